//! Per-crtc vblank interval statistics.

use crate::event::{EventId, TraceEvent};
use std::collections::{BTreeMap, HashMap};

/// Frame periods of common refresh rates: 15, 30, 60, 90, 95, 120, 144, 165
/// and 240 Hz.
pub const REFRESH_PERIODS_NS: [i64; 9] = [
    66_666_666, 33_333_333, 16_666_666, 11_111_111, 10_526_315, 8_333_333, 6_944_444, 6_060_606, 4_166_666,
];

/// Snaps `diff` to the first refresh period it is within `tolerance_pct` of.
pub fn snap_interval(diff: i64, tolerance_pct: f64) -> i64 {
    // Basis points, so 1% is 100.
    let limit = (tolerance_pct * 100.0) as i128;
    for rate in REFRESH_PERIODS_NS {
        let pct = 10_000 * (diff as i128 - rate as i128) / rate as i128;
        if pct > -limit && pct < limit {
            return rate;
        }
    }
    diff
}

#[derive(Debug, Clone, Default)]
pub struct VblankInfo {
    pub last_ts: Option<i64>,
    /// Number of intervals recorded.
    pub count: u64,
    /// Snapped interval in microseconds -> occurrences.
    pub histogram: BTreeMap<i64, u64>,
    pub median_ns: Option<i64>,
}

impl VblankInfo {
    fn record(&mut self, ts: i64, tolerance_pct: f64) {
        if let Some(last) = self.last_ts {
            let diff = snap_interval(ts.saturating_sub(last), tolerance_pct);
            *self.histogram.entry(diff / 1000).or_insert(0) += 1;
            self.count += 1;
        }
        self.last_ts = Some(ts);
    }

    /// First histogram bucket where the running count reaches half the samples.
    pub fn compute_median(&mut self) -> Option<i64> {
        if self.count == 0 {
            return None;
        }
        let mut median = self.count / 2;
        for (&us, &n) in &self.histogram {
            if n >= median {
                self.median_ns = Some(us * 1000);
                return self.median_ns;
            }
            median -= n;
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct VblankTracker {
    pub crtcs: BTreeMap<i32, VblankInfo>,
    queued: HashMap<u64, EventId>,
    tolerance_pct: f64,
}

impl VblankTracker {
    pub fn new(tolerance_pct: f64) -> Self {
        VblankTracker {
            tolerance_pct,
            ..Default::default()
        }
    }

    pub fn on_queued(&mut self, event: &TraceEvent) {
        let seq = event.field_u64("seq").unwrap_or(0);
        if seq != 0 {
            self.queued.insert(seq, event.id);
        }
    }

    /// Gives the matching queued event its queue delay and records the interval.
    pub fn on_vblank(&mut self, events: &mut [TraceEvent], id: EventId) {
        let (ts, crtc, seq) = {
            let e = &events[id as usize];
            (e.ts, e.crtc.unwrap_or(0), e.field_u64("seq").unwrap_or(0))
        };
        if let Some(queued) = self.queued.remove(&seq) {
            let q = &mut events[queued as usize];
            q.duration = Some(ts - q.ts);
        }
        self.crtcs.entry(crtc).or_default().record(ts, self.tolerance_pct);
    }

    pub fn finish(mut self) -> BTreeMap<i32, VblankInfo> {
        for info in self.crtcs.values_mut() {
            info.compute_median();
        }
        self.crtcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventField;
    use std::sync::Arc;

    fn vblank(id: u32, ts: i64, name: &str, seq: u64) -> TraceEvent {
        let fields = vec![EventField { key: Arc::from("seq"), value: Arc::from(seq.to_string().as_str()) }];
        let mut e = TraceEvent::new(ts, 0, 0, Arc::from("<idle>-0"), Arc::from("drm"), Arc::from(name), fields);
        e.id = id;
        e.crtc = Some(0);
        e
    }

    #[test]
    fn test_snap_interval() {
        assert_eq!(snap_interval(16_600_000, 1.0), 16_666_666);
        assert_eq!(snap_interval(8_340_000, 1.0), 8_333_333);
        assert_eq!(snap_interval(20_000_000, 1.0), 20_000_000);
        assert_eq!(snap_interval(16_400_000, 1.0), 16_400_000);
        assert_eq!(snap_interval(16_400_000, 2.0), 16_666_666);
        assert_eq!(snap_interval(i64::MAX, 1.0), i64::MAX);
        assert_eq!(snap_interval(i64::MIN, 1.0), i64::MIN);
    }

    #[test]
    fn test_median_of_60hz_stream() {
        let mut events: Vec<TraceEvent> = (0..10).map(|i| vblank(i, i as i64 * 16_666_000, "drm_vblank_event", i as u64 + 1)).collect();
        let mut tracker = VblankTracker::new(1.0);
        for id in 0..10 {
            tracker.on_vblank(&mut events, id);
        }
        let crtcs = tracker.finish();
        let info = &crtcs[&0];
        assert_eq!(info.count, 9);
        let median = info.median_ns.unwrap();
        assert!((median - 16_666_666).abs() < 166_666);
    }

    #[test]
    fn test_queued_pairing() {
        let mut events = vec![vblank(0, 1_000, "drm_vblank_event_queued", 42), vblank(1, 9_000, "drm_vblank_event", 42)];
        let mut tracker = VblankTracker::new(1.0);
        tracker.on_queued(&events[0].clone());
        tracker.on_vblank(&mut events, 1);
        assert_eq!(events[0].duration, Some(8_000));
        assert!(tracker.queued.is_empty());

        // A later vblank reusing the sequence number leaves the pair alone.
        events.push(vblank(2, 30_000, "drm_vblank_event", 42));
        tracker.on_vblank(&mut events, 2);
        assert_eq!(events[0].duration, Some(8_000));
    }
}
