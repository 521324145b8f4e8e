//! Intel i915 request lifecycles, wait spans and perf-sample attribution.
//!
//! Request events are grouped by `(ring, ctx, seqno)`. `intel_engine_notify`
//! only knows the ring and the global seqno, so it is found through the
//! `global_seqno` of the matching `i915_request_in`.

use super::color::set_auto_color;
use super::rows::RowPacker;
use super::{CorrelationKey, CorrelationPass, Timeline, TimelineFamily};
use crate::event::{EventId, EventKind, I915Stage, I915Wait, TraceEvent};
use crate::hash::murmur3_32;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `ring`, `engine`, or `class:instance` packed as `class * 16 + instance`.
pub fn ring_of(event: &TraceEvent) -> Option<u32> {
    if let Some(ring) = event.field_u64("ring").or_else(|| event.field_u64("engine")) {
        return Some(ring as u32);
    }
    let class = event.field_u64("class")?;
    let instance = event.field_u64("instance").unwrap_or(0);
    Some((class * 16 + instance) as u32)
}

fn triple_hash(ring: u32, ctx: u64, seqno: u64) -> u32 {
    let mut packed = [0u8; 12];
    packed[..4].copy_from_slice(&ring.to_le_bytes());
    packed[4..8].copy_from_slice(&(ctx as u32).to_le_bytes());
    packed[8..].copy_from_slice(&(seqno as u32).to_le_bytes());
    murmur3_32(&packed, 0)
}

/// `(ring, ctx, seqno)` of a request event. Notify events have no ctx and
/// key with ctx 0.
fn request_triple(event: &TraceEvent) -> Option<(u32, u64, u64)> {
    let seqno = event.seqno.filter(|s| *s != 0)?;
    let ring = ring_of(event)?;
    let ctx = match event.field_u64("ctx") {
        Some(ctx) => ctx,
        None if event.kind == EventKind::I915Request(I915Stage::Notify) => 0,
        None => return None,
    };
    Some((ring, ctx, seqno))
}

pub fn request_key(event: &TraceEvent) -> Option<CorrelationKey> {
    request_triple(event).map(|(r, c, s)| CorrelationKey::I915Request(triple_hash(r, c, s)))
}

fn wait_key(event: &TraceEvent) -> Option<CorrelationKey> {
    request_triple(event).map(|(r, c, s)| CorrelationKey::I915Wait(triple_hash(r, c, s)))
}

fn stage_of(event: &TraceEvent) -> Option<I915Stage> {
    match event.kind {
        EventKind::I915Request(stage) => Some(stage),
        _ => None,
    }
}

/// Gives `later` the span since `earlier`, unless it already has one or
/// the two are out of order.
fn set_duration(pass: &mut CorrelationPass<'_>, earlier: Option<EventId>, later: Option<EventId>) -> bool {
    let (Some(e0), Some(e1)) = (earlier, later) else {
        return false;
    };
    let ts0 = pass.event(e0).ts;
    let event = pass.event_mut(e1);
    if event.has_duration() || event.ts < ts0 {
        return false;
    }
    event.duration = Some(event.ts - ts0);
    event.predecessor = Some(e0);
    true
}

#[derive(Debug, Default)]
pub struct I915State {
    /// Request groups in first-seen order.
    request_keys: Vec<CorrelationKey>,
    /// `i915_reqwait ring<N>` -> wait_end events.
    wait_locs: BTreeMap<u32, Vec<EventId>>,
}

impl I915State {
    pub fn add_request(&mut self, pass: &mut CorrelationPass<'_>, id: EventId) {
        let Some(key) = request_key(pass.event(id)) else {
            return;
        };
        if pass.indices.add_key(key, id).len() == 1 {
            self.request_keys.push(key);
        }
    }

    /// Pairs a wait_end with the latest wait_begin of the same request.
    pub fn add_wait(&mut self, pass: &mut CorrelationPass<'_>, id: EventId, stage: I915Wait) {
        let Some(key) = wait_key(pass.event(id)) else {
            return;
        };
        let group = pass.indices.add_key(key, id).to_vec();
        if stage != I915Wait::End {
            return;
        }
        let begin = group
            .iter()
            .rev()
            .copied()
            .find(|&g| pass.event(g).kind == EventKind::I915Wait(I915Wait::Begin));
        let Some(begin) = begin else {
            pass.mark_unlinked(id);
            return;
        };

        let span = pass.event(id).ts - pass.event(begin).ts;
        pass.event_mut(begin).duration = Some(span);
        let end = pass.event_mut(id);
        end.duration = Some(span);
        end.predecessor = Some(begin);
        if let Some(ring) = end.field_u64("ring") {
            self.wait_locs.entry(ring as u32).or_default().push(id);
        }
    }

    pub fn finish(self, pass: &mut CorrelationPass<'_>) -> Vec<Timeline> {
        let mut timelines = self.finish_requests(pass);
        for (ring, ends) in self.wait_locs {
            let mut rows = RowPacker::new();
            let mut events = Vec::with_capacity(ends.len() * 2);
            for end in ends {
                let Some(begin) = pass.event(end).predecessor else {
                    continue;
                };
                let row = rows.get_row(pass.event(begin).ts, pass.event(end).ts);
                pass.event_mut(begin).row = Some(row);
                pass.event_mut(end).row = Some(row);
                events.push(begin);
                events.push(end);
            }
            events.sort_unstable();
            events.dedup();
            timelines.push(Timeline {
                name: pass.pool.intern_owned(format!("i915_reqwait ring{}", ring)),
                family: TimelineFamily::I915Wait,
                events,
                row_count: rows.row_count(),
            });
        }
        timelines
    }

    fn finish_requests(&self, pass: &mut CorrelationPass<'_>) -> Vec<Timeline> {
        let mut ring_locs: BTreeMap<u32, Vec<EventId>> = BTreeMap::new();

        for &key in &self.request_keys {
            let group = pass.indices.key_group(key).map(<[EventId]>::to_vec).unwrap_or_default();
            let mut slots: [Option<EventId>; 6] = [None; 6];
            let mut ring = None;
            for &id in &group {
                let event = pass.event(id);
                if let Some(stage) = stage_of(event) {
                    slots[stage.index()] = Some(id);
                    ring = ring.or_else(|| ring_of(event));
                }
            }

            let slot = |stage: I915Stage| slots[stage.index()];
            if slot(I915Stage::Notify).is_none() {
                if let Some(req_in) = slot(I915Stage::In) {
                    if let Some(notify) = find_notify(pass, req_in) {
                        pass.event_mut(notify).predecessor = Some(req_in);
                        if let Some(locs) = pass.indices.by_key.get_mut(&key) {
                            locs.push(notify);
                            locs.sort_unstable();
                        }
                        slots[I915Stage::Notify.index()] = Some(notify);
                    }
                }
            }

            let slot = |stage: I915Stage| slots[stage.index()];
            let mut any = set_duration(pass, slot(I915Stage::Queue), slot(I915Stage::Add));
            any |= set_duration(pass, slot(I915Stage::Add), slot(I915Stage::Submit));
            any |= set_duration(pass, slot(I915Stage::Submit), slot(I915Stage::In));
            any |= set_duration(pass, slot(I915Stage::In), slot(I915Stage::Notify));
            any |= set_duration(pass, slot(I915Stage::Notify), slot(I915Stage::Out));
            any |= set_duration(pass, slot(I915Stage::In), slot(I915Stage::Out));

            if any {
                let locs = ring_locs.entry(ring.unwrap_or(0)).or_default();
                locs.extend(slots.iter().flatten());
            }
        }

        let mut timelines = Vec::new();
        for (ring, mut locs) in ring_locs {
            locs.sort_unstable();
            locs.dedup();
            let mut rows = RowPacker::new();
            for &id in &locs {
                if pass.event(id).row.is_some() {
                    continue;
                }
                let event = pass.event(id);
                let owner = match (stage_of(event), event.predecessor) {
                    (Some(I915Stage::Notify), Some(pred)) => pred,
                    _ => id,
                };
                let Some(group) = request_key(pass.event(owner))
                    .and_then(|key| pass.indices.key_group(key))
                    .map(<[EventId]>::to_vec)
                else {
                    continue;
                };
                let (Some(&first), Some(&last)) = (group.first(), group.last()) else {
                    continue;
                };
                let row = rows.get_row(pass.event(first).ts, pass.event(last).ts);
                for member in group {
                    pass.event_mut(member).row = Some(row);
                }
            }
            timelines.push(Timeline {
                name: pass.pool.intern_owned(format!("i915_req ring{}", ring)),
                family: TimelineFamily::I915Request,
                events: locs,
                row_count: rows.row_count(),
            });
        }
        timelines
    }
}

/// The `intel_engine_notify` keyed by the request's ring and global seqno.
fn find_notify(pass: &CorrelationPass<'_>, req_in: EventId) -> Option<EventId> {
    let event = pass.event(req_in);
    let global = event.field_u64("global_seqno").or_else(|| event.field_u64("global"))?;
    let ring = ring_of(event)?;
    let key = CorrelationKey::I915Request(triple_hash(ring, 0, global));
    pass.indices
        .key_group(key)?
        .iter()
        .copied()
        .find(|&id| stage_of(pass.event(id)) == Some(I915Stage::Notify))
}

/// Attributes each i915-perf sample to the request running its hardware
/// context: the nearest earlier `request_in` with the same `hw_id` inside
/// the search window, else the nearest such `request_add`.
pub fn correlate_perf_samples(pass: &mut CorrelationPass<'_>) {
    let sat = pass.options.timeline_label_saturation;
    let alpha = pass.options.timeline_label_alpha;
    let window = pass.options.i915_perf_search_window_ns;

    for idx in 0..pass.events.len() {
        let id = idx as EventId;
        let sample = pass.event(id);
        if sample.kind != EventKind::I915Perf {
            continue;
        }
        let hw_id = sample.field_i64("hw_id").unwrap_or(sample.pid as i64);
        let min_ts = sample.ts - window;

        let search = |stage: I915Stage| {
            pass.events[..idx]
                .iter()
                .rev()
                .take_while(|e| e.ts >= min_ts)
                .find(|e| e.kind == EventKind::I915Request(stage) && e.field_i64("hw_id") == Some(hw_id))
                .map(|e| e.id)
        };
        let request = search(I915Stage::In).or_else(|| search(I915Stage::Add));

        let identity: Arc<str> = match request {
            Some(req) => {
                pass.indices.i915_perf_to_request.insert(id, req);
                Arc::clone(&pass.event(req).comm)
            }
            None => {
                pass.stats.unmatched_perf_samples += 1;
                pass.pool.intern_owned(format!("[i915-perf hw_id={:#x}]", hw_id))
            }
        };
        let sample = pass.event_mut(id);
        sample.user_comm = Arc::clone(&identity);
        set_auto_color(sample, &identity, sat, alpha);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_event;
    use super::super::EventCorrelator;
    use crate::config::LoadOptions;
    use crate::event::{EventFlags, TraceEvent};
    use crate::string_intern::StringPool;
    use std::collections::BTreeMap;

    fn req(id: u32, ts: i64, name: &str, fields: &[(&str, &str)], seqno: u64) -> TraceEvent {
        let mut e = make_event(id, ts, 77, "glxgears-77", name, fields);
        e.seqno = Some(seqno);
        e
    }

    #[test]
    fn test_request_chain_with_notify_fallback() {
        let mut pool = StringPool::new();
        let base = [("ring", "0"), ("ctx", "12")];
        let mut events = vec![
            req(0, 100, "i915_request_queue", &base, 5),
            req(1, 110, "i915_request_add", &base, 5),
            req(2, 130, "i915_request_submit", &base, 5),
            req(3, 150, "i915_request_in", &[("ring", "0"), ("ctx", "12"), ("global_seqno", "900")], 5),
            req(4, 190, "intel_engine_notify", &[("ring", "0")], 900),
            req(5, 200, "i915_request_out", &base, 5),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(events[1].duration, Some(10));
        assert_eq!(events[2].duration, Some(20));
        assert_eq!(events[3].duration, Some(20));
        assert_eq!(events[4].duration, Some(40));
        assert_eq!(events[4].predecessor, Some(3));
        assert_eq!(events[5].duration, Some(10));
        assert_eq!(events[5].predecessor, Some(4));

        let timeline = correlation.timeline("i915_req ring0").unwrap();
        assert_eq!(timeline.events, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(timeline.row_count, 1);
        assert!(events.iter().all(|e| e.row == Some(0)));
    }

    #[test]
    fn test_out_of_order_pairs_get_no_duration() {
        let mut pool = StringPool::new();
        let base = [("ring", "1"), ("ctx", "3")];
        let mut events = vec![
            req(0, 100, "i915_request_in", &base, 8),
            req(1, 120, "i915_request_out", &base, 8),
            req(2, 130, "i915_request_add", &base, 8),
        ];
        let options = LoadOptions::default();
        EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);
        assert_eq!(events[1].duration, Some(20));
        assert_eq!(events[0].duration, None);
    }

    #[test]
    fn test_overlapping_requests_take_separate_rows() {
        let mut pool = StringPool::new();
        let a = [("ring", "0"), ("ctx", "1")];
        let b = [("ring", "0"), ("ctx", "2")];
        let mut events = vec![
            req(0, 100, "i915_request_in", &a, 1),
            req(1, 120, "i915_request_in", &b, 1),
            req(2, 150, "i915_request_out", &a, 1),
            req(3, 170, "i915_request_out", &b, 1),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);
        assert_eq!(events[0].row, Some(0));
        assert_eq!(events[2].row, Some(0));
        assert_eq!(events[1].row, Some(1));
        assert_eq!(correlation.timeline("i915_req ring0").unwrap().row_count, 2);
    }

    #[test]
    fn test_wait_spans() {
        let mut pool = StringPool::new();
        let base = [("ring", "2"), ("ctx", "4")];
        let mut events = vec![
            req(0, 100, "i915_request_wait_begin", &base, 3),
            req(1, 180, "i915_request_wait_end", &base, 3),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);
        assert_eq!(events[0].duration, Some(80));
        assert_eq!(events[1].duration, Some(80));
        assert_eq!(events[1].predecessor, Some(0));
        let timeline = correlation.timeline("i915_reqwait ring2").unwrap();
        assert_eq!(timeline.events, vec![0, 1]);
    }

    #[test]
    fn test_perf_samples() {
        let mut pool = StringPool::new();
        let sample = |id: u32, ts: i64, hw_id: &str| {
            let mut e = make_event(id, ts, 0, "i915-perf", "i915-perf", &[("hw_id", hw_id)]);
            e.system = "i915-perf".into();
            e.flags.insert(EventFlags::I915_PERF);
            e
        };
        let mut events = vec![
            req(0, 100, "i915_request_in", &[("ring", "0"), ("ctx", "1"), ("hw_id", "5")], 1),
            sample(1, 200, "5"),
            sample(2, 300, "6"),
            sample(3, 2_000_000_200, "5"),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(correlation.indices.i915_perf_to_request.get(&1), Some(&0));
        assert_eq!(&*events[1].user_comm, "glxgears-77");
        assert_eq!(&*events[2].user_comm, "[i915-perf hw_id=0x6]");
        assert_eq!(correlation.stats.unmatched_perf_samples, 2);
        assert!(events[2].flags.contains(EventFlags::AUTOGEN_COLOR));
    }
}
