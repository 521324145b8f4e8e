//! The event correlation pass.
//!
//! Runs once over the time-sorted event array. Each event is classified,
//! indexed, and handed to the state of its family (AMD, DRM scheduler, MSM,
//! i915, vblank, scheduler). When every event has been seen the families
//! compute durations and rows for their timelines.

pub mod amd;
pub mod classify;
pub mod color;
pub mod comm;
pub mod drm_sched;
pub mod i915;
pub mod msm;
pub mod rows;
pub mod vblank;

use crate::config::LoadOptions;
use crate::event::{EventFlags, EventId, EventKind, TraceEvent};
use crate::io::progress::LoadProgress;
use crate::string_intern::StringPool;
use comm::CommTracker;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use vblank::{VblankInfo, VblankTracker};

pub use classify::classify;
pub use color::{color_from_hash, recolor_auto, set_event_color};
pub use rows::RowPacker;

/// `prev_state` mask; anything outside the low bits is a modifier.
const TASK_STATE_MAX: i64 = 1024;

/// Groups the events that belong to one unit of GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CorrelationKey {
    /// Hash of `timeline_context_seqno`.
    Amd(u32),
    /// Scheduler fence handle, valid only while its job is outstanding.
    DrmFence(u64),
    /// Scheduler job sequence number.
    DrmSeqno(u64),
    /// Hash of ring id and seqno.
    Msm(u32),
    /// Hash of ring, ctx and seqno.
    I915Request(u32),
    I915Wait(u32),
}

/// Read-only lookups handed to consumers. Every list is ascending by id.
#[derive(Debug, Clone, Default)]
pub struct TraceIndices {
    pub by_name: BTreeMap<Arc<str>, Vec<EventId>>,
    pub by_comm: BTreeMap<Arc<str>, Vec<EventId>>,
    pub by_key: HashMap<CorrelationKey, Vec<EventId>>,
    pub by_crtc: BTreeMap<i32, Vec<EventId>>,
    /// pid -> sched_switch events switching that pid out.
    pub sched_switch_prev: HashMap<i32, Vec<EventId>>,
    /// pid -> sched_switch events switching that pid in.
    pub sched_switch_next: HashMap<i32, Vec<EventId>>,
    /// `timeline_context_seqno` -> amdgpu_job_msg events.
    pub gfx_context_msgs: HashMap<Arc<str>, Vec<EventId>>,
    /// i915-perf sample -> the request event it was attributed to.
    pub i915_perf_to_request: HashMap<EventId, EventId>,
}

impl TraceIndices {
    /// Appends `id` to the group for `key` and returns the group.
    pub fn add_key(&mut self, key: CorrelationKey, id: EventId) -> &[EventId] {
        let group = self.by_key.entry(key).or_default();
        group.push(id);
        group
    }

    pub fn key_group(&self, key: CorrelationKey) -> Option<&[EventId]> {
        self.by_key.get(&key).map(|v| v.as_slice())
    }

    pub fn events_named(&self, name: &str) -> &[EventId] {
        self.by_name.get(name).map_or(&[], |v| v.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineFamily {
    Amd,
    DrmSched,
    Msm,
    I915Request,
    I915Wait,
}

/// One lane group of GPU work with its laid-out events.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub name: Arc<str>,
    pub family: TimelineFamily,
    pub events: Vec<EventId>,
    pub row_count: u32,
}

/// Correlation misses. None of these abort a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub events: usize,
    /// Stage events with no earlier stage under the same key.
    pub unlinked: usize,
    /// Scheduler events rejected because their fence handle was ambiguous.
    pub dropped: usize,
    pub unmatched_perf_samples: usize,
    /// Work groups left out of timelines for never signaling.
    pub pruned_groups: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub indices: TraceIndices,
    pub timelines: Vec<Timeline>,
    pub vblanks: BTreeMap<i32, VblankInfo>,
    pub comms: CommTracker,
    pub stats: CorrelationStats,
}

impl Correlation {
    pub fn timeline(&self, name: &str) -> Option<&Timeline> {
        self.timelines.iter().find(|t| &*t.name == name)
    }
}

/// Mutable state shared by the family passes.
pub struct CorrelationPass<'a> {
    pub events: &'a mut [TraceEvent],
    pub indices: &'a mut TraceIndices,
    pub stats: &'a mut CorrelationStats,
    pub options: &'a LoadOptions,
    pub pool: &'a mut StringPool,
}

impl CorrelationPass<'_> {
    pub fn event(&self, id: EventId) -> &TraceEvent {
        &self.events[id as usize]
    }

    pub fn event_mut(&mut self, id: EventId) -> &mut TraceEvent {
        &mut self.events[id as usize]
    }

    /// Links `id` to `prev` and hands it the first group member's comm.
    pub fn link(&mut self, id: EventId, prev: EventId, first: EventId) {
        let user_comm = Arc::clone(&self.event(first).comm);
        let event = self.event_mut(id);
        event.predecessor = Some(prev);
        event.user_comm = user_comm;
        event.flags.remove(EventFlags::UNLINKED);
    }

    pub fn mark_unlinked(&mut self, id: EventId) {
        self.event_mut(id).flags.insert(EventFlags::UNLINKED);
        self.stats.unlinked += 1;
    }
}

fn push_id<K: Ord>(map: &mut BTreeMap<K, Vec<EventId>>, key: K, id: EventId) {
    map.entry(key).or_default().push(id);
}

/// Drives the correlation pass over a sorted event array.
pub struct EventCorrelator<'a> {
    options: &'a LoadOptions,
    progress: Option<&'a LoadProgress>,
    pid_tgid: Option<&'a BTreeMap<i32, i32>>,
}

impl<'a> EventCorrelator<'a> {
    pub fn new(options: &'a LoadOptions) -> Self {
        EventCorrelator { options, progress: None, pid_tgid: None }
    }

    pub fn with_progress(mut self, progress: &'a LoadProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Thread groups recorded in the capture, merged with those learned
    /// from fork events.
    pub fn with_pid_tgid(mut self, pid_tgid: &'a BTreeMap<i32, i32>) -> Self {
        self.pid_tgid = Some(pid_tgid);
        self
    }

    /// Enriches `events` in place. Events must already be sorted by
    /// timestamp with ids equal to their positions.
    pub fn correlate(
        &self,
        events: &mut [TraceEvent],
        pid_comm: &BTreeMap<i32, Arc<str>>,
        pool: &mut StringPool,
    ) -> Correlation {
        let start = Instant::now();
        if let Some(progress) = self.progress {
            progress.begin_initializing();
        }

        classify::classify_all(events);

        let mut comms = CommTracker::new(pid_comm.clone());
        if let Some(pid_tgid) = self.pid_tgid {
            comms.seed_tgids(pid_tgid);
        }
        for event in events.iter().filter(|e| e.kind == EventKind::SchedSwitch) {
            comms.observe_sched_switch(event);
        }

        let mut indices = TraceIndices::default();
        let mut stats = CorrelationStats {
            events: events.len(),
            ..Default::default()
        };
        let mut vblanks = VblankTracker::new(self.options.vblank_snap_tolerance_pct);
        let mut amd = amd::AmdState::default();
        let mut drm = drm_sched::DrmSchedState::default();
        let mut msm = msm::MsmState::default();
        let mut i915 = i915::I915State::default();

        let mut pass = CorrelationPass {
            events,
            indices: &mut indices,
            stats: &mut stats,
            options: self.options,
            pool,
        };

        for idx in 0..pass.events.len() {
            let id = idx as EventId;
            init_event(&mut pass, &comms, id);

            let kind = pass.event(id).kind;
            match kind {
                EventKind::Vblank => vblanks.on_vblank(pass.events, id),
                EventKind::VblankQueued => vblanks.on_queued(pass.event(id)),
                EventKind::SchedSwitch => init_sched_switch(&mut pass, &comms, id),
                EventKind::ProcessFork => comms.add_fork(pass.event(id)),
                EventKind::ProcessExec => comms.on_exec(&pass.events[idx], pass.pool),
                EventKind::ProcessExit => comms.on_exit(pass.event(id)),
                EventKind::Amd(stage) => amd.add_event(&mut pass, id, stage),
                EventKind::DrmSched(stage) => drm.add_event(&mut pass, id, stage),
                EventKind::Msm(stage) => msm.add_event(&mut pass, id, stage),
                EventKind::I915Request(_) => i915.add_request(&mut pass, id),
                EventKind::I915Wait(stage) => i915.add_wait(&mut pass, id, stage),
                _ => {}
            }
            if &*pass.event(id).name == "amdgpu_job_msg" {
                amd::index_job_msg(&mut pass, id);
            }

            if let Some(progress) = self.progress {
                progress.record_event();
            }
        }

        let mut timelines = amd.finish(&mut pass);
        timelines.extend(drm.finish(&mut pass));
        timelines.extend(msm.finish(&mut pass));
        timelines.extend(i915.finish(&mut pass));
        i915::correlate_perf_samples(&mut pass);

        let vblanks = vblanks.finish();
        let removed = comms.remove_single_tgids();
        comms.update_tgid_colors(self.options.timeline_label_saturation, self.options.timeline_label_alpha, pass.pool);
        debug!("removed {} single-thread groups", removed);

        info!(
            "correlated {} events into {} timelines in {:.2}ms ({} unlinked, {} dropped)",
            stats.events,
            timelines.len(),
            start.elapsed().as_secs_f64() * 1000.0,
            stats.unlinked,
            stats.dropped
        );

        Correlation {
            indices,
            timelines,
            vblanks,
            comms,
            stats,
        }
    }
}

/// Comm rewrite plus the name, comm and crtc indices every event gets.
fn init_event(pass: &mut CorrelationPass<'_>, comms: &CommTracker, id: EventId) {
    let pid = pass.event(id).pid;
    if let Some(comm) = comms.sched_switch_comm_str(pid, pass.pool) {
        let event = pass.event_mut(id);
        if event.user_comm == event.comm {
            event.user_comm = Arc::clone(&comm);
        }
        event.comm = comm;
    }

    let event = &pass.events[id as usize];
    push_id(&mut pass.indices.by_comm, Arc::clone(&event.comm), id);
    if event.kind == EventKind::Vblank {
        let crtc = event.crtc.unwrap_or(0);
        let name = pass.pool.intern_owned(format!("{}{}", event.name, crtc));
        push_id(&mut pass.indices.by_name, name, id);
        push_id(&mut pass.indices.by_crtc, crtc, id);
    } else {
        push_id(&mut pass.indices.by_name, Arc::clone(&event.name), id);
    }
}

/// Time since the outgoing pid was switched in, and the prev/next indices.
fn init_sched_switch(pass: &mut CorrelationPass<'_>, comms: &CommTracker, id: EventId) {
    let event = pass.event(id);
    let (Some(prev_pid), Some(next_pid)) = (event.field_i64("prev_pid"), event.field_i64("next_pid")) else {
        return;
    };
    let (prev_pid, next_pid) = (prev_pid as i32, next_pid as i32);
    let prev_state = event.field_i64("prev_state").unwrap_or(0);
    let pid = event.pid;

    let switched_in = pass
        .indices
        .sched_switch_next
        .get(&prev_pid)
        .and_then(|locs| locs.last())
        .map(|&last| pass.event(last).ts);
    if let Some(in_ts) = switched_in {
        let event = pass.event_mut(id);
        if prev_state & (TASK_STATE_MAX - 1) == 0 {
            event.flags.insert(EventFlags::TASK_RUNNING);
        }
        event.duration = Some(event.ts - in_ts);
    }

    pass.indices.sched_switch_prev.entry(prev_pid).or_default().push(id);
    pass.indices.sched_switch_next.entry(next_pid).or_default().push(id);

    for other in [prev_pid, next_pid] {
        if other != pid {
            if let Some(comm) = comms.comm_str(other, pass.pool) {
                let locs = pass.indices.by_comm.entry(comm).or_default();
                if locs.last() != Some(&id) {
                    locs.push(id);
                }
            }
        }
    }
}

/// Serializes a ring's jobs on the hardware: each signal event starts when
/// both its run event and the previous signal have happened.
///
/// `locs` holds every surviving event of the ring in id order. Signal
/// events must link to their run event, which may link to its submit
/// event. Returns the number of rows used.
pub(crate) fn layout_serialized(pass: &mut CorrelationPass<'_>, locs: &[EventId]) -> u32 {
    let sat = pass.options.timeline_label_saturation;
    let alpha = pass.options.timeline_label_alpha;
    let mut last_signal = 0i64;
    let mut row = 0u32;
    let mut row_count = 0u32;

    for &id in locs {
        let signal = pass.event(id);
        if !signal.flags.contains(EventFlags::FENCE_SIGNALED) {
            continue;
        }
        let Some(run_id) = signal.predecessor else {
            continue;
        };
        let signal_ts = signal.ts;
        let run_ts = pass.event(run_id).ts;
        let hw_start = last_signal.max(run_ts);
        let mut start_ts = run_ts;

        // The run span ends where the hardware picks the job up.
        pass.event_mut(id).duration = Some(signal_ts - hw_start);
        pass.event_mut(run_id).duration = Some(hw_start - run_ts);
        if let Some(submit_id) = pass.event(run_id).predecessor {
            let submit_ts = pass.event(submit_id).ts;
            pass.event_mut(submit_id).duration = Some(run_ts - submit_ts);
            start_ts = submit_ts;
        }

        if start_ts > last_signal {
            row = 0;
        }
        pass.event_mut(id).row = Some(row);
        row += 1;
        row_count = row_count.max(row);
        last_signal = signal_ts;

        let identity = Arc::clone(&pass.event(id).user_comm);
        color::set_auto_color(pass.event_mut(id), &identity, sat, alpha);
    }
    row_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventField;

    pub(crate) fn make_event(id: u32, ts: i64, pid: i32, comm: &str, name: &str, fields: &[(&str, &str)]) -> TraceEvent {
        let fields = fields
            .iter()
            .map(|(k, v)| EventField { key: Arc::from(*k), value: Arc::from(*v) })
            .collect();
        let mut e = TraceEvent::new(ts, 0, pid, Arc::from(comm), Arc::from("test"), Arc::from(name), fields);
        e.id = id;
        e
    }

    #[test]
    fn test_sched_switch_duration_and_indices() {
        let mut pool = StringPool::new();
        let mut events = vec![
            make_event(0, 100, 0, "<idle>-0", "sched_switch", &[("prev_pid", "0"), ("prev_comm", "swapper"), ("prev_state", "0"), ("next_pid", "5"), ("next_comm", "game")]),
            make_event(1, 250, 5, "<...>-5", "sched_switch", &[("prev_pid", "5"), ("prev_comm", "game"), ("prev_state", "1"), ("next_pid", "0"), ("next_comm", "swapper")]),
            make_event(2, 300, 0, "<idle>-0", "sched_switch", &[("prev_pid", "0"), ("prev_comm", "swapper"), ("prev_state", "0"), ("next_pid", "5"), ("next_comm", "game")]),
            make_event(3, 320, 5, "<...>-5", "sched_switch", &[("prev_pid", "5"), ("prev_comm", "game"), ("prev_state", "1024"), ("next_pid", "0"), ("next_comm", "swapper")]),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(events[1].duration, Some(150));
        assert!(!events[1].flags.contains(EventFlags::TASK_RUNNING));
        assert_eq!(events[3].duration, Some(20));
        assert!(events[3].flags.contains(EventFlags::TASK_RUNNING));
        assert_eq!(&*events[1].comm, "game-5");
        assert_eq!(correlation.indices.sched_switch_prev[&5], vec![1, 3]);
        assert_eq!(correlation.indices.by_comm.get("game-5").unwrap(), &vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_vblanks_indexed_per_crtc() {
        let mut pool = StringPool::new();
        let mut events: Vec<TraceEvent> = (0..4)
            .map(|i| {
                let mut e = make_event(i, i as i64 * 8_333_333, 0, "<idle>-0", "drm_vblank_event", &[("seq", "1")]);
                e.crtc = Some((i % 2) as i32);
                e
            })
            .collect();
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(correlation.indices.events_named("drm_vblank_event0"), &[0, 2]);
        assert_eq!(correlation.indices.events_named("drm_vblank_event1"), &[1, 3]);
        assert_eq!(correlation.vblanks[&0].median_ns, Some(16_666_000));
    }
}
