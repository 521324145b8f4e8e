//! amdgpu submissions: `amdgpu_cs_ioctl` -> `amdgpu_sched_run_job` -> `*fence_signaled`.

use super::{layout_serialized, CorrelationKey, CorrelationPass, Timeline, TimelineFamily};
use crate::event::{AmdStage, EventFlags, EventId, TraceEvent};
use crate::hash::fnv1a32;
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `timeline_context_seqno`, the string identifying one job.
pub fn gfx_context(event: &TraceEvent) -> Option<String> {
    let seqno = event.seqno.filter(|s| *s != 0)?;
    Some(format!("{}_{}_{}", event.field("timeline")?, event.field("context")?, seqno))
}

#[derive(Debug, Default)]
pub struct AmdState {
    /// Ring name (`gfx`, `sdma0`, ...) -> every stage event on it.
    timeline_locs: BTreeMap<Arc<str>, Vec<EventId>>,
}

impl AmdState {
    pub fn add_event(&mut self, pass: &mut CorrelationPass<'_>, id: EventId, stage: AmdStage) {
        let event = pass.event(id);
        let (Some(timeline), Some(ctx)) = (event.field_arc("timeline").cloned(), gfx_context(event)) else {
            return;
        };
        self.timeline_locs.entry(timeline).or_default().push(id);

        let group = pass.indices.add_key(CorrelationKey::Amd(fnv1a32(&ctx)), id).to_vec();
        if group.len() > 1 {
            pass.link(id, group[group.len() - 2], group[0]);
            if stage == AmdStage::FenceSignaled {
                for &member in &group {
                    pass.event_mut(member).flags.insert(EventFlags::TIMELINE);
                }
            }
        } else if stage != AmdStage::CsIoctl {
            pass.mark_unlinked(id);
        }
    }

    /// Drops unsignaled work and lays out each ring.
    pub fn finish(self, pass: &mut CorrelationPass<'_>) -> Vec<Timeline> {
        let pruned = pass
            .indices
            .by_key
            .iter()
            .filter(|(key, group)| {
                matches!(key, CorrelationKey::Amd(_)) && !group.iter().any(|&id| pass.events[id as usize].is_timeline())
            })
            .count();
        pass.stats.pruned_groups += pruned;

        let mut timelines = Vec::new();
        for (name, mut locs) in self.timeline_locs {
            locs.retain(|&id| pass.event(id).is_timeline());
            if locs.is_empty() {
                debug!("amd timeline {} has no signaled work", name);
                continue;
            }
            let row_count = layout_serialized(pass, &locs);
            timelines.push(Timeline {
                name,
                family: TimelineFamily::Amd,
                events: locs,
                row_count,
            });
        }
        timelines
    }
}

/// Indexes an `amdgpu_job_msg` under the job it describes.
pub fn index_job_msg(pass: &mut CorrelationPass<'_>, id: EventId) {
    let event = pass.event(id);
    if event.field("msg").map_or(true, str::is_empty) {
        return;
    }
    if let Some(ctx) = gfx_context(event) {
        let ctx = pass.pool.intern_owned(ctx);
        pass.indices.gfx_context_msgs.entry(ctx).or_default().push(id);
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

    fn amd(id: u32, ts: i64, pid: i32, comm: &str, name: &str, timeline: &str, seqno: u64) -> TraceEvent {
        let seq = seqno.to_string();
        let mut e = make_event(id, ts, pid, comm, name, &[("timeline", timeline), ("context", "249"), ("seqno", seq.as_str())]);
        e.seqno = Some(seqno);
        e
    }

    #[test]
    fn test_single_job_durations() {
        let mut pool = StringPool::new();
        let mut events = vec![
            amd(0, 100, 2837, "SkinningApp-2837", "amdgpu_cs_ioctl", "gfx", 91446),
            amd(1, 105, 477, "gfx-477", "amdgpu_sched_run_job", "gfx", 91446),
            amd(2, 140, 0, "<idle>-0", "fence_signaled", "gfx", 91446),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(events[2].duration, Some(35));
        // Nothing queued ahead: the hardware starts the job as it is run.
        assert_eq!(events[1].duration, Some(0));
        assert_eq!(events[0].duration, Some(5));
        assert_eq!(events[2].predecessor, Some(1));
        assert_eq!(events[1].predecessor, Some(0));
        assert_eq!(&*events[2].user_comm, "SkinningApp-2837");
        assert!(events[2].flags.contains(EventFlags::AUTOGEN_COLOR | EventFlags::TIMELINE));
        assert_eq!(events[2].row, Some(0));

        let timeline = correlation.timeline("gfx").unwrap();
        assert_eq!(timeline.events, vec![0, 1, 2]);
        assert_eq!(timeline.row_count, 1);
    }

    #[test]
    fn test_jobs_serialize_on_the_ring() {
        let mut pool = StringPool::new();
        let mut events = vec![
            amd(0, 100, 10, "a-10", "amdgpu_cs_ioctl", "gfx", 1),
            amd(1, 105, 3, "gfx-3", "amdgpu_sched_run_job", "gfx", 1),
            amd(2, 110, 11, "b-11", "amdgpu_cs_ioctl", "gfx", 2),
            amd(3, 115, 3, "gfx-3", "amdgpu_sched_run_job", "gfx", 2),
            amd(4, 140, 0, "<idle>-0", "fence_signaled", "gfx", 1),
            amd(5, 160, 0, "<idle>-0", "fence_signaled", "gfx", 2),
            amd(6, 200, 10, "a-10", "amdgpu_cs_ioctl", "gfx", 3),
            amd(7, 205, 3, "gfx-3", "amdgpu_sched_run_job", "gfx", 3),
            amd(8, 230, 0, "<idle>-0", "fence_signaled", "gfx", 3),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(events[5].duration, Some(20));
        assert_eq!(events[3].duration, Some(25));
        assert_eq!(events[2].duration, Some(5));
        for (run, signal) in [(1, 4), (3, 5), (7, 8)] {
            let run_end = events[run].ts + events[run].duration.unwrap();
            let hw_start = events[signal].ts - events[signal].duration.unwrap();
            assert_eq!(run_end, hw_start);
        }
        assert_eq!(events[4].row, Some(0));
        assert_eq!(events[5].row, Some(1));
        assert_eq!(events[8].row, Some(0));
        assert_eq!(&*events[5].user_comm, "b-11");
        assert_eq!(correlation.timeline("gfx").unwrap().row_count, 2);
    }

    #[test]
    fn test_unsignaled_work_is_pruned() {
        let mut pool = StringPool::new();
        let mut events = vec![
            amd(0, 100, 10, "a-10", "amdgpu_cs_ioctl", "sdma0", 7),
            amd(1, 105, 3, "sdma0-3", "amdgpu_sched_run_job", "sdma0", 7),
            amd(2, 106, 3, "comp-3", "amdgpu_sched_run_job", "comp_1.0.0", 9),
            amd(3, 150, 0, "<idle>-0", "fence_signaled", "comp_1.0.0", 9),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert!(correlation.timeline("sdma0").is_none());
        assert_eq!(correlation.stats.pruned_groups, 1);
        assert!(events[2].flags.contains(EventFlags::UNLINKED));
        assert_eq!(correlation.stats.unlinked, 1);
        assert_eq!(events[3].duration, Some(44));
        assert_eq!(events[2].duration, Some(0));
        assert_eq!(&*events[3].user_comm, "comp-3");
    }

    #[test]
    fn test_job_msg_indexed_by_context() {
        let mut pool = StringPool::new();
        let mut msg = amd(0, 100, 10, "a-10", "amdgpu_job_msg", "gfx", 4);
        msg.fields.push(crate::event::EventField { key: "msg".into(), value: "present".into() });
        let mut events = vec![msg];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);
        assert_eq!(correlation.indices.gfx_context_msgs.get("gfx_249_4"), Some(&vec![0]));
    }
}
