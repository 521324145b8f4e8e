//! Qualcomm MSM submissions: `msm_gpu_submit_flush` -> `msm_gpu_submit_retired`.

use super::color::set_auto_color;
use super::rows::RowPacker;
use super::{CorrelationKey, CorrelationPass, Timeline, TimelineFamily};
use crate::event::{EventFlags, EventId, MsmStage, TraceEvent};
use crate::hash::murmur3_32;
use std::collections::BTreeMap;
use std::sync::Arc;

fn ring_id(event: &TraceEvent) -> Option<u32> {
    event
        .field_u64("ringid")
        .or_else(|| event.field_u64("ring"))
        .map(|r| r as u32)
}

pub fn msm_key(ring: u32, seqno: u64) -> CorrelationKey {
    let mut packed = [0u8; 12];
    packed[..4].copy_from_slice(&ring.to_le_bytes());
    packed[4..].copy_from_slice(&seqno.to_le_bytes());
    CorrelationKey::Msm(murmur3_32(&packed, 0))
}

#[derive(Debug, Default)]
pub struct MsmState {
    /// Ring id -> linked retired events, in id order.
    ring_locs: BTreeMap<u32, Vec<EventId>>,
}

impl MsmState {
    pub fn add_event(&mut self, pass: &mut CorrelationPass<'_>, id: EventId, stage: MsmStage) {
        let event = pass.event(id);
        let (Some(ring), Some(seqno)) = (ring_id(event), event.field_u64("seqno")) else {
            return;
        };

        let group = pass.indices.add_key(msm_key(ring, seqno), id).to_vec();
        if stage != MsmStage::Retired {
            return;
        }
        let flush = group
            .iter()
            .rev()
            .copied()
            .find(|&g| g != id && pass.event(g).flags.contains(EventFlags::HW_QUEUE));
        match flush {
            Some(flush) => {
                pass.link(id, flush, group[0]);
                let flush_ts = pass.event(flush).ts;
                let retired = pass.event_mut(id);
                retired.duration = Some(retired.ts - flush_ts);
                retired.flags.insert(EventFlags::TIMELINE);
                pass.event_mut(flush).flags.insert(EventFlags::TIMELINE);
                self.ring_locs.entry(ring).or_default().push(id);
            }
            None => pass.mark_unlinked(id),
        }
    }

    pub fn finish(self, pass: &mut CorrelationPass<'_>) -> Vec<Timeline> {
        let sat = pass.options.timeline_label_saturation;
        let alpha = pass.options.timeline_label_alpha;
        let mut timelines = Vec::new();

        for (ring, retired) in self.ring_locs {
            let mut rows = RowPacker::new();
            let mut events = Vec::with_capacity(retired.len() * 2);
            for id in retired {
                let Some(flush) = pass.event(id).predecessor else {
                    continue;
                };
                let (start, end) = (pass.event(flush).ts, pass.event(id).ts);
                let row = rows.get_row(start, end);
                pass.event_mut(flush).row = Some(row);
                pass.event_mut(id).row = Some(row);

                let identity = Arc::clone(&pass.event(id).user_comm);
                set_auto_color(pass.event_mut(id), &identity, sat, alpha);
                events.push(flush);
                events.push(id);
            }
            events.sort_unstable();
            let name = pass.pool.intern_owned(format!("msm ring{}", ring));
            timelines.push(Timeline {
                name,
                family: TimelineFamily::Msm,
                events,
                row_count: rows.row_count(),
            });
        }
        timelines
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

    fn submit(id: u32, ts: i64, comm: &str, name: &str, seqno: &str) -> TraceEvent {
        make_event(id, ts, 9, comm, name, &[("id", "1"), ("ringid", "0"), ("seqno", seqno)])
    }

    #[test]
    fn test_flush_retired_pairs_and_rows() {
        let mut pool = StringPool::new();
        let mut events = vec![
            submit(0, 100, "weston-9", "msm_gpu_submit_flush", "1"),
            submit(1, 120, "weston-9", "msm_gpu_submit_flush", "2"),
            submit(2, 150, "<idle>-0", "msm_gpu_submit_retired", "1"),
            submit(3, 170, "<idle>-0", "msm_gpu_submit_retired", "2"),
            submit(4, 200, "<idle>-0", "msm_gpu_submit_retired", "3"),
        ];
        let options = LoadOptions::default();
        let correlation = EventCorrelator::new(&options).correlate(&mut events, &BTreeMap::new(), &mut pool);

        assert_eq!(events[2].predecessor, Some(0));
        assert_eq!(events[2].duration, Some(50));
        assert_eq!(events[3].duration, Some(50));
        assert_eq!(&*events[3].user_comm, "weston-9");
        assert_eq!(events[2].row, Some(0));
        assert_eq!(events[3].row, Some(1));
        assert!(events[3].flags.contains(EventFlags::AUTOGEN_COLOR));
        assert!(events[4].flags.contains(EventFlags::UNLINKED));

        let timeline = correlation.timeline("msm ring0").unwrap();
        assert_eq!(timeline.events, vec![0, 1, 2, 3]);
        assert_eq!(timeline.row_count, 2);
    }
}
