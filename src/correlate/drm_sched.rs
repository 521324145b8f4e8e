//! Generic DRM GPU scheduler: `drm_sched_job` -> `drm_run_job` -> `drm_sched_process_job`.
//!
//! Completion events only carry the job's fence pointer. The fence maps to
//! the job's sequence number while the job is outstanding; once the job
//! signals the pointer may be handed to a new job.

use super::{layout_serialized, CorrelationKey, CorrelationPass, Timeline, TimelineFamily};
use crate::event::{DrmSchedStage, EventFlags, EventId, TraceEvent};
use log::warn;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

fn fence_handle(event: &TraceEvent) -> Option<u64> {
    let value = event.field("fence")?;
    event
        .field_u64("fence")
        .or_else(|| u64::from_str_radix(value.trim_start_matches("0x"), 16).ok())
}

#[derive(Debug, Default)]
pub struct DrmSchedState {
    /// Fence handle -> sequence number of the job still holding it.
    outstanding: HashMap<u64, u64>,
    /// Sequence number -> ring name from the job event.
    rings: HashMap<u64, Arc<str>>,
    /// Events of each sequence number and stage still waiting for their
    /// next stage, oldest first.
    unmatched: HashMap<(u64, DrmSchedStage), Vec<EventId>>,
    ring_locs: BTreeMap<Arc<str>, Vec<EventId>>,
    seqnos: Vec<u64>,
}

impl DrmSchedState {
    pub fn add_event(&mut self, pass: &mut CorrelationPass<'_>, id: EventId, stage: DrmSchedStage) {
        let event = pass.event(id);
        let Some(fence) = fence_handle(event) else {
            return;
        };
        let id_seqno = event.field_u64("id");
        let ring = event.field_arc("name").or_else(|| event.field_arc("ring")).cloned();

        let seqno = match stage {
            DrmSchedStage::Job => {
                let Some(seqno) = id_seqno else {
                    return;
                };
                if let Some(prev) = self.outstanding.get(&fence) {
                    warn!("drm_sched_job {} reuses fence {:#x} still held by job {}", seqno, fence, prev);
                    self.drop_event(pass, id);
                    return;
                }
                self.outstanding.insert(fence, seqno);
                if let Some(ring) = ring {
                    self.rings.insert(seqno, ring);
                }
                self.seqnos.push(seqno);
                seqno
            }
            DrmSchedStage::RunJob | DrmSchedStage::ProcessJob => {
                match id_seqno.or_else(|| self.outstanding.get(&fence).copied()) {
                    Some(seqno) => seqno,
                    None => {
                        self.drop_event(pass, id);
                        return;
                    }
                }
            }
        };

        let key = CorrelationKey::DrmSeqno(seqno);
        if stage != DrmSchedStage::Job {
            let wanted = match stage {
                DrmSchedStage::RunJob => DrmSchedStage::Job,
                _ => DrmSchedStage::RunJob,
            };
            let Some(prev) = self.take_unmatched(seqno, wanted) else {
                self.drop_event(pass, id);
                return;
            };
            let group = pass.indices.key_group(key).map(<[EventId]>::to_vec).unwrap_or_default();
            let first = group.first().copied().unwrap_or(prev);
            pass.link(id, prev, first);

            if stage == DrmSchedStage::ProcessJob {
                self.outstanding.remove(&fence);
                let members: Vec<EventId> = group.iter().copied().chain(std::iter::once(id)).collect();
                for &member in &members {
                    pass.event_mut(member).flags.insert(EventFlags::TIMELINE);
                }
                if let Some(ring) = self.rings.get(&seqno) {
                    self.ring_locs.entry(Arc::clone(ring)).or_default().extend(members);
                }
            }
        }

        if stage != DrmSchedStage::ProcessJob {
            self.unmatched.entry((seqno, stage)).or_default().push(id);
        }
        pass.indices.add_key(key, id);
        pass.indices.add_key(CorrelationKey::DrmFence(fence), id);
    }

    /// Pops the newest waiting event of `stage` for `seqno`.
    fn take_unmatched(&mut self, seqno: u64, stage: DrmSchedStage) -> Option<EventId> {
        let waiting = self.unmatched.get_mut(&(seqno, stage))?;
        let id = waiting.pop();
        if waiting.is_empty() {
            self.unmatched.remove(&(seqno, stage));
        }
        id
    }

    fn drop_event(&mut self, pass: &mut CorrelationPass<'_>, id: EventId) {
        pass.event_mut(id).flags.insert(EventFlags::DROPPED);
        pass.stats.dropped += 1;
    }

    pub fn finish(self, pass: &mut CorrelationPass<'_>) -> Vec<Timeline> {
        let pruned = self
            .seqnos
            .iter()
            .filter(|s| {
                pass.indices
                    .key_group(CorrelationKey::DrmSeqno(**s))
                    .map_or(true, |g| !g.iter().any(|&id| pass.event(id).is_timeline()))
            })
            .count();
        pass.stats.pruned_groups += pruned;

        let mut timelines = Vec::new();
        for (name, mut locs) in self.ring_locs {
            locs.sort_unstable();
            locs.dedup();
            let row_count = layout_serialized(pass, &locs);
            timelines.push(Timeline {
                name,
                family: TimelineFamily::DrmSched,
                events: locs,
                row_count,
            });
        }
        timelines
    }
}
