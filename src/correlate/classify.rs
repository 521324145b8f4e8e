//! One-time event classification.

use crate::event::{
    AmdStage, DrmSchedStage, EventFlags, EventKind, I915Stage, I915Wait, MsmStage, TraceEvent,
};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static EXACT_NAMES: Lazy<HashMap<&'static str, EventKind>> = Lazy::new(|| {
    HashMap::from([
        ("sched_switch", EventKind::SchedSwitch),
        ("sched_process_fork", EventKind::ProcessFork),
        ("sched_process_exec", EventKind::ProcessExec),
        ("sched_process_exit", EventKind::ProcessExit),
        ("drm_vblank_event", EventKind::Vblank),
        ("drm_vblank_event_queued", EventKind::VblankQueued),
        ("drm_sched_job", EventKind::DrmSched(DrmSchedStage::Job)),
        ("drm_run_job", EventKind::DrmSched(DrmSchedStage::RunJob)),
        ("drm_sched_process_job", EventKind::DrmSched(DrmSchedStage::ProcessJob)),
        ("msm_gpu_submit_flush", EventKind::Msm(MsmStage::Flush)),
        ("msm_gpu_submit_retired", EventKind::Msm(MsmStage::Retired)),
        ("intel_engine_notify", EventKind::I915Request(I915Stage::Notify)),
    ])
});

/// Decides an event's family from its system, name and, for ambiguous
/// names, the presence of the fields the family needs.
pub fn classify(event: &TraceEvent) -> EventKind {
    let name = &*event.name;
    if &*event.system == "ftrace-print" {
        return EventKind::FtracePrint;
    }
    if event.flags.contains(EventFlags::I915_PERF) || &*event.system == "i915-perf" {
        return EventKind::I915Perf;
    }

    if let Some(kind) = EXACT_NAMES.get(name) {
        return *kind;
    }

    if let Some(stage) = amd_stage(event) {
        return EventKind::Amd(stage);
    }

    let suffix = name
        .strip_prefix("i915_gem_request_")
        .or_else(|| name.strip_prefix("i915_request_"));
    match suffix {
        Some("queue") => EventKind::I915Request(I915Stage::Queue),
        Some("add") => EventKind::I915Request(I915Stage::Add),
        Some("submit") => EventKind::I915Request(I915Stage::Submit),
        Some("in") => EventKind::I915Request(I915Stage::In),
        Some("out") => EventKind::I915Request(I915Stage::Out),
        Some("wait_begin") => EventKind::I915Wait(I915Wait::Begin),
        Some("wait_end") => EventKind::I915Wait(I915Wait::End),
        _ => EventKind::Generic,
    }
}

/// AMD stages need a non-zero seqno plus `context` and `timeline` fields.
fn amd_stage(event: &TraceEvent) -> Option<AmdStage> {
    if event.seqno.unwrap_or(0) == 0 || event.field("context").is_none() || event.field("timeline").is_none() {
        return None;
    }
    let name = &*event.name;
    if name.contains("fence_signaled") {
        Some(AmdStage::FenceSignaled)
    } else if name.contains("amdgpu_cs_ioctl") {
        Some(AmdStage::CsIoctl)
    } else if name.contains("amdgpu_sched_run_job") {
        Some(AmdStage::RunJob)
    } else {
        None
    }
}

/// Queue-state flags implied by a family stage.
pub fn stage_flags(kind: EventKind) -> EventFlags {
    match kind {
        EventKind::Amd(AmdStage::CsIoctl) | EventKind::DrmSched(DrmSchedStage::Job) => EventFlags::SW_QUEUE,
        EventKind::Amd(AmdStage::RunJob) | EventKind::DrmSched(DrmSchedStage::RunJob) | EventKind::Msm(MsmStage::Flush) => {
            EventFlags::HW_QUEUE
        }
        EventKind::Amd(AmdStage::FenceSignaled)
        | EventKind::DrmSched(DrmSchedStage::ProcessJob)
        | EventKind::Msm(MsmStage::Retired) => EventFlags::FENCE_SIGNALED,
        _ => EventFlags::NONE,
    }
}

/// Classifies every event and records the result on it.
pub fn classify_all(events: &mut [TraceEvent]) {
    for event in events.iter_mut() {
        event.kind = classify(event);
        event.flags.insert(stage_flags(event.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventField;
    use std::sync::Arc;

    fn event(system: &str, name: &str, fields: &[(&str, &str)]) -> TraceEvent {
        let fields = fields
            .iter()
            .map(|(k, v)| EventField { key: Arc::from(*k), value: Arc::from(*v) })
            .collect();
        TraceEvent::new(0, 0, 1, Arc::from("x-1"), Arc::from(system), Arc::from(name), fields)
    }

    #[test]
    fn test_amd_needs_key_fields() {
        let mut e = event("dma_fence", "dma_fence_signaled", &[("context", "5"), ("timeline", "gfx")]);
        e.seqno = Some(3);
        assert_eq!(classify(&e), EventKind::Amd(AmdStage::FenceSignaled));

        e.seqno = Some(0);
        assert_eq!(classify(&e), EventKind::Generic);

        let mut e = event("amdgpu", "amdgpu_cs_ioctl", &[("context", "5")]);
        e.seqno = Some(3);
        assert_eq!(classify(&e), EventKind::Generic);
    }

    #[test]
    fn test_i915_suffixes() {
        let e = event("i915", "i915_request_submit", &[]);
        assert_eq!(classify(&e), EventKind::I915Request(I915Stage::Submit));
        let e = event("i915", "i915_gem_request_wait_end", &[]);
        assert_eq!(classify(&e), EventKind::I915Wait(I915Wait::End));
        let e = event("i915", "intel_engine_notify", &[]);
        assert_eq!(classify(&e), EventKind::I915Request(I915Stage::Notify));
    }

    #[test]
    fn test_print_and_perf() {
        let e = event("ftrace-print", "print", &[("buf", "hello")]);
        assert_eq!(classify(&e), EventKind::FtracePrint);
        let mut e = event("x", "i915-perf-begin", &[]);
        e.flags.insert(EventFlags::I915_PERF);
        assert_eq!(classify(&e), EventKind::I915Perf);
    }

    #[test]
    fn test_classify_all_sets_queue_flags() {
        let mut events = vec![event("drm", "drm_run_job", &[]), event("msm", "msm_gpu_submit_retired", &[])];
        classify_all(&mut events);
        assert!(events[0].flags.contains(EventFlags::HW_QUEUE));
        assert!(events[1].flags.contains(EventFlags::FENCE_SIGNALED));
    }
}
