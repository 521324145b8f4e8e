//! The decoded event record shared by the reader and the correlator.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Dense index into the session's event array.
pub type EventId = u32;

/// Derived-state bits attached to an event.
///
/// The event's family is held separately in [`EventKind`]; these bits record
/// what the correlation pass learned about it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const NONE: Self = Self(0);
    /// Submitted, not yet dispatched to hardware.
    pub const SW_QUEUE: Self = Self(1 << 0);
    /// Dispatched to hardware, awaiting completion.
    pub const HW_QUEUE: Self = Self(1 << 1);
    pub const FENCE_SIGNALED: Self = Self(1 << 2);
    /// Member of a GPU timeline that survived pruning.
    pub const TIMELINE: Self = Self(1 << 3);
    /// The previous task was still runnable when it was switched out.
    pub const TASK_RUNNING: Self = Self(1 << 4);
    /// Color was computed by the correlator rather than set by the user.
    pub const AUTOGEN_COLOR: Self = Self(1 << 5);
    /// Produced by a performance-counter source rather than ftrace.
    pub const I915_PERF: Self = Self(1 << 6);
    /// Stage event that found no predecessor with the same key.
    pub const UNLINKED: Self = Self(1 << 7);
    /// Event was rejected by chain linking and excluded from timelines.
    pub const DROPPED: Self = Self(1 << 8);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(EventFlags, &str)] = &[
            (EventFlags::SW_QUEUE, "SW_QUEUE"),
            (EventFlags::HW_QUEUE, "HW_QUEUE"),
            (EventFlags::FENCE_SIGNALED, "FENCE_SIGNALED"),
            (EventFlags::TIMELINE, "TIMELINE"),
            (EventFlags::TASK_RUNNING, "TASK_RUNNING"),
            (EventFlags::AUTOGEN_COLOR, "AUTOGEN_COLOR"),
            (EventFlags::I915_PERF, "I915_PERF"),
            (EventFlags::UNLINKED, "UNLINKED"),
            (EventFlags::DROPPED, "DROPPED"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "EventFlags({})", set.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmdStage {
    CsIoctl,
    RunJob,
    FenceSignaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrmSchedStage {
    Job,
    RunJob,
    ProcessJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsmStage {
    Flush,
    Retired,
}

/// i915 request lifecycle stages in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum I915Stage {
    Queue,
    Add,
    Submit,
    In,
    Notify,
    Out,
}

impl I915Stage {
    pub const ALL: [I915Stage; 6] = [
        I915Stage::Queue,
        I915Stage::Add,
        I915Stage::Submit,
        I915Stage::In,
        I915Stage::Notify,
        I915Stage::Out,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum I915Wait {
    Begin,
    End,
}

/// Classification computed once per event by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventKind {
    #[default]
    Generic,
    SchedSwitch,
    ProcessFork,
    ProcessExec,
    ProcessExit,
    Vblank,
    VblankQueued,
    FtracePrint,
    Amd(AmdStage),
    DrmSched(DrmSchedStage),
    Msm(MsmStage),
    I915Request(I915Stage),
    I915Wait(I915Wait),
    I915Perf,
}

/// One interned key/value pair from the event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventField {
    pub key: Arc<str>,
    pub value: Arc<str>,
}

/// A decoded trace record, later enriched in place by the correlator.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub id: EventId,
    /// Corrected timestamp in nanoseconds.
    pub ts: i64,
    pub cpu: u32,
    pub pid: i32,
    /// `comm-pid` display string.
    pub comm: Arc<str>,
    /// Process that submitted the work this event belongs to.
    pub user_comm: Arc<str>,
    pub name: Arc<str>,
    pub system: Arc<str>,
    /// GPU timeline (ring) name, when the payload carries one.
    pub timeline: Option<Arc<str>>,
    pub context: Option<u64>,
    pub seqno: Option<u64>,
    pub crtc: Option<i32>,
    pub fields: Vec<EventField>,
    /// `common_flags` from the payload header (irqs-off, hardirq, softirq).
    pub irq_flags: u8,
    pub flags: EventFlags,
    pub kind: EventKind,
    pub duration: Option<i64>,
    pub predecessor: Option<EventId>,
    pub row: Option<u32>,
    pub color: Option<u32>,
}

impl TraceEvent {
    /// Creates a raw event as produced by a decoder; correlation fields start empty.
    pub fn new(
        ts: i64,
        cpu: u32,
        pid: i32,
        comm: Arc<str>,
        system: Arc<str>,
        name: Arc<str>,
        fields: Vec<EventField>,
    ) -> Self {
        TraceEvent {
            id: 0,
            ts,
            cpu,
            pid,
            user_comm: Arc::clone(&comm),
            comm,
            name,
            system,
            timeline: None,
            context: None,
            seqno: None,
            crtc: None,
            fields,
            irq_flags: 0,
            flags: EventFlags::NONE,
            kind: EventKind::Generic,
            duration: None,
            predecessor: None,
            row: None,
            color: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| &*f.key == key)
            .map(|f| &*f.value)
    }

    pub fn field_arc(&self, key: &str) -> Option<&Arc<str>> {
        self.fields.iter().find(|f| &*f.key == key).map(|f| &f.value)
    }

    /// Parses a numeric field, accepting decimal or `0x` hex.
    pub fn field_i64(&self, key: &str) -> Option<i64> {
        self.field(key).and_then(parse_number)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.field(key).and_then(parse_number).map(|v| v as u64)
    }

    pub fn has_duration(&self) -> bool {
        self.duration.is_some()
    }

    pub fn end_ts(&self) -> i64 {
        self.ts + self.duration.unwrap_or(0)
    }

    pub fn is_timeline(&self) -> bool {
        self.flags.contains(EventFlags::TIMELINE)
    }
}

/// Parses integers the way field values are printed: decimal, `0x` hex, or negative decimal.
pub fn parse_number(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    s.parse::<u64>().ok().map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_fields(fields: &[(&str, &str)]) -> TraceEvent {
        let fields = fields
            .iter()
            .map(|(k, v)| EventField { key: Arc::from(*k), value: Arc::from(*v) })
            .collect();
        TraceEvent::new(10, 0, 42, Arc::from("Xorg-42"), Arc::from("amdgpu"), Arc::from("amdgpu_cs_ioctl"), fields)
    }

    #[test]
    fn test_field_lookup() {
        let event = event_with_fields(&[("seqno", "17"), ("ring", "0x1f"), ("timeline", "gfx")]);
        assert_eq!(event.field("timeline"), Some("gfx"));
        assert_eq!(event.field_u64("seqno"), Some(17));
        assert_eq!(event.field_i64("ring"), Some(31));
        assert_eq!(event.field("missing"), None);
        assert_eq!(&*event.user_comm, "Xorg-42");
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("-5"), Some(-5));
        assert_eq!(parse_number(" 12 "), Some(12));
        assert_eq!(parse_number("0xffffffffffffffff"), Some(-1));
        assert_eq!(parse_number("18446744073709551615"), Some(-1));
        assert_eq!(parse_number("gfx"), None);
    }

    #[test]
    fn test_flags() {
        let mut flags = EventFlags::SW_QUEUE | EventFlags::AUTOGEN_COLOR;
        assert!(flags.contains(EventFlags::SW_QUEUE));
        assert!(!flags.contains(EventFlags::HW_QUEUE));
        flags.remove(EventFlags::SW_QUEUE);
        flags.insert(EventFlags::FENCE_SIGNALED);
        assert!(flags.intersects(EventFlags::FENCE_SIGNALED | EventFlags::HW_QUEUE));
        assert_eq!(format!("{:?}", flags), "EventFlags(FENCE_SIGNALED | AUTOGEN_COLOR)");
    }
}
