use crate::config::LoadOptions;
use crate::event::TraceEvent;
use crate::string_intern::StringPool;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Per-CPU statistics, from the capture's CPUSTAT text and from decoding.
#[derive(Debug, Clone, Default)]
pub struct CpuInfo {
    pub cpu: u32,
    pub file_offset: u64,
    pub file_size: u64,
    pub entries: u64,
    pub overrun: u64,
    pub commit_overrun: u64,
    pub bytes: u64,
    pub oldest_event_ts: i64,
    pub now_ts: i64,
    pub dropped_events: u64,
    pub read_events: u64,
    /// Records decoded from this CPU's buffers.
    pub events: u64,
    pub min_ts: Option<i64>,
    pub max_ts: Option<i64>,
}

/// Capture-level information known once headers have been read.
///
/// Passed to the decode callback alongside every event and returned by the
/// reader when decoding finishes.
#[derive(Debug, Clone, Default)]
pub struct TraceInfo {
    pub file: String,
    pub file_version: u32,
    pub big_endian: bool,
    pub long_size: u32,
    pub page_size: u32,
    pub compression: Option<String>,
    pub cpus: u32,
    pub uname: Option<String>,
    pub tracer_version: Option<String>,
    pub trace_clock: Option<String>,
    pub trace_id: Option<u64>,
    /// Named ring-buffer instances besides the top-level one.
    pub buffers: Vec<String>,
    pub cpu_info: Vec<CpuInfo>,
    /// pid -> comm, seeded from the capture's saved cmdlines.
    pub pid_comm: BTreeMap<i32, Arc<str>>,
    /// pid -> tgid, from the capture's saved tgid table.
    pub pid_tgid: BTreeMap<i32, i32>,
    /// Records before this timestamp were dropped by CPU-overlap trimming.
    pub trimmed_ts: Option<i64>,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
}

/// Decode callback: receives every record in non-decreasing timestamp order.
/// Returning `true` asks the reader to stop before the next record.
pub type EventCallback<'a> = dyn FnMut(&TraceInfo, TraceEvent) -> bool + 'a;

/// A producer of raw events.
///
/// The binary trace.dat decoder is one implementation; any other capture
/// format feeds the correlator through this same callback shape.
pub trait TraceReader: Send {
    /// Decodes the file at `path`, invoking `callback` once per record.
    fn read(
        &mut self,
        path: &Path,
        options: &LoadOptions,
        pool: &mut StringPool,
        callback: &mut EventCallback<'_>,
    ) -> anyhow::Result<TraceInfo>;
}
