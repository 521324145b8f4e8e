//! The trace.dat implementation of [`TraceReader`].

use super::bytes::{Endian, FileSource, ReadAt};
use super::container::{BufferLayout, TraceHeader};
use super::format::FormatRegistry;
use super::kallsyms::KernelSymbols;
use super::merge::MergeCursor;
use super::ringbuf::{CpuRingBuffer, Record};
use super::tsync::TimestampCorrection;
use crate::config::LoadOptions;
use crate::error::DecodeError;
use crate::event::{parse_number, EventField, TraceEvent};
use crate::string_intern::StringPool;
use crate::traits::{CpuInfo, EventCallback, TraceInfo, TraceReader};
use anyhow::Context;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Reads version 6 and 7 trace.dat captures.
#[derive(Debug, Default)]
pub struct TraceDatReader;

impl TraceDatReader {
    pub fn new() -> Self {
        TraceDatReader
    }
}

impl TraceReader for TraceDatReader {
    fn read(
        &mut self,
        path: &Path,
        options: &LoadOptions,
        pool: &mut StringPool,
        callback: &mut EventCallback<'_>,
    ) -> anyhow::Result<TraceInfo> {
        let src = FileSource::open(path).with_context(|| format!("Failed to open trace file: {}", path.display()))?;
        decode_trace(&src, &path.display().to_string(), options, pool, callback)
            .with_context(|| format!("Failed to decode trace file: {}", path.display()))
    }
}

/// Decodes a whole capture from `src`, calling `callback` once per record
/// in merged timestamp order. Stops early when the callback returns `true`.
pub fn decode_trace(
    src: &dyn ReadAt,
    name: &str,
    options: &LoadOptions,
    pool: &mut StringPool,
    callback: &mut EventCallback<'_>,
) -> Result<TraceInfo, DecodeError> {
    let start = Instant::now();
    let header = TraceHeader::read(src, pool)?;
    let mut info = trace_info(&header, name);
    info!(
        "{}: version {}, {} cpus, {} event formats, {} buffer(s)",
        name,
        header.version,
        header.cpus,
        header.formats.len(),
        header.buffers.len()
    );

    let correction = TimestampCorrection {
        ns_per_tick: options.ts2secs.filter(|t| *t > 0.0).map(|t| 1e9 / t),
        tsc2nsec: header.options.tsc2nsec,
        host_sync: header.options.time_shift.clone(),
        ts_offset: header.options.date_offset + header.options.offset + options.ts_offset,
        raw: options.raw_timestamps,
    };

    let mut rings = Vec::new();
    for buffer in &header.buffers {
        match &buffer.layout {
            BufferLayout::Flyrecord(cpus) => {
                for desc in cpus {
                    let ring = CpuRingBuffer::new(
                        rings.len() as u32,
                        *desc,
                        buffer.page_size,
                        header.long_size,
                        header.endian,
                        header.codec,
                        options.chunk_cache_capacity,
                        src,
                    )?;
                    rings.push(ring);
                }
            }
            BufferLayout::Latency { size, .. } => {
                warn!("{}: latency buffer {:?} ({} bytes) is not decoded", name, buffer.name, size);
            }
        }
    }

    let mut merge = MergeCursor::new(rings).with_correction(correction.clone());
    if options.trim_to_cpu_overlap {
        let trim = merge.first_timestamps(src)?.into_iter().flatten().max();
        if let Some(trim) = trim {
            merge.seek_to_timestamp(trim, src)?;
            info.trimmed_ts = Some(correction.correct(trim, 0));
            debug!("trimmed records before raw timestamp {}", trim);
        }
    }

    let mut builder = EventBuilder::new(&header.formats, header.endian, &correction, options, &info.pid_comm)
        .with_symbols(&header.kallsyms);
    let mut missed_pages = 0u64;
    let mut count = 0u64;

    while let Some(rec) = merge.next(src)? {
        if rec.missed_events {
            missed_pages += 1;
        }
        let payload = merge.record_data(&rec).unwrap_or(&[]);
        let event = match builder.build(&rec, payload, pool) {
            Some(event) => event,
            None => continue,
        };

        let cpu = rec.cpu as usize;
        if info.cpu_info.len() <= cpu {
            info.cpu_info.resize_with(cpu + 1, CpuInfo::default);
            info.cpu_info[cpu].cpu = rec.cpu;
        }
        let stats = &mut info.cpu_info[cpu];
        stats.events += 1;
        stats.min_ts = Some(stats.min_ts.map_or(event.ts, |t| t.min(event.ts)));
        stats.max_ts = Some(stats.max_ts.map_or(event.ts, |t| t.max(event.ts)));
        info.first_ts = Some(info.first_ts.map_or(event.ts, |t| t.min(event.ts)));
        info.last_ts = Some(info.last_ts.map_or(event.ts, |t| t.max(event.ts)));

        count += 1;
        if callback(&info, event) {
            info!("{}: decode stopped after {} events", name, count);
            break;
        }
    }
    merge.finish(src);

    if builder.unknown_types > 0 {
        warn!("{}: skipped {} records with no event format", name, builder.unknown_types);
    }
    if missed_pages > 0 {
        warn!("{}: {} records follow pages with missed events", name, missed_pages);
    }
    info!("{}: read {} events in {:.2}ms", name, count, start.elapsed().as_secs_f64() * 1000.0);
    Ok(info)
}

fn trace_info(header: &TraceHeader, name: &str) -> TraceInfo {
    let mut pid_comm = BTreeMap::new();
    pid_comm.insert(0, Arc::from("<idle>"));
    for (pid, comm) in &header.cmdlines {
        pid_comm.entry(*pid).or_insert_with(|| Arc::from(comm.as_str()));
    }

    let mut cpu_info: Vec<CpuInfo> = (0..header.cpus)
        .map(|cpu| CpuInfo { cpu, ..Default::default() })
        .collect();
    for text in &header.options.cpustats {
        if let Some(stat) = parse_cpustat(text) {
            let cpu = stat.cpu as usize;
            if cpu_info.len() <= cpu {
                cpu_info.resize_with(cpu + 1, CpuInfo::default);
            }
            cpu_info[cpu] = stat;
        }
    }
    if let Some(BufferLayout::Flyrecord(descs)) = header.top_buffer().map(|b| &b.layout) {
        for desc in descs {
            if let Some(stat) = cpu_info.get_mut(desc.cpu as usize) {
                stat.file_offset = desc.offset;
                stat.file_size = desc.size;
            }
        }
    }

    TraceInfo {
        file: name.to_string(),
        file_version: header.version,
        big_endian: header.endian == Endian::Big,
        long_size: header.long_size,
        page_size: header.page_size,
        compression: header.codec.map(|c| c.name().to_string()),
        cpus: header.cpus,
        uname: header.options.uname.clone(),
        tracer_version: header.options.version.clone(),
        trace_clock: header.options.trace_clock.clone(),
        trace_id: header.options.trace_id,
        buffers: header
            .buffers
            .iter()
            .filter(|b| !b.name.is_empty())
            .map(|b| b.name.clone())
            .collect(),
        cpu_info,
        pid_comm,
        pid_tgid: header.options.tgids.iter().filter(|(_, tgid)| *tgid > 0).copied().collect(),
        ..Default::default()
    }
}

/// Parses one CPUSTAT block:
///
/// ```text
/// CPU: 0
/// entries: 1234
/// oldest event ts: 5029.402612
/// ```
pub fn parse_cpustat(text: &str) -> Option<CpuInfo> {
    let mut stat = CpuInfo::default();
    let mut have_cpu = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let num = || value.parse::<u64>().unwrap_or(0);
        match key.trim() {
            "CPU" => {
                stat.cpu = value.parse().ok()?;
                have_cpu = true;
            }
            "entries" => stat.entries = num(),
            "overrun" => stat.overrun = num(),
            "commit overrun" => stat.commit_overrun = num(),
            "bytes" => stat.bytes = num(),
            "oldest event ts" => stat.oldest_event_ts = seconds_to_ns(value),
            "now ts" => stat.now_ts = seconds_to_ns(value),
            "dropped events" => stat.dropped_events = num(),
            "read events" => stat.read_events = num(),
            _ => {}
        }
    }
    have_cpu.then_some(stat)
}

/// `"5029.402612"` -> nanoseconds.
fn seconds_to_ns(s: &str) -> i64 {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs = secs.parse::<i64>().unwrap_or(0);
    let digits: String = frac.chars().take(9).collect();
    let frac_ns = if digits.is_empty() {
        0
    } else {
        digits.parse::<i64>().unwrap_or(0) * 10i64.pow(9 - digits.len() as u32)
    };
    secs * 1_000_000_000 + frac_ns
}

/// Turns raw records into [`TraceEvent`]s.
struct EventBuilder<'a> {
    formats: &'a FormatRegistry,
    endian: Endian,
    correction: &'a TimestampCorrection,
    high_precision_vblank: bool,
    pid_comm: &'a BTreeMap<i32, Arc<str>>,
    comm_pid: HashMap<i32, Arc<str>>,
    symbols: Option<&'a KernelSymbols>,
    unknown_types: u64,
}

impl<'a> EventBuilder<'a> {
    fn new(
        formats: &'a FormatRegistry,
        endian: Endian,
        correction: &'a TimestampCorrection,
        options: &LoadOptions,
        pid_comm: &'a BTreeMap<i32, Arc<str>>,
    ) -> Self {
        EventBuilder {
            formats,
            endian,
            correction,
            high_precision_vblank: options.high_precision_vblank,
            pid_comm,
            comm_pid: HashMap::new(),
            symbols: None,
            unknown_types: 0,
        }
    }

    fn with_symbols(mut self, symbols: &'a KernelSymbols) -> Self {
        if !symbols.is_empty() {
            self.symbols = Some(symbols);
        }
        self
    }

    /// `comm-pid`, with `<...>` for pids the capture never named.
    fn comm(&mut self, pid: i32, pool: &mut StringPool) -> Arc<str> {
        if let Some(comm) = self.comm_pid.get(&pid) {
            return Arc::clone(comm);
        }
        let name = self.pid_comm.get(&pid).map_or("<...>", |c| &**c);
        let comm = pool.intern_owned(format!("{}-{}", name, pid));
        self.comm_pid.insert(pid, Arc::clone(&comm));
        comm
    }

    fn build(&mut self, rec: &Record, payload: &[u8], pool: &mut StringPool) -> Option<TraceEvent> {
        let (ty, irq_flags, pid) = self.formats.read_common(payload, self.endian)?;
        let format = match self.formats.get(ty) {
            Some(f) => Arc::clone(f),
            None => {
                self.unknown_types += 1;
                debug!("cpu {}: no format for event type {} at {:#x}", rec.cpu, ty, rec.offset);
                return None;
            }
        };

        let mut fields = format.decode_fields(payload, self.endian, pool);
        let mut system = Arc::clone(&format.system);
        let mut name = Arc::clone(&format.name);
        if &*format.system == "ftrace" && &*format.name == "function" {
            if let Some(func) = self.resolve_function(&mut fields, pool) {
                system = pool.intern("ftrace-function");
                name = func;
            }
        } else if &*format.system == "ftrace" && &*format.name == "print" {
            system = pool.intern("ftrace-print");
            for field in fields.iter_mut().filter(|f| &*f.key == "buf") {
                let text = field.value.replace('\n', " ");
                field.value = pool.intern(text.trim_end());
            }
        }

        let comm = self.comm(pid, pool);
        let mut ts = self.correction.correct(rec.ts, rec.cpu);
        if self.high_precision_vblank && &*format.name == "drm_vblank_event" {
            if let Some(time) = vblank_time(&fields) {
                ts = if self.correction.raw { time } else { time + self.correction.ts_offset };
            }
        }

        let mut event = TraceEvent::new(ts, rec.cpu, pid, comm, system, name, Vec::new());
        event.irq_flags = irq_flags;
        for field in &fields {
            match &*field.key {
                "timeline" => event.timeline = Some(Arc::clone(&field.value)),
                "context" => event.context = parse_number(&field.value).map(|v| v as u64),
                "seqno" => event.seqno = parse_number(&field.value).map(|v| v as u64),
                "crtc" => event.crtc = parse_number(&field.value).map(|v| v as i32),
                _ => {}
            }
        }
        event.fields = fields;
        Some(event)
    }

    /// Appends ` (func)` to the `ip` and `parent_ip` values of a function
    /// trace record. Returns the function named by `ip`.
    fn resolve_function(&self, fields: &mut [EventField], pool: &mut StringPool) -> Option<Arc<str>> {
        let symbols = self.symbols?;
        let mut found = None;
        for field in fields.iter_mut() {
            let is_ip = &*field.key == "ip";
            if !is_ip && &*field.key != "parent_ip" {
                continue;
            }
            let Some(func) = parse_number(&field.value).and_then(|addr| symbols.find(addr as u64)) else {
                continue;
            };
            field.value = pool.intern_owned(format!("{} ({})", field.value, func));
            if is_ip {
                found = Some(pool.intern(func));
            }
        }
        found
    }
}

/// The `time` field of a vblank carrying a non-zero `high_prec`.
fn vblank_time(fields: &[EventField]) -> Option<i64> {
    let get = |key: &str| fields.iter().find(|f| &*f.key == key).and_then(|f| parse_number(&f.value));
    match get("high_prec") {
        Some(hp) if hp != 0 => get("time"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpustat() {
        let text = "CPU: 2\nentries: 120\noverrun: 3\ncommit overrun: 0\nbytes: 8192\n\
                    oldest event ts: 5029.402612\nnow ts: 5031.000001\ndropped events: 7\nread events: 11\n";
        let stat = parse_cpustat(text).unwrap();
        assert_eq!(stat.cpu, 2);
        assert_eq!(stat.entries, 120);
        assert_eq!(stat.overrun, 3);
        assert_eq!(stat.bytes, 8192);
        assert_eq!(stat.oldest_event_ts, 5_029_402_612_000);
        assert_eq!(stat.now_ts, 5_031_000_001_000);
        assert_eq!(stat.dropped_events, 7);
        assert_eq!(stat.read_events, 11);

        assert!(parse_cpustat("entries: 5\n").is_none());
    }

    #[test]
    fn test_vblank_time_requires_high_prec() {
        let field = |k: &str, v: &str| EventField { key: Arc::from(k), value: Arc::from(v) };
        let fields = vec![field("crtc", "0"), field("high_prec", "1"), field("time", "123456")];
        assert_eq!(vblank_time(&fields), Some(123456));

        let fields = vec![field("high_prec", "0"), field("time", "123456")];
        assert_eq!(vblank_time(&fields), None);
    }
}
