//! Container-level parsing: file header, metadata parts, options and the
//! per-CPU data descriptors.
//!
//! Version 6 files are strictly sequential and are read through a forward-only
//! [`FileState`] machine. Version 7 files locate every part through option
//! blocks that point at sections; the same state labels are updated as parts
//! are found.

use super::bytes::{Decoder, Endian, ReadAt, SliceReader};
use super::compress::Codec;
use super::format::{EventFormat, FormatRegistry};
use super::kallsyms::KernelSymbols;
use super::tsync::{Tsc2Nsec, TsyncTable};
use crate::error::DecodeError;
use crate::string_intern::StringPool;
use log::{debug, warn};

pub const MAGIC: &[u8; 10] = b"\x17\x08\x44tracing";
pub const FILE_VERSION_SEQUENTIAL: u32 = 6;
pub const FILE_VERSION_SECTIONED: u32 = 7;

/// Section flag: payload is `{u32 compressed size, u32 size, bytes}`.
pub const SECTION_FLAG_COMPRESSED: u16 = 1 << 0;

pub mod option_id {
    pub const DONE: u16 = 0;
    pub const DATE: u16 = 1;
    pub const CPUSTAT: u16 = 2;
    pub const BUFFER: u16 = 3;
    pub const TRACECLOCK: u16 = 4;
    pub const UNAME: u16 = 5;
    pub const HOOK: u16 = 6;
    pub const OFFSET: u16 = 7;
    pub const CPUCOUNT: u16 = 8;
    pub const VERSION: u16 = 9;
    pub const PROCMAPS: u16 = 10;
    pub const TRACEID: u16 = 11;
    pub const TIME_SHIFT: u16 = 12;
    pub const GUEST: u16 = 13;
    pub const TSC2NSEC: u16 = 14;
    pub const STRINGS: u16 = 15;
    pub const HEADER_INFO: u16 = 16;
    pub const FTRACE_EVENTS: u16 = 17;
    pub const EVENT_FORMATS: u16 = 18;
    pub const KALLSYMS: u16 = 19;
    pub const PRINTK: u16 = 20;
    pub const CMDLINES: u16 = 21;
    pub const BUFFER_TEXT: u16 = 22;
    /// gpuvis extension: `pid tgid` lines saved by the recorder.
    pub const SAVED_TGIDS: u16 = 32;
}

/// Container read progress. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileState {
    Init,
    Headers,
    FtraceEvents,
    AllEvents,
    Kallsyms,
    Printk,
    Cmdlines,
    CpuCount,
    Options,
    CpuLatency,
    CpuFlyrecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDataDesc {
    pub cpu: u32,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferLayout {
    /// One paged ring buffer per CPU.
    Flyrecord(Vec<CpuDataDesc>),
    /// A single contiguous text region.
    Latency { offset: u64, size: u64 },
}

/// A ring-buffer instance. The top-level buffer has an empty name.
#[derive(Debug, Clone)]
pub struct BufferInstance {
    pub name: String,
    pub clock: Option<String>,
    pub page_size: u32,
    pub layout: BufferLayout,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// DATE option, converted from microseconds to nanoseconds.
    pub date_offset: i64,
    pub offset: i64,
    pub trace_clock: Option<String>,
    pub uname: Option<String>,
    pub version: Option<String>,
    pub trace_id: Option<u64>,
    pub cpustats: Vec<String>,
    pub tsc2nsec: Option<Tsc2Nsec>,
    pub time_shift: Option<TsyncTable>,
    pub strings: Vec<u8>,
    /// `(pid, tgid)` pairs from SAVED_TGIDS or an oversized CPUCOUNT.
    pub tgids: Vec<(i32, i32)>,
    pub skipped: Vec<u16>,
}

/// Everything in a capture except the event data itself.
#[derive(Debug)]
pub struct TraceHeader {
    pub version: u32,
    pub endian: Endian,
    pub long_size: u32,
    pub page_size: u32,
    pub codec: Option<Codec>,
    pub compression: Option<(String, String)>,
    pub state: FileState,
    pub header_page: String,
    pub header_event: String,
    pub formats: FormatRegistry,
    pub kallsyms_size: usize,
    pub kallsyms: KernelSymbols,
    pub printk_size: usize,
    pub cmdlines: Vec<(i32, String)>,
    pub cpus: u32,
    pub options: CaptureOptions,
    /// Index 0 is the top-level buffer once CPU data has been located.
    pub buffers: Vec<BufferInstance>,
    pub file_size: u64,
}

impl TraceHeader {
    /// Reads and validates the fixed file header. Rejects unsupported
    /// versions before anything else is parsed.
    pub fn open(src: &dyn ReadAt) -> Result<(Self, u64), DecodeError> {
        let mut dec = Decoder::new(src, 0, Endian::Little);
        let magic = dec.bytes(MAGIC.len()).map_err(|_| DecodeError::BadMagic)?;
        if magic != MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let version_str = dec.cstr()?;
        let version = match version_str.trim().parse::<u32>() {
            Ok(v @ (FILE_VERSION_SEQUENTIAL | FILE_VERSION_SECTIONED)) => v,
            _ => return Err(DecodeError::UnsupportedVersion(version_str)),
        };

        let endian = if dec.u8()? != 0 { Endian::Big } else { Endian::Little };
        dec.set_endian(endian);
        let long_size = dec.u8()? as u32;
        let page_size = dec.u32()?;

        let mut header = TraceHeader {
            version,
            endian,
            long_size,
            page_size,
            codec: None,
            compression: None,
            state: FileState::Init,
            header_page: String::new(),
            header_event: String::new(),
            formats: FormatRegistry::new(),
            kallsyms_size: 0,
            kallsyms: KernelSymbols::default(),
            printk_size: 0,
            cmdlines: Vec::new(),
            cpus: 0,
            options: CaptureOptions::default(),
            buffers: Vec::new(),
            file_size: src.len(),
        };

        if version >= FILE_VERSION_SECTIONED {
            let name = dec.cstr()?;
            let comp_version = dec.cstr()?;
            header.codec = Codec::from_name(&name, &comp_version)?;
            header.compression = Some((name, comp_version));
        }

        Ok((header, dec.pos()))
    }

    /// Reads the whole container header.
    pub fn read(src: &dyn ReadAt, pool: &mut StringPool) -> Result<Self, DecodeError> {
        let (header, pos) = Self::open(src)?;
        let mut parser = HeaderParser { src, dec: Decoder::new(src, pos, header.endian), header };
        if parser.header.version >= FILE_VERSION_SECTIONED {
            parser.read_sectioned(pool)?;
        } else {
            parser.read_sequential(pool)?;
        }
        parser.validate_cpu_data()?;
        Ok(parser.header)
    }

    pub fn top_buffer(&self) -> Option<&BufferInstance> {
        self.buffers.iter().find(|b| b.name.is_empty())
    }
}

struct HeaderParser<'a> {
    src: &'a dyn ReadAt,
    dec: Decoder<'a>,
    header: TraceHeader,
}

fn expect_tag(dec: &mut Decoder<'_>, tag: &'static str) -> Result<(), DecodeError> {
    let offset = dec.pos();
    let found = dec.bytes(tag.len())?;
    if found != tag.as_bytes() {
        return Err(DecodeError::BadTag {
            offset,
            expected: tag,
            found: String::from_utf8_lossy(&found).into_owned(),
        });
    }
    Ok(())
}

fn read_header_info(dec: &mut Decoder<'_>, header: &mut TraceHeader) -> Result<(), DecodeError> {
    expect_tag(dec, "header_page\0")?;
    let size = dec.u64()?;
    header.header_page = dec.text(size as usize)?;
    expect_tag(dec, "header_event\0")?;
    let size = dec.u64()?;
    header.header_event = dec.text(size as usize)?;
    Ok(())
}

fn read_format_list(
    dec: &mut Decoder<'_>,
    system: &str,
    formats: &mut FormatRegistry,
    pool: &mut StringPool,
) -> Result<(), DecodeError> {
    let count = dec.u32()?;
    for _ in 0..count {
        let size = dec.u64()?;
        let text = dec.text(size as usize)?;
        formats.add(EventFormat::parse(system, &text, pool)?);
    }
    Ok(())
}

fn read_event_systems(dec: &mut Decoder<'_>, formats: &mut FormatRegistry, pool: &mut StringPool) -> Result<(), DecodeError> {
    let systems = dec.u32()?;
    for _ in 0..systems {
        let system = dec.cstr()?;
        read_format_list(dec, &system, formats, pool)?;
    }
    Ok(())
}

fn parse_cmdlines(text: &str) -> Vec<(i32, String)> {
    text.lines()
        .filter_map(|line| {
            let (pid, comm) = line.trim_start().split_once(' ')?;
            Some((pid.parse().ok()?, comm.to_string()))
        })
        .collect()
}

impl<'a> HeaderParser<'a> {
    fn advance(&mut self, state: FileState) {
        if state > self.header.state {
            self.header.state = state;
        }
    }

    fn read_headers(&mut self) -> Result<(), DecodeError> {
        if self.header.state >= FileState::Headers {
            return Ok(());
        }
        read_header_info(&mut self.dec, &mut self.header)?;
        self.advance(FileState::Headers);
        Ok(())
    }

    fn read_ftrace_events(&mut self, pool: &mut StringPool) -> Result<(), DecodeError> {
        if self.header.state >= FileState::FtraceEvents {
            return Ok(());
        }
        read_format_list(&mut self.dec, "ftrace", &mut self.header.formats, pool)?;
        self.advance(FileState::FtraceEvents);
        Ok(())
    }

    fn read_all_events(&mut self, pool: &mut StringPool) -> Result<(), DecodeError> {
        if self.header.state >= FileState::AllEvents {
            return Ok(());
        }
        read_event_systems(&mut self.dec, &mut self.header.formats, pool)?;
        self.advance(FileState::AllEvents);
        Ok(())
    }

    fn read_kallsyms(&mut self) -> Result<(), DecodeError> {
        if self.header.state >= FileState::Kallsyms {
            return Ok(());
        }
        let size = self.dec.u32()?;
        let text = self.dec.text(size as usize)?;
        self.header.kallsyms_size = size as usize;
        self.header.kallsyms = KernelSymbols::parse(&text);
        self.advance(FileState::Kallsyms);
        Ok(())
    }

    fn read_printk(&mut self) -> Result<(), DecodeError> {
        if self.header.state >= FileState::Printk {
            return Ok(());
        }
        let size = self.dec.u32()?;
        self.dec.skip(size as u64)?;
        self.header.printk_size = size as usize;
        self.advance(FileState::Printk);
        Ok(())
    }

    fn read_cmdlines(&mut self) -> Result<(), DecodeError> {
        if self.header.state >= FileState::Cmdlines {
            return Ok(());
        }
        let size = self.dec.u64()?;
        let text = self.dec.text(size as usize)?;
        self.header.cmdlines = parse_cmdlines(&text);
        self.advance(FileState::Cmdlines);
        Ok(())
    }

    fn read_cpu_count(&mut self) -> Result<(), DecodeError> {
        if self.header.state >= FileState::CpuCount {
            return Ok(());
        }
        self.header.cpus = self.dec.u32()?;
        self.advance(FileState::CpuCount);
        Ok(())
    }

    /// Version 6: options block, then the `flyrecord` or `latency` tag.
    fn read_options_and_cpu_data(&mut self) -> Result<(), DecodeError> {
        if self.header.state >= FileState::CpuLatency {
            return Ok(());
        }

        let mut tag_offset = self.dec.pos();
        let mut tag = self.dec.bytes(10)?;
        if tag.starts_with(b"options") {
            self.read_sequential_options()?;
            self.advance(FileState::Options);
            tag_offset = self.dec.pos();
            tag = self.dec.bytes(10)?;
        }

        if tag.starts_with(b"latency") {
            let offset = self.dec.pos();
            self.header.buffers.insert(
                0,
                BufferInstance {
                    name: String::new(),
                    clock: self.header.options.trace_clock.clone(),
                    page_size: self.header.page_size,
                    layout: BufferLayout::Latency { offset, size: self.header.file_size - offset },
                },
            );
            self.advance(FileState::CpuLatency);
        } else if tag.starts_with(b"flyrecord") {
            let cpus = self.read_cpu_table(self.header.cpus)?;
            self.header.buffers.insert(
                0,
                BufferInstance {
                    name: String::new(),
                    clock: self.header.options.trace_clock.clone(),
                    page_size: self.header.page_size,
                    layout: BufferLayout::Flyrecord(cpus),
                },
            );
            self.advance(FileState::CpuFlyrecord);
        } else {
            return Err(DecodeError::BadTag {
                offset: tag_offset,
                expected: "flyrecord",
                found: String::from_utf8_lossy(&tag).trim_end_matches('\0').to_string(),
            });
        }
        Ok(())
    }

    /// Version 6 per-CPU `{u64 offset, u64 size}` table at the current position.
    fn read_cpu_table(&mut self, cpus: u32) -> Result<Vec<CpuDataDesc>, DecodeError> {
        (0..cpus)
            .map(|cpu| {
                let offset = self.dec.u64()?;
                let size = self.dec.u64()?;
                Ok(CpuDataDesc { cpu, offset, size })
            })
            .collect()
    }

    fn read_sequential_options(&mut self) -> Result<(), DecodeError> {
        let mut v6_buffers = Vec::new();
        loop {
            let id = self.dec.u16()?;
            if id == option_id::DONE {
                break;
            }
            let size = self.dec.u32()?;
            let offset = self.dec.pos();
            let payload = self.dec.bytes(size as usize)?;
            if id == option_id::BUFFER {
                let mut rd = SliceReader::new(&payload, self.header.endian);
                let table_offset = rd.u64()?;
                let name = rd.cstr()?;
                v6_buffers.push((name, table_offset));
            } else {
                self.handle_option(id, offset, &payload)?;
            }
        }

        let resume = self.dec.pos();
        for (name, table_offset) in v6_buffers {
            self.dec.seek(table_offset);
            let cpus = self.read_cpu_table(self.header.cpus)?;
            self.header.buffers.push(BufferInstance {
                name,
                clock: None,
                page_size: self.header.page_size,
                layout: BufferLayout::Flyrecord(cpus),
            });
        }
        self.dec.seek(resume);
        Ok(())
    }

    /// Options shared by both generations.
    fn handle_option(&mut self, id: u16, offset: u64, payload: &[u8]) -> Result<(), DecodeError> {
        let endian = self.header.endian;
        if id == option_id::CPUCOUNT {
            // Older recorders stored the tgid table under this id.
            if payload.len() > 8 {
                let tgids = parse_tgids(&String::from_utf8_lossy(payload));
                self.header.options.tgids.extend(tgids);
            } else if payload.len() >= 4 {
                self.header.cpus = endian.u32(payload);
                self.advance(FileState::CpuCount);
            }
            return Ok(());
        }

        let opts = &mut self.header.options;
        let text = || {
            let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
            String::from_utf8_lossy(&payload[..end]).into_owned()
        };

        match id {
            option_id::DATE => {
                // Hex microseconds between trace clock and wall clock.
                if let Some(us) = parse_c_integer(&text()) {
                    opts.date_offset += us * 1000;
                }
            }
            option_id::OFFSET => {
                if let Some(ns) = parse_c_integer(&text()) {
                    opts.offset += ns;
                }
            }
            option_id::CPUSTAT => opts.cpustats.push(text()),
            option_id::TRACECLOCK => opts.trace_clock = Some(text().trim().to_string()),
            option_id::UNAME => opts.uname = Some(text()),
            option_id::VERSION => opts.version = Some(text()),
            option_id::TRACEID => {
                if payload.len() >= 8 {
                    opts.trace_id = Some(endian.u64(payload));
                }
            }
            option_id::TIME_SHIFT => {
                if payload.len() >= 16 {
                    opts.time_shift = Some(TsyncTable::parse(payload, endian).map_err(|e| {
                        DecodeError::BadSection {
                            id,
                            offset,
                            reason: format!("time shift table: {}", e),
                        }
                    })?);
                }
            }
            option_id::TSC2NSEC => opts.tsc2nsec = Tsc2Nsec::parse(payload, endian),
            option_id::STRINGS => opts.strings.extend_from_slice(payload),
            option_id::SAVED_TGIDS => opts.tgids.extend(parse_tgids(&text())),
            option_id::HOOK | option_id::PROCMAPS | option_id::GUEST => {
                debug!("ignoring option {} ({} bytes) at {:#x}", id, payload.len(), offset);
            }
            _ => {
                warn!("skipping unknown option {} ({} bytes) at {:#x}", id, payload.len(), offset);
                opts.skipped.push(id);
            }
        }
        Ok(())
    }

    fn read_sequential(&mut self, pool: &mut StringPool) -> Result<(), DecodeError> {
        self.read_headers()?;
        self.read_ftrace_events(pool)?;
        self.read_all_events(pool)?;
        self.read_kallsyms()?;
        self.read_printk()?;
        self.read_cmdlines()?;
        self.read_cpu_count()?;
        self.read_options_and_cpu_data()
    }

    /// Reads a section header at `offset` and returns its (decompressed) payload
    /// together with the payload's file offset.
    fn read_section(&self, offset: u64, expected_id: u16) -> Result<(Vec<u8>, u64), DecodeError> {
        let mut dec = Decoder::new(self.src, offset, self.header.endian);
        let id = dec.u16()?;
        let flags = dec.u16()?;
        let _description = dec.u32()?;
        let size = dec.u64()?;
        if id != expected_id {
            return Err(DecodeError::BadSection {
                id,
                offset,
                reason: format!("expected section {}", expected_id),
            });
        }
        let payload_offset = dec.pos();
        if payload_offset.saturating_add(size) > self.header.file_size {
            return Err(DecodeError::Truncated { offset: payload_offset, wanted: size });
        }

        if flags & SECTION_FLAG_COMPRESSED == 0 {
            return Ok((dec.bytes(size as usize)?, payload_offset));
        }
        let codec = self.header.codec.ok_or_else(|| DecodeError::BadSection {
            id,
            offset,
            reason: "compressed section in a file without compression".to_string(),
        })?;
        let zsize = dec.u32()?;
        let usize_ = dec.u32()?;
        let packed = dec.bytes(zsize as usize)?;
        let data = codec.decompress(&packed, usize_ as usize, payload_offset)?;
        Ok((data, payload_offset))
    }

    fn read_sectioned(&mut self, pool: &mut StringPool) -> Result<(), DecodeError> {
        let mut next = self.dec.u64()?;
        let mut visited = Vec::new();
        let mut parts: Vec<(u16, u64)> = Vec::new();
        let mut buffer_opts: Vec<(u16, Vec<u8>)> = Vec::new();

        while next != 0 {
            if visited.contains(&next) {
                return Err(DecodeError::BadSection {
                    id: option_id::DONE,
                    offset: next,
                    reason: "option blocks form a cycle".to_string(),
                });
            }
            visited.push(next);
            let block_offset = next;
            let (block, payload_offset) = self.read_section(block_offset, option_id::DONE)?;
            next = 0;

            let mut rd = SliceReader::new(&block, self.header.endian);
            while rd.remaining() > 0 {
                let id = rd.u16()?;
                let size = rd.u32()? as usize;
                let opt_offset = payload_offset + rd.pos() as u64;
                let payload = rd.bytes(size)?;
                match id {
                    option_id::DONE => {
                        if payload.len() >= 8 {
                            next = self.header.endian.u64(payload);
                        }
                        break;
                    }
                    option_id::HEADER_INFO
                    | option_id::FTRACE_EVENTS
                    | option_id::EVENT_FORMATS
                    | option_id::KALLSYMS
                    | option_id::PRINTK
                    | option_id::CMDLINES => {
                        if payload.len() < 8 {
                            return Err(DecodeError::BadSection {
                                id,
                                offset: opt_offset,
                                reason: "section pointer too short".to_string(),
                            });
                        }
                        parts.push((id, self.header.endian.u64(payload)));
                    }
                    option_id::BUFFER | option_id::BUFFER_TEXT => buffer_opts.push((id, payload.to_vec())),
                    _ => self.handle_option(id, opt_offset, payload)?,
                }
            }
            self.advance(FileState::Options);
        }

        // Metadata parts in their canonical order.
        parts.sort_by_key(|(id, _)| *id);
        for (id, offset) in parts {
            let (data, _) = self.read_section(offset, id)?;
            let mut dec = Decoder::new(&data, 0, self.header.endian);
            match id {
                option_id::HEADER_INFO => {
                    read_header_info(&mut dec, &mut self.header)?;
                    self.advance(FileState::Headers);
                }
                option_id::FTRACE_EVENTS => {
                    read_format_list(&mut dec, "ftrace", &mut self.header.formats, pool)?;
                    self.advance(FileState::FtraceEvents);
                }
                option_id::EVENT_FORMATS => {
                    read_event_systems(&mut dec, &mut self.header.formats, pool)?;
                    self.advance(FileState::AllEvents);
                }
                option_id::KALLSYMS => {
                    let size = dec.u32()?;
                    let text = dec.text(size as usize)?;
                    self.header.kallsyms_size = size as usize;
                    self.header.kallsyms = KernelSymbols::parse(&text);
                    self.advance(FileState::Kallsyms);
                }
                option_id::PRINTK => {
                    let size = dec.u32()?;
                    self.header.printk_size = size as usize;
                    self.advance(FileState::Printk);
                }
                _ => {
                    let size = dec.u64()?;
                    let text = dec.text(size as usize)?;
                    self.header.cmdlines = parse_cmdlines(&text);
                    self.advance(FileState::Cmdlines);
                }
            }
        }

        for (id, payload) in buffer_opts {
            let buffer = self.parse_buffer_option(id, &payload)?;
            if buffer.name.is_empty() {
                self.header.buffers.insert(0, buffer);
            } else {
                self.header.buffers.push(buffer);
            }
        }
        match self.header.buffers.first().map(|b| &b.layout) {
            Some(BufferLayout::Latency { .. }) => self.advance(FileState::CpuLatency),
            Some(BufferLayout::Flyrecord(_)) => self.advance(FileState::CpuFlyrecord),
            None => {}
        }
        Ok(())
    }

    /// BUFFER: u64 section offset, name, clock, u32 page size, u32 cpu count,
    /// then `{u32 cpu, u64 offset, u64 size}` per CPU.
    /// BUFFER_TEXT: u64 section offset, name, clock; the section holds the text.
    fn parse_buffer_option(&self, id: u16, payload: &[u8]) -> Result<BufferInstance, DecodeError> {
        let mut rd = SliceReader::new(payload, self.header.endian);
        let section_offset = rd.u64()?;
        let name = rd.cstr()?;
        let clock = rd.cstr()?;
        let clock = if clock.is_empty() { None } else { Some(clock) };

        if id == option_id::BUFFER_TEXT {
            let mut dec = Decoder::new(self.src, section_offset, self.header.endian);
            dec.skip(8)?;
            let size = dec.u64()?;
            return Ok(BufferInstance {
                name,
                clock,
                page_size: self.header.page_size,
                layout: BufferLayout::Latency { offset: dec.pos(), size },
            });
        }

        let page_size = rd.u32()?;
        let count = rd.u32()?;
        let mut cpus = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let cpu = rd.u32()?;
            let offset = rd.u64()?;
            let size = rd.u64()?;
            cpus.push(CpuDataDesc { cpu, offset, size });
        }
        Ok(BufferInstance { name, clock, page_size, layout: BufferLayout::Flyrecord(cpus) })
    }

    /// Every declared per-CPU range must lie inside the file.
    fn validate_cpu_data(&self) -> Result<(), DecodeError> {
        for buffer in &self.header.buffers {
            if let BufferLayout::Flyrecord(cpus) = &buffer.layout {
                for desc in cpus {
                    let end = desc.offset.saturating_add(desc.size);
                    if end > self.header.file_size {
                        return Err(DecodeError::CpuDataOutOfBounds {
                            cpu: desc.cpu,
                            end,
                            file_size: self.header.file_size,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parses `pid tgid` lines. Malformed lines are skipped.
pub fn parse_tgids(text: &str) -> Vec<(i32, i32)> {
    text.lines()
        .filter_map(|line| {
            let (pid, tgid) = line.trim_matches('\0').split_once(' ')?;
            Some((pid.trim().parse().ok()?, tgid.trim().parse().ok()?))
        })
        .collect()
}

/// `strtoll(s, NULL, 0)`: decimal, `0x` hex or leading-zero octal.
fn parse_c_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if neg { -value } else { value })
}
