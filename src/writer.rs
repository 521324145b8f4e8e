//! Synthetic trace.dat writer.
//!
//! Builds version 6 or version 7 captures in memory from event formats and
//! records, so the decoder can be exercised without a kernel. Used by the
//! integration tests and by `gpuvis-tracegen`.

use crate::tracedat::bytes::Endian;
use crate::tracedat::compress::Codec;
use crate::tracedat::container::{option_id, FILE_VERSION_SECTIONED, FILE_VERSION_SEQUENTIAL, MAGIC};
use crate::tracedat::ringbuf::{TYPE_PADDING, TYPE_TIME_EXTEND};
use crate::tracedat::tsync::{Tsc2Nsec, TsyncTable};
use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const LONG_SIZE: usize = 8;
const PAGE_HEADER: usize = 8 + LONG_SIZE;
const COMMON_SIZE: usize = 8;
const MAX_SMALL_RECORD: usize = 28 * 4;
const MAX_DELTA: u64 = (1 << 27) - 1;

const HEADER_PAGE: &str = "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;
\tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;
\tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;
\tfield: char data;\toffset:16;\tsize:4080;\tsigned:1;
";

const HEADER_EVENT: &str = "# compressed entry header
\ttype_len    :    5 bits
\ttime_delta  :   27 bits
\tarray       :   32 bits

\tpadding     : type == 29
\ttime_extend : type == 30
\ttime_stamp  : type == 31
\tdata max type_len  == 28
";

/// C type of an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    /// `unsigned long`, printed in hex.
    Long,
    Pointer,
    /// Fixed `char name[N]`.
    Char(usize),
    /// `__data_loc char[]` string stored after the fixed fields.
    Str,
}

impl FieldType {
    fn size(self) -> usize {
        match self {
            FieldType::U8 => 1,
            FieldType::U16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::Str => 4,
            FieldType::U64 | FieldType::I64 | FieldType::Long | FieldType::Pointer => 8,
            FieldType::Char(n) => n,
        }
    }

    fn declaration(self, name: &str) -> String {
        match self {
            FieldType::U8 => format!("unsigned char {}", name),
            FieldType::U16 => format!("unsigned short {}", name),
            FieldType::U32 => format!("unsigned int {}", name),
            FieldType::U64 => format!("u64 {}", name),
            FieldType::I32 => format!("int {}", name),
            FieldType::I64 => format!("s64 {}", name),
            FieldType::Long => format!("unsigned long {}", name),
            FieldType::Pointer => format!("void * {}", name),
            FieldType::Char(n) => format!("char {}[{}]", name, n),
            FieldType::Str => format!("__data_loc char[] {}", name),
        }
    }

    fn signed(self) -> bool {
        matches!(self, FieldType::I32 | FieldType::I64)
    }
}

/// A field value for [`TraceDatWriter::add_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

#[derive(Debug, Clone)]
struct FormatDef {
    id: u16,
    system: String,
    name: String,
    fields: Vec<(String, FieldType, usize)>,
    fixed_size: usize,
}

impl FormatDef {
    fn text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "name: {}", self.name);
        let _ = writeln!(out, "ID: {}", self.id);
        out.push_str("format:\n");
        out.push_str("\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n");
        out.push_str("\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n");
        out.push_str("\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n");
        out.push_str("\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\n");
        for (name, ty, offset) in &self.fields {
            let _ = writeln!(
                out,
                "\tfield:{};\toffset:{};\tsize:{};\tsigned:{};",
                ty.declaration(name),
                offset,
                ty.size(),
                ty.signed() as u8
            );
        }
        out.push_str("\nprint fmt: \"\"\n");
        out
    }
}

#[derive(Debug, Clone)]
struct PendingRecord {
    ts: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct BufferData {
    name: String,
    clock: Option<String>,
    cpus: Vec<Vec<PendingRecord>>,
}

/// In-memory builder for trace.dat captures.
///
/// # Examples
///
/// ```no_run
/// # use rgpuvis::writer::{FieldType, TraceDatWriter};
/// # fn main() -> anyhow::Result<()> {
/// let mut writer = TraceDatWriter::new(6, 1);
/// let id = writer.add_format("drm", "drm_vblank_event", &[("crtc", FieldType::I32), ("seq", FieldType::U32)]);
/// writer.add_cmdline(0, "swapper");
/// writer.add_event(0, 1_000, 0, id, &[0.into(), 1u32.into()])?;
/// writer.write_to("trace.dat")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TraceDatWriter {
    version: u32,
    endian: Endian,
    page_size: u32,
    codec: Option<Codec>,
    /// Pages per compressed chunk.
    chunk_pages: usize,
    cpus: u32,
    formats: Vec<FormatDef>,
    cmdlines: Vec<(i32, String)>,
    kallsyms: String,
    options: Vec<(u16, Vec<u8>)>,
    buffers: Vec<BufferData>,
}

impl TraceDatWriter {
    /// A little-endian capture with 4 KiB pages and no compression.
    pub fn new(version: u32, cpus: u32) -> Self {
        TraceDatWriter {
            version,
            endian: Endian::Little,
            page_size: 4096,
            codec: None,
            chunk_pages: 4,
            cpus,
            formats: Vec::new(),
            cmdlines: Vec::new(),
            kallsyms: String::new(),
            options: Vec::new(),
            buffers: vec![BufferData {
                name: String::new(),
                clock: None,
                cpus: vec![Vec::new(); cpus as usize],
            }],
        }
    }

    /// Compresses metadata sections and CPU data. Version 7 only.
    pub fn with_compression(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_chunk_pages(mut self, pages: usize) -> Self {
        self.chunk_pages = pages.max(1);
        self
    }

    /// Registers an event format and returns its type id.
    pub fn add_format(&mut self, system: &str, name: &str, fields: &[(&str, FieldType)]) -> u16 {
        let id = 100 + self.formats.len() as u16;
        let mut offset = COMMON_SIZE;
        let mut laid_out = Vec::with_capacity(fields.len());
        for (field, ty) in fields {
            laid_out.push((field.to_string(), *ty, offset));
            offset += ty.size();
        }
        self.formats.push(FormatDef {
            id,
            system: system.to_string(),
            name: name.to_string(),
            fields: laid_out,
            fixed_size: offset,
        });
        id
    }

    pub fn add_cmdline(&mut self, pid: i32, comm: &str) {
        self.cmdlines.push((pid, comm.to_string()));
    }

    /// Appends a raw option. Later options of the same id are kept too.
    pub fn add_option(&mut self, id: u16, payload: Vec<u8>) {
        self.options.push((id, payload));
    }

    fn add_text_option(&mut self, id: u16, text: &str) {
        let mut payload = text.as_bytes().to_vec();
        payload.push(0);
        self.add_option(id, payload);
    }

    /// DATE: offset between trace clock and wall clock, in microseconds.
    pub fn set_date_offset_us(&mut self, us: i64) {
        let text = if us < 0 { format!("-0x{:x}", -us) } else { format!("0x{:x}", us) };
        self.add_text_option(option_id::DATE, &text);
    }

    pub fn set_offset(&mut self, ns: i64) {
        self.add_text_option(option_id::OFFSET, &ns.to_string());
    }

    pub fn set_trace_clock(&mut self, clock: &str) {
        self.add_text_option(option_id::TRACECLOCK, clock);
    }

    pub fn set_uname(&mut self, uname: &str) {
        self.add_text_option(option_id::UNAME, uname);
    }

    pub fn set_tracer_version(&mut self, version: &str) {
        self.add_text_option(option_id::VERSION, version);
    }

    pub fn set_trace_id(&mut self, id: u64) {
        let mut payload = Vec::new();
        self.endian.put_u64(&mut payload, id);
        self.add_option(option_id::TRACEID, payload);
    }

    /// SAVED_TGIDS: one `pid tgid` line per thread.
    /// `/proc/kallsyms` text for resolving function trace addresses.
    pub fn set_kallsyms(&mut self, text: &str) {
        self.kallsyms = text.to_string();
    }

    pub fn set_saved_tgids(&mut self, tgids: &[(i32, i32)]) {
        let text: String = tgids.iter().map(|(pid, tgid)| format!("{} {}\n", pid, tgid)).collect();
        self.add_text_option(option_id::SAVED_TGIDS, &text);
    }

    pub fn add_cpustat(&mut self, text: &str) {
        self.add_text_option(option_id::CPUSTAT, text);
    }

    pub fn set_tsc2nsec(&mut self, tsc: Tsc2Nsec) {
        let mut payload = Vec::new();
        self.endian.put_u32(&mut payload, tsc.mult);
        self.endian.put_u32(&mut payload, tsc.shift);
        self.endian.put_u64(&mut payload, tsc.offset);
        self.add_option(option_id::TSC2NSEC, payload);
    }

    /// TIME_SHIFT: u64 peer id, u32 flags, u32 cpu count, then per CPU the
    /// sample count and the time, offset and scaling arrays.
    pub fn set_time_shift(&mut self, table: &TsyncTable) {
        let e = self.endian;
        let mut payload = Vec::new();
        e.put_u64(&mut payload, table.peer_trace_id);
        e.put_u32(&mut payload, table.flags);
        e.put_u32(&mut payload, table.cpus.len() as u32);
        for samples in &table.cpus {
            e.put_u32(&mut payload, samples.len() as u32);
            for s in samples {
                e.put_u64(&mut payload, s.time as u64);
            }
            for s in samples {
                e.put_u64(&mut payload, s.offset as u64);
            }
            for s in samples {
                e.put_u64(&mut payload, s.scaling as u64);
            }
        }
        self.add_option(option_id::TIME_SHIFT, payload);
    }

    /// Adds a named ring-buffer instance and returns its index.
    pub fn add_buffer(&mut self, name: &str, clock: Option<&str>) -> usize {
        self.buffers.push(BufferData {
            name: name.to_string(),
            clock: clock.map(str::to_string),
            cpus: vec![Vec::new(); self.cpus as usize],
        });
        self.buffers.len() - 1
    }

    /// Adds a record to the top-level buffer.
    pub fn add_event(&mut self, cpu: u32, ts: u64, pid: i32, format: u16, values: &[FieldValue]) -> Result<()> {
        self.add_buffer_event(0, cpu, ts, pid, format, values)
    }

    /// Adds a record to buffer `buffer`. Records of one CPU may be added in
    /// any order; they are sorted by timestamp when written.
    pub fn add_buffer_event(
        &mut self,
        buffer: usize,
        cpu: u32,
        ts: u64,
        pid: i32,
        format: u16,
        values: &[FieldValue],
    ) -> Result<()> {
        let def = self
            .formats
            .iter()
            .find(|f| f.id == format)
            .with_context(|| format!("Unknown event format id {}", format))?;
        let payload = encode_payload(def, pid, values, self.endian)?;
        self.add_raw(buffer, cpu, ts, payload)
    }

    /// Adds a pre-encoded payload.
    pub fn add_raw(&mut self, buffer: usize, cpu: u32, ts: u64, payload: Vec<u8>) -> Result<()> {
        let max = self.page_size as usize - PAGE_HEADER - 8;
        if payload.len() > max {
            bail!("Record of {} bytes does not fit a {} byte page", payload.len(), self.page_size);
        }
        let records = self
            .buffers
            .get_mut(buffer)
            .and_then(|b| b.cpus.get_mut(cpu as usize))
            .with_context(|| format!("No cpu {} in buffer {}", cpu, buffer))?;
        records.push(PendingRecord { ts, payload });
        Ok(())
    }

    pub fn event_count(&self) -> usize {
        self.buffers.iter().flat_map(|b| &b.cpus).map(Vec::len).sum()
    }

    /// Writes the capture to `path`.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let file = File::create(path).with_context(|| format!("Failed to create file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .with_context(|| format!("Failed to write file: {}", path.display()))?;
        Ok(())
    }

    /// Serializes the whole capture.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.version {
            FILE_VERSION_SEQUENTIAL => {
                if self.codec.is_some() {
                    bail!("Version 6 captures cannot be compressed");
                }
                self.sequential()
            }
            FILE_VERSION_SECTIONED => self.sectioned(),
            v => bail!("Cannot write file version {}", v),
        }
    }

    fn file_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(format!("{}\0", self.version).as_bytes());
        out.push((self.endian == Endian::Big) as u8);
        out.push(LONG_SIZE as u8);
        self.endian.put_u32(out, self.page_size);
    }

    fn header_info(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"header_page\0");
        self.endian.put_u64(out, HEADER_PAGE.len() as u64);
        out.extend_from_slice(HEADER_PAGE.as_bytes());
        out.extend_from_slice(b"header_event\0");
        self.endian.put_u64(out, HEADER_EVENT.len() as u64);
        out.extend_from_slice(HEADER_EVENT.as_bytes());
    }

    fn ftrace_formats(&self, out: &mut Vec<u8>) {
        let ftrace: Vec<&FormatDef> = self.formats.iter().filter(|f| f.system == "ftrace").collect();
        self.endian.put_u32(out, ftrace.len() as u32);
        for def in ftrace {
            let text = def.text();
            self.endian.put_u64(out, text.len() as u64);
            out.extend_from_slice(text.as_bytes());
        }
    }

    fn kallsyms_part(&self, out: &mut Vec<u8>) {
        self.endian.put_u32(out, self.kallsyms.len() as u32);
        out.extend_from_slice(self.kallsyms.as_bytes());
    }

    fn event_systems(&self, out: &mut Vec<u8>) {
        let mut systems: Vec<&str> = Vec::new();
        for def in self.formats.iter().filter(|f| f.system != "ftrace") {
            if !systems.contains(&def.system.as_str()) {
                systems.push(&def.system);
            }
        }
        self.endian.put_u32(out, systems.len() as u32);
        for system in systems {
            out.extend_from_slice(system.as_bytes());
            out.push(0);
            let defs: Vec<&FormatDef> = self.formats.iter().filter(|f| f.system == system).collect();
            self.endian.put_u32(out, defs.len() as u32);
            for def in defs {
                let text = def.text();
                self.endian.put_u64(out, text.len() as u64);
                out.extend_from_slice(text.as_bytes());
            }
        }
    }

    fn cmdlines(&self, out: &mut Vec<u8>) {
        let mut text = String::new();
        for (pid, comm) in &self.cmdlines {
            let _ = writeln!(text, "{} {}", pid, comm);
        }
        self.endian.put_u64(out, text.len() as u64);
        out.extend_from_slice(text.as_bytes());
    }

    fn encode_option(&self, out: &mut Vec<u8>, id: u16, payload: &[u8]) {
        self.endian.put_u16(out, id);
        self.endian.put_u32(out, payload.len() as u32);
        out.extend_from_slice(payload);
    }

    /// Per-CPU page streams of one buffer.
    fn cpu_streams(&self, buffer: &BufferData) -> Result<Vec<Vec<u8>>> {
        buffer
            .cpus
            .iter()
            .map(|records| encode_pages(records, self.page_size as usize, self.endian))
            .collect()
    }

    fn patch_u64(&self, out: &mut [u8], at: usize, v: u64) {
        let mut bytes = Vec::with_capacity(8);
        self.endian.put_u64(&mut bytes, v);
        out[at..at + 8].copy_from_slice(&bytes);
    }

    fn align_to_page(&self, out: &mut Vec<u8>) {
        let page = self.page_size as usize;
        let aligned = out.len().div_ceil(page) * page;
        out.resize(aligned, 0);
    }

    /// Version 6: every part in a fixed order, then `options  `, then the
    /// `flyrecord` tag and the per-CPU offset/size table.
    fn sequential(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.file_header(&mut out);
        self.header_info(&mut out);
        self.ftrace_formats(&mut out);
        self.event_systems(&mut out);
        self.kallsyms_part(&mut out);
        self.endian.put_u32(&mut out, 0);
        self.cmdlines(&mut out);
        self.endian.put_u32(&mut out, self.cpus);

        out.extend_from_slice(b"options  \0");
        for (id, payload) in &self.options {
            self.encode_option(&mut out, *id, payload);
        }
        // Named buffers point at their own CPU tables, patched below.
        let mut table_patches = Vec::new();
        for buffer in self.buffers.iter().skip(1) {
            let mut payload = vec![0u8; 8];
            payload.extend_from_slice(buffer.name.as_bytes());
            payload.push(0);
            self.endian.put_u16(&mut out, option_id::BUFFER);
            self.endian.put_u32(&mut out, payload.len() as u32);
            table_patches.push(out.len());
            out.extend_from_slice(&payload);
        }
        self.endian.put_u16(&mut out, option_id::DONE);

        out.extend_from_slice(b"flyrecord\0");
        let mut tables = Vec::with_capacity(self.buffers.len());
        for i in 0..self.buffers.len() {
            if i > 0 {
                let at = table_patches[i - 1];
                let table_offset = out.len() as u64;
                self.patch_u64(&mut out, at, table_offset);
            }
            tables.push(out.len());
            out.resize(out.len() + self.cpus as usize * 16, 0);
        }

        for (buffer, table) in self.buffers.iter().zip(tables) {
            for (cpu, stream) in self.cpu_streams(buffer)?.into_iter().enumerate() {
                self.align_to_page(&mut out);
                let offset = out.len() as u64;
                out.extend_from_slice(&stream);
                self.patch_u64(&mut out, table + cpu * 16, offset);
                self.patch_u64(&mut out, table + cpu * 16 + 8, stream.len() as u64);
            }
        }
        Ok(out)
    }

    /// Writes a section header and its payload, compressing when asked.
    fn section(&self, out: &mut Vec<u8>, id: u16, payload: &[u8], compress: bool) -> Result<u64> {
        let offset = out.len() as u64;
        self.endian.put_u16(out, id);
        match self.codec.filter(|_| compress) {
            Some(codec) => {
                let packed = codec
                    .compress(payload)
                    .with_context(|| format!("Failed to compress section {}", id))?;
                self.endian.put_u16(out, 1);
                self.endian.put_u32(out, 0);
                self.endian.put_u64(out, 8 + packed.len() as u64);
                self.endian.put_u32(out, packed.len() as u32);
                self.endian.put_u32(out, payload.len() as u32);
                out.extend_from_slice(&packed);
            }
            None => {
                self.endian.put_u16(out, 0);
                self.endian.put_u32(out, 0);
                self.endian.put_u64(out, payload.len() as u64);
                out.extend_from_slice(payload);
            }
        }
        Ok(offset)
    }

    /// Version 7: metadata sections, buffer data, then one option block
    /// pointing at all of them.
    fn sectioned(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.file_header(&mut out);
        let (name, version) = match self.codec {
            Some(Codec::Zlib) => ("zlib", "1"),
            Some(Codec::Brotli) => ("brotli", "1.0"),
            Some(Codec::Zstd) => ("zstd", "1.5"),
            None => ("none", ""),
        };
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(version.as_bytes());
        out.push(0);
        let first_options = out.len();
        self.endian.put_u64(&mut out, 0);

        let mut parts = Vec::new();
        let mut payload = Vec::new();
        self.header_info(&mut payload);
        parts.push((option_id::HEADER_INFO, self.section(&mut out, option_id::HEADER_INFO, &payload, true)?));
        payload.clear();
        self.ftrace_formats(&mut payload);
        parts.push((option_id::FTRACE_EVENTS, self.section(&mut out, option_id::FTRACE_EVENTS, &payload, true)?));
        payload.clear();
        self.event_systems(&mut payload);
        parts.push((option_id::EVENT_FORMATS, self.section(&mut out, option_id::EVENT_FORMATS, &payload, true)?));
        payload.clear();
        self.kallsyms_part(&mut payload);
        parts.push((option_id::KALLSYMS, self.section(&mut out, option_id::KALLSYMS, &payload, true)?));
        let mut empty = Vec::new();
        self.endian.put_u32(&mut empty, 0);
        parts.push((option_id::PRINTK, self.section(&mut out, option_id::PRINTK, &empty, true)?));
        payload.clear();
        self.cmdlines(&mut payload);
        parts.push((option_id::CMDLINES, self.section(&mut out, option_id::CMDLINES, &payload, true)?));

        let mut buffer_opts = Vec::new();
        for buffer in &self.buffers {
            let streams = self.cpu_streams(buffer)?;
            let streams = match self.codec {
                Some(codec) => streams
                    .iter()
                    .map(|s| encode_chunks(codec, s, self.chunk_pages * self.page_size as usize, self.endian))
                    .collect::<Result<Vec<_>>>()?,
                None => streams,
            };

            // Section size is patched once the CPU data is laid out.
            let section_offset = out.len() as u64;
            self.endian.put_u16(&mut out, option_id::BUFFER);
            self.endian.put_u16(&mut out, 0);
            self.endian.put_u32(&mut out, 0);
            let size_at = out.len();
            self.endian.put_u64(&mut out, 0);
            let data_start = out.len();

            let mut opt = Vec::new();
            self.endian.put_u64(&mut opt, section_offset);
            opt.extend_from_slice(buffer.name.as_bytes());
            opt.push(0);
            opt.extend_from_slice(buffer.clock.as_deref().unwrap_or("").as_bytes());
            opt.push(0);
            self.endian.put_u32(&mut opt, self.page_size);
            self.endian.put_u32(&mut opt, streams.len() as u32);
            for (cpu, stream) in streams.iter().enumerate() {
                self.align_to_page(&mut out);
                self.endian.put_u32(&mut opt, cpu as u32);
                self.endian.put_u64(&mut opt, out.len() as u64);
                self.endian.put_u64(&mut opt, stream.len() as u64);
                out.extend_from_slice(stream);
            }
            let written = (out.len() - data_start) as u64;
            self.patch_u64(&mut out, size_at, written);
            buffer_opts.push(opt);
        }

        let mut block = Vec::new();
        for (id, offset) in parts {
            let mut ptr = Vec::new();
            self.endian.put_u64(&mut ptr, offset);
            self.encode_option(&mut block, id, &ptr);
        }
        let mut cpus = Vec::new();
        self.endian.put_u32(&mut cpus, self.cpus);
        self.encode_option(&mut block, option_id::CPUCOUNT, &cpus);
        for (id, payload) in &self.options {
            self.encode_option(&mut block, *id, payload);
        }
        for opt in &buffer_opts {
            self.encode_option(&mut block, option_id::BUFFER, opt);
        }
        let mut next = Vec::new();
        self.endian.put_u64(&mut next, 0);
        self.encode_option(&mut block, option_id::DONE, &next);

        let options_offset = self.section(&mut out, option_id::DONE, &block, false)?;
        self.patch_u64(&mut out, first_options, options_offset);
        Ok(out)
    }
}

/// `common_type`, `common_flags`, `common_preempt_count`, `common_pid`, the
/// fixed fields, then `__data_loc` string bodies. Padded to 4 bytes.
fn encode_payload(def: &FormatDef, pid: i32, values: &[FieldValue], endian: Endian) -> Result<Vec<u8>> {
    if values.len() != def.fields.len() {
        bail!(
            "Event {}:{} takes {} fields, got {}",
            def.system,
            def.name,
            def.fields.len(),
            values.len()
        );
    }

    let mut out = Vec::with_capacity(def.fixed_size + 16);
    endian.put_u16(&mut out, def.id);
    out.push(0);
    out.push(0);
    endian.put_u32(&mut out, pid as u32);
    out.resize(def.fixed_size, 0);

    let mut tail = Vec::new();
    for ((name, ty, offset), value) in def.fields.iter().zip(values) {
        let mut bytes = Vec::with_capacity(8);
        match (ty, value) {
            (FieldType::U8, FieldValue::Int(v)) => bytes.push(*v as u8),
            (FieldType::U16, FieldValue::Int(v)) => endian.put_u16(&mut bytes, *v as u16),
            (FieldType::U32 | FieldType::I32, FieldValue::Int(v)) => endian.put_u32(&mut bytes, *v as u32),
            (FieldType::U64 | FieldType::I64 | FieldType::Long | FieldType::Pointer, FieldValue::Int(v)) => {
                endian.put_u64(&mut bytes, *v as u64)
            }
            (FieldType::Char(n), FieldValue::Str(s)) => {
                bytes = s.as_bytes().iter().copied().take(n.saturating_sub(1)).collect();
                bytes.resize(*n, 0);
            }
            (FieldType::Str, FieldValue::Str(s)) => {
                let loc = def.fixed_size + tail.len();
                let len = s.len() + 1;
                if loc > 0xffff || len > 0xffff {
                    bail!("String field {} of {}:{} is too long", name, def.system, def.name);
                }
                tail.extend_from_slice(s.as_bytes());
                tail.push(0);
                endian.put_u32(&mut bytes, ((len as u32) << 16) | loc as u32);
            }
            _ => bail!("Field {} of {}:{} has the wrong value kind", name, def.system, def.name),
        }
        out[*offset..*offset + bytes.len()].copy_from_slice(&bytes);
    }
    out.extend_from_slice(&tail);
    out.resize(out.len().div_ceil(4) * 4, 0);
    Ok(out)
}

fn record_header(endian: Endian, type_len: u32, delta: u32) -> u32 {
    match endian {
        Endian::Little => (delta << 5) | type_len,
        Endian::Big => (type_len << 27) | delta,
    }
}

/// Lays records out in pages: u64 base timestamp, u64 commit, then records
/// with 27-bit deltas and time extends for larger gaps.
fn encode_pages(records: &[PendingRecord], page_size: usize, endian: Endian) -> Result<Vec<u8>> {
    let mut sorted: Vec<&PendingRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.ts);

    let mut out = Vec::new();
    let mut page: Vec<u8> = Vec::new();
    let mut page_ts = 0u64;
    let mut last_ts = 0u64;

    let close = |out: &mut Vec<u8>, page: &mut Vec<u8>, page_ts: u64| {
        if page.is_empty() {
            return;
        }
        endian.put_u64(out, page_ts);
        endian.put_u64(out, page.len() as u64);
        out.extend_from_slice(page);
        out.resize(out.len() + page_size - PAGE_HEADER - page.len(), 0);
        page.clear();
    };

    for rec in sorted {
        let len = rec.payload.len().div_ceil(4) * 4;
        let body = if len > 0 && len <= MAX_SMALL_RECORD { 4 + len } else { 8 + len };
        let delta = rec.ts - last_ts;
        let extend = if !page.is_empty() && delta > MAX_DELTA { 8 } else { 0 };
        if page.is_empty() || page.len() + extend + body > page_size - PAGE_HEADER {
            close(&mut out, &mut page, page_ts);
            page_ts = rec.ts;
            last_ts = rec.ts;
        }

        let mut delta = (rec.ts - last_ts) as u32;
        if rec.ts - last_ts > MAX_DELTA {
            let gap = rec.ts - last_ts;
            endian.put_u32(&mut page, record_header(endian, TYPE_TIME_EXTEND, (gap & MAX_DELTA) as u32));
            endian.put_u32(&mut page, (gap >> 27) as u32);
            delta = 0;
        }
        if body == 4 + len {
            endian.put_u32(&mut page, record_header(endian, (len / 4) as u32, delta));
        } else {
            endian.put_u32(&mut page, record_header(endian, 0, delta));
            endian.put_u32(&mut page, (len + 4) as u32);
        }
        page.extend_from_slice(&rec.payload);
        page.resize(page.len() + len - rec.payload.len(), 0);
        last_ts = rec.ts;
    }

    // A trailing padding word marks the rest of the last page empty.
    if !page.is_empty() && page.len() + 4 <= page_size - PAGE_HEADER {
        let mut pad = Vec::new();
        endian.put_u32(&mut pad, record_header(endian, TYPE_PADDING, 0));
        let commit = page.len();
        page.extend_from_slice(&pad);
        endian.put_u64(&mut out, page_ts);
        endian.put_u64(&mut out, page.len() as u64);
        out.extend_from_slice(&page);
        out.resize(out.len() + page_size - PAGE_HEADER - commit - pad.len(), 0);
    } else {
        close(&mut out, &mut page, page_ts);
    }
    Ok(out)
}

/// `u32 count`, then `{u32 zsize, u32 size, bytes}` per chunk.
fn encode_chunks(codec: Codec, stream: &[u8], chunk_size: usize, endian: Endian) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if stream.is_empty() {
        return Ok(out);
    }
    let chunks: Vec<&[u8]> = stream.chunks(chunk_size).collect();
    endian.put_u32(&mut out, chunks.len() as u32);
    for chunk in chunks {
        let packed = codec.compress(chunk).context("Failed to compress cpu data")?;
        endian.put_u32(&mut out, packed.len() as u32);
        endian.put_u32(&mut out, chunk.len() as u32);
        out.extend_from_slice(&packed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOptions;
    use crate::string_intern::StringPool;
    use crate::tracedat::container::TraceHeader;
    use crate::tracedat::decode_trace;
    use crate::traits::TraceInfo;
    use crate::event::TraceEvent;

    fn decode(bytes: &Vec<u8>) -> Vec<TraceEvent> {
        let mut pool = StringPool::new();
        let mut events = Vec::new();
        decode_trace(bytes, "test", &LoadOptions::default(), &mut pool, &mut |_: &TraceInfo, e: TraceEvent| {
            events.push(e);
            false
        })
        .unwrap();
        events
    }

    #[test]
    fn test_format_text_parses() {
        let mut writer = TraceDatWriter::new(6, 1);
        let id = writer.add_format("sched", "sched_switch", &[("prev_comm", FieldType::Char(16)), ("prev_pid", FieldType::I32)]);
        let text = writer.formats[0].text();
        let mut pool = StringPool::new();
        let format = crate::tracedat::format::EventFormat::parse("sched", &text, &mut pool).unwrap();
        assert_eq!(format.id, id);
        assert_eq!(format.common_fields.len(), 4);
        assert_eq!(format.field("prev_pid").unwrap().offset, 24);
    }

    #[test]
    fn test_payload_rejects_wrong_arity() {
        let mut writer = TraceDatWriter::new(6, 1);
        let id = writer.add_format("drm", "drm_vblank_event", &[("crtc", FieldType::I32)]);
        assert!(writer.add_event(0, 1, 0, id, &[]).is_err());
        assert!(writer.add_event(0, 1, 0, id, &["x".into()]).is_err());
        assert!(writer.add_event(3, 1, 0, id, &[0.into()]).is_err());
    }

    #[test]
    fn test_time_extend_and_page_split() {
        let mut writer = TraceDatWriter::new(6, 1).with_page_size(128);
        let id = writer.add_format("test", "tick", &[("n", FieldType::U32), ("msg", FieldType::Str)]);
        let stamps = [5u64, 10, 1 << 28, (1 << 28) + 3, 1 << 40, (1 << 40) + 1, (1 << 40) + 2];
        for (i, ts) in stamps.iter().enumerate() {
            writer.add_event(0, *ts, 1, id, &[(i as u32).into(), format!("m{}", i).into()]).unwrap();
        }
        let events = decode(&writer.to_bytes().unwrap());
        let ts: Vec<i64> = events.iter().map(|e| e.ts).collect();
        assert_eq!(ts, stamps.iter().map(|t| *t as i64).collect::<Vec<_>>());
        assert_eq!(events[6].field("msg"), Some("m6"));
    }

    #[test]
    fn test_sectioned_header_and_options() {
        let mut writer = TraceDatWriter::new(7, 2).with_compression(Codec::Zlib);
        writer.set_trace_clock("mono");
        writer.set_uname("Linux test");
        writer.add_cmdline(42, "Xorg");
        writer.add_buffer("guest", Some("x86-tsc"));
        let bytes = writer.to_bytes().unwrap();

        let mut pool = StringPool::new();
        let header = TraceHeader::read(&bytes, &mut pool).unwrap();
        assert_eq!(header.version, 7);
        assert_eq!(header.cpus, 2);
        assert_eq!(header.codec, Some(Codec::Zlib));
        assert_eq!(header.options.trace_clock.as_deref(), Some("mono"));
        assert_eq!(header.cmdlines, vec![(42, "Xorg".to_string())]);
        assert_eq!(header.buffers.len(), 2);
        assert_eq!(header.buffers[1].name, "guest");
        assert_eq!(header.buffers[1].clock.as_deref(), Some("x86-tsc"));
    }

    #[test]
    fn test_v6_rejects_compression() {
        let writer = TraceDatWriter::new(6, 1).with_compression(Codec::Brotli);
        assert!(writer.to_bytes().is_err());
    }
}
