//! Per-CPU paged ring-buffer decoding.
//!
//! A CPU's data is a run of page-sized sub-buffers. Each page starts with a
//! base timestamp and a commit word; records inside it carry 27-bit deltas
//! from the running timestamp. Pages live in a shared [`PagePool`] keyed by
//! `(ring, page index)`; decoded [`Record`]s refer to their page by key and
//! the pool drops a page when its last reference is released.
//!
//! Compressed captures store each CPU's data as a table of independently
//! compressed chunks. A small per-CPU [`ChunkCache`] keeps recently
//! decompressed chunks; pages borrow chunk memory and pin the chunk while
//! they are alive.

use super::bytes::{Decoder, Endian, ReadAt};
use super::compress::Codec;
use super::container::CpuDataDesc;
use crate::error::DecodeError;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

const TS_SHIFT: u32 = 27;
const TS_DELTA_MASK: u32 = (1 << TS_SHIFT) - 1;
const COMMIT_MASK: u64 = (1 << 27) - 1;
const MISSING_EVENTS: u64 = 1 << 31;

pub const TYPE_PADDING: u32 = 29;
pub const TYPE_TIME_EXTEND: u32 = 30;
pub const TYPE_TIME_STAMP: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// Ring index, unique across all CPUs of all buffer instances.
    pub ring: u32,
    pub index: u64,
}

#[derive(Debug)]
struct PageEntry {
    data: Arc<[u8]>,
    start: usize,
    len: usize,
    refs: u32,
    chunk: Option<usize>,
}

/// Arena of mapped pages with explicit reference counts.
#[derive(Debug, Default)]
pub struct PagePool {
    pages: HashMap<PageKey, PageEntry>,
}

impl PagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self, key: PageKey) -> Option<&[u8]> {
        self.pages.get(&key).map(|e| &e.data[e.start..e.start + e.len])
    }

    /// Payload bytes of a live record.
    pub fn record_data(&self, record: &Record) -> Option<&[u8]> {
        self.data(record.page)
            .and_then(|page| page.get(record.data_start..record.data_start + record.size))
    }

    pub fn refs(&self, key: PageKey) -> u32 {
        self.pages.get(&key).map_or(0, |e| e.refs)
    }

    pub fn live_pages(&self) -> usize {
        self.pages.len()
    }

    fn contains(&self, key: PageKey) -> bool {
        self.pages.contains_key(&key)
    }

    fn insert(&mut self, key: PageKey, data: Arc<[u8]>, start: usize, len: usize, chunk: Option<usize>) {
        self.pages.insert(key, PageEntry { data, start, len, refs: 1, chunk });
    }

    fn retain(&mut self, key: PageKey) {
        if let Some(e) = self.pages.get_mut(&key) {
            e.refs += 1;
        }
    }

    /// Drops one reference. Returns the chunk the page pinned when the page is freed.
    fn release(&mut self, key: PageKey) -> Option<Option<usize>> {
        let entry = self.pages.get_mut(&key)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        self.pages.remove(&key).map(|e| e.chunk)
    }
}

/// One decoded record. Its payload stays readable through the pool until
/// the cursor releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Raw, uncorrected timestamp.
    pub ts: u64,
    pub ring: u32,
    pub cpu: u32,
    pub page: PageKey,
    /// Payload start within the page.
    pub data_start: usize,
    pub size: usize,
    /// Position of the record header in the CPU's data stream; the absolute
    /// file offset for uncompressed data.
    pub offset: u64,
    pub missed_events: bool,
}

/// One compressed block of a CPU's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionChunk {
    pub file_offset: u64,
    pub zsize: u32,
    pub size: u32,
    /// Offset of this chunk's first byte in the decompressed stream.
    pub logical_offset: u64,
}

impl CompressionChunk {
    fn contains(&self, logical: u64) -> bool {
        logical >= self.logical_offset && logical < self.logical_offset + self.size as u64
    }
}

#[derive(Debug)]
struct CachedChunk {
    index: usize,
    data: Arc<[u8]>,
    refs: u32,
    last_use: u64,
}

/// Fewest chunks a CPU can pin while stepping across a chunk boundary.
pub const MIN_CHUNK_CACHE_CAPACITY: usize = 3;

/// Bounded cache of decompressed chunks, pinned by live pages.
#[derive(Debug)]
pub struct ChunkCache {
    capacity: usize,
    entries: Vec<CachedChunk>,
    last: Option<usize>,
    clock: u64,
    pub hits: u64,
    pub misses: u64,
}

impl ChunkCache {
    /// Capacities below [`MIN_CHUNK_CACHE_CAPACITY`] are raised to it.
    pub fn new(capacity: usize) -> Self {
        ChunkCache {
            capacity: capacity.max(MIN_CHUNK_CACHE_CAPACITY),
            entries: Vec::new(),
            last: None,
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the chunk holding `logical`: last accessed, then the one after
    /// it, then binary search.
    pub fn find_chunk(&mut self, chunks: &[CompressionChunk], logical: u64) -> Option<usize> {
        if let Some(last) = self.last {
            if chunks.get(last).is_some_and(|c| c.contains(logical)) {
                return Some(last);
            }
            if chunks.get(last + 1).is_some_and(|c| c.contains(logical)) {
                self.last = Some(last + 1);
                return Some(last + 1);
            }
        }
        let idx = chunks.partition_point(|c| c.logical_offset + c.size as u64 <= logical);
        if chunks.get(idx).is_some_and(|c| c.contains(logical)) {
            self.last = Some(idx);
            Some(idx)
        } else {
            None
        }
    }

    fn get(
        &mut self,
        index: usize,
        chunk: &CompressionChunk,
        src: &dyn ReadAt,
        codec: Codec,
        cpu: u32,
    ) -> Result<Arc<[u8]>, DecodeError> {
        self.clock += 1;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) {
            entry.last_use = self.clock;
            self.hits += 1;
            return Ok(Arc::clone(&entry.data));
        }

        self.misses += 1;
        if self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.refs == 0)
                .min_by_key(|(_, e)| e.last_use)
                .map(|(i, _)| i)
                .ok_or(DecodeError::ChunkCacheExhausted { cpu, capacity: self.capacity })?;
            let evicted = self.entries.swap_remove(victim);
            debug!("cpu {}: evicting chunk {}", cpu, evicted.index);
        }

        let packed = src.read_vec(chunk.file_offset, chunk.zsize as usize)?;
        let data: Arc<[u8]> = codec.decompress(&packed, chunk.size as usize, chunk.file_offset)?.into();
        debug!("cpu {}: decompressed chunk {} ({} -> {} bytes)", cpu, index, chunk.zsize, chunk.size);
        self.entries.push(CachedChunk {
            index,
            data: Arc::clone(&data),
            refs: 0,
            last_use: self.clock,
        });
        Ok(data)
    }

    fn retain(&mut self, index: usize) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.index == index) {
            e.refs += 1;
        }
    }

    fn release(&mut self, index: usize) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.index == index) {
            e.refs = e.refs.saturating_sub(1);
        }
    }

    pub fn pinned(&self) -> usize {
        self.entries.iter().filter(|e| e.refs > 0).count()
    }
}

#[derive(Debug)]
enum Storage {
    Raw { offset: u64, size: u64 },
    Compressed { codec: Codec, chunks: Vec<CompressionChunk>, size: u64 },
}

/// Cursor state within the current page.
#[derive(Debug, Clone, Copy)]
struct PageCursor {
    key: PageKey,
    /// End of the record area, relative to the page start.
    end: usize,
    /// Next record header, relative to the page start.
    pos: usize,
    ts: u64,
    missed: bool,
}

/// Shared state the cursor needs to map pages.
pub struct RingCtx<'a> {
    pub src: &'a dyn ReadAt,
    pub pool: &'a mut PagePool,
}

/// Decoding cursor over one CPU's ring buffer.
#[derive(Debug)]
pub struct CpuRingBuffer {
    pub ring: u32,
    pub cpu: u32,
    storage: Storage,
    cache: ChunkCache,
    page_size: usize,
    long_size: usize,
    endian: Endian,
    page_count: u64,
    next_page: u64,
    cursor: Option<PageCursor>,
    peeked: Option<Record>,
    returned: Option<PageKey>,
    /// Timestamp of the most recently decoded record.
    pub last_ts: u64,
}

impl CpuRingBuffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: u32,
        desc: CpuDataDesc,
        page_size: u32,
        long_size: u32,
        endian: Endian,
        codec: Option<Codec>,
        cache_capacity: usize,
        src: &dyn ReadAt,
    ) -> Result<Self, DecodeError> {
        let page_size = page_size as usize;
        if page_size <= 8 + long_size as usize {
            return Err(DecodeError::BadPage {
                cpu: desc.cpu,
                offset: desc.offset,
                reason: format!("page size {} is too small", page_size),
            });
        }

        let storage = match codec {
            Some(codec) if desc.size > 0 => {
                let chunks = read_chunk_table(src, desc, endian)?;
                let size = chunks.last().map_or(0, |c| c.logical_offset + c.size as u64);
                Storage::Compressed { codec, chunks, size }
            }
            _ => Storage::Raw { offset: desc.offset, size: desc.size },
        };
        let size = match &storage {
            Storage::Raw { size, .. } | Storage::Compressed { size, .. } => *size,
        };

        Ok(CpuRingBuffer {
            ring,
            cpu: desc.cpu,
            storage,
            cache: ChunkCache::new(cache_capacity),
            page_size,
            long_size: long_size as usize,
            endian,
            page_count: size.div_ceil(page_size as u64),
            next_page: 0,
            cursor: None,
            peeked: None,
            returned: None,
            last_ts: 0,
        })
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.cache
    }

    fn stream_base(&self) -> u64 {
        match &self.storage {
            Storage::Raw { offset, .. } => *offset,
            Storage::Compressed { .. } => 0,
        }
    }

    fn page_key(&self, index: u64) -> PageKey {
        PageKey { ring: self.ring, index }
    }

    /// Maps page `index` into the pool, taking one reference.
    fn acquire_page(&mut self, index: u64, ctx: &mut RingCtx<'_>) -> Result<PageKey, DecodeError> {
        let key = self.page_key(index);
        if ctx.pool.contains(key) {
            ctx.pool.retain(key);
            return Ok(key);
        }

        let start = index * self.page_size as u64;
        match &self.storage {
            Storage::Raw { offset, size } => {
                let len = (*size - start).min(self.page_size as u64) as usize;
                let data: Arc<[u8]> = ctx.src.read_vec(offset + start, len)?.into();
                ctx.pool.insert(key, data, 0, len, None);
            }
            Storage::Compressed { codec, chunks, size } => {
                let codec = *codec;
                let len = (*size - start).min(self.page_size as u64) as usize;
                let first = self.cache.find_chunk(chunks, start).ok_or(DecodeError::BadPage {
                    cpu: self.cpu,
                    offset: start,
                    reason: "no chunk covers page".to_string(),
                })?;
                let chunk = chunks[first];
                let data = self.cache.get(first, &chunk, ctx.src, codec, self.cpu)?;
                let in_chunk = (start - chunk.logical_offset) as usize;

                if in_chunk + len <= data.len() {
                    self.cache.retain(first);
                    ctx.pool.insert(key, data, in_chunk, len, Some(first));
                } else {
                    // Page straddles chunks: assemble a private copy.
                    let mut page = Vec::with_capacity(len);
                    page.extend_from_slice(&data[in_chunk..]);
                    let mut next = first + 1;
                    while page.len() < len {
                        let chunk = *chunks.get(next).ok_or(DecodeError::BadPage {
                            cpu: self.cpu,
                            offset: start,
                            reason: "page runs past the last chunk".to_string(),
                        })?;
                        let data = self.cache.get(next, &chunk, ctx.src, codec, self.cpu)?;
                        let take = (len - page.len()).min(data.len());
                        page.extend_from_slice(&data[..take]);
                        next += 1;
                    }
                    ctx.pool.insert(key, page.into(), 0, len, None);
                }
            }
        }
        Ok(key)
    }

    fn release_page(&mut self, key: PageKey, ctx: &mut RingCtx<'_>) {
        if let Some(Some(chunk)) = ctx.pool.release(key) {
            self.cache.release(chunk);
        }
    }

    /// Drops every reference this cursor holds.
    pub fn reset(&mut self, ctx: &mut RingCtx<'_>) {
        if let Some(rec) = self.peeked.take() {
            self.release_page(rec.page, ctx);
        }
        if let Some(key) = self.returned.take() {
            self.release_page(key, ctx);
        }
        if let Some(cur) = self.cursor.take() {
            self.release_page(cur.key, ctx);
        }
        self.next_page = 0;
    }

    fn open_page(&mut self, index: u64, ctx: &mut RingCtx<'_>) -> Result<(), DecodeError> {
        if let Some(cur) = self.cursor.take() {
            self.release_page(cur.key, ctx);
        }
        let key = self.acquire_page(index, ctx)?;
        let hdr = 8 + self.long_size;
        let page = ctx.pool.data(key).unwrap_or(&[]);
        if page.len() < hdr {
            let len = page.len();
            self.release_page(key, ctx);
            return Err(DecodeError::BadPage {
                cpu: self.cpu,
                offset: index * self.page_size as u64,
                reason: format!("page is {} bytes, shorter than its header", len),
            });
        }
        let ts = self.endian.u64(&page[0..8]);
        let commit = self.endian.uint(&page[8..hdr], self.long_size);
        let end = (hdr + (commit & COMMIT_MASK) as usize).min(page.len());
        self.cursor = Some(PageCursor {
            key,
            end,
            pos: hdr,
            ts,
            missed: commit & MISSING_EVENTS != 0,
        });
        self.next_page = index + 1;
        Ok(())
    }

    /// Decodes the next record, taking a page reference for it.
    fn decode_next(&mut self, ctx: &mut RingCtx<'_>) -> Result<Option<Record>, DecodeError> {
        loop {
            let mut cur = match self.cursor {
                Some(cur) => cur,
                None => {
                    if self.next_page >= self.page_count {
                        return Ok(None);
                    }
                    self.open_page(self.next_page, ctx)?;
                    continue;
                }
            };

            let page = ctx.pool.data(cur.key).unwrap_or(&[]);
            let found = decode_event(page, &mut cur, self.endian).map_err(|reason| DecodeError::BadPage {
                cpu: self.cpu,
                offset: cur.key.index * self.page_size as u64 + cur.pos as u64,
                reason,
            })?;
            self.cursor = Some(cur);

            match found {
                Some((hdr_pos, data_start, size, ts)) => {
                    ctx.pool.retain(cur.key);
                    self.last_ts = ts;
                    let offset = self.stream_base() + cur.key.index * self.page_size as u64 + hdr_pos as u64;
                    return Ok(Some(Record {
                        ts,
                        ring: self.ring,
                        cpu: self.cpu,
                        page: cur.key,
                        data_start,
                        size,
                        offset,
                        missed_events: cur.missed,
                    }));
                }
                None => {
                    self.cursor = None;
                    self.release_page(cur.key, ctx);
                }
            }
        }
    }

    /// Returns the current record without advancing.
    pub fn peek(&mut self, ctx: &mut RingCtx<'_>) -> Result<Option<&Record>, DecodeError> {
        if self.peeked.is_none() {
            self.peeked = self.decode_next(ctx)?;
        }
        Ok(self.peeked.as_ref())
    }

    /// Advances and returns the next record, releasing the previously
    /// returned record's page reference. The returned record stays readable
    /// through the pool until the next call.
    pub fn next(&mut self, ctx: &mut RingCtx<'_>) -> Result<Option<Record>, DecodeError> {
        if let Some(key) = self.returned.take() {
            self.release_page(key, ctx);
        }
        let record = match self.peeked.take() {
            Some(rec) => Some(rec),
            None => self.decode_next(ctx)?,
        };
        self.returned = record.as_ref().map(|r| r.page);
        Ok(record)
    }

    fn page_timestamp(&mut self, index: u64, ctx: &mut RingCtx<'_>) -> Result<u64, DecodeError> {
        let key = self.acquire_page(index, ctx)?;
        let ts = ctx.pool.data(key).filter(|p| p.len() >= 8).map(|p| self.endian.u64(&p[0..8]));
        self.release_page(key, ctx);
        ts.ok_or(DecodeError::BadPage {
            cpu: self.cpu,
            offset: index * self.page_size as u64,
            reason: "short page".to_string(),
        })
    }

    /// Positions the cursor so that `peek` returns the first record at or
    /// after `ts`. The page search lands one page early since a page's
    /// records can only be decoded from its start.
    pub fn seek_to_timestamp(&mut self, ts: u64, ctx: &mut RingCtx<'_>) -> Result<(), DecodeError> {
        self.reset(ctx);
        if self.page_count == 0 {
            return Ok(());
        }

        let (mut lo, mut hi) = (0u64, self.page_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.page_timestamp(mid, ctx)? <= ts {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        // `lo` is the first page starting after ts.
        self.next_page = lo.saturating_sub(2);

        while let Some(rec) = self.peek(ctx)? {
            if rec.ts >= ts {
                break;
            }
            self.next(ctx)?;
        }
        Ok(())
    }

    /// Reads the record whose header is at `offset` in the CPU data stream.
    /// The cursor continues after it.
    pub fn read_at(&mut self, offset: u64, ctx: &mut RingCtx<'_>) -> Result<Option<Record>, DecodeError> {
        let base = self.stream_base();
        if offset < base {
            return Ok(None);
        }
        let index = (offset - base) / self.page_size as u64;
        if index >= self.page_count {
            return Ok(None);
        }
        self.reset(ctx);
        self.next_page = index;
        while let Some(rec) = self.next(ctx)? {
            if rec.offset == offset {
                return Ok(Some(rec));
            }
            if rec.offset > offset || rec.page.index != index {
                break;
            }
        }
        Ok(None)
    }

    /// Returns the final record in the buffer, scanning pages backward and
    /// skipping pages that hold only padding.
    pub fn read_last(&mut self, ctx: &mut RingCtx<'_>) -> Result<Option<Record>, DecodeError> {
        let mut index = self.page_count;
        while index > 0 {
            index -= 1;
            self.reset(ctx);
            self.next_page = index;
            let mut last = None;
            while let Some(rec) = self.peek(ctx)? {
                if rec.page.index != index {
                    break;
                }
                last = self.next(ctx)?;
            }
            if last.is_some() {
                return Ok(last);
            }
        }
        self.reset(ctx);
        Ok(None)
    }
}

/// Walks record headers from `cur.pos`. Control records only adjust the
/// running timestamp. Returns `(header pos, payload start, payload size, ts)`
/// for the next data record, or `None` at the end of the page.
fn decode_event(page: &[u8], cur: &mut PageCursor, endian: Endian) -> Result<Option<(usize, usize, usize, u64)>, String> {
    let end = cur.end;
    let read_u32 = |at: usize| -> Result<u32, String> {
        if at + 4 > end {
            return Err(format!("record header at {} runs past commit {}", at, end));
        }
        Ok(endian.u32(&page[at..at + 4]))
    };

    loop {
        if cur.pos + 4 > cur.end {
            cur.pos = cur.end;
            return Ok(None);
        }
        let hdr_pos = cur.pos;
        let word = read_u32(hdr_pos)?;
        let (type_len, delta) = match endian {
            Endian::Little => (word & 0x1f, word >> 5),
            Endian::Big => (word >> TS_SHIFT, word & TS_DELTA_MASK),
        };

        match type_len {
            TYPE_PADDING => {
                if delta == 0 {
                    // Rest of the page is empty.
                    cur.pos = cur.end;
                    return Ok(None);
                }
                let len = read_u32(hdr_pos + 4)? as usize;
                cur.pos = hdr_pos + 4 + len;
            }
            TYPE_TIME_EXTEND => {
                let extend = read_u32(hdr_pos + 4)? as u64;
                cur.ts = cur.ts.wrapping_add((extend << TS_SHIFT) + delta as u64);
                cur.pos = hdr_pos + 8;
            }
            TYPE_TIME_STAMP => {
                let extend = read_u32(hdr_pos + 4)? as u64;
                cur.ts = (extend << TS_SHIFT) + delta as u64;
                cur.pos = hdr_pos + 8;
            }
            0 => {
                let len = (read_u32(hdr_pos + 4)? as usize).saturating_sub(4);
                let len = (len + 3) & !3;
                let data_start = hdr_pos + 8;
                if data_start + len > cur.end {
                    return Err(format!("record at {} with {} bytes runs past commit {}", hdr_pos, len, cur.end));
                }
                cur.ts = cur.ts.wrapping_add(delta as u64);
                cur.pos = data_start + len;
                return Ok(Some((hdr_pos, data_start, len, cur.ts)));
            }
            n => {
                let len = n as usize * 4;
                let data_start = hdr_pos + 4;
                if data_start + len > cur.end {
                    return Err(format!("record at {} with {} bytes runs past commit {}", hdr_pos, len, cur.end));
                }
                cur.ts = cur.ts.wrapping_add(delta as u64);
                cur.pos = data_start + len;
                return Ok(Some((hdr_pos, data_start, len, cur.ts)));
            }
        }
    }
}

/// Reads `u32 count` then `{u32 zsize, u32 size, bytes}` headers.
fn read_chunk_table(src: &dyn ReadAt, desc: CpuDataDesc, endian: Endian) -> Result<Vec<CompressionChunk>, DecodeError> {
    let end = desc.offset + desc.size;
    let mut dec = Decoder::new(src, desc.offset, endian);
    let count = dec.u32()?;
    let mut chunks = Vec::with_capacity(count.min(1 << 16) as usize);
    let mut logical = 0u64;
    for _ in 0..count {
        let zsize = dec.u32()?;
        let size = dec.u32()?;
        let file_offset = dec.pos();
        if file_offset + zsize as u64 > end {
            return Err(DecodeError::CpuDataOutOfBounds {
                cpu: desc.cpu,
                end: file_offset + zsize as u64,
                file_size: end,
            });
        }
        dec.skip(zsize as u64)?;
        chunks.push(CompressionChunk { file_offset, zsize, size, logical_offset: logical });
        logical += size as u64;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64;

    /// Builds one little-endian page with 8-byte commit from raw record words.
    fn page(ts: u64, body: &[u32]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&ts.to_le_bytes());
        p.extend_from_slice(&((body.len() * 4) as u64).to_le_bytes());
        for w in body {
            p.extend_from_slice(&w.to_le_bytes());
        }
        p.resize(PAGE, 0);
        p
    }

    fn hdr(type_len: u32, delta: u32) -> u32 {
        (delta << 5) | type_len
    }

    fn ring(data: &Vec<u8>) -> CpuRingBuffer {
        let desc = CpuDataDesc { cpu: 0, offset: 0, size: data.len() as u64 };
        CpuRingBuffer::new(0, desc, PAGE as u32, 8, Endian::Little, None, 4, data).unwrap()
    }

    #[test]
    fn test_deltas_and_control_records() {
        let mut data = page(1000, &[hdr(1, 5), 0xaa, hdr(TYPE_TIME_EXTEND, 3), 1, hdr(2, 2), 1, 2]);
        data.extend(page(1 << 30, &[hdr(1, 0), 0xbb, hdr(TYPE_PADDING, 0)]));
        let mut pool = PagePool::new();
        let mut ctx = RingCtx { src: &data, pool: &mut pool };
        let mut cpu = ring(&data);

        let a = cpu.next(&mut ctx).unwrap().unwrap();
        assert_eq!(a.ts, 1005);
        assert_eq!(ctx.pool.record_data(&a).unwrap(), &0xaau32.to_le_bytes());

        let b = cpu.next(&mut ctx).unwrap().unwrap();
        assert_eq!(b.ts, 1005 + (1 << 27) + 3 + 2);
        assert_eq!(b.size, 8);

        let c = cpu.next(&mut ctx).unwrap().unwrap();
        assert_eq!(c.ts, 1 << 30);
        assert_eq!(c.page.index, 1);
        assert!(cpu.next(&mut ctx).unwrap().is_none());
        assert_eq!(ctx.pool.live_pages(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let data = page(10, &[hdr(1, 1), 1, hdr(1, 1), 2]);
        let mut pool = PagePool::new();
        let mut ctx = RingCtx { src: &data, pool: &mut pool };
        let mut cpu = ring(&data);

        let peeked = cpu.peek(&mut ctx).unwrap().cloned().unwrap();
        let again = cpu.peek(&mut ctx).unwrap().cloned().unwrap();
        assert_eq!(peeked, again);
        assert_eq!(cpu.next(&mut ctx).unwrap().unwrap(), peeked);
        assert_eq!(cpu.next(&mut ctx).unwrap().unwrap().ts, 12);
    }

    #[test]
    fn test_padding_with_length_is_skipped() {
        let data = page(0, &[hdr(TYPE_PADDING, 1), 4, 0xdead, hdr(1, 7), 9]);
        let mut pool = PagePool::new();
        let mut ctx = RingCtx { src: &data, pool: &mut pool };
        let mut cpu = ring(&data);
        let rec = cpu.next(&mut ctx).unwrap().unwrap();
        assert_eq!(rec.ts, 7);
        assert_eq!(ctx.pool.record_data(&rec).unwrap(), &9u32.to_le_bytes());
    }

    #[test]
    fn test_seek_read_at_and_read_last() {
        let mut data = Vec::new();
        for p in 0..5u64 {
            data.extend(page(p * 100, &[hdr(1, 10), p as u32, hdr(1, 10), p as u32]));
        }
        // Trailing page holding only padding.
        data.extend(page(600, &[hdr(TYPE_PADDING, 0)]));

        let mut pool = PagePool::new();
        let mut ctx = RingCtx { src: &data, pool: &mut pool };
        let mut cpu = ring(&data);

        cpu.seek_to_timestamp(315, &mut ctx).unwrap();
        assert_eq!(cpu.peek(&mut ctx).unwrap().unwrap().ts, 320);

        let last = cpu.read_last(&mut ctx).unwrap().unwrap();
        assert_eq!(last.ts, 420);

        let offset = last.offset;
        cpu.seek_to_timestamp(0, &mut ctx).unwrap();
        let again = cpu.read_at(offset, &mut ctx).unwrap().unwrap();
        assert_eq!(again.ts, 420);
        assert!(cpu.read_at(offset + 1, &mut ctx).unwrap().is_none());
    }

    #[test]
    fn test_record_past_commit_is_bad_page() {
        let mut data = page(0, &[hdr(1, 1), 5]);
        // Commit claims 4 bytes only: the 4-byte payload is cut off.
        data[8..16].copy_from_slice(&4u64.to_le_bytes());
        let mut pool = PagePool::new();
        let mut ctx = RingCtx { src: &data, pool: &mut pool };
        let mut cpu = ring(&data);
        assert!(matches!(cpu.next(&mut ctx), Err(DecodeError::BadPage { .. })));
    }

    #[test]
    fn test_chunk_lookup_and_exhaustion() {
        let mut src = Vec::new();
        let mut chunks = Vec::new();
        let mut logical = 0;
        for i in 0..4u8 {
            let packed = Codec::Zlib.compress(&[i; 16]).unwrap();
            chunks.push(CompressionChunk {
                file_offset: src.len() as u64,
                zsize: packed.len() as u32,
                size: 16,
                logical_offset: logical,
            });
            logical += 16;
            src.extend(packed);
        }

        let mut cache = ChunkCache::new(3);
        assert_eq!(cache.find_chunk(&chunks, 40), Some(2));
        assert_eq!(cache.find_chunk(&chunks, 50), Some(3));
        assert_eq!(cache.find_chunk(&chunks, 5), Some(0));
        assert_eq!(cache.find_chunk(&chunks, 64), None);

        let a = cache.get(0, &chunks[0], &src, Codec::Zlib, 0).unwrap();
        assert_eq!(&a[..], &[0u8; 16]);
        cache.retain(0);
        cache.get(1, &chunks[1], &src, Codec::Zlib, 0).unwrap();
        cache.retain(1);
        cache.get(2, &chunks[2], &src, Codec::Zlib, 0).unwrap();
        cache.retain(2);
        assert!(matches!(
            cache.get(3, &chunks[3], &src, Codec::Zlib, 0),
            Err(DecodeError::ChunkCacheExhausted { cpu: 0, capacity: 3 })
        ));

        cache.release(0);
        let d = cache.get(3, &chunks[3], &src, Codec::Zlib, 0).unwrap();
        assert_eq!(&d[..], &[3u8; 16]);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.pinned(), 2);
    }

    #[test]
    fn test_small_cache_capacity_is_raised() {
        assert_eq!(ChunkCache::new(0).capacity(), MIN_CHUNK_CACHE_CAPACITY);
        assert_eq!(ChunkCache::new(1).capacity(), MIN_CHUNK_CACHE_CAPACITY);
        assert_eq!(ChunkCache::new(8).capacity(), 8);
    }
}
