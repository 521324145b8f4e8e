//! Time-ordered merge across per-CPU cursors.

use super::bytes::ReadAt;
use super::ringbuf::{CpuRingBuffer, PagePool, Record, RingCtx};
use super::tsync::TimestampCorrection;
use crate::error::DecodeError;

/// Emits records from every ring in non-decreasing timestamp order.
///
/// Each step peeks all rings and advances only the one holding the earliest
/// record. Equal timestamps go to the lower ring index. With a correction
/// set, rings are ordered by corrected time, since per-CPU clock sync can
/// move one CPU's records past another's.
pub struct MergeCursor {
    rings: Vec<CpuRingBuffer>,
    pool: PagePool,
    correction: Option<TimestampCorrection>,
}

impl MergeCursor {
    pub fn new(rings: Vec<CpuRingBuffer>) -> Self {
        MergeCursor {
            rings,
            pool: PagePool::new(),
            correction: None,
        }
    }

    pub fn with_correction(mut self, correction: TimestampCorrection) -> Self {
        self.correction = Some(correction);
        self
    }

    fn order_key(&self, ts: u64, cpu: u32) -> i128 {
        match &self.correction {
            Some(c) => c.correct(ts, cpu) as i128,
            None => ts as i128,
        }
    }

    pub fn rings(&self) -> &[CpuRingBuffer] {
        &self.rings
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn record_data(&self, record: &Record) -> Option<&[u8]> {
        self.pool.record_data(record)
    }

    /// Raw timestamp of each ring's first record, `None` for empty rings.
    pub fn first_timestamps(&mut self, src: &dyn ReadAt) -> Result<Vec<Option<u64>>, DecodeError> {
        let mut out = Vec::with_capacity(self.rings.len());
        for ring in &mut self.rings {
            let mut ctx = RingCtx { src, pool: &mut self.pool };
            out.push(ring.peek(&mut ctx)?.map(|r| r.ts));
        }
        Ok(out)
    }

    /// Positions every ring at its first record at or after `ts`.
    pub fn seek_to_timestamp(&mut self, ts: u64, src: &dyn ReadAt) -> Result<(), DecodeError> {
        for ring in &mut self.rings {
            let mut ctx = RingCtx { src, pool: &mut self.pool };
            ring.seek_to_timestamp(ts, &mut ctx)?;
        }
        Ok(())
    }

    pub fn next(&mut self, src: &dyn ReadAt) -> Result<Option<Record>, DecodeError> {
        let mut best: Option<(usize, i128)> = None;
        for i in 0..self.rings.len() {
            let mut ctx = RingCtx { src, pool: &mut self.pool };
            let Some((ts, cpu)) = self.rings[i].peek(&mut ctx)?.map(|r| (r.ts, r.cpu)) else {
                continue;
            };
            let key = self.order_key(ts, cpu);
            if best.map_or(true, |(_, best_key)| key < best_key) {
                best = Some((i, key));
            }
        }

        match best {
            Some((i, _)) => {
                let mut ctx = RingCtx { src, pool: &mut self.pool };
                self.rings[i].next(&mut ctx)
            }
            None => Ok(None),
        }
    }

    /// Releases every page still held by the rings.
    pub fn finish(&mut self, src: &dyn ReadAt) {
        for ring in &mut self.rings {
            let mut ctx = RingCtx { src, pool: &mut self.pool };
            ring.reset(&mut ctx);
        }
    }
}
