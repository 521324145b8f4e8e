//! Timestamp correction: clock rescale, host/guest sync, fixed offset.

use super::bytes::{Endian, SliceReader};
use crate::error::DecodeError;

/// Blend offsets between the bracketing samples instead of using the lower one.
pub const TSYNC_FLAG_INTERPOLATE: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsyncSample {
    pub time: i64,
    pub offset: i64,
    pub scaling: i64,
}

/// Per-CPU host/guest clock samples, sorted by time with duplicates removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsyncTable {
    pub peer_trace_id: u64,
    pub flags: u32,
    pub cpus: Vec<Vec<TsyncSample>>,
}

impl TsyncTable {
    pub fn new(flags: u32, cpus: Vec<Vec<TsyncSample>>) -> Self {
        let cpus = cpus.into_iter().map(normalize_samples).collect();
        TsyncTable { peer_trace_id: 0, flags, cpus }
    }

    /// Parses a TIME_SHIFT option payload.
    ///
    /// Layout: u64 peer id, u32 flags, u32 cpu count, then per CPU a u32
    /// sample count followed by that many i64 times, offsets and scalings.
    pub fn parse(buf: &[u8], endian: Endian) -> Result<Self, DecodeError> {
        let mut rd = SliceReader::new(buf, endian);
        let peer_trace_id = rd.u64()?;
        let flags = rd.u32()?;
        let cpu_count = rd.u32()? as usize;
        let mut cpus = Vec::with_capacity(cpu_count.min(4096));
        for _ in 0..cpu_count {
            let count = rd.u32()? as usize;
            let mut read_array = || {
                (0..count)
                    .map(|_| rd.u64().map(|v| v as i64))
                    .collect::<Result<Vec<i64>, DecodeError>>()
            };
            let times = read_array()?;
            let offsets = read_array()?;
            let scalings = read_array()?;
            let samples = (0..count)
                .map(|i| TsyncSample { time: times[i], offset: offsets[i], scaling: scalings[i] })
                .collect();
            cpus.push(samples);
        }

        let mut table = TsyncTable::new(flags, cpus);
        table.peer_trace_id = peer_trace_id;
        Ok(table)
    }

    pub fn interpolate(&self) -> bool {
        self.flags & TSYNC_FLAG_INTERPOLATE != 0
    }

    /// Applies the sync correction for one CPU. CPUs without samples pass through.
    pub fn correct(&self, ts: i64, cpu: u32) -> i64 {
        let samples = match self.cpus.get(cpu as usize) {
            Some(s) if !s.is_empty() => s,
            _ => return ts,
        };

        match samples.len() {
            1 => ts + samples[0].offset,
            2 => self.calc(ts, &samples[0], &samples[1]),
            n => {
                if ts <= samples[0].time {
                    return self.calc(ts, &samples[0], &samples[1]);
                }
                if ts >= samples[n - 1].time {
                    return self.calc(ts, &samples[n - 2], &samples[n - 1]);
                }
                // Bracket: last sample with time <= ts.
                let lower = samples.partition_point(|s| s.time <= ts) - 1;
                self.calc(ts, &samples[lower], &samples[lower + 1])
            }
        }
    }

    fn calc(&self, ts: i64, min: &TsyncSample, max: &TsyncSample) -> i64 {
        let (scaling, tscor) = if self.interpolate() {
            let delta = max.time - min.time;
            let scaling = (min.scaling + max.scaling) / 2;
            let tscor = if delta == 0 {
                min.offset
            } else {
                let offset = (ts - min.time) * (max.offset - min.offset);
                min.offset + (offset + delta / 2) / delta
            };
            (scaling, tscor)
        } else {
            (min.scaling, min.offset)
        };
        ts * scaling.max(1) + tscor
    }
}

fn normalize_samples(mut samples: Vec<TsyncSample>) -> Vec<TsyncSample> {
    samples.sort_by_key(|s| s.time);
    samples.dedup_by_key(|s| s.time);
    samples
}

/// Recorded TSC calibration: `ns = ((ticks - offset) * mult) >> shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tsc2Nsec {
    pub mult: u32,
    pub shift: u32,
    pub offset: u64,
}

impl Tsc2Nsec {
    pub fn parse(buf: &[u8], endian: Endian) -> Option<Self> {
        if buf.len() < 16 {
            return None;
        }
        Some(Tsc2Nsec {
            mult: endian.u32(&buf[0..4]),
            shift: endian.u32(&buf[4..8]),
            offset: endian.u64(&buf[8..16]),
        })
    }

    pub fn apply(&self, ticks: u64) -> u64 {
        let ticks = ticks.saturating_sub(self.offset);
        ((ticks as u128 * self.mult as u128) >> self.shift.min(127)) as u64
    }
}

/// The full correction pipeline for one capture.
///
/// Order: (a) clock rescale, (b) host/guest sync, (c) fixed offset.
/// Raw mode skips (b) and (c) but still rescales.
#[derive(Debug, Clone, Default)]
pub struct TimestampCorrection {
    /// Nanoseconds per tick for a counter clock with a known frequency.
    pub ns_per_tick: Option<f64>,
    pub tsc2nsec: Option<Tsc2Nsec>,
    pub host_sync: Option<TsyncTable>,
    pub ts_offset: i64,
    pub raw: bool,
}

impl TimestampCorrection {
    pub fn correct(&self, raw_ts: u64, cpu: u32) -> i64 {
        let mut ts = if let Some(ns_per_tick) = self.ns_per_tick {
            (raw_ts as f64 * ns_per_tick) as i64
        } else if let Some(tsc) = &self.tsc2nsec {
            tsc.apply(raw_ts) as i64
        } else {
            raw_ts as i64
        };

        if self.raw {
            return ts;
        }
        if let Some(table) = &self.host_sync {
            ts = table.correct(ts, cpu);
        }
        ts + self.ts_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(time: i64, offset: i64) -> TsyncSample {
        TsyncSample { time, offset, scaling: 1 }
    }

    #[test]
    fn test_three_sample_interpolation() {
        let table = TsyncTable::new(
            TSYNC_FLAG_INTERPOLATE,
            vec![vec![sample(0, 10), sample(100, 20), sample(200, 15)]],
        );
        // Halfway between +20 and +15, rounded by integer division.
        assert_eq!(table.correct(150, 0), 168);
        assert_eq!(table.correct(100, 0), 120);
        assert_eq!(table.correct(50, 0), 65);
    }

    #[test]
    fn test_without_interpolate_uses_lower_bracket() {
        let table = TsyncTable::new(0, vec![vec![sample(0, 10), sample(100, 20), sample(200, 15)]]);
        assert_eq!(table.correct(150, 0), 170);
        assert_eq!(table.correct(250, 0), 270);
    }

    #[test]
    fn test_single_sample_and_unknown_cpu() {
        let table = TsyncTable::new(TSYNC_FLAG_INTERPOLATE, vec![vec![sample(5, -3)]]);
        assert_eq!(table.correct(100, 0), 97);
        assert_eq!(table.correct(100, 7), 100);
    }

    #[test]
    fn test_samples_sorted_and_deduplicated() {
        let table = TsyncTable::new(0, vec![vec![sample(200, 15), sample(0, 10), sample(200, 99), sample(100, 20)]]);
        let times: Vec<i64> = table.cpus[0].iter().map(|s| s.time).collect();
        assert_eq!(times, vec![0, 100, 200]);
    }

    #[test]
    fn test_parse_time_shift_payload() {
        let e = Endian::Little;
        let mut buf = Vec::new();
        e.put_u64(&mut buf, 0xabc);
        e.put_u32(&mut buf, TSYNC_FLAG_INTERPOLATE);
        e.put_u32(&mut buf, 1);
        e.put_u32(&mut buf, 2);
        for v in [100i64, 0, 20, 10, 1, 1] {
            e.put_u64(&mut buf, v as u64);
        }
        let table = TsyncTable::parse(&buf, e).unwrap();
        assert_eq!(table.peer_trace_id, 0xabc);
        assert_eq!(table.cpus[0], vec![sample(0, 10), sample(100, 20)]);

        assert!(TsyncTable::parse(&buf[..buf.len() - 1], e).is_err());
    }

    #[test]
    fn test_correction_order_and_raw_mode() {
        let mut corr = TimestampCorrection {
            tsc2nsec: Some(Tsc2Nsec { mult: 1, shift: 1, offset: 0 }),
            host_sync: Some(TsyncTable::new(0, vec![vec![sample(0, 1000)]])),
            ts_offset: 5,
            ..Default::default()
        };
        assert_eq!(corr.correct(200, 0), 100 + 1000 + 5);
        corr.raw = true;
        assert_eq!(corr.correct(200, 0), 100);
    }
}
