//! Binary trace.dat decoding.
//!
//! `container` parses the file header, metadata parts and options;
//! `ringbuf` walks one CPU's pages; `merge` interleaves every CPU of every
//! buffer instance; `reader` turns records into events.

pub mod bytes;
pub mod compress;
pub mod container;
pub mod format;
pub mod kallsyms;
pub mod merge;
pub mod reader;
pub mod ringbuf;
pub mod tsync;

pub use container::{BufferInstance, BufferLayout, CpuDataDesc, FileState, TraceHeader};
pub use kallsyms::KernelSymbols;
pub use reader::{decode_trace, TraceDatReader};
pub use ringbuf::{CompressionChunk, CpuRingBuffer, PagePool, Record};
pub use tsync::{TimestampCorrection, TsyncSample, TsyncTable};
