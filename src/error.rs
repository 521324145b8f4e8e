//! Typed decode errors for the binary trace container.
//!
//! Format and resource errors are fatal to a load; every variant carries
//! the byte offset, CPU or section id needed to diagnose the capture.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("bad magic at offset 0: not a trace-cmd data file")]
    BadMagic,

    #[error("unsupported file version {0}")]
    UnsupportedVersion(String),

    #[error("truncated read at offset {offset:#x}: wanted {wanted} bytes")]
    Truncated { offset: u64, wanted: u64 },

    #[error("cpu {cpu} data ends at {end:#x} past end of file ({file_size:#x}); capture possibly truncated")]
    CpuDataOutOfBounds { cpu: u32, end: u64, file_size: u64 },

    #[error("bad section {id} at offset {offset:#x}: {reason}")]
    BadSection { id: u16, offset: u64, reason: String },

    #[error("unexpected tag {found:?} at offset {offset:#x}, expected {expected}")]
    BadTag { offset: u64, expected: &'static str, found: String },

    #[error("unsupported compression algorithm {name:?} version {version:?}")]
    UnsupportedCompression { name: String, version: String },

    #[error("decompression failed for block at offset {offset:#x}: {reason}")]
    Decompress { offset: u64, reason: String },

    #[error("chunk cache for cpu {cpu} is full of referenced chunks (capacity {capacity})")]
    ChunkCacheExhausted { cpu: u32, capacity: usize },

    #[error("bad page at offset {offset:#x} on cpu {cpu}: {reason}")]
    BadPage { cpu: u32, offset: u64, reason: String },

    #[error("bad event format: {0}")]
    BadFormat(String),

    #[error("cpu {0} is out of range")]
    NoSuchCpu(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_display_includes_offset() {
        let err = DecodeError::Truncated { offset: 0x40, wanted: 8 };
        assert_eq!(err.to_string(), "truncated read at offset 0x40: wanted 8 bytes");
    }

    #[test]
    fn test_cpu_bounds_display() {
        let err = DecodeError::CpuDataOutOfBounds { cpu: 3, end: 0x2000, file_size: 0x1800 };
        assert!(err.to_string().contains("cpu 3"));
        assert!(err.to_string().contains("truncated"));
    }
}
