//! Block codecs for sectioned (version 7) captures.

use crate::error::DecodeError;
use brotli::enc::BrotliEncoderParams;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// Level 0 selects zstd's default.
const ZSTD_LEVEL: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zlib,
    Brotli,
    Zstd,
}

impl Codec {
    /// Resolves the algorithm named in the file header. `"none"` means no codec.
    pub fn from_name(name: &str, version: &str) -> Result<Option<Codec>, DecodeError> {
        match name {
            "" | "none" => Ok(None),
            "zlib" => Ok(Some(Codec::Zlib)),
            "brotli" => Ok(Some(Codec::Brotli)),
            "zstd" => Ok(Some(Codec::Zstd)),
            _ => Err(DecodeError::UnsupportedCompression {
                name: name.to_string(),
                version: version.to_string(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Zlib => "zlib",
            Codec::Brotli => "brotli",
            Codec::Zstd => "zstd",
        }
    }

    /// Decompresses one block whose uncompressed size is recorded in the file.
    /// `offset` is the block's file position, for error reporting.
    pub fn decompress(self, input: &[u8], size: usize, offset: u64) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::with_capacity(size);
        let result = match self {
            Codec::Zlib => ZlibDecoder::new(input).read_to_end(&mut out),
            Codec::Brotli => brotli::Decompressor::new(input, 4096).read_to_end(&mut out),
            Codec::Zstd => zstd::stream::read::Decoder::new(input).and_then(|mut dec| dec.read_to_end(&mut out)),
        };
        if let Err(e) = result {
            return Err(DecodeError::Decompress { offset, reason: e.to_string() });
        }
        if out.len() != size {
            return Err(DecodeError::Decompress {
                offset,
                reason: format!("expected {} bytes, got {}", size, out.len()),
            });
        }
        Ok(out)
    }

    pub fn compress(self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(input)?;
                enc.finish()
            }
            Codec::Brotli => {
                let mut out = Vec::new();
                {
                    let params = BrotliEncoderParams {
                        quality: 6,
                        lgwin: 22,
                        ..Default::default()
                    };
                    let mut writer = brotli::CompressorWriter::with_params(&mut out, 4096, &params);
                    writer.write_all(input)?;
                    writer.flush()?;
                }
                Ok(out)
            }
            Codec::Zstd => zstd::stream::encode_all(input, ZSTD_LEVEL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_names() {
        assert_eq!(Codec::from_name("none", "").unwrap(), None);
        assert_eq!(Codec::from_name("zlib", "1.2.11").unwrap(), Some(Codec::Zlib));
        assert_eq!(Codec::from_name("zstd", "1.5.5").unwrap(), Some(Codec::Zstd));
        assert!(matches!(
            Codec::from_name("lzo", "2.10"),
            Err(DecodeError::UnsupportedCompression { .. })
        ));
    }

    #[test]
    fn test_block_round_trip() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|v| (v % 251).to_le_bytes()).collect();
        for codec in [Codec::Zlib, Codec::Brotli, Codec::Zstd] {
            let packed = codec.compress(&payload).unwrap();
            let unpacked = codec.decompress(&packed, payload.len(), 0).unwrap();
            assert_eq!(unpacked, payload, "{}", codec.name());
        }
    }

    #[test]
    fn test_size_mismatch_is_an_error() {
        let packed = Codec::Zlib.compress(b"hello").unwrap();
        let err = Codec::Zlib.decompress(&packed, 6, 0x80).unwrap_err();
        assert!(err.to_string().contains("0x80"));
    }
}
