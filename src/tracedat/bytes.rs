//! Positional byte sources and an endian-aware field decoder.

use crate::error::DecodeError;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn u16(self, b: &[u8]) -> u16 {
        let a = [b[0], b[1]];
        match self {
            Endian::Little => u16::from_le_bytes(a),
            Endian::Big => u16::from_be_bytes(a),
        }
    }

    pub fn u32(self, b: &[u8]) -> u32 {
        let a = [b[0], b[1], b[2], b[3]];
        match self {
            Endian::Little => u32::from_le_bytes(a),
            Endian::Big => u32::from_be_bytes(a),
        }
    }

    pub fn u64(self, b: &[u8]) -> u64 {
        let a = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        match self {
            Endian::Little => u64::from_le_bytes(a),
            Endian::Big => u64::from_be_bytes(a),
        }
    }

    /// Reads an unsigned integer of 1, 2, 4 or 8 bytes.
    pub fn uint(self, b: &[u8], size: usize) -> u64 {
        match size {
            1 => b[0] as u64,
            2 => self.u16(b) as u64,
            4 => self.u32(b) as u64,
            _ => self.u64(b),
        }
    }

    pub fn put_u16(self, out: &mut Vec<u8>, v: u16) {
        match self {
            Endian::Little => out.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub fn put_u32(self, out: &mut Vec<u8>, v: u32) {
        match self {
            Endian::Little => out.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub fn put_u64(self, out: &mut Vec<u8>, v: u64) {
        match self {
            Endian::Little => out.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => out.extend_from_slice(&v.to_be_bytes()),
        }
    }
}

/// Random-access byte source. Reads past the end are `Truncated` errors.
pub trait ReadAt {
    fn len(&self) -> u64;

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DecodeError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>, DecodeError> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

fn check_bounds(offset: u64, wanted: usize, total: u64) -> Result<(), DecodeError> {
    match offset.checked_add(wanted as u64) {
        Some(end) if end <= total => Ok(()),
        _ => Err(DecodeError::Truncated { offset, wanted: wanted as u64 }),
    }
}

impl ReadAt for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DecodeError> {
        check_bounds(offset, buf.len(), ReadAt::len(self))?;
        let start = offset as usize;
        buf.copy_from_slice(&self[start..start + buf.len()]);
        Ok(())
    }
}

impl ReadAt for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DecodeError> {
        self.as_slice().read_exact_at(offset, buf)
    }
}

/// A file read with seek + read; the decode worker is the only user.
pub struct FileSource {
    file: RefCell<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(FileSource { file: RefCell::new(file), len })
    }
}

impl ReadAt for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DecodeError> {
        check_bounds(offset, buf.len(), self.len)?;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DecodeError::Truncated { offset, wanted: buf.len() as u64 },
            _ => DecodeError::Io(e),
        })
    }
}

/// Sequential field reader over a [`ReadAt`] source.
pub struct Decoder<'a> {
    src: &'a dyn ReadAt,
    pos: u64,
    endian: Endian,
}

impl<'a> Decoder<'a> {
    pub fn new(src: &'a dyn ReadAt, pos: u64, endian: Endian) -> Self {
        Decoder { src, pos, endian }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn remaining(&self) -> u64 {
        self.src.len().saturating_sub(self.pos)
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub fn bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        let buf = self.src.read_vec(self.pos, len)?;
        self.pos += len as u64;
        Ok(buf)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        self.src.read_exact_at(self.pos, &mut buf)?;
        self.pos += N as u64;
        Ok(buf)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.array::<2>()?;
        Ok(self.endian.u16(&b))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.array::<4>()?;
        Ok(self.endian.u32(&b))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.array::<8>()?;
        Ok(self.endian.u64(&b))
    }

    pub fn skip(&mut self, len: u64) -> Result<(), DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.src.len())
            .ok_or(DecodeError::Truncated { offset: self.pos, wanted: len })?;
        self.pos = end;
        Ok(())
    }

    /// Reads a NUL-terminated string. Missing terminator is a truncation.
    pub fn cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let avail = self.src.len().saturating_sub(self.pos).min(chunk.len() as u64) as usize;
            if avail == 0 {
                return Err(DecodeError::Truncated { offset: start, wanted: out.len() as u64 + 1 });
            }
            self.src.read_exact_at(self.pos, &mut chunk[..avail])?;
            if let Some(nul) = chunk[..avail].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                self.pos += nul as u64 + 1;
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..avail]);
            self.pos += avail as u64;
        }
    }

    /// Reads `len` bytes as text, dropping any trailing NULs.
    pub fn text(&mut self, len: usize) -> Result<String, DecodeError> {
        let buf = self.bytes(len)?;
        let end = buf.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }
}

/// Field reader over an in-memory payload such as an option body.
pub struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Self {
        SliceReader { buf, pos: 0, endian }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let slice = self
            .buf
            .get(self.pos..self.pos.saturating_add(len))
            .ok_or(DecodeError::Truncated { offset: self.pos as u64, wanted: len as u64 })?;
        self.pos += len;
        Ok(slice)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(self.endian.u16(b))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(self.endian.u32(b))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.bytes(8)?;
        Ok(self.endian.u64(b))
    }

    pub fn cstr(&mut self) -> Result<String, DecodeError> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or(DecodeError::Truncated {
            offset: self.pos as u64,
            wanted: rest.len() as u64 + 1,
        })?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Returns the NUL-terminated string at the start of `buf` and the bytes after it.
pub fn split_cstr(buf: &[u8]) -> (String, &[u8]) {
    match buf.iter().position(|&b| b == 0) {
        Some(nul) => (String::from_utf8_lossy(&buf[..nul]).into_owned(), &buf[nul + 1..]),
        None => (String::from_utf8_lossy(buf).into_owned(), &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_reads_fields_in_order() {
        let mut data = Vec::new();
        Endian::Big.put_u16(&mut data, 0x1234);
        Endian::Big.put_u32(&mut data, 7);
        data.extend_from_slice(b"gfx\0");
        Endian::Big.put_u64(&mut data, u64::MAX - 1);

        let mut dec = Decoder::new(&data, 0, Endian::Big);
        assert_eq!(dec.u16().unwrap(), 0x1234);
        assert_eq!(dec.u32().unwrap(), 7);
        assert_eq!(dec.cstr().unwrap(), "gfx");
        assert_eq!(dec.u64().unwrap(), u64::MAX - 1);
        assert!(dec.at_end());
    }

    #[test]
    fn test_truncated_read_reports_offset() {
        let data = vec![1u8, 2, 3];
        let mut dec = Decoder::new(&data, 0, Endian::Little);
        dec.u16().unwrap();
        match dec.u32() {
            Err(DecodeError::Truncated { offset, wanted }) => {
                assert_eq!(offset, 2);
                assert_eq!(wanted, 4);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string_is_truncated() {
        let data = b"no terminator".to_vec();
        let mut dec = Decoder::new(&data, 0, Endian::Little);
        assert!(matches!(dec.cstr(), Err(DecodeError::Truncated { offset: 0, .. })));
    }

    #[test]
    fn test_split_cstr() {
        let (name, rest) = split_cstr(b"instance\0abc");
        assert_eq!(name, "instance");
        assert_eq!(rest, b"abc");
    }
}
