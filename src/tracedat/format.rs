//! Event format descriptions and payload decoding.
//!
//! Each event type ships a text description of its binary layout:
//!
//! ```text
//! name: sched_switch
//! ID: 316
//! format:
//! 	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
//! 	field:char prev_comm[16];	offset:8;	size:16;	signed:0;
//! ```
//!
//! The registry parses those descriptions and turns raw payloads into
//! interned key/value fields.

use super::bytes::Endian;
use crate::error::DecodeError;
use crate::event::EventField;
use crate::string_intern::StringPool;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int { signed: bool, long: bool },
    Pointer,
    CharArray,
    /// `__data_loc`: u32 holding the payload offset (low 16 bits) and length (high 16).
    DataLoc { string: bool },
    Bytes,
}

#[derive(Debug, Clone)]
pub struct FieldFormat {
    pub name: Arc<str>,
    pub type_name: String,
    pub offset: usize,
    pub size: usize,
    pub kind: FieldKind,
}

#[derive(Debug, Clone)]
pub struct EventFormat {
    pub id: u16,
    pub system: Arc<str>,
    pub name: Arc<str>,
    pub common_fields: Vec<FieldFormat>,
    pub fields: Vec<FieldFormat>,
}

/// Byte positions of the fields every payload starts with.
#[derive(Debug, Clone, Copy)]
pub struct CommonLayout {
    pub type_offset: usize,
    pub type_size: usize,
    pub flags_offset: usize,
    pub pid_offset: usize,
    pub pid_size: usize,
}

impl Default for CommonLayout {
    fn default() -> Self {
        CommonLayout {
            type_offset: 0,
            type_size: 2,
            flags_offset: 2,
            pid_offset: 4,
            pid_size: 4,
        }
    }
}

fn parse_field_line(line: &str) -> Result<FieldFormat, DecodeError> {
    let bad = || DecodeError::BadFormat(format!("malformed field line: {:?}", line.trim()));
    let mut decl = None;
    let mut offset = None;
    let mut size = None;
    let mut signed = false;

    for part in line.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("field:") {
            decl = Some(rest.trim());
        } else if let Some(rest) = part.strip_prefix("offset:") {
            offset = rest.trim().parse::<usize>().ok();
        } else if let Some(rest) = part.strip_prefix("size:") {
            size = rest.trim().parse::<usize>().ok();
        } else if let Some(rest) = part.strip_prefix("signed:") {
            signed = rest.trim() == "1";
        }
    }

    let decl = decl.ok_or_else(bad)?;
    let offset = offset.ok_or_else(bad)?;
    let size = size.ok_or_else(bad)?;

    let split = decl.rfind(|c: char| c.is_whitespace() || c == '*').ok_or_else(bad)?;
    let (type_part, name_part) = decl.split_at(split + 1);
    let mut type_name = type_part.trim().to_string();
    let mut name = name_part.trim();
    let mut is_array = false;
    if let Some(bracket) = name.find('[') {
        type_name.push_str(&name[bracket..]);
        name = &name[..bracket];
        is_array = true;
    }
    if name.is_empty() {
        return Err(bad());
    }

    let kind = if type_name.starts_with("__data_loc") {
        FieldKind::DataLoc { string: type_name.contains("char") }
    } else if is_array && type_name.contains("char") {
        FieldKind::CharArray
    } else if type_name.contains('*') {
        FieldKind::Pointer
    } else if !is_array && matches!(size, 1 | 2 | 4 | 8) {
        let base = type_name.trim_start_matches("const ").trim();
        FieldKind::Int { signed, long: base == "long" || base == "unsigned long" }
    } else {
        FieldKind::Bytes
    };

    Ok(FieldFormat {
        name: Arc::from(name),
        type_name,
        offset,
        size,
        kind,
    })
}

impl EventFormat {
    /// Parses one format description. `system` comes from where the format
    /// was stored in the file, not from the text.
    pub fn parse(system: &str, text: &str, pool: &mut StringPool) -> Result<Self, DecodeError> {
        let mut name = None;
        let mut id = None;
        let mut common_fields = Vec::new();
        let mut fields = Vec::new();

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("name:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = trimmed.strip_prefix("ID:") {
                id = rest.trim().parse::<u16>().ok();
            } else if trimmed.starts_with("field:") {
                let mut field = parse_field_line(trimmed)?;
                field.name = pool.intern(&field.name);
                if field.name.starts_with("common_") {
                    common_fields.push(field);
                } else {
                    fields.push(field);
                }
            } else if trimmed.starts_with("print fmt:") {
                break;
            }
        }

        let name = name.ok_or_else(|| DecodeError::BadFormat(format!("format in {} has no name", system)))?;
        let id = id.ok_or_else(|| DecodeError::BadFormat(format!("format {}:{} has no ID", system, name)))?;

        Ok(EventFormat {
            id,
            system: pool.intern(system),
            name: pool.intern(&name),
            common_fields,
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldFormat> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    /// Decodes every non-common field into printed values.
    pub fn decode_fields(&self, payload: &[u8], endian: Endian, pool: &mut StringPool) -> Vec<EventField> {
        let mut out = Vec::with_capacity(self.fields.len());
        let mut buf = String::new();
        for field in &self.fields {
            buf.clear();
            format_field(&mut buf, field, payload, endian);
            let trimmed = buf.trim_end();
            out.push(EventField {
                key: Arc::clone(&field.name),
                value: pool.intern(trimmed),
            });
        }
        out
    }
}

fn cstr_lossy(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

fn push_hex_array(out: &mut String, bytes: &[u8]) {
    out.push_str("ARRAY[");
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{:02x}", b);
    }
    out.push(']');
}

fn sign_extend(v: u64, size: usize) -> i64 {
    match size {
        1 => v as u8 as i8 as i64,
        2 => v as u16 as i16 as i64,
        4 => v as u32 as i32 as i64,
        _ => v as i64,
    }
}

/// Prints a field the way ftrace tools do. Out-of-range fields print empty.
pub fn format_field(out: &mut String, field: &FieldFormat, payload: &[u8], endian: Endian) {
    let start = field.offset.min(payload.len());
    let end = if field.size == 0 {
        payload.len()
    } else {
        (field.offset + field.size).min(payload.len())
    };
    let bytes = &payload[start..end];

    match field.kind {
        FieldKind::Int { signed, long } => {
            if bytes.len() < field.size {
                return;
            }
            let v = endian.uint(bytes, field.size);
            if signed {
                let _ = write!(out, "{}", sign_extend(v, field.size));
            } else if long {
                let _ = write!(out, "0x{:x}", v);
            } else {
                let _ = write!(out, "{}", v);
            }
        }
        FieldKind::Pointer => {
            if matches!(bytes.len(), 4 | 8) {
                let _ = write!(out, "0x{:x}", endian.uint(bytes, bytes.len()));
            }
        }
        FieldKind::CharArray => out.push_str(&cstr_lossy(bytes)),
        FieldKind::DataLoc { string } => {
            if bytes.len() < 4 {
                return;
            }
            let loc = endian.u32(bytes);
            let off = (loc & 0xffff) as usize;
            let len = (loc >> 16) as usize;
            let data = payload.get(off..(off + len).min(payload.len())).unwrap_or(&[]);
            if string {
                out.push_str(&cstr_lossy(data));
            } else {
                push_hex_array(out, data);
            }
        }
        FieldKind::Bytes => push_hex_array(out, bytes),
    }
}

/// All event formats in a capture, indexed by `common_type`.
#[derive(Debug, Default)]
pub struct FormatRegistry {
    by_id: HashMap<u16, Arc<EventFormat>>,
    common: Option<CommonLayout>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, format: EventFormat) {
        if self.common.is_none() && !format.common_fields.is_empty() {
            let mut layout = CommonLayout::default();
            for f in &format.common_fields {
                match &*f.name {
                    "common_type" => {
                        layout.type_offset = f.offset;
                        layout.type_size = f.size;
                    }
                    "common_flags" => layout.flags_offset = f.offset,
                    "common_pid" => {
                        layout.pid_offset = f.offset;
                        layout.pid_size = f.size;
                    }
                    _ => {}
                }
            }
            self.common = Some(layout);
        }
        self.by_id.insert(format.id, Arc::new(format));
    }

    pub fn get(&self, id: u16) -> Option<&Arc<EventFormat>> {
        self.by_id.get(&id)
    }

    pub fn find(&self, system: &str, name: &str) -> Option<&Arc<EventFormat>> {
        self.by_id.values().find(|f| &*f.system == system && &*f.name == name)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn common(&self) -> CommonLayout {
        self.common.unwrap_or_default()
    }

    /// Reads `(common_type, common_flags, common_pid)` from a payload.
    pub fn read_common(&self, payload: &[u8], endian: Endian) -> Option<(u16, u8, i32)> {
        let c = self.common();
        let ty = payload.get(c.type_offset..c.type_offset + c.type_size)?;
        let flags = *payload.get(c.flags_offset)?;
        let pid = payload.get(c.pid_offset..c.pid_offset + c.pid_size)?;
        Some((
            endian.uint(ty, c.type_size) as u16,
            flags,
            sign_extend(endian.uint(pid, c.pid_size), c.pid_size) as i32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHED_SWITCH: &str = "name: sched_switch
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:1;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:long prev_state;\toffset:28;\tsize:8;\tsigned:1;
\tfield:__data_loc char[] timeline;\toffset:36;\tsize:4;\tsigned:0;
\tfield:void * fence;\toffset:40;\tsize:8;\tsigned:0;

print fmt: \"prev_comm=%s\", REC->prev_comm
";

    #[test]
    fn test_parse_format() {
        let mut pool = StringPool::new();
        let format = EventFormat::parse("sched", SCHED_SWITCH, &mut pool).unwrap();
        assert_eq!(format.id, 316);
        assert_eq!(&*format.name, "sched_switch");
        assert_eq!(format.common_fields.len(), 4);
        assert_eq!(format.fields.len(), 5);

        let comm = format.field("prev_comm").unwrap();
        assert_eq!(comm.kind, FieldKind::CharArray);
        assert_eq!(comm.type_name, "char[16]");
        assert_eq!(format.field("prev_pid").unwrap().kind, FieldKind::Int { signed: true, long: false });
        assert_eq!(format.field("timeline").unwrap().kind, FieldKind::DataLoc { string: true });
        assert_eq!(format.field("fence").unwrap().kind, FieldKind::Pointer);
    }

    #[test]
    fn test_decode_payload() {
        let mut pool = StringPool::new();
        let format = EventFormat::parse("sched", SCHED_SWITCH, &mut pool).unwrap();
        let e = Endian::Little;

        let mut payload = Vec::new();
        e.put_u16(&mut payload, 316);
        payload.push(1);
        payload.push(0);
        e.put_u32(&mut payload, 1234);
        let mut comm = [0u8; 16];
        comm[..5].copy_from_slice(b"Xorg ");
        payload.extend_from_slice(&comm);
        e.put_u32(&mut payload, (-1i32) as u32);
        e.put_u64(&mut payload, 2);
        e.put_u32(&mut payload, (4 << 16) | 48);
        e.put_u64(&mut payload, 0xdead);
        payload.extend_from_slice(b"gfx\0");

        let fields = format.decode_fields(&payload, e, &mut pool);
        let get = |k: &str| fields.iter().find(|f| &*f.key == k).map(|f| f.value.to_string());
        assert_eq!(get("prev_comm").as_deref(), Some("Xorg"));
        assert_eq!(get("prev_pid").as_deref(), Some("-1"));
        assert_eq!(get("prev_state").as_deref(), Some("2"));
        assert_eq!(get("timeline").as_deref(), Some("gfx"));
        assert_eq!(get("fence").as_deref(), Some("0xdead"));

        let mut registry = FormatRegistry::new();
        registry.add(format);
        assert_eq!(registry.read_common(&payload, e), Some((316, 1, 1234)));
    }

    #[test]
    fn test_missing_id_is_an_error() {
        let mut pool = StringPool::new();
        let err = EventFormat::parse("x", "name: foo\nformat:\n", &mut pool).unwrap_err();
        assert!(matches!(err, DecodeError::BadFormat(_)));
    }
}
