// tag.rs - Symbolic tag access with a typed value table
//
// Tags are addressed by ANSI extended symbolic paths built from the tag
// name, with dot-separated members and bracketed array indices
// ("Line1.Drive[3].Speed"). Values are read with CIP service 0x4C and
// written with 0x4D, carrying the elementary type code on the wire.

use tracing::trace;

use crate::bytes::Reader;
use crate::cip::{self, PathSegment, READ_TAG, WRITE_TAG};
use crate::error::{EipError, Result};
use crate::session::Session;

// CIP elementary type codes.
pub const TYPE_BOOL: u16 = 0x00C1;
pub const TYPE_SINT: u16 = 0x00C2;
pub const TYPE_INT: u16 = 0x00C3;
pub const TYPE_DINT: u16 = 0x00C4;
pub const TYPE_LINT: u16 = 0x00C5;
pub const TYPE_USINT: u16 = 0x00C6;
pub const TYPE_UINT: u16 = 0x00C7;
pub const TYPE_UDINT: u16 = 0x00C8;
pub const TYPE_ULINT: u16 = 0x00C9;
pub const TYPE_REAL: u16 = 0x00CA;
pub const TYPE_LREAL: u16 = 0x00CB;
pub const TYPE_BYTE: u16 = 0x00D1;
pub const TYPE_WORD: u16 = 0x00D2;
pub const TYPE_DWORD: u16 = 0x00D3;
pub const TYPE_LWORD: u16 = 0x00D4;
pub const TYPE_STRING: u16 = 0x00DA;

/// Longest tag-name component a symbolic segment can carry.
const MAX_SYMBOL_LEN: usize = 255;

/// A typed tag value as exchanged with the target.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    Ulint(u64),
    Real(f32),
    Lreal(f64),
    Byte(u8),
    Word(u16),
    Dword(u32),
    Lword(u64),
    /// Size-prefixed short string: 1-byte length + payload.
    String(String),
}

impl TagValue {
    /// The CIP elementary type code for this value.
    pub fn type_code(&self) -> u16 {
        match self {
            TagValue::Bool(_) => TYPE_BOOL,
            TagValue::Sint(_) => TYPE_SINT,
            TagValue::Int(_) => TYPE_INT,
            TagValue::Dint(_) => TYPE_DINT,
            TagValue::Lint(_) => TYPE_LINT,
            TagValue::Usint(_) => TYPE_USINT,
            TagValue::Uint(_) => TYPE_UINT,
            TagValue::Udint(_) => TYPE_UDINT,
            TagValue::Ulint(_) => TYPE_ULINT,
            TagValue::Real(_) => TYPE_REAL,
            TagValue::Lreal(_) => TYPE_LREAL,
            TagValue::Byte(_) => TYPE_BYTE,
            TagValue::Word(_) => TYPE_WORD,
            TagValue::Dword(_) => TYPE_DWORD,
            TagValue::Lword(_) => TYPE_LWORD,
            TagValue::String(_) => TYPE_STRING,
        }
    }

    /// Wire size of a fixed-width type; `None` for variable types.
    pub fn fixed_size(type_code: u16) -> Option<usize> {
        match type_code {
            TYPE_BOOL | TYPE_SINT | TYPE_USINT | TYPE_BYTE => Some(1),
            TYPE_INT | TYPE_UINT | TYPE_WORD => Some(2),
            TYPE_DINT | TYPE_UDINT | TYPE_REAL | TYPE_DWORD => Some(4),
            TYPE_LINT | TYPE_ULINT | TYPE_LREAL | TYPE_LWORD => Some(8),
            _ => None,
        }
    }

    /// Wire size given a logical length (string byte count); fixed types
    /// ignore the length.
    pub fn wire_size(type_code: u16, logical_len: usize) -> usize {
        match Self::fixed_size(type_code) {
            Some(n) => n,
            None => 1 + logical_len, // length prefix + payload
        }
    }

    /// Encodes the value into its wire bytes (excluding the type code).
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            TagValue::Bool(v) => vec![if *v { 0xFF } else { 0x00 }],
            TagValue::Sint(v) => v.to_le_bytes().to_vec(),
            TagValue::Int(v) => v.to_le_bytes().to_vec(),
            TagValue::Dint(v) => v.to_le_bytes().to_vec(),
            TagValue::Lint(v) => v.to_le_bytes().to_vec(),
            TagValue::Usint(v) => v.to_le_bytes().to_vec(),
            TagValue::Uint(v) => v.to_le_bytes().to_vec(),
            TagValue::Udint(v) => v.to_le_bytes().to_vec(),
            TagValue::Ulint(v) => v.to_le_bytes().to_vec(),
            TagValue::Real(v) => v.to_le_bytes().to_vec(),
            TagValue::Lreal(v) => v.to_le_bytes().to_vec(),
            TagValue::Byte(v) => vec![*v],
            TagValue::Word(v) => v.to_le_bytes().to_vec(),
            TagValue::Dword(v) => v.to_le_bytes().to_vec(),
            TagValue::Lword(v) => v.to_le_bytes().to_vec(),
            TagValue::String(s) => {
                let mut out = Vec::with_capacity(1 + s.len());
                out.push(s.len().min(255) as u8);
                out.extend_from_slice(&s.as_bytes()[..s.len().min(255)]);
                out
            }
        }
    }

    /// Decodes wire bytes into a typed value.
    pub fn from_wire(type_code: u16, data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let value = match type_code {
            TYPE_BOOL => TagValue::Bool(r.u8()? != 0),
            TYPE_SINT => TagValue::Sint(r.u8()? as i8),
            TYPE_INT => TagValue::Int(r.u16_le()? as i16),
            TYPE_DINT => TagValue::Dint(r.u32_le()? as i32),
            TYPE_LINT => {
                let lo = r.u32_le()? as u64;
                let hi = r.u32_le()? as u64;
                TagValue::Lint(((hi << 32) | lo) as i64)
            }
            TYPE_USINT => TagValue::Usint(r.u8()?),
            TYPE_UINT => TagValue::Uint(r.u16_le()?),
            TYPE_UDINT => TagValue::Udint(r.u32_le()?),
            TYPE_ULINT => {
                let lo = r.u32_le()? as u64;
                let hi = r.u32_le()? as u64;
                TagValue::Ulint((hi << 32) | lo)
            }
            TYPE_REAL => TagValue::Real(f32::from_bits(r.u32_le()?)),
            TYPE_LREAL => {
                let lo = r.u32_le()? as u64;
                let hi = r.u32_le()? as u64;
                TagValue::Lreal(f64::from_bits((hi << 32) | lo))
            }
            TYPE_BYTE => TagValue::Byte(r.u8()?),
            TYPE_WORD => TagValue::Word(r.u16_le()?),
            TYPE_DWORD => TagValue::Dword(r.u32_le()?),
            TYPE_LWORD => {
                let lo = r.u32_le()? as u64;
                let hi = r.u32_le()? as u64;
                TagValue::Lword((hi << 32) | lo)
            }
            TYPE_STRING => {
                let len = r.u8()? as usize;
                let bytes = r.take(len)?;
                TagValue::String(String::from_utf8_lossy(bytes).into_owned())
            }
            other => {
                return Err(EipError::Protocol(format!(
                    "unsupported tag data type 0x{other:04X}"
                )))
            }
        };
        Ok(value)
    }
}

/// Builds the symbolic request path for a tag name.
///
/// Dot-separated components become symbolic segments; bracketed indices
/// become element segments ("Drive[3].Speed" → symbol "Drive", element 3,
/// symbol "Speed").
pub fn parse_tag_path(tag_name: &str) -> Result<Vec<PathSegment>> {
    if tag_name.is_empty() {
        return Err(EipError::Protocol("empty tag name".to_string()));
    }
    let mut segments = Vec::new();
    for component in tag_name.split('.') {
        let (name, indices) = match component.find('[') {
            Some(bracket) => (&component[..bracket], &component[bracket..]),
            None => (component, ""),
        };
        if name.is_empty() || name.len() > MAX_SYMBOL_LEN {
            return Err(EipError::Protocol(format!(
                "invalid tag component in '{tag_name}'"
            )));
        }
        segments.push(PathSegment::Symbolic(name.to_string()));

        let mut rest = indices;
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']').ok_or_else(|| {
                EipError::Protocol(format!("unterminated array index in '{tag_name}'"))
            })?;
            for index in stripped[..close].split(',') {
                let value: u32 = index.trim().parse().map_err(|_| {
                    EipError::Protocol(format!("bad array index '{index}' in '{tag_name}'"))
                })?;
                segments.push(PathSegment::Element(value));
            }
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return Err(EipError::Protocol(format!(
                "trailing characters after index in '{tag_name}'"
            )));
        }
    }
    Ok(segments)
}

/// Reads one element of a tag over an existing session.
pub(crate) async fn read_tag(session: &mut Session, tag_name: &str) -> Result<TagValue> {
    let path = parse_tag_path(tag_name)?;
    let request = cip::encode_request(READ_TAG, &path, &1u16.to_le_bytes())?;
    let reply = session.send_rr_data(&request).await?;
    reply.check_status()?;

    let mut r = Reader::new(&reply.data);
    let type_code = r.u16_le()?;
    trace!(tag = tag_name, type_code = format_args!("0x{type_code:04X}"), "tag read");
    TagValue::from_wire(type_code, r.rest())
}

/// Writes one element of a tag over an existing session.
pub(crate) async fn write_tag(
    session: &mut Session,
    tag_name: &str,
    value: &TagValue,
) -> Result<()> {
    let path = parse_tag_path(tag_name)?;
    let mut payload = Vec::new();
    payload.extend_from_slice(&value.type_code().to_le_bytes());
    payload.extend_from_slice(&1u16.to_le_bytes()); // element count
    payload.extend_from_slice(&value.to_wire());

    let request = cip::encode_request(WRITE_TAG, &path, &payload)?;
    let reply = session.send_rr_data(&request).await?;
    reply.check_status()
}
