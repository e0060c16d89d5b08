// cip.rs - CIP request/response codec and Common Packet Format handling
//
// A CIP explicit request is [service][path size in words][path, even-padded]
// followed by service-specific payload. Replies echo the service with the
// high bit set and carry [reserved][general status][extended status size]
// [extended status words][response data].

use crate::bytes::Reader;
use crate::error::{EipError, Result};

// CIP services used by the scanner.
pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
pub const READ_TAG: u8 = 0x4C;
pub const WRITE_TAG: u8 = 0x4D;
pub const FORWARD_CLOSE: u8 = 0x4E;
pub const FORWARD_OPEN: u8 = 0x54;

// CPF item types.
pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
pub const ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
pub const ITEM_CONNECTED_DATA: u16 = 0x00B1;
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;
pub const ITEM_SEQUENCED_ADDRESS: u16 = 0x8002;
pub const ITEM_IDENTITY: u16 = 0x000C;

/// One segment of a CIP request path.
///
/// Logical segments use the 8-bit encoding when the id fits in a byte and
/// the 16-bit encoding otherwise; symbolic segments are ANSI extended
/// symbols padded to even length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Class(u16),
    Instance(u16),
    Attribute(u16),
    /// Logical connection-point segment, used for Assembly references
    /// inside Forward Open connection paths.
    ConnectionPoint(u16),
    /// ANSI extended symbolic segment (tag name component).
    Symbolic(String),
    /// Array element (member) index following a symbolic segment.
    Element(u32),
}

fn push_logical(out: &mut Vec<u8>, base8: u8, base16: u8, value: u16) {
    if value <= 0xFF {
        out.push(base8);
        out.push(value as u8);
    } else {
        out.push(base16);
        out.push(0x00); // pad byte of the 16-bit form
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Encodes a path into its wire form. The result is always even in length.
pub fn encode_path(segments: &[PathSegment]) -> Vec<u8> {
    let mut out = Vec::new();
    for segment in segments {
        match segment {
            PathSegment::Class(v) => push_logical(&mut out, 0x20, 0x21, *v),
            PathSegment::Instance(v) => push_logical(&mut out, 0x24, 0x25, *v),
            PathSegment::Attribute(v) => push_logical(&mut out, 0x30, 0x31, *v),
            PathSegment::ConnectionPoint(v) => push_logical(&mut out, 0x2C, 0x2D, *v),
            PathSegment::Symbolic(name) => {
                out.push(0x91); // ANSI extended symbol segment
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                if name.len() % 2 != 0 {
                    out.push(0x00);
                }
            }
            PathSegment::Element(idx) => {
                if *idx <= 0xFF {
                    out.push(0x28);
                    out.push(*idx as u8);
                } else if *idx <= 0xFFFF {
                    out.push(0x29);
                    out.push(0x00);
                    out.extend_from_slice(&(*idx as u16).to_le_bytes());
                } else {
                    out.push(0x2A);
                    out.push(0x00);
                    out.extend_from_slice(&idx.to_le_bytes());
                }
            }
        }
    }
    out
}

/// Decodes a wire-form path back into segments.
pub fn decode_path(buf: &[u8]) -> Result<Vec<PathSegment>> {
    let mut r = Reader::new(buf);
    let mut segments = Vec::new();
    while !r.is_empty() {
        let kind = r.u8()?;
        let segment = match kind {
            0x20 => PathSegment::Class(r.u8()? as u16),
            0x21 => {
                r.skip(1)?;
                PathSegment::Class(r.u16_le()?)
            }
            0x24 => PathSegment::Instance(r.u8()? as u16),
            0x25 => {
                r.skip(1)?;
                PathSegment::Instance(r.u16_le()?)
            }
            0x30 => PathSegment::Attribute(r.u8()? as u16),
            0x31 => {
                r.skip(1)?;
                PathSegment::Attribute(r.u16_le()?)
            }
            0x2C => PathSegment::ConnectionPoint(r.u8()? as u16),
            0x2D => {
                r.skip(1)?;
                PathSegment::ConnectionPoint(r.u16_le()?)
            }
            0x28 => PathSegment::Element(r.u8()? as u32),
            0x29 => {
                r.skip(1)?;
                PathSegment::Element(r.u16_le()? as u32)
            }
            0x2A => {
                r.skip(1)?;
                PathSegment::Element(r.u32_le()?)
            }
            0x91 => {
                let len = r.u8()? as usize;
                let name = String::from_utf8_lossy(r.take(len)?).into_owned();
                if len % 2 != 0 {
                    r.skip(1)?;
                }
                PathSegment::Symbolic(name)
            }
            other => {
                return Err(EipError::Protocol(format!(
                    "unsupported path segment type 0x{other:02X}"
                )))
            }
        };
        segments.push(segment);
    }
    Ok(segments)
}

/// Encodes a CIP explicit request: service, path size in words, path,
/// then the service-specific payload. The path-size field is a single
/// byte, so paths longer than 255 words are rejected instead of being
/// silently truncated.
pub fn encode_request(service: u8, path: &[PathSegment], payload: &[u8]) -> Result<Vec<u8>> {
    let path_bytes = encode_path(path);
    debug_assert_eq!(path_bytes.len() % 2, 0);
    let path_words = path_bytes.len() / 2;
    if path_words > u8::MAX as usize {
        return Err(EipError::Protocol(format!(
            "request path of {path_words} words exceeds the 255-word limit"
        )));
    }
    let mut out = Vec::with_capacity(2 + path_bytes.len() + payload.len());
    out.push(service);
    out.push(path_words as u8);
    out.extend_from_slice(&path_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// A decoded CIP reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    /// Echoed service code with the reply bit (0x80) set.
    pub service: u8,
    pub general_status: u8,
    /// Extended status words (size-prefixed on the wire).
    pub extended_status: Vec<u16>,
    /// Service-specific response data following the status block.
    pub data: Vec<u8>,
}

impl CipReply {
    /// Fails with the mapped CIP reason when the general status is non-zero.
    pub fn check_status(&self) -> Result<()> {
        if self.general_status != 0 {
            return Err(EipError::cip_status(
                self.general_status,
                &self.extended_status,
            ));
        }
        Ok(())
    }
}

/// Decodes a CIP reply envelope from the data-item payload.
pub fn decode_reply(buf: &[u8]) -> Result<CipReply> {
    let mut r = Reader::new(buf);
    let service = r.u8()?;
    if service & 0x80 == 0 {
        return Err(EipError::Protocol(format!(
            "CIP reply service 0x{service:02X} is missing the reply bit"
        )));
    }
    r.skip(1)?; // reserved
    let general_status = r.u8()?;
    let ext_count = r.u8()? as usize;
    let mut extended_status = Vec::with_capacity(ext_count);
    for _ in 0..ext_count {
        extended_status.push(r.u16_le()?);
    }
    Ok(CipReply {
        service,
        general_status,
        extended_status,
        data: r.rest().to_vec(),
    })
}

/// Builds the SendRRData payload around a CIP request: interface handle,
/// CIP timeout, then a two-item CPF list (null address + unconnected data).
pub fn build_rr_payload(cip_request: &[u8], cip_timeout_s: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + cip_request.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // interface handle: CIP
    out.extend_from_slice(&cip_timeout_s.to_le_bytes()); // timeout
    out.extend_from_slice(&2u16.to_le_bytes()); // item count
    out.extend_from_slice(&ITEM_NULL_ADDRESS.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // null address length
    out.extend_from_slice(&ITEM_UNCONNECTED_DATA.to_le_bytes());
    out.extend_from_slice(&(cip_request.len() as u16).to_le_bytes());
    out.extend_from_slice(cip_request);
    out
}

/// Locates the data item inside a SendRRData reply payload by walking the
/// CPF item list. Address items vary in length (null, connected,
/// sequenced), so the data item is found by type, never by fixed offset.
pub fn extract_data_item(rr_payload: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(rr_payload);
    r.skip(4)?; // interface handle
    r.skip(2)?; // timeout
    let item_count = r.u16_le()?;
    if item_count == 0 || item_count > 8 {
        return Err(EipError::Protocol(format!(
            "CPF item count {item_count} out of range"
        )));
    }
    for _ in 0..item_count {
        let item_type = r.u16_le()?;
        let item_len = r.u16_le()? as usize;
        let body = r.take(item_len)?;
        match item_type {
            ITEM_UNCONNECTED_DATA | ITEM_CONNECTED_DATA => return Ok(body.to_vec()),
            _ => {} // address items are skipped by their declared length
        }
    }
    Err(EipError::Protocol(
        "no data item found in CPF item list".to_string(),
    ))
}
