// assembly.rs - Explicit messaging against the Assembly object (class 4)
//
// Process data lives in attribute 3 of an Assembly instance as a raw byte
// blob. Some adapters wrap the blob in a length-prefixed OCTET_STRING
// (type tag 0x00DA); both encodings are accepted on read.

use std::time::Duration;

use tracing::{debug, trace};

use crate::cip::{self, PathSegment, GET_ATTRIBUTE_SINGLE, SET_ATTRIBUTE_SINGLE};
use crate::error::Result;
use crate::session::Session;

/// CIP Assembly object class code.
pub const ASSEMBLY_CLASS: u16 = 4;
/// Instance attribute holding the process-data blob.
pub const DATA_ATTRIBUTE: u16 = 3;
/// Class-level attribute holding the highest instance number.
pub const MAX_INSTANCE_ATTRIBUTE: u16 = 2;

/// OCTET_STRING type tag some adapters prepend to attribute 3 data.
const OCTET_STRING_TAG: u16 = 0x00DA;

/// Max-Instance values outside this range are treated as implausible and
/// trigger the fixed fallback list.
const MAX_INSTANCE_PLAUSIBLE: u16 = 1000;
/// Sequential probing stops here even when Max Instance claims more.
const MAX_PROBED_INSTANCE: u16 = 256;

/// Instance numbers commonly used by adapters that do not answer the
/// Max-Instance query (I/O images around 100/101, config around 102,
/// plus a few vendor-typical blocks).
const FALLBACK_INSTANCES: &[u16] = &[
    1, 2, 3, 100, 101, 102, 110, 111, 112, 120, 121, 128, 129, 130, 131, 132, 150, 151, 152,
];

/// Result of one explicit assembly read.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyData {
    pub data: Vec<u8>,
    pub response_time: Duration,
}

/// An assembly instance found by discovery, with its data size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyInstance {
    pub instance: u16,
    pub size: usize,
}

fn instance_path(instance: u16, attribute: u16) -> Vec<PathSegment> {
    vec![
        PathSegment::Class(ASSEMBLY_CLASS),
        PathSegment::Instance(instance),
        PathSegment::Attribute(attribute),
    ]
}

/// Strips the optional OCTET_STRING framing from a Get-Attribute-Single
/// payload. The declared length must fit inside the payload; anything
/// else, including an unknown tag, is treated as raw bytes.
pub(crate) fn decode_assembly_payload(payload: &[u8]) -> &[u8] {
    if payload.len() >= 4 {
        let tag = u16::from_le_bytes([payload[0], payload[1]]);
        let len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
        if tag == OCTET_STRING_TAG && 4 + len <= payload.len() {
            return &payload[4..4 + len];
        }
    }
    payload
}

/// Get_Attribute_Single on an arbitrary path over an existing session.
pub(crate) async fn get_attribute_single(
    session: &mut Session,
    path: &[PathSegment],
) -> Result<Vec<u8>> {
    let request = cip::encode_request(GET_ATTRIBUTE_SINGLE, path, &[])?;
    let reply = session.send_rr_data(&request).await?;
    reply.check_status()?;
    Ok(reply.data)
}

/// Reads the process-data blob of one Assembly instance.
pub(crate) async fn read_instance(session: &mut Session, instance: u16) -> Result<Vec<u8>> {
    let payload = get_attribute_single(session, &instance_path(instance, DATA_ATTRIBUTE)).await?;
    Ok(decode_assembly_payload(&payload).to_vec())
}

/// Writes the process-data blob of one Assembly instance.
pub(crate) async fn write_instance(
    session: &mut Session,
    instance: u16,
    data: &[u8],
) -> Result<()> {
    let request = cip::encode_request(
        SET_ATTRIBUTE_SINGLE,
        &instance_path(instance, DATA_ATTRIBUTE),
        data,
    )?;
    let reply = session.send_rr_data(&request).await?;
    reply.check_status()
}

/// Reads the class-level Max Instance attribute.
pub(crate) async fn read_max_instance(session: &mut Session) -> Result<Option<u16>> {
    let path = vec![
        PathSegment::Class(ASSEMBLY_CLASS),
        PathSegment::Instance(0),
        PathSegment::Attribute(MAX_INSTANCE_ATTRIBUTE),
    ];
    match get_attribute_single(session, &path).await {
        Ok(data) if data.len() >= 2 => Ok(Some(u16::from_le_bytes([data[0], data[1]]))),
        Ok(_) => Ok(None),
        Err(e) => {
            trace!(error = %e, "Max Instance query failed");
            Ok(None)
        }
    }
}

/// Finds readable assembly instances over one session.
///
/// When Max Instance yields a plausible value, instances 1..=min(v, 256)
/// are probed sequentially; otherwise a fixed list of commonly used
/// instance numbers is tried.
pub(crate) async fn discover_instances(session: &mut Session) -> Result<Vec<AssemblyInstance>> {
    let candidates: Vec<u16> = match read_max_instance(session).await? {
        Some(max) if max > 0 && max < MAX_INSTANCE_PLAUSIBLE => {
            debug!(max, "probing instances up to Max Instance");
            (1..=max.min(MAX_PROBED_INSTANCE)).collect()
        }
        other => {
            debug!(max_instance = ?other, "Max Instance implausible, using fallback list");
            FALLBACK_INSTANCES.to_vec()
        }
    };

    let mut found = Vec::new();
    for instance in candidates {
        if let Ok(data) = read_instance(session, instance).await {
            found.push(AssemblyInstance {
                instance,
                size: data.len(),
            });
        }
    }
    Ok(found)
}
