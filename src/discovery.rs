// discovery.rs - Sessionless List Identity device discovery
//
// A List Identity request is a bare encapsulation header (session handle 0)
// sent by UDP to every probe target on the local subnet. Replies carry a
// CPF identity item (type 0x000C) with the device's vendor/product fields
// and a short product name.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::bytes::Reader;
use crate::cip::ITEM_IDENTITY;
use crate::encap::{EncapHeader, CMD_LIST_IDENTITY, EXPLICIT_PORT, HEADER_LEN};
use crate::error::{EipError, Result};

/// Probe targets per scan are capped to one /24 worth of hosts.
pub const MAX_PROBE_TARGETS: usize = 255;

/// Smallest identity item this parser accepts.
const MIN_IDENTITY_ITEM_LEN: usize = 24;

/// One discovered device, produced transiently by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// Source address the reply arrived from.
    pub address: Ipv4Addr,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    /// Major/minor revision.
    pub revision: (u8, u8),
    pub status: u16,
    pub serial_number: u32,
    /// Product name, at most 32 bytes; empty when the reply declared a
    /// length that would have read past the datagram.
    pub product_name: String,
    /// Device state byte, when the reply carried one.
    pub state: Option<u8>,
    /// Round-trip time from probe to reply.
    pub response_time: Duration,
}

/// Identity fields without the transport-derived parts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IdentityFields {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: (u8, u8),
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub state: Option<u8>,
}

/// The List Identity probe: a bare header, sessionless.
pub(crate) fn list_identity_request() -> [u8; HEADER_LEN] {
    EncapHeader::new(CMD_LIST_IDENTITY, 0, 0).encode()
}

/// Parses a List Identity reply datagram into identity fields.
///
/// Validates the minimum response size, the identity item type and length,
/// and bounds-checks the variable-length product name: a declared name
/// length that would read past the datagram leaves the name empty rather
/// than failing the whole record.
pub(crate) fn parse_identity_datagram(datagram: &[u8]) -> Result<IdentityFields> {
    if datagram.len() < HEADER_LEN + 2 {
        return Err(EipError::Protocol(format!(
            "List Identity reply too short ({} bytes)",
            datagram.len()
        )));
    }
    let header = EncapHeader::decode(datagram)?;
    if header.command != CMD_LIST_IDENTITY {
        return Err(EipError::Protocol(format!(
            "unexpected command 0x{:04X} in List Identity reply",
            header.command
        )));
    }

    let mut r = Reader::new(&datagram[HEADER_LEN..]);
    let item_count = r.u16_le()?;
    if item_count == 0 {
        return Err(EipError::Protocol(
            "List Identity reply carries no items".to_string(),
        ));
    }
    let item_type = r.u16_le()?;
    let item_len = r.u16_le()? as usize;
    if item_type != ITEM_IDENTITY {
        return Err(EipError::Protocol(format!(
            "expected identity item 0x{ITEM_IDENTITY:04X}, got 0x{item_type:04X}"
        )));
    }
    if item_len < MIN_IDENTITY_ITEM_LEN {
        return Err(EipError::Protocol(format!(
            "identity item too short ({item_len} bytes)"
        )));
    }

    r.skip(2)?; // encapsulation protocol version
    r.skip(16)?; // socket address (big-endian sockaddr_in image)
    let vendor_id = r.u16_le()?;
    let device_type = r.u16_le()?;
    let product_code = r.u16_le()?;
    let rev_major = r.u8()?;
    let rev_minor = r.u8()?;
    let status = r.u16_le()?;
    let serial_number = r.u32_le()?;

    let name_len = r.u8()? as usize;
    let product_name = if name_len <= r.remaining() {
        String::from_utf8_lossy(r.take(name_len)?).into_owned()
    } else {
        // Declared length would read past the datagram boundary.
        String::new()
    };
    let state = r.u8().ok();

    Ok(IdentityFields {
        vendor_id,
        device_type,
        product_code,
        revision: (rev_major, rev_minor),
        status,
        serial_number,
        product_name,
        state,
    })
}

/// Enumerates probe targets for the subnet of `address`/`netmask`: the
/// hosts of the subnet (capped) plus the directed broadcast address.
/// An unconfigured interface falls back to the limited broadcast.
pub(crate) fn subnet_targets(address: Ipv4Addr, netmask: Ipv4Addr) -> Vec<Ipv4Addr> {
    let addr = u32::from(address);
    let mask = u32::from(netmask);
    if addr == 0 || mask == 0 {
        return vec![Ipv4Addr::BROADCAST];
    }
    let network = addr & mask;
    let broadcast = network | !mask;
    let mut targets: Vec<Ipv4Addr> = (network.saturating_add(1)..broadcast)
        .filter(|host| *host != addr)
        .take(MAX_PROBE_TARGETS - 1)
        .map(Ipv4Addr::from)
        .collect();
    targets.push(Ipv4Addr::from(broadcast));
    targets
}

/// Sends a List Identity probe to every target and collects replies for
/// the full `wait` window. Results are deduplicated by source address,
/// first seen wins.
pub async fn scan_targets(targets: &[SocketAddrV4], wait: Duration) -> Result<Vec<DeviceRecord>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let probe = list_identity_request();
    let started = Instant::now();
    for target in targets {
        if let Err(e) = socket.send_to(&probe, SocketAddr::V4(*target)).await {
            trace!(target = %target, error = %e, "probe send failed");
        }
    }
    debug!(targets = targets.len(), "List Identity probes sent");

    let mut seen: HashSet<Ipv4Addr> = HashSet::new();
    let mut devices = Vec::new();
    let mut buf = [0u8; 512];
    let deadline = started + wait;

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        let (len, from) = match timeout(left, socket.recv_from(&mut buf)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(EipError::Io(e)),
            Err(_) => break, // window elapsed
        };
        let source = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => continue,
        };
        if seen.contains(&source) {
            trace!(source = %source, "duplicate identity reply ignored");
            continue;
        }
        match parse_identity_datagram(&buf[..len]) {
            Ok(fields) => {
                seen.insert(source);
                devices.push(DeviceRecord {
                    address: source,
                    vendor_id: fields.vendor_id,
                    device_type: fields.device_type,
                    product_code: fields.product_code,
                    revision: fields.revision,
                    status: fields.status,
                    serial_number: fields.serial_number,
                    product_name: fields.product_name,
                    state: fields.state,
                    response_time: started.elapsed(),
                });
            }
            Err(e) => warn!(source = %source, error = %e, "discarding malformed identity reply"),
        }
    }

    debug!(found = devices.len(), "scan complete");
    Ok(devices)
}

/// Convenience wrapper targeting the standard explicit port.
pub(crate) fn to_probe_addrs(hosts: &[Ipv4Addr]) -> Vec<SocketAddrV4> {
    hosts
        .iter()
        .map(|host| SocketAddrV4::new(*host, EXPLICIT_PORT))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_reply(name: &[u8], declared_len: u8) -> Vec<u8> {
        let mut item = Vec::new();
        item.extend_from_slice(&1u16.to_le_bytes()); // protocol version
        item.extend_from_slice(&[0u8; 16]); // sockaddr image
        item.extend_from_slice(&0x001Du16.to_le_bytes()); // vendor
        item.extend_from_slice(&0x000Cu16.to_le_bytes()); // device type
        item.extend_from_slice(&0x0065u16.to_le_bytes()); // product code
        item.push(2); // rev major
        item.push(7); // rev minor
        item.extend_from_slice(&0x0030u16.to_le_bytes()); // status
        item.extend_from_slice(&0xCAFE_F00Du32.to_le_bytes()); // serial
        item.push(declared_len);
        item.extend_from_slice(name);
        item.push(0x03); // state

        let mut datagram = Vec::new();
        datagram
            .extend_from_slice(&EncapHeader::new(CMD_LIST_IDENTITY, 0, (item.len() + 6) as u16).encode());
        datagram.extend_from_slice(&1u16.to_le_bytes()); // item count
        datagram.extend_from_slice(&ITEM_IDENTITY.to_le_bytes());
        datagram.extend_from_slice(&(item.len() as u16).to_le_bytes());
        datagram.extend_from_slice(&item);
        datagram
    }

    #[test]
    fn parses_a_well_formed_identity_reply() {
        let datagram = identity_reply(b"1769-L32E", 9);
        let fields = parse_identity_datagram(&datagram).unwrap();
        assert_eq!(fields.vendor_id, 0x001D);
        assert_eq!(fields.device_type, 0x000C);
        assert_eq!(fields.product_code, 0x0065);
        assert_eq!(fields.revision, (2, 7));
        assert_eq!(fields.serial_number, 0xCAFE_F00D);
        assert_eq!(fields.product_name, "1769-L32E");
        assert_eq!(fields.state, Some(0x03));
    }

    #[test]
    fn overlong_name_declaration_leaves_name_empty() {
        // Declared name length reaches past the datagram end; the record
        // survives with an empty name and no out-of-bounds read.
        let datagram = identity_reply(b"X", 200);
        let fields = parse_identity_datagram(&datagram).unwrap();
        assert_eq!(fields.product_name, "");
    }

    #[test]
    fn wrong_item_type_is_rejected() {
        let mut datagram = identity_reply(b"dev", 3);
        // Overwrite the item type right after the item count.
        let off = HEADER_LEN + 2;
        datagram[off..off + 2].copy_from_slice(&0x00B2u16.to_le_bytes());
        assert!(parse_identity_datagram(&datagram).is_err());
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(parse_identity_datagram(&[0u8; 10]).is_err());
    }

    #[test]
    fn subnet_targets_are_capped_and_end_with_broadcast() {
        let targets = subnet_targets(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(255, 255, 0, 0), // /16: far more hosts than the cap
        );
        assert!(targets.len() <= MAX_PROBE_TARGETS);
        assert_eq!(targets.last(), Some(&Ipv4Addr::new(10, 0, 255, 255)));
        assert!(!targets.contains(&Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn unconfigured_interface_uses_limited_broadcast() {
        let targets = subnet_targets(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        assert_eq!(targets, vec![Ipv4Addr::BROADCAST]);
    }

    #[test]
    fn slash_24_probes_every_host() {
        let targets = subnet_targets(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        // 253 hosts (own address excluded) plus the directed broadcast.
        assert_eq!(targets.len(), 254);
        assert!(targets.contains(&Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(targets.last(), Some(&Ipv4Addr::new(192, 168, 1, 255)));
    }
}
