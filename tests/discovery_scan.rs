// Discovery tests against a local mock device answering List Identity
// probes over UDP.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;

use eip_scan::discovery::scan_targets;
use eip_scan::encap::{EncapHeader, CMD_LIST_IDENTITY, HEADER_LEN};

/// Builds a complete List Identity reply datagram.
fn identity_reply(serial: u32, name: &str) -> Vec<u8> {
    let mut item = Vec::new();
    item.extend_from_slice(&1u16.to_le_bytes()); // protocol version
    item.extend_from_slice(&[0u8; 16]); // sockaddr image
    item.extend_from_slice(&0x001Du16.to_le_bytes()); // vendor
    item.extend_from_slice(&0x000Cu16.to_le_bytes()); // device type: communications adapter
    item.extend_from_slice(&0x0065u16.to_le_bytes()); // product code
    item.extend_from_slice(&[2, 7]); // revision 2.7
    item.extend_from_slice(&0x0030u16.to_le_bytes()); // status
    item.extend_from_slice(&serial.to_le_bytes());
    item.push(name.len() as u8);
    item.extend_from_slice(name.as_bytes());
    item.push(0x03); // state: operational

    let mut datagram = Vec::with_capacity(HEADER_LEN + 6 + item.len());
    datagram.extend_from_slice(
        &EncapHeader::new(CMD_LIST_IDENTITY, 0, (6 + item.len()) as u16).encode(),
    );
    datagram.extend_from_slice(&1u16.to_le_bytes()); // item count
    datagram.extend_from_slice(&0x000Cu16.to_le_bytes()); // identity item
    datagram.extend_from_slice(&(item.len() as u16).to_le_bytes());
    datagram.extend_from_slice(&item);
    datagram
}

/// Mock device: answers the first probe it sees with `replies` copies of
/// the same identity datagram.
async fn run_responder(socket: UdpSocket, datagram: Vec<u8>, replies: usize) {
    let mut buf = [0u8; 64];
    let (len, from) = socket.recv_from(&mut buf).await.unwrap();
    let header = EncapHeader::decode(&buf[..len]).unwrap();
    assert_eq!(header.command, CMD_LIST_IDENTITY);
    for _ in 0..replies {
        socket.send_to(&datagram, from).await.unwrap();
    }
}

#[tokio::test]
async fn scan_parses_identity_and_dedups_duplicate_replies() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = match socket.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4.port(),
        other => panic!("unexpected local addr {other}"),
    };
    tokio::spawn(run_responder(
        socket,
        identity_reply(0x00C0FFEE, "Mock IO Block"),
        2, // same device answering twice must yield one record
    ));

    let targets = [SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)];
    let devices = scan_targets(&targets, Duration::from_millis(300))
        .await
        .unwrap();

    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.address, Ipv4Addr::LOCALHOST);
    assert_eq!(device.vendor_id, 0x001D);
    assert_eq!(device.device_type, 0x000C);
    assert_eq!(device.product_code, 0x0065);
    assert_eq!(device.revision, (2, 7));
    assert_eq!(device.status, 0x0030);
    assert_eq!(device.serial_number, 0x00C0FFEE);
    assert_eq!(device.product_name, "Mock IO Block");
    assert_eq!(device.state, Some(0x03));
    assert!(device.response_time <= Duration::from_millis(300));
}

#[tokio::test]
async fn malformed_replies_are_discarded_without_failing_the_scan() {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = match socket.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4.port(),
        other => panic!("unexpected local addr {other}"),
    };
    // Wrong item type: a CPF null-address item instead of identity.
    let mut bad = EncapHeader::new(CMD_LIST_IDENTITY, 0, 6).encode().to_vec();
    bad.extend_from_slice(&1u16.to_le_bytes());
    bad.extend_from_slice(&0x0000u16.to_le_bytes());
    bad.extend_from_slice(&0u16.to_le_bytes());
    tokio::spawn(run_responder(socket, bad, 1));

    let targets = [SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)];
    let devices = scan_targets(&targets, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(devices.is_empty());
}
