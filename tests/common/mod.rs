// Shared mock adapter for the integration tests: explicit messaging on
// TCP 44818 of its own loopback address, cyclic T->O production toward
// the originator's UDP 2222. Each test binary drives its own adapters;
// they live until the binary exits.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use eip_scan::cip::{FORWARD_CLOSE, FORWARD_OPEN, GET_ATTRIBUTE_SINGLE};
use eip_scan::encap::{
    EncapHeader, CMD_REGISTER_SESSION, CMD_SEND_RR_DATA, CMD_UNREGISTER_SESSION, EXPLICIT_PORT,
    HEADER_LEN, IMPLICIT_PORT,
};

pub const SESSION_HANDLE: u32 = 0x0100_0001;

/// One mock adapter. `spawn` binds its explicit port and serves TCP
/// connections sequentially until the test binary exits.
pub struct MockAdapter {
    pub addr: Ipv4Addr,
    /// Consumed-assembly content returned on Get Attribute Single, used
    /// by the engine as the output seed.
    pub seed: Vec<u8>,
    /// T->O data produced cyclically after a successful Forward Open.
    pub produced: Vec<u8>,
    /// Reject the first Forward Open with extended status 0x0315 to
    /// exercise the size-negotiation retry.
    pub reject_first_open: bool,
    /// Delay before answering Forward Close.
    pub forward_close_delay: Duration,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::LOCALHOST,
            seed: vec![1, 2, 3, 4],
            produced: vec![0xAA, 0xBB, 0xCC, 0xDD],
            reject_first_open: false,
            forward_close_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct AdapterStats {
    pub forward_opens: AtomicUsize,
    pub forward_closes: AtomicUsize,
}

impl MockAdapter {
    pub async fn spawn(self) -> Arc<AdapterStats> {
        let listener = TcpListener::bind((self.addr, EXPLICIT_PORT)).await.unwrap();
        let stats = Arc::new(AdapterStats::default());
        tokio::spawn(run(listener, self, stats.clone()));
        stats
    }
}

pub fn cip_reply(service: u8, status: u8, extended: &[u16], data: &[u8]) -> Vec<u8> {
    let mut out = vec![service | 0x80, 0x00, status, extended.len() as u8];
    for word in extended {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

fn rr_response(cip: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + cip.len());
    payload.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    payload.extend_from_slice(&0u16.to_le_bytes()); // timeout
    payload.extend_from_slice(&2u16.to_le_bytes()); // item count
    payload.extend_from_slice(&0x0000u16.to_le_bytes()); // null address
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&0x00B2u16.to_le_bytes()); // unconnected data
    payload.extend_from_slice(&(cip.len() as u16).to_le_bytes());
    payload.extend_from_slice(cip);

    let mut out = EncapHeader::new(CMD_SEND_RR_DATA, SESSION_HANDLE, payload.len() as u16)
        .encode()
        .to_vec();
    out.extend_from_slice(&payload);
    out
}

/// Cyclic T->O producer: sequenced-address item with the echoed
/// connection id, connected-data item with a CIP sequence and the
/// configured data bytes, every 20 ms until the test binary exits.
/// The socket is bound on the adapter's address so the frames carry it
/// as their source.
async fn produce_frames(adapter_addr: Ipv4Addr, originator: Ipv4Addr, t_to_o_id: u32, data: Vec<u8>) {
    let socket = match UdpSocket::bind((adapter_addr, 0)).await {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut sequence: u32 = 0;
    let mut cip_sequence: u16 = 0;
    loop {
        sequence = sequence.wrapping_add(1);
        cip_sequence = cip_sequence.wrapping_add(1);
        let mut frame = Vec::new();
        frame.extend_from_slice(&2u16.to_le_bytes());
        frame.extend_from_slice(&0x8002u16.to_le_bytes());
        frame.extend_from_slice(&8u16.to_le_bytes());
        frame.extend_from_slice(&t_to_o_id.to_le_bytes());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(&0x00B1u16.to_le_bytes());
        frame.extend_from_slice(&((2 + data.len()) as u16).to_le_bytes());
        frame.extend_from_slice(&cip_sequence.to_le_bytes());
        frame.extend_from_slice(&data);
        let _ = socket.send_to(&frame, (originator, IMPLICIT_PORT)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn handle_send_rr_data(
    stream: &mut TcpStream,
    originator: Ipv4Addr,
    payload: &[u8],
    adapter: &MockAdapter,
    stats: &AdapterStats,
) {
    // interface handle (4) + timeout (2) + item count (2) + null address
    // item (4) + data item header (4)
    let cip = &payload[16..];
    let service = cip[0];
    let path_words = cip[1] as usize;
    let body = &cip[2 + path_words * 2..];

    let reply = match service {
        FORWARD_OPEN => {
            let attempt = stats.forward_opens.fetch_add(1, Ordering::SeqCst);
            if adapter.reject_first_open && attempt == 0 {
                // Reject the first size interpretation.
                cip_reply(FORWARD_OPEN, 0x01, &[0x0315], &[])
            } else {
                // Echo ids and serials: body is [tick][ticks][o_t id][t_o id]
                // [conn serial][vendor][orig serial]...
                let mut data = body[2..18].to_vec();
                data.extend_from_slice(&50_000u32.to_le_bytes()); // O->T API
                data.extend_from_slice(&50_000u32.to_le_bytes()); // T->O API
                data.extend_from_slice(&[0x00, 0x00]); // reply size + reserved
                let t_to_o_id = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);
                tokio::spawn(produce_frames(
                    adapter.addr,
                    originator,
                    t_to_o_id,
                    adapter.produced.clone(),
                ));
                cip_reply(FORWARD_OPEN, 0x00, &[], &data)
            }
        }
        GET_ATTRIBUTE_SINGLE => {
            // OCTET_STRING-tagged assembly data, used as the output seed.
            let mut data = vec![0xDA, 0x00, adapter.seed.len() as u8, 0x00];
            data.extend_from_slice(&adapter.seed);
            cip_reply(GET_ATTRIBUTE_SINGLE, 0x00, &[], &data)
        }
        FORWARD_CLOSE => {
            tokio::time::sleep(adapter.forward_close_delay).await;
            stats.forward_closes.fetch_add(1, Ordering::SeqCst);
            let mut data = body[2..10].to_vec(); // serial + vendor + orig serial
            data.extend_from_slice(&[0x00, 0x00]);
            cip_reply(FORWARD_CLOSE, 0x00, &[], &data)
        }
        other => cip_reply(other, 0x08, &[], &[]), // service not supported
    };
    stream.write_all(&rr_response(&reply)).await.unwrap();
}

/// Explicit-messaging side of the mock adapter, one TCP connection at a
/// time.
async fn run(listener: TcpListener, adapter: MockAdapter, stats: Arc<AdapterStats>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let originator = match peer.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => continue,
        };
        serve(&mut stream, originator, &adapter, &stats).await;
    }
}

async fn serve(
    stream: &mut TcpStream,
    originator: Ipv4Addr,
    adapter: &MockAdapter,
    stats: &AdapterStats,
) {
    loop {
        let mut head = [0u8; HEADER_LEN];
        if stream.read_exact(&mut head).await.is_err() {
            return;
        }
        let header = EncapHeader::decode(&head).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        if !payload.is_empty() {
            stream.read_exact(&mut payload).await.unwrap();
        }
        match header.command {
            CMD_REGISTER_SESSION => {
                let mut reply = EncapHeader::new(CMD_REGISTER_SESSION, SESSION_HANDLE, 4)
                    .encode()
                    .to_vec();
                reply.extend_from_slice(&payload); // echo version + flags
                stream.write_all(&reply).await.unwrap();
            }
            CMD_SEND_RR_DATA => {
                handle_send_rr_data(stream, originator, &payload, adapter, stats).await
            }
            CMD_UNREGISTER_SESSION => return,
            other => panic!("mock adapter got unexpected command 0x{other:04X}"),
        }
    }
}
