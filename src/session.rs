// session.rs - EtherNet/IP session over a TCP stream
//
// A session is negotiated with Register Session and identified by the
// handle the target assigns. Explicit operations are typically
// open-use-close per call; an implicit connection holds its session for
// its entire lifetime.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::cip;
use crate::encap::{
    self, recv_encap, send_exact, EncapHeader, CMD_REGISTER_SESSION, CMD_SEND_RR_DATA,
    CMD_UNREGISTER_SESSION,
};
use crate::error::{EipError, Result};

/// CIP timeout field carried in SendRRData, in seconds.
const CIP_TIMEOUT_S: u16 = 5;

/// A registered EtherNet/IP session bound to one TCP connection.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    handle: u32,
    io_timeout: Duration,
}

impl Session {
    /// Connects to the target's explicit-messaging port and registers a
    /// session.
    pub async fn connect(
        target: Ipv4Addr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(target, encap::EXPLICIT_PORT));
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(EipError::Io(e)),
            Err(_) => return Err(EipError::Timeout(connect_timeout)),
        };
        let mut session = Self {
            stream,
            handle: 0,
            io_timeout,
        };
        session.register().await?;
        Ok(session)
    }

    /// Session handle assigned by the target at registration.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Register Session: protocol version 1, no option flags. The command
    /// must echo back with status 0; the returned handle identifies the
    /// session from then on.
    async fn register(&mut self) -> Result<()> {
        let mut packet = Vec::with_capacity(encap::HEADER_LEN + 4);
        packet.extend_from_slice(&EncapHeader::new(CMD_REGISTER_SESSION, 0, 4).encode());
        packet.extend_from_slice(&1u16.to_le_bytes()); // protocol version
        packet.extend_from_slice(&0u16.to_le_bytes()); // option flags

        send_exact(&mut self.stream, &packet).await?;
        let (header, _payload) =
            recv_encap(&mut self.stream, CMD_REGISTER_SESSION, self.io_timeout).await?;
        self.handle = header.session_handle;
        debug!(handle = format_args!("0x{:08X}", self.handle), "session registered");
        Ok(())
    }

    /// Sends a CIP explicit request inside SendRRData and returns the CIP
    /// reply extracted from the response's CPF data item.
    pub async fn send_rr_data(&mut self, cip_request: &[u8]) -> Result<cip::CipReply> {
        let rr_payload = cip::build_rr_payload(cip_request, CIP_TIMEOUT_S);
        let mut packet = Vec::with_capacity(encap::HEADER_LEN + rr_payload.len());
        packet.extend_from_slice(
            &EncapHeader::new(CMD_SEND_RR_DATA, self.handle, rr_payload.len() as u16).encode(),
        );
        packet.extend_from_slice(&rr_payload);

        trace!(
            bytes = packet.len(),
            preview = format_args!("{:02X?}", &packet[..packet.len().min(48)]),
            "sending SendRRData"
        );
        send_exact(&mut self.stream, &packet).await?;

        let (_header, payload) =
            recv_encap(&mut self.stream, CMD_SEND_RR_DATA, self.io_timeout).await?;
        let data = cip::extract_data_item(&payload)?;
        cip::decode_reply(&data)
    }

    /// Unregister Session, fire-and-forget: the command is sent and no
    /// reply is awaited; a non-responding or already-closed peer is not
    /// an error.
    pub async fn unregister(mut self) {
        let packet = EncapHeader::new(CMD_UNREGISTER_SESSION, self.handle, 0).encode();
        if let Err(e) = send_exact(&mut self.stream, &packet).await {
            trace!(error = %e, "unregister session send failed (ignored)");
        }
    }
}
