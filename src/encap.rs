// encap.rs - EtherNet/IP encapsulation layer wire primitives
//
// The encapsulation header is 24 bytes, little-endian end-to-end:
//
//   [command u16][length u16][session handle u32][status u32]
//   [sender context 8 bytes][options u32]
//
// `length` counts the bytes that follow the header.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::bytes::Reader;
use crate::error::{EipError, Result};

/// TCP port for explicit (encapsulated) messaging.
pub const EXPLICIT_PORT: u16 = 44818;
/// UDP port for Class-1 implicit I/O.
pub const IMPLICIT_PORT: u16 = 2222;

/// Encapsulation header size on the wire.
pub const HEADER_LEN: usize = 24;

// Encapsulation commands.
pub const CMD_LIST_IDENTITY: u16 = 0x0063;
pub const CMD_REGISTER_SESSION: u16 = 0x0065;
pub const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub const CMD_SEND_RR_DATA: u16 = 0x006F;

/// Decoded encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn new(command: u16, session_handle: u32, length: u16) -> Self {
        Self {
            command,
            length,
            session_handle,
            status: 0,
            sender_context: [0; 8],
            options: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.command.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.session_handle.to_le_bytes());
        buf[8..12].copy_from_slice(&self.status.to_le_bytes());
        buf[12..20].copy_from_slice(&self.sender_context);
        buf[20..24].copy_from_slice(&self.options.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let command = r.u16_le()?;
        let length = r.u16_le()?;
        let session_handle = r.u32_le()?;
        let status = r.u32_le()?;
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(r.take(8)?);
        let options = r.u32_le()?;
        Ok(Self {
            command,
            length,
            session_handle,
            status,
            sender_context,
            options,
        })
    }
}

/// Writes the whole buffer to the stream; a short write is an error.
pub async fn send_exact(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await.map_err(EipError::Io)
}

/// Reads exactly `len` bytes, looping across partial reads until the
/// deadline. Timeout and peer-close errors report how many bytes did
/// arrive so callers can diagnose a short response.
pub async fn recv_exact(stream: &mut TcpStream, len: usize, wait: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut got = 0usize;
    let deadline = Instant::now() + wait;
    while got < len {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(EipError::RecvTimeout { got, want: len });
        }
        match timeout(left, stream.read(&mut buf[got..])).await {
            Ok(Ok(0)) => return Err(EipError::PeerClosed { got, want: len }),
            Ok(Ok(n)) => got += n,
            Ok(Err(e)) => return Err(EipError::Io(e)),
            Err(_) => return Err(EipError::RecvTimeout { got, want: len }),
        }
    }
    Ok(buf)
}

/// Receives one encapsulated response: header plus `length` payload bytes.
///
/// Some adapters prepend stray filler bytes before the header; the expected
/// command is scanned for within the first 8 bytes and the header realigned
/// when found. A command mismatch after realignment, or a non-zero
/// encapsulation status, fails the in-flight request.
pub async fn recv_encap(
    stream: &mut TcpStream,
    expected_command: u16,
    wait: Duration,
) -> Result<(EncapHeader, Vec<u8>)> {
    let mut raw = recv_exact(stream, HEADER_LEN, wait).await?;

    if u16::from_le_bytes([raw[0], raw[1]]) != expected_command {
        let mut realigned = false;
        for off in 1..=8usize {
            if u16::from_le_bytes([raw[off], raw[off + 1]]) == expected_command {
                trace!(offset = off, "skipping filler bytes before encapsulation header");
                let tail = recv_exact(stream, off, wait).await?;
                raw.drain(..off);
                raw.extend_from_slice(&tail);
                realigned = true;
                break;
            }
        }
        if !realigned {
            return Err(EipError::Protocol(format!(
                "unexpected encapsulation command 0x{:04X} (expected 0x{:04X})",
                u16::from_le_bytes([raw[0], raw[1]]),
                expected_command
            )));
        }
    }

    let header = EncapHeader::decode(&raw)?;
    if header.status != 0 {
        return Err(EipError::Protocol(format!(
            "encapsulation command 0x{:04X} failed with status 0x{:08X}",
            header.command, header.status
        )));
    }

    let payload = if header.length > 0 {
        recv_exact(stream, header.length as usize, wait).await?
    } else {
        Vec::new()
    };
    Ok((header, payload))
}
