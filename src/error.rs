// error.rs - Error types for the EtherNet/IP scanner
//
// Every fallible operation in this crate returns `Result<T>`; errors carry a
// bounded, display-ready message and are never escalated past the call that
// produced them. CIP-level failures (non-zero general status) keep the raw
// status byte alongside the mapped reason text.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EipError>;

/// Errors produced by the EtherNet/IP scanner.
#[derive(Debug, Error)]
pub enum EipError {
    /// Transport-level failure (connect, send, receive).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A receive deadline elapsed mid-frame; the partial count is kept so
    /// callers can diagnose a short response.
    #[error("receive timed out with {got} of {want} bytes")]
    RecvTimeout { got: usize, want: usize },

    /// The peer closed the stream before the full frame arrived.
    #[error("peer closed with {got} of {want} bytes received")]
    PeerClosed { got: usize, want: usize },

    /// Malformed or unexpected frame (bad command, short response,
    /// missing CPF item, truncated field).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target answered with a non-zero CIP general status.
    #[error("CIP error 0x{status:02X}: {message}")]
    Cip { status: u8, message: String },

    /// Requested packet interval outside the accepted [10, 10000] ms range.
    #[error("requested packet interval {0} ms outside 10..=10000 ms")]
    InvalidRpi(u32),

    /// The implicit connection table is full.
    #[error("no free connection slot (capacity {0})")]
    NoFreeSlot(usize),

    /// An open implicit connection already exists for this target.
    #[error("implicit connection to {0} already open")]
    AlreadyOpen(Ipv4Addr),

    /// No implicit connection exists for this target.
    #[error("no implicit connection to {0}")]
    NotConnected(Ipv4Addr),

    /// Caller-supplied data does not fit the negotiated assembly size.
    #[error("payload of {actual} bytes exceeds assembly size of {limit} bytes")]
    PayloadTooLarge { actual: usize, limit: usize },
}

impl EipError {
    /// Builds a CIP-status error with the standard reason text, appending
    /// the extended status words when the reply carried any.
    pub fn cip_status(status: u8, extended: &[u16]) -> Self {
        let mut message = cip_status_message(status);
        if !extended.is_empty() {
            let words: Vec<String> = extended.iter().map(|w| format!("0x{w:04X}")).collect();
            message.push_str(&format!(" (extended status {})", words.join(", ")));
        }
        EipError::Cip { status, message }
    }
}

/// Maps a CIP general status code to a human-readable reason.
pub fn cip_status_message(status: u8) -> String {
    match status {
        0x00 => "Success".to_string(),
        0x01 => "Connection failure".to_string(),
        0x02 => "Resource unavailable".to_string(),
        0x03 => "Invalid parameter value".to_string(),
        0x04 => "Path segment error".to_string(),
        0x05 => "Object does not exist (path destination unknown)".to_string(),
        0x06 => "Partial transfer".to_string(),
        0x07 => "Connection lost".to_string(),
        0x08 => "Service not supported".to_string(),
        0x09 => "Invalid attribute value".to_string(),
        0x0A => "Attribute list error".to_string(),
        0x0B => "Already in requested mode/state".to_string(),
        0x0C => "Object state conflict".to_string(),
        0x0D => "Object already exists".to_string(),
        0x0E => "Attribute not settable".to_string(),
        0x0F => "Privilege violation".to_string(),
        0x10 => "Device state conflict".to_string(),
        0x11 => "Reply data too large".to_string(),
        0x12 => "Fragmentation of a primitive value".to_string(),
        0x13 => "Not enough data".to_string(),
        0x14 => "Attribute not supported".to_string(),
        0x15 => "Too much data".to_string(),
        0x16 => "Object does not exist".to_string(),
        0x17 => "Service fragmentation sequence not in progress".to_string(),
        0x18 => "No stored attribute data".to_string(),
        0x19 => "Store operation failure".to_string(),
        0x1A => "Routing failure, request packet too large".to_string(),
        0x1B => "Routing failure, response packet too large".to_string(),
        0x1C => "Missing attribute list entry data".to_string(),
        0x1D => "Invalid attribute value list".to_string(),
        0x1E => "Embedded service error".to_string(),
        0x1F => "Vendor specific error".to_string(),
        0x20 => "Invalid parameter".to_string(),
        0x21 => "Write-once value or medium already written".to_string(),
        0x22 => "Invalid reply received".to_string(),
        0x23 => "Buffer overflow".to_string(),
        0x24 => "Invalid message format".to_string(),
        0x25 => "Key failure in path".to_string(),
        0x26 => "Path size invalid".to_string(),
        0x27 => "Unexpected attribute in list".to_string(),
        0x28 => "Invalid member ID".to_string(),
        0x29 => "Member not settable".to_string(),
        0x2A => "Group 2 only server general failure".to_string(),
        0x2C => "Attribute not gettable".to_string(),
        _ => format!("Unknown CIP error code: 0x{status:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_0x05_names_missing_object() {
        // Adapters commonly return 0x05 for a Get-Attribute-Single against a
        // class/instance they do not implement.
        let err = EipError::cip_status(0x05, &[]);
        assert!(err.to_string().contains("Object does not exist"));
    }

    #[test]
    fn status_0x16_names_missing_object() {
        assert!(cip_status_message(0x16).contains("Object does not exist"));
    }

    #[test]
    fn extended_status_words_are_appended() {
        let err = EipError::cip_status(0x01, &[0x0315]);
        let text = err.to_string();
        assert!(text.contains("0x01"));
        assert!(text.contains("0x0315"));
    }

    #[test]
    fn unknown_status_carries_the_raw_code() {
        assert!(cip_status_message(0xEE).contains("0xEE"));
    }
}
