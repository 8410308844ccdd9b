//! Protocol error taxonomy.
//!
//! Each failure mode is a distinct variant so callers can match on kind:
//! frame-level violations (length, checksum) are detected at parse time,
//! transport failures at the byte level, and link-level silence (a device
//! that returned no data at all) is kept separate from a malformed but
//! present response.

use std::time::Duration;

use thiserror::Error;

use crate::{MAX_PAYLOAD, MIN_MESSAGE_STREAM, MIN_PACKAGE_STREAM};

/// Frame-level violations detected while constructing or parsing
/// messages and packages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Received stream too short to contain a message header.
    #[error("message stream too short: {len} bytes (minimum {MIN_MESSAGE_STREAM})")]
    ShortMessage { len: usize },

    /// Received stream too short to contain a minimal package frame.
    #[error("package stream too short: {len} bytes (minimum {MIN_PACKAGE_STREAM})")]
    ShortPackage { len: usize },

    /// Declared payload length disagrees with the bytes actually present.
    #[error("declared payload length {declared} inconsistent with stream of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload does not fit the 16-bit length field.
    #[error("payload too long: {len} bytes (maximum {MAX_PAYLOAD})")]
    PayloadTooLong { len: usize },

    /// Frame parsed structurally but fails the checksum law. Corrupted
    /// data; the caller should log and retry the exchange, never
    /// re-interpret the frame.
    #[error("checksum mismatch: received {received:#04x}, expected {expected:#04x}")]
    ChecksumMismatch { received: u8, expected: u8 },
}

/// Byte-level transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A frame started to arrive but did not complete within the timeout.
    #[error("transport timed out after {0:?} mid-frame")]
    Timeout(Duration),

    /// Underlying I/O failure.
    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is no longer usable (peer gone, device closed).
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced by [`Channel`](crate::channel::Channel) exchanges.
#[derive(Debug, Error)]
pub enum BsmpError {
    /// The device returned no data at all within the timeout — a
    /// hardware/link-level problem, distinct from a malformed response.
    #[error("no response from device {address}")]
    SerialCommunication { address: u8 },

    /// The response was present but violated the frame format.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The transport itself failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
