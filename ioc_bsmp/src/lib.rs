//! BSMP master-side protocol engine.
//!
//! Implements the point-to-point serial protocol spoken between the
//! controlling computer and power-supply digital controllers on a shared
//! RS-485 bus. The crate covers framing, checksum validation and the
//! request/response exchange discipline; it deliberately does **not**
//! implement retries — retry policy belongs to the device controller one
//! layer up.
//!
//! # Wire format
//!
//! ```text
//! byte 0     : address        (0-255)
//! byte 1     : command        (0-255)
//! bytes 2-3  : payload length (big-endian u16)
//! bytes 4..N : payload
//! byte N+1   : checksum
//! ```
//!
//! Checksum law: the sum of every byte in the frame, checksum included,
//! is congruent to 0 modulo 256.
//!
//! # Module Structure
//!
//! - [`message`] - Application-level message (command + payload)
//! - [`package`] - Addressed, checksummed frame around a message
//! - [`channel`] - Request/response exchanges with one addressed device
//! - [`transport`] - Byte-level transport abstraction
//! - [`command`] - Command opcodes and request builders
//! - [`error`] - Protocol error taxonomy

pub mod channel;
pub mod command;
pub mod error;
pub mod message;
pub mod package;
pub mod transport;

pub use channel::Channel;
pub use error::{BsmpError, FrameError, TransportError};
pub use message::Message;
pub use package::Package;
pub use transport::{IoTransport, SerialTransport, SharedTransport};

use static_assertions::const_assert;

/// Maximum payload size representable by the 16-bit length field.
pub const MAX_PAYLOAD: usize = 65_535;

/// Message header size: command byte plus the 16-bit length field.
pub const MESSAGE_HEADER: usize = 3;

/// Minimum byte count for a received message stream. A message is always
/// parsed out of a package body, so at least one byte beyond the header
/// (payload or trailing checksum) must be addressable.
pub const MIN_MESSAGE_STREAM: usize = 4;

/// Minimum byte count for a full package frame: address, message header
/// and checksum.
pub const MIN_PACKAGE_STREAM: usize = 5;

const_assert!(MAX_PAYLOAD == u16::MAX as usize);
const_assert!(MIN_PACKAGE_STREAM == 1 + MESSAGE_HEADER + 1);
