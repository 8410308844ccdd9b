//! Request/response exchanges with one addressed device.
//!
//! A channel is stateless between requests: all state lives in the
//! transport. Correctness on a multi-drop bus comes from the concurrency
//! discipline: the shared transport mutex is held across the whole
//! write-then-read exchange so response bytes from one request can never
//! be misread as belonging to another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::BsmpError;
use crate::message::Message;
use crate::package::Package;
use crate::transport::SharedTransport;

/// One logical communication endpoint to one addressed device over one
/// physical transport.
pub struct Channel {
    address: u8,
    transport: SharedTransport,
    /// Total bytes moved through this channel, for diagnostics.
    bytes_transferred: AtomicU64,
}

impl Channel {
    /// Create a channel for the device at `address`. Channels addressing
    /// devices on the same bus must be handed clones of the same
    /// [`SharedTransport`].
    pub fn new(address: u8, transport: SharedTransport) -> Self {
        Self {
            address,
            transport,
            bytes_transferred: AtomicU64::new(0),
        }
    }

    /// Device address on the bus.
    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Diagnostic counter of bytes written plus bytes read.
    #[inline]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Frame `message` for this device and transmit it. Does not wait
    /// for a reply.
    pub fn write(&self, message: Message, timeout: Duration) -> Result<(), BsmpError> {
        let frame = Package::new(self.address, message).stream();
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.write(&frame, timeout)?;
        self.bytes_transferred
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Block on the transport for one response frame, validate it and
    /// strip address and checksum.
    pub fn read(&self, timeout: Duration) -> Result<Message, BsmpError> {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        let frame = transport.read(timeout)?;
        drop(transport);
        self.accept(frame)
    }

    /// Perform write-then-read as one atomic exchange.
    ///
    /// The transport lock is held across both halves. An empty read is
    /// reported as [`BsmpError::SerialCommunication`] (the device said
    /// nothing at all), which callers treat differently from a malformed
    /// response.
    pub fn request(&self, message: Message, timeout: Duration) -> Result<Message, BsmpError> {
        let command = message.command();
        let frame = Package::new(self.address, message).stream();

        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.write(&frame, timeout)?;
        self.bytes_transferred
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        let reply = transport.read(timeout)?;
        drop(transport);

        debug!(
            address = self.address,
            command,
            reply_len = reply.len(),
            "exchange complete"
        );
        self.accept(reply)
    }

    /// Validate a received frame and extract its message.
    fn accept(&self, frame: Vec<u8>) -> Result<Message, BsmpError> {
        if frame.is_empty() {
            return Err(BsmpError::SerialCommunication {
                address: self.address,
            });
        }
        self.bytes_transferred
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        let package = Package::checked_parse(&frame)?;
        if package.address() != self.address {
            warn!(
                expected = self.address,
                received = package.address(),
                "reply carries foreign address"
            );
        }
        Ok(package.into_message())
    }
}
