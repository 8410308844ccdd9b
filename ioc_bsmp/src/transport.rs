//! Byte-level transport abstraction.
//!
//! A transport moves whole frames; the channel layer never touches the
//! byte stream directly. The one implementation shipped here adapts any
//! `io::Read + io::Write` byte stream (a tty device file, a socket, an
//! in-memory pipe) by reading the frame header first and then the
//! declared remainder. Simulated devices implement [`SerialTransport`]
//! directly.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::MESSAGE_HEADER;
use crate::error::TransportError;

/// Frame-oriented transport used by [`Channel`](crate::channel::Channel).
///
/// `read` returns an empty vector when no data at all arrived within the
/// timeout — link-level silence, which the channel reports as a serial
/// communication failure. A frame that *starts* but never completes is a
/// [`TransportError::Timeout`].
pub trait SerialTransport: Send {
    /// Transmit one full frame.
    fn write(&mut self, frame: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Receive one full frame, or an empty vector on silence.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// A transport shared by every channel on one physical bus. The mutex is
/// the bus lock: request/response exchanges on a shared serial line must
/// not interleave.
pub type SharedTransport = Arc<Mutex<dyn SerialTransport>>;

/// Wrap a transport for sharing across channels.
pub fn shared<T: SerialTransport + 'static>(transport: T) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Adapter from a raw byte stream to frame-oriented reads.
///
/// The underlying stream should be configured with its own read timeout
/// (`VMIN`/`VTIME` on a tty, `set_read_timeout` on a socket) shorter than
/// the timeouts passed in here; this adapter only bounds the overall
/// polling loop.
pub struct IoTransport<S: Read + Write + Send> {
    stream: S,
}

impl<S: Read + Write + Send> IoTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Fill `buf` completely, polling until `deadline`.
    fn read_exact_until(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    // EOF or an expired tty read with no bytes.
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(filled)
    }
}

impl<S: Read + Write + Send> SerialTransport for IoTransport<S> {
    fn write(&mut self, frame: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        trace!(len = frame.len(), "frame transmitted");
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;

        // Header first: address byte plus the message header carrying the
        // payload length.
        let mut header = [0u8; 1 + MESSAGE_HEADER];
        let got = self.read_exact_until(&mut header, deadline)?;
        if got == 0 {
            return Ok(Vec::new());
        }
        if got < header.len() {
            return Err(TransportError::Timeout(timeout));
        }

        let payload_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut frame = Vec::with_capacity(header.len() + payload_len + 1);
        frame.extend_from_slice(&header);

        let mut rest = vec![0u8; payload_len + 1];
        let got = self.read_exact_until(&mut rest, deadline)?;
        if got < rest.len() {
            return Err(TransportError::Timeout(timeout));
        }
        frame.extend_from_slice(&rest);
        trace!(len = frame.len(), "frame received");
        Ok(frame)
    }
}
