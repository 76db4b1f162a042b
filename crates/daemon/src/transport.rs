//! Length-prefixed bincode framing over a blocking byte stream.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! Not synchronised; the socket client keeps one transport behind a mutex.

use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::IoOp;
use crate::{LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE, TransportError, TransportResult};

/// One end of a framed daemon conversation.
///
/// # Example
/// ```rust
/// use std::os::unix::net::UnixStream;
/// use bpfsync_daemon::{DaemonResponse, FrameTransport};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (a, b) = UnixStream::pair()?;
/// let mut daemon = FrameTransport::new(a.try_clone()?, a);
/// let mut client = FrameTransport::new(b.try_clone()?, b);
///
/// daemon.send(&DaemonResponse::Unloaded)?;
/// assert_eq!(client.recv::<DaemonResponse>()?, DaemonResponse::Unloaded);
/// # Ok(())
/// # }
/// ```
pub struct FrameTransport<R, W: Write> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
}

impl<R: Read, W: Write> FrameTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    /// Encode `msg` as one frame and flush it.
    ///
    /// # Errors
    /// `Encode`, `Oversized` for payloads above [`MAX_PAYLOAD_SIZE`], or `Io`.
    pub fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> TransportResult<()> {
        let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(TransportError::encode)?;

        let length = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= MAX_PAYLOAD_SIZE)
            .ok_or_else(|| TransportError::oversized(payload.len(), MAX_PAYLOAD_SIZE))?;

        let write = |e: std::io::Error| TransportError::io(IoOp::Write, &e);
        self.writer.write_all(&length.to_be_bytes()).map_err(write)?;
        self.writer.write_all(&payload).map_err(write)?;
        self.writer.flush().map_err(write)
    }

    /// Read exactly one frame and decode it.
    ///
    /// # Errors
    /// `Truncated` if the stream ends inside a frame (`read == 0` when it ends
    /// before one starts), `BadLength`, `Decode`, or `Io`.
    pub fn recv<T: DeserializeOwned>(&mut self) -> TransportResult<T> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.fill(&mut prefix, 0, LENGTH_PREFIX_SIZE)?;

        let length = u32::from_be_bytes(prefix);
        let size = usize::try_from(length)
            .map_err(|_| TransportError::bad_length(length, "does not fit in memory"))?;
        if size == 0 {
            return Err(TransportError::bad_length(length, "empty payload"));
        }
        if size > MAX_PAYLOAD_SIZE {
            return Err(TransportError::bad_length(
                length,
                format!("above the {MAX_PAYLOAD_SIZE} byte cap"),
            ));
        }

        let mut payload = vec![0u8; size];
        self.fill(
            &mut payload,
            LENGTH_PREFIX_SIZE,
            LENGTH_PREFIX_SIZE.saturating_add(size),
        )?;

        bincode::serde::decode_from_slice(&payload, bincode::config::standard())
            .map(|(message, _)| message)
            .map_err(|e| TransportError::decode(e, size))
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered_bytes(&self) -> usize {
        self.reader.buffer().len()
    }

    /// `read_exact` into `buf`; `already` frame bytes precede it.
    fn fill(&mut self, buf: &mut [u8], already: usize, expected: usize) -> TransportResult<()> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => TransportError::truncated(already, expected),
            _ => TransportError::io(IoOp::Read, &e),
        })
    }
}
