use std::{
    io::{self, ErrorKind, Read, Write},
    thread,
    time::Duration,
};

use log::{trace, warn};
use thiserror::Error;

use super::message::{FrameBuffer, HEADER_SIZE, Header, MAGIC, Message, MessageError, MessageKind};

/// Zero-byte reads or writes tolerated in a row before a transfer is abandoned.
pub const MESSAGE_RETRY: u32 = 100;
pub const STALL_BACKOFF: Duration = Duration::from_micros(100);
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer stalled after {transferred} of {expected} bytes")]
    Stalled { transferred: usize, expected: usize },
    #[error("socket is closed")]
    Closed,
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),
}

/// How long a single transfer may stall before it is reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub stall_retries: u32,
    pub stall_backoff: Duration,
}

impl RetryPolicy {
    /// Longest a single blocking read or write may wait before it counts as a stall.
    pub fn io_timeout(&self) -> Duration {
        (self.stall_backoff * self.stall_retries.max(1)).max(MIN_IO_TIMEOUT)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            stall_retries: MESSAGE_RETRY,
            stall_backoff: STALL_BACKOFF,
        }
    }
}

/// A byte stream paired with the scratch buffer its frames are built in.
#[derive(Debug)]
pub struct ProtocolTransport<T> {
    stream: T,
    scratch: FrameBuffer,
    policy: RetryPolicy,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T, policy: RetryPolicy) -> Self {
        Self {
            stream,
            scratch: FrameBuffer::default(),
            policy,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let frame = message.encode(&mut self.scratch)?;
        trace!("sending {:?} ({} bytes)", message.kind(), frame.len());
        send_all(&mut self.stream, frame, &self.policy)
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        send_all(&mut self.stream, buf, &self.policy)
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Reads one frame. Magic and kind are checked before the declared size is used to
    /// size the rest of the read.
    pub fn read_message(&mut self) -> Result<Message, TransportError> {
        receive_exact(
            &mut self.stream,
            self.scratch.frame_mut(HEADER_SIZE),
            &self.policy,
        )?;

        let header = Header::peek(self.scratch.frame(HEADER_SIZE))?;
        if header.magic != MAGIC {
            return Err(MessageError::BadMagic(header.magic).into());
        }
        let kind = MessageKind::try_from(header.kind)?;
        let size = header.size();
        let fixed = kind.fixed_size();
        if size < fixed || (!kind.carries_payload() && size != fixed) {
            return Err(MessageError::LayoutMismatch {
                kind,
                expected: fixed,
                declared: size,
            }
            .into());
        }

        let frame = self.scratch.frame_mut(size);
        receive_exact(&mut self.stream, &mut frame[HEADER_SIZE..], &self.policy)?;

        let message = Message::decode(self.scratch.frame(size)).inspect_err(|e| {
            warn!("dropping invalid frame: {e}");
        })?;
        trace!("received {:?} ({size} bytes)", message.kind());
        Ok(message)
    }

    pub fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        receive_exact(&mut self.stream, buf, &self.policy)
    }
}

/// Writes all of `buf`, retrying partial and zero-byte writes.
pub fn send_all<W: Write>(
    stream: &mut W,
    buf: &[u8],
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    let mut sent = 0;
    let mut stalls = 0;

    while sent < buf.len() {
        match stream.write(&buf[sent..]) {
            Ok(0) => stall(&mut stalls, sent, buf.len(), policy)?,
            Ok(n) => {
                sent += n;
                stalls = 0;
            }
            Err(e) if is_transient(&e) => stall(&mut stalls, sent, buf.len(), policy)?,
            Err(e) => return Err(e.into()),
        }
    }
    stream.flush()?;
    Ok(())
}

/// Fills `buf`, retrying partial and zero-byte reads.
///
/// A zero-byte read counts as a stall rather than end of stream; a peer that has gone
/// away is detected once the stall budget runs out.
pub fn receive_exact<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    let mut received = 0;
    let mut stalls = 0;

    while received < buf.len() {
        match stream.read(&mut buf[received..]) {
            Ok(0) => stall(&mut stalls, received, buf.len(), policy)?,
            Ok(n) => {
                received += n;
                stalls = 0;
            }
            Err(e) if is_transient(&e) => stall(&mut stalls, received, buf.len(), policy)?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

fn stall(
    stalls: &mut u32,
    transferred: usize,
    expected: usize,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    *stalls += 1;
    if *stalls > policy.stall_retries {
        return Err(TransportError::Stalled {
            transferred,
            expected,
        });
    }
    thread::sleep(policy.stall_backoff);
    Ok(())
}
