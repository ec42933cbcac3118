//! Wire framing for every message exchanged between client and server.
//!
//! Each frame starts with a fixed [`Header`] of magic, kind and total size, followed by
//! the kind-specific fixed fields and, for the data kinds, the tag bytes and payload bytes:
//!
//! ```text
//! +---------+--------+--------+---------------------+-----------+-------------+
//! | magic   | kind   | size   | fixed fields        | tag bytes | data bytes  |
//! | u64     | u32    | u32    | (kind dependent)    | tag_len   | data_len    |
//! +---------+--------+--------+---------------------+-----------+-------------+
//! ```
//!
//! Integers are little-endian and fixed-width. The data kinds (`LOAD_BINARY`,
//! `INPUT_DATA`, `OUTPUT_DATA`) carry `tag_len: u64` and `data_len: u64` as their fixed
//! fields so the receiver can slice the frame without a second round trip.
//!
//! Nothing in a frame is trusted until [`validate`] has confirmed the magic, the kind and
//! that the declared size is exactly what the kind's layout implies.
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};
use log::warn;
use thiserror::Error;

/// Sentinel opening every frame.
pub const MAGIC: u64 = 0x32ab4fd;

pub const HEADER_SIZE: usize = 16;
const COUNT_SIZE: usize = size_of::<i64>();
const LENGTH_SIZE: usize = size_of::<u64>();
const KIND_SIZE: usize = size_of::<u32>();

const DATA_FIELDS_SIZE: usize = 2 * LENGTH_SIZE;

/// Initial size of scratch frame buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("bad magic {0:#x}")]
    BadMagic(u64),

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("declared size {declared} but received {received} bytes")]
    SizeMismatch { declared: usize, received: usize },

    #[error("{kind:?} layout requires {expected} bytes, header declares {declared}")]
    LayoutMismatch {
        kind: MessageKind,
        expected: usize,
        declared: usize,
    },

    #[error("frame truncated")]
    Truncated,

    #[error("frame of {0} bytes exceeds the size field")]
    TooLarge(usize),

    #[error("tag is not valid utf-8")]
    InvalidTag,

    #[error("failed to encode frame field: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode frame field: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Closed set of message kinds. Discriminants are the on-wire values; `10` is reserved.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init = 0,
    NumDevices = 1,
    MaxDevices = 2,
    LoadBinary = 3,
    InputData = 4,
    OutputData = 5,
    Infer = 6,
    CloseConnection = 7,
    CloseServer = 8,
    Ping = 9,
    Ack = 11,
    Fail = 12,
}

impl MessageKind {
    /// Header plus the kind's fixed fields, excluding any tag or data bytes.
    pub fn fixed_size(self) -> usize {
        match self {
            MessageKind::Init
            | MessageKind::CloseConnection
            | MessageKind::CloseServer
            | MessageKind::Ping
            | MessageKind::Fail => HEADER_SIZE,
            MessageKind::NumDevices | MessageKind::MaxDevices => HEADER_SIZE + COUNT_SIZE,
            MessageKind::LoadBinary | MessageKind::InputData | MessageKind::OutputData => {
                HEADER_SIZE + DATA_FIELDS_SIZE
            }
            MessageKind::Infer => HEADER_SIZE + LENGTH_SIZE,
            MessageKind::Ack => HEADER_SIZE + KIND_SIZE,
        }
    }

    /// Whether frames of this kind carry a tag and data after their fixed fields.
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            MessageKind::LoadBinary | MessageKind::InputData | MessageKind::OutputData
        )
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = MessageError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let kind = match value {
            0 => MessageKind::Init,
            1 => MessageKind::NumDevices,
            2 => MessageKind::MaxDevices,
            3 => MessageKind::LoadBinary,
            4 => MessageKind::InputData,
            5 => MessageKind::OutputData,
            6 => MessageKind::Infer,
            7 => MessageKind::CloseConnection,
            8 => MessageKind::CloseServer,
            9 => MessageKind::Ping,
            11 => MessageKind::Ack,
            12 => MessageKind::Fail,
            other => return Err(MessageError::UnknownKind(other)),
        };
        Ok(kind)
    }
}

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub magic: u64,
    pub kind: u32,
    pub size: u32,
}

impl Header {
    /// Reads a header without trusting any of its fields.
    pub fn peek(buf: &[u8]) -> Result<Header, MessageError> {
        let (header, _) = get::<Header>(buf, 0)?;
        Ok(header)
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }
}

/// Tag and bytes carried by the data kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub tag: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(tag: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }

    pub fn untagged(data: Vec<u8>) -> Self {
        Self::new(String::new(), data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init,
    NumDevices(i64),
    MaxDevices(i64),
    LoadBinary(Payload),
    InputData(Payload),
    OutputData(Payload),
    Infer { output_size: u64 },
    CloseConnection,
    CloseServer,
    Ping,
    Ack(MessageKind),
    Fail,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Init => MessageKind::Init,
            Message::NumDevices(_) => MessageKind::NumDevices,
            Message::MaxDevices(_) => MessageKind::MaxDevices,
            Message::LoadBinary(_) => MessageKind::LoadBinary,
            Message::InputData(_) => MessageKind::InputData,
            Message::OutputData(_) => MessageKind::OutputData,
            Message::Infer { .. } => MessageKind::Infer,
            Message::CloseConnection => MessageKind::CloseConnection,
            Message::CloseServer => MessageKind::CloseServer,
            Message::Ping => MessageKind::Ping,
            Message::Ack(_) => MessageKind::Ack,
            Message::Fail => MessageKind::Fail,
        }
    }

    fn payload(&self) -> Option<&Payload> {
        match self {
            Message::LoadBinary(p) | Message::InputData(p) | Message::OutputData(p) => Some(p),
            _ => None,
        }
    }

    /// Total serialized length, header included.
    pub fn encoded_len(&self) -> usize {
        let variable = self.payload().map_or(0, |p| p.tag.len() + p.data.len());
        self.kind().fixed_size() + variable
    }

    /// Serializes into `out`, growing it if needed, and returns the encoded frame.
    pub fn encode<'a>(&self, out: &'a mut FrameBuffer) -> Result<&'a [u8], MessageError> {
        let len = self.encoded_len();
        let size = u32::try_from(len).map_err(|_| MessageError::TooLarge(len))?;
        let frame = out.frame_mut(len);

        let mut at = encode_header(frame, self.kind(), size)?;
        match self {
            Message::NumDevices(count) | Message::MaxDevices(count) => {
                at = put(frame, at, *count)?;
            }
            Message::Infer { output_size } => {
                at = put(frame, at, *output_size)?;
            }
            Message::Ack(kind) => {
                at = put(frame, at, *kind as u32)?;
            }
            Message::LoadBinary(payload)
            | Message::InputData(payload)
            | Message::OutputData(payload) => {
                at = put(frame, at, payload.tag.len() as u64)?;
                at = put(frame, at, payload.data.len() as u64)?;
                frame[at..at + payload.tag.len()].copy_from_slice(payload.tag.as_bytes());
                at += payload.tag.len();
                frame[at..at + payload.data.len()].copy_from_slice(&payload.data);
                at += payload.data.len();
            }
            Message::Init
            | Message::CloseConnection
            | Message::CloseServer
            | Message::Ping
            | Message::Fail => {}
        }
        debug_assert_eq!(at, len);

        Ok(out.frame(len))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut buf = FrameBuffer::with_capacity(self.encoded_len());
        Ok(self.encode(&mut buf)?.to_vec())
    }

    /// Decodes a complete frame. The frame is validated first.
    pub fn decode(buf: &[u8]) -> Result<Message, MessageError> {
        let header = check(buf, buf.len())?;
        let kind = MessageKind::try_from(header.kind)?;
        let at = HEADER_SIZE;

        let message = match kind {
            MessageKind::Init => Message::Init,
            MessageKind::CloseConnection => Message::CloseConnection,
            MessageKind::CloseServer => Message::CloseServer,
            MessageKind::Ping => Message::Ping,
            MessageKind::Fail => Message::Fail,
            MessageKind::NumDevices => Message::NumDevices(get::<i64>(buf, at)?.0),
            MessageKind::MaxDevices => Message::MaxDevices(get::<i64>(buf, at)?.0),
            MessageKind::Infer => Message::Infer {
                output_size: get::<u64>(buf, at)?.0,
            },
            MessageKind::Ack => {
                let (acked, _) = get::<u32>(buf, at)?;
                Message::Ack(MessageKind::try_from(acked)?)
            }
            MessageKind::LoadBinary | MessageKind::InputData | MessageKind::OutputData => {
                let (tag_len, at) = get::<u64>(buf, at)?;
                let (data_len, at) = get::<u64>(buf, at)?;
                let tag_end = at + tag_len as usize;
                let data_end = tag_end + data_len as usize;

                let tag = buf.get(at..tag_end).ok_or(MessageError::Truncated)?;
                let tag = String::from_utf8(tag.to_vec()).map_err(|_| MessageError::InvalidTag)?;
                let data = buf
                    .get(tag_end..data_end)
                    .ok_or(MessageError::Truncated)?
                    .to_vec();
                let payload = Payload { tag, data };

                match kind {
                    MessageKind::LoadBinary => Message::LoadBinary(payload),
                    MessageKind::InputData => Message::InputData(payload),
                    _ => Message::OutputData(payload),
                }
            }
        };

        Ok(message)
    }
}

/// Writes magic, kind and size into the front of `buf`. Returns the header length.
pub fn encode_header(buf: &mut [u8], kind: MessageKind, size: u32) -> Result<usize, MessageError> {
    let header = Header {
        magic: MAGIC,
        kind: kind as u32,
        size,
    };
    put(buf, 0, header)
}

/// Reports whether `buf` holds a well-formed frame of exactly `received` bytes.
pub fn validate(buf: &[u8], received: usize) -> bool {
    match check(buf, received) {
        Ok(_) => true,
        Err(e) => {
            warn!("invalid frame: {e}");
            false
        }
    }
}

/// Same checks as [`validate`], reporting which one failed.
pub fn check(buf: &[u8], received: usize) -> Result<Header, MessageError> {
    if received < HEADER_SIZE || buf.len() < received {
        return Err(MessageError::Truncated);
    }

    let header = Header::peek(buf)?;
    if header.magic != MAGIC {
        return Err(MessageError::BadMagic(header.magic));
    }
    let kind = MessageKind::try_from(header.kind)?;
    if header.size() != received {
        return Err(MessageError::SizeMismatch {
            declared: header.size(),
            received,
        });
    }

    let mut expected = kind.fixed_size();
    if kind.carries_payload() {
        if received < expected {
            return Err(MessageError::LayoutMismatch {
                kind,
                expected,
                declared: header.size(),
            });
        }
        let (tag_len, at) = get::<u64>(buf, HEADER_SIZE)?;
        let (data_len, _) = get::<u64>(buf, at)?;
        expected = (expected as u64)
            .checked_add(tag_len)
            .and_then(|n| n.checked_add(data_len))
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(usize::MAX);
    }

    if expected != header.size() {
        return Err(MessageError::LayoutMismatch {
            kind,
            expected,
            declared: header.size(),
        });
    }
    Ok(header)
}

/// Grow-only scratch space for whole frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns the first `size` bytes, growing the buffer first if it is smaller.
    pub fn frame_mut(&mut self, size: usize) -> &mut [u8] {
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
        assert!(self.buf.len() >= size);
        &mut self.buf[..size]
    }

    pub fn frame(&self, size: usize) -> &[u8] {
        &self.buf[..size]
    }
}

fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn put<E: Encode>(buf: &mut [u8], at: usize, value: E) -> Result<usize, MessageError> {
    let dst = buf.get_mut(at..).ok_or(MessageError::Truncated)?;
    let written = bincode::encode_into_slice(value, dst, wire_config())?;
    Ok(at + written)
}

fn get<D: Decode<()>>(buf: &[u8], at: usize) -> Result<(D, usize), MessageError> {
    let src = buf.get(at..).ok_or(MessageError::Truncated)?;
    let (value, read) = bincode::decode_from_slice(src, wire_config())?;
    Ok((value, at + read))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Init,
            Message::NumDevices(2),
            Message::MaxDevices(-1),
            Message::LoadBinary(Payload::new("lenet.nvdla", vec![7; 300])),
            Message::InputData(Payload::untagged(vec![1, 2, 3, 4])),
            Message::OutputData(Payload::untagged(vec![])),
            Message::Infer { output_size: 40 },
            Message::CloseConnection,
            Message::CloseServer,
            Message::Ping,
            Message::Ack(MessageKind::LoadBinary),
            Message::Fail,
        ]
    }

    #[test]
    fn encoded_frames_validate_and_decode() {
        for message in sample_messages() {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(bytes.len(), message.encoded_len());
            assert!(validate(&bytes, bytes.len()), "{message:?}");
            assert_eq!(Message::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn header_layout_is_fixed_width() {
        let bytes = Message::Ack(MessageKind::Init).to_bytes().unwrap();

        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..8], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[8..12], &11u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &20u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0u32.to_le_bytes());
    }

    #[test]
    fn data_frame_places_lengths_before_tag_and_data() {
        let bytes = Message::LoadBinary(Payload::new("ab", vec![9, 8, 7]))
            .to_bytes()
            .unwrap();

        assert_eq!(&bytes[16..24], &2u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &3u64.to_le_bytes());
        assert_eq!(&bytes[32..34], b"ab");
        assert_eq!(&bytes[34..], &[9, 8, 7]);
    }

    #[test]
    fn declared_size_shorter_than_frame_is_rejected() {
        for message in sample_messages() {
            let mut bytes = message.to_bytes().unwrap();
            let short = bytes.len() as u32 - 1;
            bytes[12..16].copy_from_slice(&short.to_le_bytes());

            assert!(!validate(&bytes, bytes.len()));
            assert!(!validate(&bytes[..bytes.len() - 1], bytes.len() - 1));
        }
    }

    #[test]
    fn received_count_must_match_header() {
        let bytes = Message::Ping.to_bytes().unwrap();
        let mut padded = bytes.clone();
        padded.push(0);

        assert!(matches!(
            check(&padded, padded.len()),
            Err(MessageError::SizeMismatch {
                declared: 16,
                received: 17
            })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = Message::Init.to_bytes().unwrap();
        bytes[0] ^= 0xff;

        assert!(matches!(
            check(&bytes, bytes.len()),
            Err(MessageError::BadMagic(_))
        ));
    }

    #[test]
    fn reserved_and_out_of_range_kinds_are_rejected() {
        for raw in [10u32, 13, u32::MAX] {
            let mut bytes = Message::Init.to_bytes().unwrap();
            bytes[8..12].copy_from_slice(&raw.to_le_bytes());

            assert!(matches!(
                check(&bytes, bytes.len()),
                Err(MessageError::UnknownKind(k)) if k == raw
            ));
        }
    }

    #[test]
    fn payload_lengths_must_account_for_the_frame() {
        let mut bytes = Message::InputData(Payload::untagged(vec![0; 8]))
            .to_bytes()
            .unwrap();
        bytes[24..32].copy_from_slice(&7u64.to_le_bytes());

        assert!(matches!(
            check(&bytes, bytes.len()),
            Err(MessageError::LayoutMismatch { .. })
        ));

        bytes[24..32].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(!validate(&bytes, bytes.len()));
    }

    #[test]
    fn ack_of_unknown_kind_fails_to_decode() {
        let mut bytes = Message::Ack(MessageKind::Ping).to_bytes().unwrap();
        bytes[16..20].copy_from_slice(&10u32.to_le_bytes());

        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::UnknownKind(10))
        ));
    }

    #[test]
    fn frame_buffer_only_grows() {
        let mut buf = FrameBuffer::with_capacity(4);

        assert_eq!(buf.frame_mut(64).len(), 64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.frame_mut(8).len(), 8);
        assert_eq!(buf.capacity(), 64);
    }
}
