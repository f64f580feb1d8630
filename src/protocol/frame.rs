//! WebSocket frame codec
//!
//! Bit-level encoding and decoding of the RFC 6455 frame format:
//!
//! ```text
//! byte0: FIN(1) RSV1-3(3) OPCODE(4)
//! byte1: MASK(1) PAYLOAD_LEN(7)
//!   PAYLOAD_LEN == 126 -> 2 byte big-endian length follows
//!   PAYLOAD_LEN == 127 -> 8 byte big-endian length follows
//!   MASK == 1          -> 4 byte masking key follows
//! payload, XORed with the masking key (cyclically) iff masked
//! ```
//!
//! Headers are decoded separately from payloads so a caller can inspect the
//! opcode and length before deciding where the payload goes.

use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// FIN bit of the first header byte
const FIN_BIT: u8 = 0x80;
/// RSV1..RSV3 bits of the first header byte
const RSV_BITS: u8 = 0x70;
/// Opcode nibble of the first header byte
const OPCODE_MASK: u8 = 0x0F;
/// MASK bit of the second header byte
const MASK_BIT: u8 = 0x80;
/// Length indicator of the second header byte
const LENGTH_MASK: u8 = 0x7F;

/// Length indicator announcing a 16-bit extended length
pub const LENGTH_U16: u8 = 126;
/// Length indicator announcing a 64-bit extended length
pub const LENGTH_U64: u8 = 127;

/// Largest payload that fits in the 7-bit length field
pub const MAX_INLINE_LENGTH: u64 = 125;

/// Control frames may never carry more than this many payload bytes
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Chunk size used while streaming payloads
const PAYLOAD_CHUNK: usize = 8 * 1024;

/// Errors produced while decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Reserved bits set in frame header: {0:#04x}")]
    ReservedBits(u8),

    #[error("Control frame payload too large: {0} bytes (max 125)")]
    ControlFrameTooLarge(u64),

    #[error("Control frame must not be fragmented")]
    FragmentedControlFrame,

    #[error("Invalid payload length: {0}")]
    InvalidLength(u64),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame opcode (4 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation of a fragmented message
    Continuation,
    /// UTF-8 text message
    Text,
    /// Binary message
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Any of the reserved values (0x3-0x7, 0xB-0xF)
    Reserved(u8),
}

impl Opcode {
    /// Decode an opcode from the low nibble of `value`
    pub fn from_u8(value: u8) -> Self {
        match value & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Wire value of this opcode
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(value) => value & OPCODE_MASK,
        }
    }

    /// Whether frames with this opcode carry application data
    pub fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    /// Whether this opcode lies in the control range (0x8-0xF)
    pub fn is_control(self) -> bool {
        self.as_u8() >= 0x8
    }
}

/// Which end of the connection is encoding; decides masking polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: every outgoing frame is masked
    Client,
    /// Server: outgoing frames are never masked
    Server,
}

/// A decoded frame header. The payload is left on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: Opcode,
    /// Masking key, present iff the MASK bit was set
    pub mask: Option<[u8; 4]>,
    /// Number of payload bytes following the header
    pub payload_len: u64,
}

impl FrameHeader {
    /// Create an unmasked, final header
    pub fn new(opcode: Opcode, payload_len: u64) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload_len,
        }
    }

    /// Attach a masking key
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Whether the payload is masked
    pub fn masked(&self) -> bool {
        self.mask.is_some()
    }

    /// The 7-bit length indicator for this header's payload length.
    ///
    /// Always the minimal form: the literal length up to 125, then 126 for
    /// anything that fits in 16 bits, then 127.
    pub fn length_indicator(&self) -> u8 {
        match self.payload_len {
            len if len <= MAX_INLINE_LENGTH => len as u8,
            len if len <= u64::from(u16::MAX) => LENGTH_U16,
            _ => LENGTH_U64,
        }
    }

    /// Size in bytes of the encoded header
    pub fn encoded_len(&self) -> usize {
        let extension = match self.length_indicator() {
            LENGTH_U16 => 2,
            LENGTH_U64 => 8,
            _ => 0,
        };
        let mask = if self.masked() { 4 } else { 0 };
        2 + extension + mask
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let fin = if self.fin { FIN_BIT } else { 0 };
        let mask_bit = if self.masked() { MASK_BIT } else { 0 };
        let indicator = self.length_indicator();

        buf.push(fin | self.opcode.as_u8());
        buf.push(mask_bit | indicator);

        match indicator {
            LENGTH_U16 => buf.extend_from_slice(&(self.payload_len as u16).to_be_bytes()),
            LENGTH_U64 => buf.extend_from_slice(&self.payload_len.to_be_bytes()),
            _ => {}
        }

        if let Some(mask) = self.mask {
            buf.extend_from_slice(&mask);
        }
    }

    /// Read one frame header from `reader`.
    ///
    /// Consumes the two fixed bytes, the extended length if the indicator
    /// asks for one, and the masking key if the MASK bit is set. A failure at
    /// any point yields an error; a partially read header is never returned.
    pub async fn read_from<R>(reader: &mut R) -> FrameResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut fixed = [0u8; 2];
        reader.read_exact(&mut fixed).await?;

        let rsv = fixed[0] & RSV_BITS;
        if rsv != 0 {
            return Err(FrameError::ReservedBits(rsv));
        }

        let fin = fixed[0] & FIN_BIT != 0;
        let opcode = Opcode::from_u8(fixed[0]);
        let masked = fixed[1] & MASK_BIT != 0;

        let payload_len = match fixed[1] & LENGTH_MASK {
            LENGTH_U16 => {
                let mut ext = [0u8; 2];
                reader.read_exact(&mut ext).await?;
                u64::from(u16::from_be_bytes(ext))
            }
            LENGTH_U64 => {
                let mut ext = [0u8; 8];
                reader.read_exact(&mut ext).await?;
                let len = u64::from_be_bytes(ext);
                // The most significant bit must be 0
                if len > i64::MAX as u64 {
                    return Err(FrameError::InvalidLength(len));
                }
                len
            }
            literal => u64::from(literal),
        };

        if opcode.is_control() {
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLarge(payload_len));
            }
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        Ok(Self {
            fin,
            opcode,
            mask,
            payload_len,
        })
    }
}

/// XOR `buf` with `mask`, treating `buf[0]` as payload byte `offset`.
///
/// Applying the same mask twice restores the input.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}

/// Generate a fresh masking key from the thread-local CSPRNG
pub fn generate_mask() -> [u8; 4] {
    let mut mask = [0u8; 4];
    rand::rng().fill_bytes(&mut mask);
    mask
}

/// Encode a complete frame for `payload`.
///
/// Client-role frames get a fresh random mask; server-role frames are
/// emitted unmasked. Header and payload come back in a single buffer so the
/// caller can write the frame with one call.
pub fn encode(opcode: Opcode, payload: &[u8], role: Role) -> Vec<u8> {
    let mask = match role {
        Role::Client => Some(generate_mask()),
        Role::Server => None,
    };
    encode_with_mask(opcode, payload, mask)
}

/// Encode a complete frame with an explicit (or no) masking key
pub fn encode_with_mask(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = FrameHeader::new(opcode, payload.len() as u64);
    header.mask = mask;

    let mut buf = Vec::with_capacity(header.encoded_len() + payload.len());
    header.encode_into(&mut buf);

    let start = buf.len();
    buf.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut buf[start..], mask, 0);
    }
    buf
}

/// Consume exactly `header.payload_len` bytes from `reader` into `sink`,
/// unmasking on the way if the header carries a mask.
///
/// Returns the number of bytes written. A stream that ends early yields an
/// `UnexpectedEof` I/O error.
pub async fn decode_payload<R, W>(reader: &mut R, header: &FrameHeader, sink: &mut W) -> FrameResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut remaining = header.payload_len;
    let mut offset = 0usize;
    let mut chunk = vec![0u8; PAYLOAD_CHUNK.min(remaining as usize)];

    while remaining > 0 {
        let want = chunk.len().min(remaining as usize);
        let read = reader.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside frame payload",
            )
            .into());
        }

        if let Some(mask) = header.mask {
            apply_mask(&mut chunk[..read], mask, offset);
        }
        sink.write_all(&chunk[..read]).await?;

        offset = (offset + read) % 4;
        remaining -= read as u64;
    }

    sink.flush().await?;
    Ok(header.payload_len)
}

/// Decode a frame's payload into a freshly allocated buffer
pub async fn read_payload<R>(reader: &mut R, header: &FrameHeader) -> FrameResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = usize::try_from(header.payload_len)
        .map_err(|_| FrameError::InvalidLength(header.payload_len))?;
    let mut payload = Vec::with_capacity(len);
    decode_payload(reader, header, &mut payload).await?;
    Ok(payload)
}
