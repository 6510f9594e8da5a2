//! Length-delimited envelopes.
//!
//! ```text
//! +-------+----------------+-----------------+
//! | flags | length (u32 BE) | payload         |
//! | 1 B   | 4 B            | `length` bytes  |
//! +-------+----------------+-----------------+
//! ```
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The payload is compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// The payload is the end-of-stream JSON message.
pub const FLAG_END_STREAM: u8 = 0b0000_0010;

const HEADER_LEN: usize = 5;

/// Default upper bound for a single envelope payload, matching gRPC's default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Failed to read the message body: '{0}'")]
    Io(#[from] std::io::Error),
    #[error("Envelope declares {len} bytes, more than the {max} bytes allowed")]
    TooLarge { len: usize, max: usize },
    #[error("Envelope carries unknown flags {0:#010b}")]
    UnknownFlags(u8),
    #[error("Body ended inside an envelope, {0} trailing bytes")]
    Truncated(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub data: Bytes,
}

impl Envelope {
    /// An uncompressed message envelope.
    pub fn message(data: Bytes) -> Self {
        Self { flags: 0, data }
    }

    pub fn end_stream(data: Bytes) -> Self {
        Self {
            flags: FLAG_END_STREAM,
            data,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Encodes the envelope into a standalone buffer.
    pub fn into_bytes(self) -> Bytes {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        put_envelope(&self, &mut dst);
        dst.freeze()
    }
}

fn put_envelope(envelope: &Envelope, dst: &mut BytesMut) {
    dst.reserve(HEADER_LEN + envelope.data.len());
    dst.put_u8(envelope.flags);
    dst.put_u32(envelope.data.len() as u32);
    dst.put_slice(&envelope.data);
}

/// `tokio_util` codec reading and writing [`Envelope`]s.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_message_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl EnvelopeCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let flags = src[0];
        if flags & !(FLAG_COMPRESSED | FLAG_END_STREAM) != 0 {
            return Err(FramingError::UnknownFlags(flags));
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_message_size {
            return Err(FramingError::TooLarge {
                len,
                max: self.max_message_size,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len).freeze();

        Ok(Some(Envelope { flags, data }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(envelope) => Ok(Some(envelope)),
            None if src.is_empty() => Ok(None),
            None => Err(FramingError::Truncated(src.len())),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() > self.max_message_size {
            return Err(FramingError::TooLarge {
                len: item.data.len(),
                max: self.max_message_size,
            });
        }
        put_envelope(&item, dst);
        Ok(())
    }
}
