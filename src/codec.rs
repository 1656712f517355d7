//! Length-delimited bincode framing for [`Envelope`]s.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::message::Envelope;

/// Default upper bound on a frame's payload, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frames each [`Envelope`] behind a 4-byte big-endian length prefix.
///
/// Frames longer than the configured limit are refused in both directions, and a frame must
/// decode to exactly one envelope with no bytes left over.
pub struct EnvelopeCodec {
    codec: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_len)
                .new_codec(),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.codec.max_frame_length()
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((envelope, length)) if length == bytes.len() => Ok(Some(envelope)),
            Ok((_, length)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after envelope", bytes.len() - length),
            )),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match bincode::encode_to_vec(envelope, bincode::config::standard()) {
            Ok(bytes) => self.codec.encode(Bytes::from(bytes), dst),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}
