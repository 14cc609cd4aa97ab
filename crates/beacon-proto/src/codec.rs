// ABOUTME: Length-delimited frame codec for tokio_util Framed readers and writers.
// ABOUTME: Wraps LengthDelimitedCodec and encodes/decodes Frame with prost.

use bytes::{Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::Frame;

/// Maximum frame size accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Errors produced while reading or writing frames.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Underlying I/O failure, including oversize frames.
    #[error("frame i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame bytes were not a valid protobuf message.
    #[error("frame decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("frame encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Codec turning a byte stream into [`Frame`]s.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.inner.decode(src)? {
            Some(buf) => Ok(Some(Frame::decode(buf.freeze())?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf)?;
        self.inner.encode(Bytes::from(buf), dst)?;
        Ok(())
    }
}
