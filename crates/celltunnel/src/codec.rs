// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing codec for tunnel streams.
//!
//! A tunnel stream carries self-delimiting records: one handshake identity
//! followed by any number of envelopes. Each record is serialized as JSON
//! and prefixed with its length:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON record       |
//! +----------------+-------------------+
//! ```
//!
//! Every write is flushed before returning, so the peer's reader always
//! observes complete records in submission order.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum record size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest record the 4-byte length prefix can describe.
pub const FRAME_SIZE_LIMIT: usize = u32::MAX as usize;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended inside a frame")]
    Truncated,

    #[error("empty frame")]
    Empty,

    #[error("frame too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the error came from the transport rather than the bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Truncated)
    }
}

/// Length-prefixed JSON record codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec rejecting records larger than `max_frame_size`.
    ///
    /// The limit is capped at [`FRAME_SIZE_LIMIT`].
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(FRAME_SIZE_LIMIT),
        }
    }

    /// Maximum accepted record size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize a record into a complete frame.
    pub fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, CodecError> {
        let body = serde_json::to_vec(record)?;
        let too_large = || CodecError::TooLarge {
            size: body.len(),
            max: self.max_frame_size,
        };
        if body.len() > self.max_frame_size {
            return Err(too_large());
        }
        let len = u32::try_from(body.len()).map_err(|_| too_large())?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Write one record and flush.
    pub async fn write<W, T>(&self, writer: &mut W, record: &T) -> Result<usize, CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let frame = self.encode(record)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(frame.len())
    }

    /// Read one record.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub async fn read<R, T>(&self, reader: &mut R) -> Result<Option<T>, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
        T: DeserializeOwned,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(CodecError::Truncated)
                };
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(CodecError::Empty);
        }
        if len > self.max_frame_size {
            return Err(CodecError::TooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut body = vec![0u8; len];
        match reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::Truncated);
            }
            Err(e) => return Err(CodecError::Io(e)),
        }

        Ok(Some(serde_json::from_slice(&body)?))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CellAddress, Envelope};
    use tokio::io::duplex;

    #[test]
    fn test_encode_header() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&"hello").unwrap();
        let body_len = frame.len() - FRAME_HEADER_SIZE;
        assert_eq!(&frame[..4], &(body_len as u32).to_be_bytes());
        assert_eq!(&frame[4..], b"\"hello\"");
    }

    #[test]
    fn test_encode_too_large() {
        let codec = FrameCodec::new(8);
        let err = codec.encode(&"a string longer than eight bytes").unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { max: 8, .. }));
    }

    #[test]
    fn test_limit_capped_to_length_prefix() {
        assert_eq!(FrameCodec::new(usize::MAX).max_frame_size(), FRAME_SIZE_LIMIT);
        assert_eq!(FrameCodec::new(1024).max_frame_size(), 1024);
    }

    #[tokio::test]
    async fn test_records_keep_order() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(64 * 1024);

        for i in 0..5u8 {
            let env = Envelope::new(CellAddress::local("src"), CellAddress::new("dst", "nodeB"), vec![i]);
            codec.write(&mut a, &env).await.unwrap();
        }
        drop(a);

        for i in 0..5u8 {
            let env: Envelope = codec.read(&mut b).await.unwrap().unwrap();
            assert_eq!(env.payload, vec![i]);
        }
        let end: Option<Envelope> = codec.read(&mut b).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_read_truncated_header() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(1024);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);

        let err = codec.read::<_, String>(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_read_truncated_body() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(1024);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"\"abc").await.unwrap();
        drop(a);

        let err = codec.read::<_, String>(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized() {
        let codec = FrameCodec::new(16);
        let (mut a, mut b) = duplex(1024);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();

        let err = codec.read::<_, String>(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { size: 1000, max: 16 }));
    }

    #[tokio::test]
    async fn test_read_rejects_empty_and_garbage() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(1024);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        let err = codec.read::<_, String>(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::Empty));

        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{{{").await.unwrap();
        let err = codec.read::<_, String>(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
        assert!(!err.is_io());
    }
}
