//! Bridge envelope codec.
//!
//! The bus client runs out of process and exchanges messages with this
//! binary as length-prefixed envelopes (all little-endian):
//!
//! ```text
//! [u16 topic_len][topic UTF-8][u32 payload_len][payload]
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::defaults::MAX_ENVELOPE_PAYLOAD_BYTES;

/// One bus message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Encode as one envelope.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let topic_len = u16::try_from(self.topic.len())
            .map_err(|_| EnvelopeError::TopicTooLong(self.topic.len()))?;
        let payload_len = u32::try_from(self.payload.len())
            .ok()
            .filter(|&n| n as usize <= MAX_ENVELOPE_PAYLOAD_BYTES)
            .ok_or(EnvelopeError::PayloadTooLarge(self.payload.len()))?;

        let mut out = Vec::with_capacity(6 + self.topic.len() + self.payload.len());
        out.extend_from_slice(&topic_len.to_le_bytes());
        out.extend_from_slice(self.topic.as_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Envelope I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream ended inside an envelope")]
    Truncated,

    #[error("Topic of {0} bytes exceeds the u16 length prefix")]
    TopicTooLong(usize),

    #[error("Payload of {0} bytes exceeds the envelope limit")]
    PayloadTooLarge(usize),

    #[error("Envelope topic is not valid UTF-8: {0}")]
    InvalidTopic(#[from] std::string::FromUtf8Error),
}

impl EnvelopeError {
    /// True when only the one message is lost: nothing was written, or the
    /// reader is still positioned on the next envelope.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            Self::TopicTooLong(_) | Self::PayloadTooLarge(_) | Self::InvalidTopic(_)
        )
    }
}

fn eof_to_truncated(e: std::io::Error) -> EnvelopeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        EnvelopeError::Truncated
    } else {
        EnvelopeError::Io(e)
    }
}

/// Read one envelope. `Ok(None)` on a clean end of stream between envelopes.
///
/// An oversized payload is discarded and a bad topic is only checked once the
/// payload is consumed, so both errors leave the reader on the next envelope.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<BusMessage>, EnvelopeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 2];
    let first = reader.read(&mut len_buf[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut len_buf[1..])
        .await
        .map_err(eof_to_truncated)?;
    let topic_len = usize::from(u16::from_le_bytes(len_buf));

    let mut topic = vec![0u8; topic_len];
    reader.read_exact(&mut topic).await.map_err(eof_to_truncated)?;

    let mut payload_len = [0u8; 4];
    reader
        .read_exact(&mut payload_len)
        .await
        .map_err(eof_to_truncated)?;
    let payload_len = u32::from_le_bytes(payload_len) as usize;
    if payload_len > MAX_ENVELOPE_PAYLOAD_BYTES {
        let mut discard = (&mut *reader).take(payload_len as u64);
        tokio::io::copy(&mut discard, &mut tokio::io::sink()).await?;
        return Err(EnvelopeError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_to_truncated)?;

    let topic = String::from_utf8(topic)?;
    Ok(Some(BusMessage { topic, payload }))
}

/// Write one envelope and flush.
pub async fn write_envelope<W>(writer: &mut W, message: &BusMessage) -> Result<(), EnvelopeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
