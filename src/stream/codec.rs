//! Binary Frame Codec
//!
//! Data payload layout (all little-endian):
//!
//! ```text
//! [u16 descriptor_length][u16 metadata_version][opaque header .. descriptor_length]
//! [sample_count x element_type]
//! ```
//!
//! The header bytes `[0, descriptor_length)` are passed through verbatim.
//! Samples are widened to `f64` for computation and narrowed back to the
//! registered element type on encode.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::FrameDecodeError;

/// Size of the `descriptor_length` + `metadata_version` prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

// ============================================================================
// Element Type
// ============================================================================

/// Sample element type signalled by metadata `Data.Type[0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Float32,
    Float64,
}

impl ElementType {
    /// Parse a metadata type code; only the first character is significant.
    pub fn from_type_code(code: &str) -> Option<Self> {
        match code.chars().next()? {
            'f' => Some(ElementType::Float32),
            'd' => Some(ElementType::Float64),
            _ => None,
        }
    }

    pub const fn code(self) -> char {
        match self {
            ElementType::Float32 => 'f',
            ElementType::Float64 => 'd',
        }
    }

    /// Bytes per element on the wire.
    pub const fn size(self) -> usize {
        match self {
            ElementType::Float32 => 4,
            ElementType::Float64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Float32 => write!(f, "float32"),
            ElementType::Float64 => write!(f, "float64"),
        }
    }
}

// ============================================================================
// Sample Count
// ============================================================================

/// Elements per frame: fixed by metadata, or derived from payload length
/// (`Data.Samples == -1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleCount {
    Fixed(usize),
    Derived,
}

impl SampleCount {
    /// Sentinel used by the metadata document for [`SampleCount::Derived`].
    pub const DERIVED_SENTINEL: i64 = -1;

    fn resolve(self, payload_len: usize, descriptor_length: usize, element: ElementType) -> usize {
        match self {
            SampleCount::Fixed(n) => n,
            SampleCount::Derived => payload_len.saturating_sub(descriptor_length) / element.size(),
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded data message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Raw bytes `[0, descriptor_length)`, prefix included.
    pub header: Vec<u8>,
    pub metadata_version: u16,
    /// Samples widened to `f64`.
    pub samples: Vec<f64>,
}

impl Frame {
    pub fn descriptor_length(&self) -> usize {
        self.header.len()
    }

    /// Decode a data payload using the registered layout.
    ///
    /// Nothing is mutated on failure; callers must only touch stream state
    /// after this returns `Ok`.
    pub fn decode(
        payload: &[u8],
        count: SampleCount,
        element: ElementType,
    ) -> Result<Self, FrameDecodeError> {
        if payload.len() < FRAME_PREFIX_LEN {
            return Err(FrameDecodeError::MissingPrefix { len: payload.len() });
        }

        let descriptor_length = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
        let metadata_version = u16::from_le_bytes([payload[2], payload[3]]);

        if descriptor_length < FRAME_PREFIX_LEN {
            return Err(FrameDecodeError::DescriptorTooShort { descriptor_length });
        }

        let n = count.resolve(payload.len(), descriptor_length, element);
        let size = element.size();
        let required = n
            .checked_mul(size)
            .and_then(|body| body.checked_add(descriptor_length));

        let body = match required {
            Some(end) if end <= payload.len() => &payload[descriptor_length..end],
            _ => {
                return Err(FrameDecodeError::Truncated {
                    len: payload.len(),
                    descriptor_length,
                    count: n,
                    element_size: size,
                })
            }
        };

        let samples = match element {
            ElementType::Float32 => body
                .chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            ElementType::Float64 => body
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        };

        Ok(Self {
            header: payload[..descriptor_length].to_vec(),
            metadata_version,
            samples,
        })
    }

    /// Header bytes followed by samples narrowed to `element`.
    pub fn encode(&self, element: ElementType) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.samples.len() * element.size());
        out.extend_from_slice(&self.header);

        match element {
            ElementType::Float32 => {
                for &s in &self.samples {
                    #[allow(clippy::cast_possible_truncation)]
                    out.extend_from_slice(&(s as f32).to_le_bytes());
                }
            }
            ElementType::Float64 => {
                for &s in &self.samples {
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
        }

        out
    }
}

/// Build a data payload. Used by tests and the replay tooling.
pub fn build_payload(
    descriptor_length: u16,
    metadata_version: u16,
    element: ElementType,
    samples: &[f64],
) -> Vec<u8> {
    let mut header = Vec::with_capacity(usize::from(descriptor_length));
    header.extend_from_slice(&descriptor_length.to_le_bytes());
    header.extend_from_slice(&metadata_version.to_le_bytes());
    header.resize(usize::from(descriptor_length).max(FRAME_PREFIX_LEN), 0);

    Frame {
        header,
        metadata_version,
        samples: samples.to_vec(),
    }
    .encode(element)
}
