//! Error taxonomy for the per-message stream path.
//!
//! Every variant maps to a local drop-and-log: nothing here ever terminates
//! the processing loop.

use thiserror::Error;

/// Topic shape violations (unknown discriminator, rewrite rule mismatch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("Unknown topic discriminator '{0}' (expected 'data' or 'metadata')")]
    UnknownDiscriminator(String),

    #[error("Topic has no stream key segments: '{0}'")]
    EmptyKey(String),

    #[error("Rewrite rule {rule} does not apply to stream {key}")]
    RuleNotApplicable { rule: String, key: String },
}

/// Metadata document could not be used to create a registry entry.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Invalid metadata JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required metadata field: {0}")]
    MissingField(&'static str),

    #[error("Invalid metadata field {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// Binary data payload did not match the registered frame layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameDecodeError {
    #[error("Payload of {len} bytes is too short for the 4-byte frame prefix")]
    MissingPrefix { len: usize },

    #[error("Descriptor length {descriptor_length} is shorter than the 4-byte frame prefix")]
    DescriptorTooShort { descriptor_length: usize },

    #[error(
        "Payload of {len} bytes is shorter than descriptor ({descriptor_length}) + {count} x {element_size}-byte samples"
    )]
    Truncated {
        len: usize,
        descriptor_length: usize,
        count: usize,
        element_size: usize,
    },
}

/// Any failure while handling one inbound message.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] TopicError),

    #[error("Metadata parse error: {0}")]
    MetadataParse(#[from] MetadataError),

    #[error("Frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),
}
