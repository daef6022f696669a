//! Stream protocol: topic classification, frame codec, metadata handling and
//! the per-key registry.

pub mod codec;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod topic;

pub use codec::{ElementType, Frame, SampleCount};
pub use error::{FrameDecodeError, MetadataError, StreamError, TopicError};
pub use registry::{RetentionPolicy, StreamRegistry, StreamState, StreamSummary};
pub use topic::{classify, ClassifiedTopic, MessageKind, SegmentRule, StreamKey, TopicFilter};
