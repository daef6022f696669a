//! Topic Classifier
//!
//! CP-SENS topics are `/`-separated paths whose last segment tells the
//! message kind:
//!
//! ```text
//! cpsens/<site>/<node>/<channel>/<quantity>/<analysis>/{data|metadata}
//! ```
//!
//! Everything before the discriminator is the [`StreamKey`]. One interior
//! segment is stage-specific and rewritten by a [`SegmentRule`] to form the
//! output topics (`raw` -> `detrend`, `acc` -> `displ`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::TopicError;

/// Path separator used by the bus.
pub const TOPIC_SEPARATOR: char = '/';

/// Trailing segment for binary frames.
pub const DATA_SEGMENT: &str = "data";

/// Trailing segment for JSON metadata documents.
pub const METADATA_SEGMENT: &str = "metadata";

// ============================================================================
// Stream Key
// ============================================================================

/// Topic path segments without the trailing data/metadata discriminator.
///
/// Scopes all per-channel state. Compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamKey(Vec<String>);

impl StreamKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Full topic for this key with the given discriminator appended.
    pub fn topic(&self, kind: MessageKind) -> String {
        format!("{}{}{}", self, TOPIC_SEPARATOR, kind.segment())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                write!(f, "{}", TOPIC_SEPARATOR)?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// Message Kind
// ============================================================================

/// Discriminator carried by the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Data,
    Metadata,
}

impl MessageKind {
    pub const fn segment(self) -> &'static str {
        match self {
            MessageKind::Data => DATA_SEGMENT,
            MessageKind::Metadata => METADATA_SEGMENT,
        }
    }
}

/// Result of classifying one inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedTopic {
    pub key: StreamKey,
    pub kind: MessageKind,
}

/// Split a topic into its stream key and message kind.
///
/// Pure and deterministic. Fails when the last segment is neither `data` nor
/// `metadata`, or when nothing precedes it.
pub fn classify(topic: &str) -> Result<ClassifiedTopic, TopicError> {
    let mut segments: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
    // split() always yields at least one element
    let last = segments.pop().unwrap_or_default();

    let kind = match last {
        DATA_SEGMENT => MessageKind::Data,
        METADATA_SEGMENT => MessageKind::Metadata,
        other => return Err(TopicError::UnknownDiscriminator(other.to_string())),
    };

    if segments.is_empty() {
        return Err(TopicError::EmptyKey(topic.to_string()));
    }

    Ok(ClassifiedTopic {
        key: StreamKey::new(segments),
        kind,
    })
}

// ============================================================================
// Segment Rewrite Rule
// ============================================================================

/// How a stage derives its output topics from the input stream key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentRule {
    /// Replace the first key segment equal to `from` with `to`.
    Match { from: String, to: String },
    /// Replace the key segment at position `index` with `to`.
    Index { index: usize, to: String },
}

impl SegmentRule {
    pub fn matching(from: impl Into<String>, to: impl Into<String>) -> Self {
        SegmentRule::Match {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn at_index(index: usize, to: impl Into<String>) -> Self {
        SegmentRule::Index {
            index,
            to: to.into(),
        }
    }

    /// Replacement value written into the output key.
    pub fn replacement(&self) -> &str {
        match self {
            SegmentRule::Match { to, .. } | SegmentRule::Index { to, .. } => to,
        }
    }

    /// Rewrite one segment of `key`, leaving all others untouched.
    pub fn apply(&self, key: &StreamKey) -> Result<StreamKey, TopicError> {
        let position = match self {
            SegmentRule::Match { from, .. } => key.segments().iter().position(|s| s == from),
            SegmentRule::Index { index, .. } => (*index < key.segments().len()).then_some(*index),
        };

        let Some(position) = position else {
            return Err(TopicError::RuleNotApplicable {
                rule: self.to_string(),
                key: key.to_string(),
            });
        };

        let mut segments = key.segments().to_vec();
        segments[position] = self.replacement().to_string();
        Ok(StreamKey(segments))
    }

    /// Output `(metadata_topic, data_topic)` for an input stream key.
    pub fn output_topics(&self, key: &StreamKey) -> Result<(String, String), TopicError> {
        let rewritten = self.apply(key)?;
        Ok((
            rewritten.topic(MessageKind::Metadata),
            rewritten.topic(MessageKind::Data),
        ))
    }
}

impl fmt::Display for SegmentRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentRule::Match { from, to } => write!(f, "'{}'->'{}'", from, to),
            SegmentRule::Index { index, to } => write!(f, "[{}]->'{}'", index, to),
        }
    }
}

// ============================================================================
// Subscription Filter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterLevel {
    Exact(String),
    /// `+`: exactly one level
    Single,
    /// `#`: this level and everything below (including nothing)
    Multi,
}

/// MQTT-style subscription filter (`cpsens/+/+/+/+/raw/+`, `cpsens/#`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<FilterLevel>,
}

impl TopicFilter {
    /// `#`: every topic.
    pub fn all() -> Self {
        Self {
            raw: "#".to_string(),
            levels: vec![FilterLevel::Multi],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split(TOPIC_SEPARATOR);

        for level in &self.levels {
            match level {
                FilterLevel::Multi => return true,
                FilterLevel::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                FilterLevel::Exact(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        topic_levels.next().is_none()
    }
}

impl FromStr for TopicFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("subscription filter is empty".to_string());
        }

        let parts: Vec<&str> = s.split(TOPIC_SEPARATOR).collect();
        let mut levels = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" if i + 1 == parts.len() => FilterLevel::Multi,
                "#" => return Err(format!("'#' must be the last level in '{}'", s)),
                "+" => FilterLevel::Single,
                p if p.contains('+') || p.contains('#') => {
                    return Err(format!("wildcard must occupy a whole level in '{}'", s))
                }
                p => FilterLevel::Exact(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: s.to_string(),
            levels,
        })
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
