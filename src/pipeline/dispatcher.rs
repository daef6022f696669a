//! Dispatcher / Publisher
//!
//! Routes one inbound bus message at a time:
//!
//! ```text
//! topic -> subscription filter -> classify -> metadata path | data path -> publish
//! ```
//!
//! The dispatcher owns the [`StreamRegistry`] and is not reentrant; callers
//! serialize `handle_message` (the processing loop runs it on one task).

use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use super::envelope::BusMessage;
use crate::config::StreamConfig;
use crate::stream::codec::Frame;
use crate::stream::error::StreamError;
use crate::stream::metadata;
use crate::stream::registry::{RetentionPolicy, StreamRegistry};
use crate::stream::topic::{classify, MessageKind, StreamKey, TopicFilter};
use crate::transform::Stage;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Metadata republished; `created` when this message created the entry.
    MetadataPublished { created: bool },
    FramePublished { samples: usize },
    /// Data for a key with no registry entry.
    DroppedUnknownKey,
    /// Topic matched no subscription filter.
    Ignored,
}

/// Result of a successfully handled message: zero or one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub outcome: Outcome,
    pub messages: Vec<BusMessage>,
}

impl Handled {
    fn silent(outcome: Outcome) -> Self {
        Self {
            outcome,
            messages: Vec::new(),
        }
    }

    fn publish(outcome: Outcome, topic: &str, payload: Vec<u8>) -> Self {
        Self {
            outcome,
            messages: vec![BusMessage::new(topic, payload)],
        }
    }
}

/// Message counters by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub messages_received: u64,
    pub streams_created: u64,
    pub metadata_published: u64,
    pub frames_published: u64,
    pub samples_processed: u64,
    pub dropped_unknown_key: u64,
    pub ignored_unsubscribed: u64,
    pub protocol_errors: u64,
    pub metadata_errors: u64,
    pub frame_errors: u64,
    /// Outputs the sink could not encode (topic or payload past envelope limits).
    pub publish_errors: u64,
    pub evictions: u64,
}

pub struct Dispatcher {
    stage: Stage,
    filters: Vec<TopicFilter>,
    registry: StreamRegistry,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Dispatcher for `stage` that subscribes to everything and never evicts.
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            filters: vec![TopicFilter::all()],
            registry: StreamRegistry::new(RetentionPolicy::Unbounded),
            stats: DispatchStats::default(),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.stage())
            .with_subscriptions(config.subscriptions())
            .with_retention(config.retention_policy())
    }

    pub fn with_subscriptions(mut self, filters: Vec<TopicFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.registry = StreamRegistry::new(policy);
        self
    }

    /// Replace stage identity, rewrite rule and filter parameters.
    ///
    /// Existing entries keep the stage they were created under.
    pub fn configure(&mut self, stage: Stage) {
        info!(
            stage = %stage.kind,
            rewrite = %stage.rewrite,
            q = stage.kalman.process_noise,
            r = stage.kalman.measurement_noise,
            existing_streams = self.registry.len(),
            "Dispatcher reconfigured"
        );
        self.stage = stage;
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn subscriptions(&self) -> &[TopicFilter] {
        &self.filters
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<Handled, StreamError> {
        self.handle_message_at(topic, payload, Instant::now())
    }

    /// `handle_message` with an explicit clock, for retention tests.
    pub fn handle_message_at(
        &mut self,
        topic: &str,
        payload: &[u8],
        now: Instant,
    ) -> Result<Handled, StreamError> {
        self.stats.messages_received += 1;

        if !self.filters.iter().any(|f| f.matches(topic)) {
            debug!(topic = %topic, "Topic not subscribed, ignoring");
            self.stats.ignored_unsubscribed += 1;
            return Ok(Handled::silent(Outcome::Ignored));
        }

        let result = classify(topic)
            .map_err(StreamError::from)
            .and_then(|classified| match classified.kind {
                MessageKind::Metadata => self.handle_metadata(classified.key, payload, now),
                MessageKind::Data => self.handle_data(&classified.key, payload, now),
            });

        if let Err(ref e) = result {
            match e {
                StreamError::Protocol(_) => self.stats.protocol_errors += 1,
                StreamError::MetadataParse(_) => self.stats.metadata_errors += 1,
                StreamError::FrameDecode(_) => self.stats.frame_errors += 1,
            }
        }
        result
    }

    fn handle_metadata(
        &mut self,
        key: StreamKey,
        payload: &[u8],
        now: Instant,
    ) -> Result<Handled, StreamError> {
        let created = if self.registry.touch(&key, now) {
            debug!(key = %key, "Metadata for known stream, republishing cached document");
            false
        } else {
            let entry = metadata::build_entry(&key, payload, &self.stage, now)?;
            info!(
                key = %key,
                output = %entry.output_data_topic,
                element = %entry.element_type,
                samples = ?entry.sample_count,
                "Registered stream"
            );

            for evicted in self.registry.create(key.clone(), entry, now) {
                info!(key = %evicted, "Evicted least recently used stream");
                self.stats.evictions += 1;
            }
            self.stats.streams_created += 1;
            true
        };

        let Some(entry) = self.registry.lookup(&key) else {
            // create() never evicts the entry it inserts
            return Ok(Handled::silent(Outcome::MetadataPublished { created }));
        };

        self.stats.metadata_published += 1;
        Ok(Handled::publish(
            Outcome::MetadataPublished { created },
            &entry.output_metadata_topic,
            entry.serialized_metadata.clone(),
        ))
    }

    fn handle_data(
        &mut self,
        key: &StreamKey,
        payload: &[u8],
        now: Instant,
    ) -> Result<Handled, StreamError> {
        let Some(entry) = self.registry.lookup(key) else {
            info!(key = %key, "Data for unknown stream, waiting for metadata");
            self.stats.dropped_unknown_key += 1;
            return Ok(Handled::silent(Outcome::DroppedUnknownKey));
        };

        // Decode before touching any state
        let mut frame = Frame::decode(payload, entry.sample_count, entry.element_type)?;
        let samples = frame.samples.len();
        let element_type = entry.element_type;
        let topic = entry.output_data_topic.clone();

        let applied = self
            .registry
            .mutate(key, now, |transform| transform.apply(&mut frame.samples));
        if applied.is_none() {
            return Ok(Handled::silent(Outcome::DroppedUnknownKey));
        }
        let encoded = frame.encode(element_type);

        debug!(key = %key, samples = samples, "Frame processed");
        self.stats.frames_published += 1;
        self.stats.samples_processed += samples as u64;
        Ok(Handled::publish(Outcome::FramePublished { samples }, &topic, encoded))
    }

    /// Count one output message the sink rejected on its own.
    pub fn record_publish_error(&mut self) {
        self.stats.publish_errors += 1;
    }

    /// Apply the idle retention policy. Returns the number of entries removed.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let evicted = self.registry.evict_idle(now);
        for key in &evicted {
            info!(key = %key, "Evicted idle stream");
        }
        self.stats.evictions += evicted.len() as u64;
        evicted.len()
    }
}
