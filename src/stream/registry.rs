//! Stream Registry
//!
//! Owns the per-key [`StreamState`]. Entries are created only from the
//! metadata path and only when absent; the data path changes them only via
//! [`StreamRegistry::mutate`], after a frame has decoded.
//!
//! Retention is an explicit [`RetentionPolicy`]. Evicted keys behave exactly
//! as if they had never been seen.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::codec::{ElementType, SampleCount};
use super::topic::StreamKey;
use crate::transform::{StageKind, TransformState};

// ============================================================================
// Retention Policy
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never remove entries.
    #[default]
    Unbounded,
    /// Creating an entry beyond the cap evicts the least recently touched one.
    MaxStreams(usize),
    /// [`StreamRegistry::evict_idle`] removes entries untouched for this long.
    Idle(Duration),
}

// ============================================================================
// Stream State
// ============================================================================

/// Everything the data path needs for one stream key.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub sample_count: SampleCount,
    pub element_type: ElementType,
    pub output_metadata_topic: String,
    pub output_data_topic: String,
    /// Augmented metadata document, republished verbatim.
    pub serialized_metadata: Vec<u8>,
    pub transform: TransformState,
    pub frames_processed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub(crate) last_touched: Instant,
    pub(crate) touch_seq: u64,
}

/// Read-only view of one entry for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub key: String,
    pub element_type: ElementType,
    pub sample_count: SampleCount,
    pub output_metadata_topic: String,
    pub output_data_topic: String,
    pub transform: StageKind,
    pub frames_processed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
pub struct StreamRegistry {
    entries: HashMap<StreamKey, StreamState>,
    policy: RetentionPolicy,
    /// Monotonic touch counter; orders entries for LRU eviction.
    clock: u64,
}

impl StreamRegistry {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            clock: 0,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn lookup(&self, key: &StreamKey) -> Option<&StreamState> {
        self.entries.get(key)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert `state` for an absent key. First metadata wins: an existing
    /// entry is never replaced.
    ///
    /// Returns the keys evicted to respect `MaxStreams`.
    pub fn create(&mut self, key: StreamKey, mut state: StreamState, now: Instant) -> Vec<StreamKey> {
        if self.entries.contains_key(&key) {
            return Vec::new();
        }

        state.last_touched = now;
        state.touch_seq = self.tick();
        self.entries.insert(key.clone(), state);

        let mut evicted = Vec::new();
        if let RetentionPolicy::MaxStreams(cap) = self.policy {
            while self.entries.len() > cap.max(1) {
                let Some(lru) = self
                    .entries
                    .iter()
                    .filter(|(k, _)| **k != key)
                    .min_by_key(|(_, s)| s.touch_seq)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                self.entries.remove(&lru);
                evicted.push(lru);
            }
        }
        evicted
    }

    /// Mark an entry as active without changing its state.
    pub fn touch(&mut self, key: &StreamKey, now: Instant) -> bool {
        let seq = self.tick();
        match self.entries.get_mut(key) {
            Some(state) => {
                state.last_touched = now;
                state.touch_seq = seq;
                state.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the transform state of an existing entry, count one
    /// processed frame and touch it. `None` if the key is absent.
    pub fn mutate<F, R>(&mut self, key: &StreamKey, now: Instant, f: F) -> Option<R>
    where
        F: FnOnce(&mut TransformState) -> R,
    {
        let seq = self.tick();
        let state = self.entries.get_mut(key)?;
        let result = f(&mut state.transform);
        state.frames_processed += 1;
        state.last_touched = now;
        state.touch_seq = seq;
        state.last_activity = Utc::now();
        Some(result)
    }

    pub fn remove(&mut self, key: &StreamKey) -> Option<StreamState> {
        self.entries.remove(key)
    }

    /// Remove entries idle for longer than the `Idle` timeout. No-op under
    /// other policies.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<StreamKey> {
        let RetentionPolicy::Idle(timeout) = self.policy else {
            return Vec::new();
        };

        let expired: Vec<StreamKey> = self
            .entries
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_touched) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// One summary per entry, ordered by key.
    pub fn summaries(&self) -> Vec<StreamSummary> {
        let mut out: Vec<(&StreamKey, StreamSummary)> = self
            .entries
            .iter()
            .map(|(key, s)| {
                (
                    key,
                    StreamSummary {
                        key: key.to_string(),
                        element_type: s.element_type,
                        sample_count: s.sample_count,
                        output_metadata_topic: s.output_metadata_topic.clone(),
                        output_data_topic: s.output_data_topic.clone(),
                        transform: s.transform.kind(),
                        frames_processed: s.frames_processed,
                        created_at: s.created_at,
                        last_activity: s.last_activity,
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out.into_iter().map(|(_, s)| s).collect()
    }
}
