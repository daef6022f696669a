//! Message processing loop shared by every transport.
//!
//! `source -> Dispatcher::handle_message -> sink`, one message at a time, so
//! registry mutations are serialized by construction.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dispatcher::{DispatchStats, Dispatcher, Outcome};
use super::envelope::EnvelopeError;
use super::source::{MessageSink, MessageSource, SourceEvent};
use super::{AppState, SystemStatus};
use crate::config::defaults::{DEFAULT_PROGRESS_EVERY, IDLE_SWEEP_INTERVAL_SECS};

/// Minimum spacing between registry snapshots pushed to [`AppState`].
const STREAM_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Owns the dispatcher for the lifetime of one run.
///
/// Built with [`new()`](ProcessingLoop::new), tuned with the `with_*`
/// builders, then consumed by [`run()`](ProcessingLoop::run).
pub struct ProcessingLoop {
    dispatcher: Dispatcher,
    app_state: Arc<RwLock<AppState>>,
    cancel_token: CancellationToken,
    progress_every: u64,
    sweep_interval: Duration,
}

impl ProcessingLoop {
    pub fn new(
        dispatcher: Dispatcher,
        app_state: Arc<RwLock<AppState>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            app_state,
            cancel_token,
            progress_every: DEFAULT_PROGRESS_EVERY,
            sweep_interval: Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS),
        }
    }

    /// Messages between progress lines; 0 disables them.
    pub fn with_progress_every(mut self, n: u64) -> Self {
        self.progress_every = n;
        self
    }

    /// How often idle retention is applied.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Run until the source is exhausted, fails, or cancellation.
    ///
    /// Returns final dispatcher statistics.
    pub async fn run<S, K>(mut self, source: &mut S, sink: &mut K) -> DispatchStats
    where
        S: MessageSource + ?Sized,
        K: MessageSink + ?Sized,
    {
        info!(
            "📊 Processing {} stage: {} -> {}",
            self.dispatcher.stage().kind,
            source.source_name(),
            sink.sink_name()
        );
        info!("{}", RULE);

        {
            let mut state = self.app_state.write().await;
            state.status = SystemStatus::Running;
            state.stage = self.dispatcher.stage().kind;
            state.source = source.source_name().to_string();
            state.sink = sink.sink_name().to_string();
        }

        let mut final_status = SystemStatus::Stopped;
        let mut last_sweep = Instant::now();
        let mut last_snapshot = Instant::now();

        loop {
            let event = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("[ProcessingLoop] Shutdown signal received");
                    break;
                }
                result = source.next_message() => {
                    match result {
                        Ok(ev) => ev,
                        Err(e) => {
                            error!("[ProcessingLoop] Source error: {:#}", e);
                            final_status = SystemStatus::Error;
                            break;
                        }
                    }
                }
            };

            let message = match event {
                SourceEvent::Message(m) => m,
                SourceEvent::Eof => {
                    info!(
                        "[ProcessingLoop] Source reached end ({} messages received)",
                        self.dispatcher.stats().messages_received
                    );
                    break;
                }
            };

            let mut streams_changed = false;
            let mut sink_failed = false;

            match self.dispatcher.handle_message(&message.topic, &message.payload) {
                Ok(handled) => {
                    for out in handled.messages {
                        let topic_len = out.topic.len();
                        let Err(e) = sink.publish(out).await else {
                            continue;
                        };
                        if e
                            .downcast_ref::<EnvelopeError>()
                            .is_some_and(EnvelopeError::is_per_message)
                        {
                            warn!(topic_len = topic_len, "Dropped output message: {:#}", e);
                            self.dispatcher.record_publish_error();
                            continue;
                        }
                        error!("[ProcessingLoop] Sink error: {:#}", e);
                        sink_failed = true;
                        break;
                    }
                    streams_changed = handled.outcome == Outcome::MetadataPublished { created: true };
                }
                Err(e) => {
                    warn!(topic = %message.topic, "Dropped message: {}", e);
                }
            }

            let now = Instant::now();
            if now.duration_since(last_sweep) >= self.sweep_interval {
                streams_changed |= self.dispatcher.evict_idle(now) > 0;
                last_sweep = now;
            }

            let refresh_streams =
                streams_changed || now.duration_since(last_snapshot) >= STREAM_SNAPSHOT_INTERVAL;
            {
                let mut state = self.app_state.write().await;
                state.last_message_time = Some(chrono::Utc::now());
                state.sync_from(&self.dispatcher, refresh_streams);
            }
            if refresh_streams {
                last_snapshot = now;
            }

            let received = self.dispatcher.stats().messages_received;
            if self.progress_every > 0 && received % self.progress_every == 0 {
                let stats = self.dispatcher.stats();
                info!(
                    "📈 Progress: {} messages | Frames: {} | Streams: {} | Dropped: {} | Errors: {}",
                    received,
                    stats.frames_published,
                    self.dispatcher.registry().len(),
                    stats.dropped_unknown_key,
                    stats.protocol_errors
                        + stats.metadata_errors
                        + stats.frame_errors
                        + stats.publish_errors
                );
            }

            if sink_failed {
                final_status = SystemStatus::Error;
                break;
            }
        }

        {
            let mut state = self.app_state.write().await;
            state.status = final_status;
            state.sync_from(&self.dispatcher, true);
        }

        let stats = self.dispatcher.stats().clone();
        log_final_statistics(&stats, self.dispatcher.registry().len());
        stats
    }
}

fn log_final_statistics(stats: &DispatchStats, streams: usize) {
    info!("");
    info!("{}", RULE);
    info!("📊 FINAL STATISTICS");
    info!("{}", RULE);
    info!("   Messages Received:    {}", stats.messages_received);
    info!("   Streams Registered:   {}", stats.streams_created);
    info!("   Streams Active:       {}", streams);
    info!("   Metadata Published:   {}", stats.metadata_published);
    info!("   Frames Published:     {}", stats.frames_published);
    info!("   Samples Processed:    {}", stats.samples_processed);
    info!("   Waiting for Metadata: {}", stats.dropped_unknown_key);
    info!("   Not Subscribed:       {}", stats.ignored_unsubscribed);
    info!("   Protocol Errors:      {}", stats.protocol_errors);
    info!("   Metadata Errors:      {}", stats.metadata_errors);
    info!("   Frame Errors:         {}", stats.frame_errors);
    info!("   Publish Errors:       {}", stats.publish_errors);
    info!("   Evictions:            {}", stats.evictions);
    info!("{}", RULE);
}
