//! Processing loop tests: channel source -> loop -> channel sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use cpsens_stream::pipeline::envelope::{read_envelope, write_envelope};
use cpsens_stream::pipeline::source::{
    ChannelSink, ChannelSource, MessageSink, MessageSource, SourceEvent,
};
use cpsens_stream::pipeline::{AppState, ProcessingLoop, SystemStatus};
use cpsens_stream::stream::codec::build_payload;
use cpsens_stream::{BusMessage, Dispatcher, ElementType, RetentionPolicy, Stage, StageKind};

const META: &[u8] = br#"{"Data":{"Samples":4,"Type":"f"},"Analysis chain":[]}"#;

fn new_loop(dispatcher: Dispatcher) -> (ProcessingLoop, Arc<RwLock<AppState>>, CancellationToken) {
    let app_state = Arc::new(RwLock::new(AppState::for_stage(StageKind::Detrend)));
    let token = CancellationToken::new();
    let processing_loop = ProcessingLoop::new(dispatcher, Arc::clone(&app_state), token.clone())
        .with_progress_every(0);
    (processing_loop, app_state, token)
}

#[tokio::test]
async fn test_loop_processes_until_source_closes() {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(16);

    let data = build_payload(4, 1, ElementType::Float32, &[10.0; 4]);
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/data", data.clone()))
        .await
        .unwrap();
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/metadata", META.to_vec()))
        .await
        .unwrap();
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/data", data))
        .await
        .unwrap();
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/bogus", Vec::new()))
        .await
        .unwrap();
    drop(in_tx);

    let (processing_loop, app_state, _token) = new_loop(Dispatcher::new(Stage::detrend()));
    let mut source = ChannelSource::new(in_rx);
    let mut sink = ChannelSink::new(out_tx);
    let stats = processing_loop.run(&mut source, &mut sink).await;

    assert_eq!(stats.messages_received, 4);
    assert_eq!(stats.dropped_unknown_key, 1);
    assert_eq!(stats.metadata_published, 1);
    assert_eq!(stats.frames_published, 1);
    assert_eq!(stats.protocol_errors, 1);

    let meta_out = out_rx.recv().await.unwrap();
    assert_eq!(meta_out.topic, "cpsns/s/n/ch1/detrend/metadata");
    let data_out = out_rx.recv().await.unwrap();
    assert_eq!(data_out.topic, "cpsns/s/n/ch1/detrend/data");
    assert_eq!(&data_out.payload[4..], &[0u8; 16]);
    assert!(out_rx.try_recv().is_err());

    let state = app_state.read().await;
    assert_eq!(state.status, SystemStatus::Stopped);
    assert_eq!(state.source, "channel");
    assert_eq!(state.stats, stats);
    assert_eq!(state.streams.len(), 1);
    assert!(state.last_message_time.is_some());
}

#[tokio::test]
async fn test_loop_stops_on_cancellation() {
    let (in_tx, in_rx) = mpsc::channel::<BusMessage>(16);
    let (out_tx, _out_rx) = mpsc::channel(16);

    let (processing_loop, app_state, token) = new_loop(Dispatcher::new(Stage::detrend()));
    let handle = tokio::spawn(async move {
        let mut source = ChannelSource::new(in_rx);
        let mut sink = ChannelSink::new(out_tx);
        processing_loop.run(&mut source, &mut sink).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert_eq!(stats.messages_received, 0);
    assert_eq!(app_state.read().await.status, SystemStatus::Stopped);
    drop(in_tx);
}

#[tokio::test]
async fn test_sink_failure_marks_error() {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);
    drop(out_rx);

    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/metadata", META.to_vec()))
        .await
        .unwrap();
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch2/raw/metadata", META.to_vec()))
        .await
        .unwrap();

    let (processing_loop, app_state, _token) = new_loop(Dispatcher::new(Stage::detrend()));
    let mut source = ChannelSource::new(in_rx);
    let mut sink = ChannelSink::new(out_tx);
    let stats = processing_loop.run(&mut source, &mut sink).await;

    // Loop stops after the first failed publish
    assert_eq!(stats.messages_received, 1);
    assert_eq!(app_state.read().await.status, SystemStatus::Error);
}

struct FailingSource;

#[async_trait]
impl MessageSource for FailingSource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        anyhow::bail!("bridge vanished")
    }

    fn source_name(&self) -> &str {
        "failing"
    }
}

#[tokio::test]
async fn test_source_failure_marks_error() {
    let (out_tx, _out_rx) = mpsc::channel(16);
    let (processing_loop, app_state, _token) = new_loop(Dispatcher::new(Stage::detrend()));

    let mut sink = ChannelSink::new(out_tx);
    let stats = processing_loop.run(&mut FailingSource, &mut sink).await;

    assert_eq!(stats.messages_received, 0);
    let state = app_state.read().await;
    assert_eq!(state.status, SystemStatus::Error);
    assert_eq!(state.source, "failing");
}

#[tokio::test]
async fn test_idle_sweep_runs_between_messages() {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, _out_rx) = mpsc::channel(16);

    let dispatcher = Dispatcher::new(Stage::detrend())
        .with_retention(RetentionPolicy::Idle(Duration::from_millis(30)));
    let (processing_loop, app_state, _token) = new_loop(dispatcher);
    let processing_loop = processing_loop.with_sweep_interval(Duration::ZERO);

    let handle = tokio::spawn(async move {
        let mut source = ChannelSource::new(in_rx);
        let mut sink = ChannelSink::new(out_tx);
        processing_loop.run(&mut source, &mut sink).await
    });

    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/metadata", META.to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch2/raw/metadata", META.to_vec()))
        .await
        .unwrap();
    drop(in_tx);

    let stats = handle.await.unwrap();
    assert_eq!(stats.streams_created, 2);
    assert_eq!(stats.evictions, 1);

    let state = app_state.read().await;
    assert_eq!(state.streams.len(), 1);
    assert_eq!(state.streams[0].key, "cpsns/s/n/ch2/raw");
}

/// Encodes every published message into an in-memory envelope stream.
#[derive(Default)]
struct BufferSink {
    wire: Vec<u8>,
}

#[async_trait]
impl MessageSink for BufferSink {
    async fn publish(&mut self, message: BusMessage) -> Result<()> {
        write_envelope(&mut self.wire, &message)
            .await
            .context("writing envelope to buffer")
    }

    fn sink_name(&self) -> &str {
        "buffer"
    }
}

#[tokio::test]
async fn test_unencodable_output_is_dropped_and_loop_continues() {
    let (in_tx, in_rx) = mpsc::channel(16);

    // Fits the u16 prefix on input, overflows it once `raw` becomes `detrend`
    let long_topic = format!("cpsns/{}/raw/metadata", "x".repeat(65_515));
    assert_eq!(long_topic.len(), 65_534);
    in_tx
        .send(BusMessage::new(long_topic, META.to_vec()))
        .await
        .unwrap();
    in_tx
        .send(BusMessage::new("cpsns/s/n/ch1/raw/metadata", META.to_vec()))
        .await
        .unwrap();
    drop(in_tx);

    let (processing_loop, app_state, _token) = new_loop(Dispatcher::new(Stage::detrend()));
    let mut source = ChannelSource::new(in_rx);
    let mut sink = BufferSink::default();
    let stats = processing_loop.run(&mut source, &mut sink).await;

    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.publish_errors, 1);
    assert_eq!(app_state.read().await.status, SystemStatus::Stopped);

    let mut reader = sink.wire.as_slice();
    let published = read_envelope(&mut reader).await.unwrap().unwrap();
    assert_eq!(published.topic, "cpsns/s/n/ch1/detrend/metadata");
    assert_eq!(read_envelope(&mut reader).await.unwrap(), None);
}
