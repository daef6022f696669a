//! Message source and sink abstractions for the bus bridge.
//!
//! Sources yield inbound [`BusMessage`]s; sinks publish the dispatcher's
//! output. Both speak the length-prefixed envelope from
//! [`envelope`](super::envelope) when backed by a byte stream:
//! stdin/stdout (bridge process piped in) or TCP (bridge reachable over the
//! network). Channel variants run the loop in process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Duration;

use super::envelope::{read_envelope, write_envelope, BusMessage, EnvelopeError};
use crate::config::defaults::{
    CONNECT_TIMEOUT_SECS, INITIAL_RECONNECT_DELAY_SECS, MAX_RECONNECT_ATTEMPTS,
    MAX_RECONNECT_DELAY_SECS, TCP_KEEPALIVE_INTERVAL_SECS, TCP_KEEPALIVE_TIME_SECS,
};

/// Events produced by a message source.
#[derive(Debug)]
pub enum SourceEvent {
    Message(BusMessage),
    /// No more messages (EOF on stdin, closed channel, exhausted reconnects).
    Eof,
}

/// Where inbound bus messages come from.
///
/// The processing loop calls [`next_message`](MessageSource::next_message)
/// inside a `select!` with cancellation; a message only partially read when
/// cancellation fires is discarded.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Returns `Err` on unrecoverable errors only.
    async fn next_message(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging (e.g. "stdin", "tcp").
    fn source_name(&self) -> &str;
}

/// Where dispatcher output goes.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn publish(&mut self, message: BusMessage) -> Result<()>;

    fn sink_name(&self) -> &str;
}

// ============================================================================
// Stdin / Stdout
// ============================================================================

/// Reads envelopes from stdin.
///
/// `mqtt-bridge --sub 'cpsens/#' | cpsens-stream --stdin | mqtt-bridge --pub`
pub struct StdinSource {
    reader: BufReader<tokio::io::Stdin>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for StdinSource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        next_from_reader(&mut self.reader, "stdin").await
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

/// Next message from an envelope byte stream. Envelopes that cannot be
/// delivered on their own (bad topic, oversized payload) are skipped.
async fn next_from_reader<R>(reader: &mut R, name: &str) -> Result<SourceEvent>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    loop {
        match read_envelope(reader).await {
            Ok(Some(message)) => return Ok(SourceEvent::Message(message)),
            Ok(None) => return Ok(SourceEvent::Eof),
            Err(EnvelopeError::Truncated) => {
                tracing::warn!(source = name, "Input ended inside an envelope");
                return Ok(SourceEvent::Eof);
            }
            Err(e) if e.is_per_message() => {
                tracing::warn!(source = name, error = %e, "Skipped undeliverable envelope");
            }
            Err(e) => return Err(e).with_context(|| format!("reading envelope from {}", name)),
        }
    }
}

/// Writes envelopes to stdout, flushing after each.
pub struct StdoutSink {
    writer: BufWriter<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            writer: BufWriter::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for StdoutSink {
    async fn publish(&mut self, message: BusMessage) -> Result<()> {
        write_envelope(&mut self.writer, &message)
            .await
            .context("writing envelope to stdout")
    }

    fn sink_name(&self) -> &str {
        "stdout"
    }
}

// ============================================================================
// TCP
// ============================================================================

/// Connect with timeout and enable TCP keepalive to detect dead peers.
async fn connect_tcp(addr: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(addr),
    )
    .await
    .with_context(|| format!("connect to {} timed out", addr))?
    .with_context(|| format!("connect to {} failed", addr))?;

    let sock_ref = socket2::SockRef::from(&stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_TIME_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_INTERVAL_SECS));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "Could not enable TCP keepalive");
    }
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Could not disable Nagle on bridge socket");
    }

    Ok(stream)
}

/// Reconnect with exponential backoff. Err once all attempts are exhausted.
async fn reconnect_tcp(addr: &str, role: &str) -> Result<TcpStream> {
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        let delay_secs = (INITIAL_RECONNECT_DELAY_SECS * 2u64.saturating_pow(attempt - 1))
            .min(MAX_RECONNECT_DELAY_SECS);

        tracing::warn!(
            address = %addr,
            role = role,
            attempt = attempt,
            max_attempts = MAX_RECONNECT_ATTEMPTS,
            delay_secs = delay_secs,
            "Bridge reconnecting"
        );
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;

        match connect_tcp(addr).await {
            Ok(stream) => {
                tracing::info!(address = %addr, role = role, attempt = attempt, "Bridge reconnected");
                return Ok(stream);
            }
            Err(e) => tracing::warn!(attempt = attempt, error = %e, "Reconnection attempt failed"),
        }
    }

    tracing::error!(address = %addr, role = role, "Bridge reconnection exhausted");
    anyhow::bail!(
        "failed to reconnect to {} after {} attempts",
        addr,
        MAX_RECONNECT_ATTEMPTS
    )
}

/// Reads envelopes from a TCP bridge, reconnecting on disconnect.
pub struct TcpSource {
    addr: String,
    reader: Option<BufReader<TcpStream>>,
    reconnections: u64,
}

impl TcpSource {
    /// Connect to the bridge and return a ready source.
    pub async fn connect(addr: &str) -> Result<Self> {
        tracing::info!(address = %addr, "Connecting to bridge (subscribe side)");
        let stream = connect_tcp(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            reader: Some(BufReader::new(stream)),
            reconnections: 0,
        })
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections
    }
}

#[async_trait]
impl MessageSource for TcpSource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        loop {
            if self.reader.is_none() {
                let stream = reconnect_tcp(&self.addr, "subscribe").await?;
                self.reconnections += 1;
                self.reader = Some(BufReader::new(stream));
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            match read_envelope(reader).await {
                Ok(Some(message)) => return Ok(SourceEvent::Message(message)),
                Ok(None) => {
                    tracing::warn!(address = %self.addr, "Bridge closed the connection");
                }
                Err(e) if e.is_per_message() => {
                    tracing::warn!(address = %self.addr, error = %e, "Skipped undeliverable envelope");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(address = %self.addr, error = %e, "Bridge read failed");
                }
            }
            self.reader = None;
        }
    }

    fn source_name(&self) -> &str {
        "tcp"
    }
}

/// Writes envelopes to a TCP bridge, reconnecting once per failed write.
pub struct TcpSink {
    addr: String,
    writer: Option<BufWriter<TcpStream>>,
}

impl TcpSink {
    pub async fn connect(addr: &str) -> Result<Self> {
        tracing::info!(address = %addr, "Connecting to bridge (publish side)");
        let stream = connect_tcp(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            writer: Some(BufWriter::new(stream)),
        })
    }
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn publish(&mut self, message: BusMessage) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            match write_envelope(writer, &message).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_per_message() => {
                    return Err(e).context("encoding outbound envelope");
                }
                Err(e) => {
                    tracing::warn!(address = %self.addr, error = %e, "Bridge write failed");
                    let _ = writer.shutdown().await;
                    self.writer = None;
                }
            }
        }

        let stream = reconnect_tcp(&self.addr, "publish").await?;
        let writer = self.writer.insert(BufWriter::new(stream));
        write_envelope(writer, &message)
            .await
            .context("writing envelope after reconnect")
    }

    fn sink_name(&self) -> &str {
        "tcp"
    }
}

// ============================================================================
// In-process channels
// ============================================================================

/// Receives messages from an mpsc channel; EOF when all senders drop.
pub struct ChannelSource {
    rx: mpsc::Receiver<BusMessage>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        Ok(match self.rx.recv().await {
            Some(message) => SourceEvent::Message(message),
            None => SourceEvent::Eof,
        })
    }

    fn source_name(&self) -> &str {
        "channel"
    }
}

/// Forwards published messages into an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<BusMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BusMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn publish(&mut self, message: BusMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("output channel closed"))
    }

    fn sink_name(&self) -> &str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_channel_source_eof_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = ChannelSource::new(rx);
        tx.send(BusMessage::new("a/data", vec![1])).await.unwrap();
        drop(tx);

        match source.next_message().await.unwrap() {
            SourceEvent::Message(m) => assert_eq!(m.topic, "a/data"),
            SourceEvent::Eof => panic!("expected a message"),
        }
        assert!(matches!(source.next_message().await.unwrap(), SourceEvent::Eof));
    }

    #[tokio::test]
    async fn test_channel_sink_errors_when_receiver_drops() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);
        drop(rx);
        assert!(sink.publish(BusMessage::new("a/data", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_skips_envelope_with_invalid_topic() {
        let mut wire = vec![2, 0, 0xc3, 0x28, 1, 0, 0, 0, 9];
        wire.extend(BusMessage::new("cpsns/s/n/ch1/raw/data", vec![1]).encode().unwrap());
        let mut reader = wire.as_slice();

        match next_from_reader(&mut reader, "test").await.unwrap() {
            SourceEvent::Message(m) => assert_eq!(m.topic, "cpsns/s/n/ch1/raw/data"),
            SourceEvent::Eof => panic!("valid envelope after the bad one was lost"),
        }
        assert!(matches!(
            next_from_reader(&mut reader, "test").await.unwrap(),
            SourceEvent::Eof
        ));
    }

    #[tokio::test]
    async fn test_reader_truncation_is_eof() {
        let wire = BusMessage::new("a/data", vec![1, 2, 3]).encode().unwrap();
        let mut reader = &wire[..wire.len() - 2];
        assert!(matches!(
            next_from_reader(&mut reader, "test").await.unwrap(),
            SourceEvent::Eof
        ));
    }

    #[tokio::test]
    async fn test_tcp_source_skips_invalid_topic_without_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[1, 0, 0xff, 0, 0, 0, 0]).await.unwrap();
            let msg = BusMessage::new("cpsns/s/n/ch1/raw/metadata", b"{}".to_vec());
            write_envelope(&mut socket, &msg).await.unwrap();
            let mut buf = [0u8; 1];
            let _ = socket.read(&mut buf).await;
        });

        let mut source = TcpSource::connect(&addr).await.unwrap();
        match source.next_message().await.unwrap() {
            SourceEvent::Message(m) => assert_eq!(m.topic, "cpsns/s/n/ch1/raw/metadata"),
            SourceEvent::Eof => panic!("expected a message"),
        }
        assert_eq!(source.reconnections(), 0);
        drop(source);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_source_reads_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let msg = BusMessage::new("cpsns/s/n/ch1/raw/metadata", b"{}".to_vec());
            write_envelope(&mut socket, &msg).await.unwrap();
            // Keep the connection open until the client has read
            let mut buf = [0u8; 1];
            let _ = socket.read(&mut buf).await;
        });

        let mut source = TcpSource::connect(&addr).await.unwrap();
        match source.next_message().await.unwrap() {
            SourceEvent::Message(m) => {
                assert_eq!(m.topic, "cpsns/s/n/ch1/raw/metadata");
                assert_eq!(m.payload, b"{}".to_vec());
            }
            SourceEvent::Eof => panic!("expected a message"),
        }
        assert_eq!(source.reconnections(), 0);
        drop(source);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_sink_writes_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_envelope(&mut socket).await.unwrap()
        });

        let mut sink = TcpSink::connect(&addr).await.unwrap();
        let msg = BusMessage::new("cpsns/s/n/ch1/detrend/data", vec![4, 0, 1, 0]);
        sink.publish(msg.clone()).await.unwrap();

        assert_eq!(server.await.unwrap(), Some(msg));
    }
}
