//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Kalman Integrator
// ============================================================================

/// Q: process-noise scalar injected through the control channel.
pub const DEFAULT_PROCESS_NOISE: f64 = 1e-6;

/// R: variance of the zero pseudo-measurement on position.
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 1e-10;

// ============================================================================
// Stream Registry
// ============================================================================

/// Entry cap for `retention = "max_streams"`.
pub const DEFAULT_MAX_STREAMS: usize = 4_096;

/// Idle timeout for `retention = "idle"` (seconds). 3 600 = 1 hour.
pub const DEFAULT_IDLE_SECS: u64 = 3_600;

/// How often the processing loop sweeps idle entries (seconds).
pub const IDLE_SWEEP_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Processing Loop
// ============================================================================

/// Messages between progress log lines.
pub const DEFAULT_PROGRESS_EVERY: u64 = 1_000;

/// Default subscription: everything.
pub const DEFAULT_SUBSCRIPTION: &str = "#";

// ============================================================================
// Bridge Transport
// ============================================================================

/// Largest payload accepted in one bridge envelope (bytes). 64 MiB.
pub const MAX_ENVELOPE_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Maximum reconnection attempts before a TCP source gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial reconnection delay (doubles each attempt).
pub const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;

/// Maximum reconnection delay cap (seconds).
pub const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// TCP connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// TCP keepalive idle time before probing (seconds).
pub const TCP_KEEPALIVE_TIME_SECS: u64 = 30;

/// TCP keepalive probe interval (seconds).
pub const TCP_KEEPALIVE_INTERVAL_SECS: u64 = 10;

// ============================================================================
// Status Server
// ============================================================================

/// Status API bind address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8090";

/// Per-request timeout on the status API (seconds).
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 10;

/// In-flight request cap on the status API.
pub const HTTP_MAX_CONCURRENT_REQUESTS: usize = 64;
