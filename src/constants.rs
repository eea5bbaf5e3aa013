//! Constants for the ticker feed SDK
//!
//! All configuration for the feeds is centralized here. No runtime
//! configuration files are used - the feeds operate with these compile-time
//! values and take only the tracked identifiers, an optional API key and the
//! refresh interval at runtime.

/// Binance websocket endpoint; streams are selected with SUBSCRIBE requests.
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws/ticker";

/// Binance REST API base URL (exchange symbol catalog).
pub const BINANCE_API_URL: &str = "https://api.binance.com";

/// Coincap price stream endpoint; the tracked asset list is appended as a
/// query parameter.
pub const COINCAP_WS_URL: &str = "wss://ws.coincap.io/prices";

/// Coincap REST API base URL (asset and rate catalogs).
pub const COINCAP_API_URL: &str = "https://api.coincap.io";

/// Delay before re-attempting a dropped price stream connection (in milliseconds).
pub const RECONNECT_DELAY_MS: u64 = 5000;

/// Sleep between retries when a catalog endpoint answers HTTP 429 (in milliseconds).
pub const RATE_LIMIT_BACKOFF_MS: u64 = 5000;

/// Default cadence for re-emitting the current quote snapshot (in milliseconds).
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 5000;

/// HTTP request timeout for catalog fetches (in seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Buffered snapshots per subscriber before older ones are dropped.
pub const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// User agent for catalog requests.
pub const USER_AGENT: &str = "ticker-feed-sdk/0.1.0";
