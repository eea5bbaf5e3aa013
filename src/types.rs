//! Shared types for the feed connection managers

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle of the streaming connection owned by a feed.
///
/// A feed owns at most one live connection; the previous one is closed
/// before a replacement becomes authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; a reconnect may be pending.
    Disconnected,
    /// Transport handshake in flight.
    Connecting,
    /// Connected and subscribed.
    Open,
    /// Normal closure initiated.
    Closing,
}

/// Latest miniTicker extraction for one tracked symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniTicker {
    /// Exchange pair symbol as it appears on the wire, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Close price as reported, kept as the exchange's decimal string.
    pub close: String,
}

/// Snapshot emitted by the Binance-style feed: tracked base symbol to the
/// latest tick, `None` until the first message for that symbol arrives.
pub type TickerSnapshot = HashMap<String, Option<MiniTicker>>;

/// Snapshot emitted by the Coincap-style feed: asset id to the latest USD
/// price, `None` while the price is still unknown.
pub type QuoteSnapshot = HashMap<String, Option<f64>>;
