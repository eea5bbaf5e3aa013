//! Error types for the ticker feed SDK

use thiserror::Error;

/// Errors visible to direct callers of the feed constructors.
///
/// The streaming path never raises to subscribers; transport and protocol
/// failures degrade to "no update this tick" plus a reconnect attempt.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The tracked symbol set may never be empty.
    #[error("attempted to create a feed that watches no symbols")]
    EmptySymbolSet,

    /// The catalog HTTP client could not be built.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Streaming transport failures. Logged and fed into the reconnect policy,
/// never propagated to subscribers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket protocol or I/O error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport could not be established
    #[error("connect failed: {0}")]
    Connect(String),

    /// Operation on a socket that is no longer open
    #[error("socket closed")]
    Closed,
}

/// Catalog fetch failures.
///
/// HTTP 429 never appears here; the fetch loop recovers from rate limiting
/// by sleeping and retrying.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Network request failed
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-200, non-429 status
    #[error("unexpected status: HTTP {0}")]
    Status(u16),

    /// Response body did not match the expected shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
