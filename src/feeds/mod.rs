//! Feed connection managers
//!
//! Each feed owns a single logical streaming subscription, merges inbound
//! price updates into its quote cache and notifies subscribers. The two
//! variants differ in their wire protocol and reconnect policy:
//!
//! - [`BinanceFeed`] multiplexes streams over one socket, replaces
//!   subscriptions in place and relies on the refresh clock's health check
//!   to repair dropped connections.
//! - [`CoincapFeed`] encodes the tracked assets in the connection URL,
//!   reconnects fully when they change and schedules a timed reconnect
//!   after every close event.

pub mod binance;
pub mod coincap;

pub use binance::BinanceFeed;
pub use coincap::CoincapFeed;

/// Lowercases and dedupes identifiers, preserving first-seen order.
pub(crate) fn normalise_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let lower = id.as_ref().to_lowercase();
        if !out.contains(&lower) {
            out.push(lower);
        }
    }
    out
}
