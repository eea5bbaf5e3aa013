//! # Ticker Feed SDK
//!
//! Real-time cryptocurrency quote streaming over the public Binance and
//! Coincap WebSocket APIs, with one-shot catalog lookups for symbol lists,
//! asset metadata and fiat conversion rates.
//!
//! Each feed owns a single streaming connection, maintains an in-memory
//! quote cache keyed by the tracked identifiers and broadcasts a full
//! snapshot to subscribers whenever the cache changes. A periodic refresh
//! clock re-emits the latest snapshot and repairs dropped connections.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use ticker_feed_sdk::BinanceFeed;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let feed = BinanceFeed::new(&["BTC", "ETH"], Duration::from_secs(5))?;
//! let mut updates = feed.subscribe();
//!
//! while let Ok(snapshot) = updates.recv().await {
//!     for (symbol, tick) in &snapshot {
//!         match tick {
//!             Some(tick) => println!("{symbol}: {}", tick.close),
//!             None => println!("{symbol}: waiting for first quote"),
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod constants;
pub mod error;
pub mod feeds;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use catalog::{AssetInfo, CatalogCache, RateInfo};
pub use error::{CatalogError, FeedError, TransportError};
pub use feeds::{BinanceFeed, CoincapFeed};
pub use types::{ConnectionState, MiniTicker, QuoteSnapshot, TickerSnapshot};
