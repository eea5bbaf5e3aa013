//! Binance miniTicker stream connection manager
//!
//! Tracks a set of base symbols against their USDT pairs over a single
//! multiplexed websocket. Symbol changes are applied in place by resending
//! the subscription on the live connection; dropped connections are
//! repaired by the refresh clock's health check rather than a dedicated
//! reconnect timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::constants::{BINANCE_WS_URL, UPDATE_CHANNEL_CAPACITY};
use crate::error::FeedError;
use crate::feeds::normalise_ids;
use crate::transport::{FeedTransport, WireMessage, WsTransport};
use crate::types::{ConnectionState, MiniTicker, TickerSnapshot};

enum Command {
    /// Write a text frame on the live socket.
    Send(String),
    /// Close the socket with a normal closure and stop.
    Close,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    e: String,
    s: String,
    c: String,
}

/// Decodes an inbound payload, discarding anything that is not a
/// `24hrMiniTicker` event.
fn parse_ticker(text: &str) -> Option<MiniTicker> {
    let raw: RawTicker = serde_json::from_str(text).ok()?;
    if raw.e != "24hrMiniTicker" {
        return None;
    }
    Some(MiniTicker {
        symbol: raw.s,
        close: raw.c,
    })
}

/// Maps a wire pair symbol (`BTCUSDT`) back to the tracked base (`btc`).
fn base_symbol(wire: &str) -> Option<String> {
    wire.to_lowercase().strip_suffix("usdt").map(str::to_string)
}

struct Shared {
    transport: Arc<dyn FeedTransport>,
    symbols: RwLock<Vec<String>>,
    ticks: RwLock<HashMap<String, Option<MiniTicker>>>,
    state: RwLock<ConnectionState>,
    request_id: AtomicU64,
    initialised: AtomicBool,
    destroyed: AtomicBool,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    updates: broadcast::Sender<TickerSnapshot>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    fn snapshot(&self) -> TickerSnapshot {
        self.ticks.read().unwrap().clone()
    }

    fn emit(&self) {
        let _ = self.updates.send(self.snapshot());
    }

    fn send_command(&self, command: Command) -> bool {
        match self.commands.lock().unwrap().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Serialises a subscribe/unsubscribe request with the next request id.
    /// Ids increase monotonically and restart at 0 on each connection;
    /// acks are ignored.
    fn stream_request(&self, method: &str, symbols: &[String]) -> String {
        let params: Vec<String> = symbols
            .iter()
            .map(|symbol| format!("{symbol}usdt@miniTicker"))
            .collect();
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        serde_json::json!({ "method": method, "params": params, "id": id }).to_string()
    }

    fn import_message(&self, text: &str) {
        let Some(tick) = parse_ticker(text) else {
            return;
        };
        let Some(base) = base_symbol(&tick.symbol) else {
            return;
        };
        {
            let mut ticks = self.ticks.write().unwrap();
            // Stale streams can still deliver after an unsubscribe.
            if !ticks.contains_key(&base) {
                return;
            }
            ticks.insert(base, Some(tick));
        }
        self.initialised.store(true, Ordering::SeqCst);
        self.emit();
    }

    fn spawn_connection(self: Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.write().unwrap();
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Open) {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        tokio::spawn(async move { self.run_connection().await });
    }

    async fn run_connection(self: Arc<Self>) {
        let symbols = self.symbols.read().unwrap().clone();
        info!(symbols = %symbols.join(","), "connecting ticker stream");

        let mut socket = match self.transport.connect(BINANCE_WS_URL).await {
            Ok(socket) => socket,
            Err(e) => {
                // The refresh clock's health check retries later.
                error!(error = %e, "ticker stream connect failed");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        if self.destroyed.load(Ordering::SeqCst) {
            let _ = socket.close().await;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.commands.lock().unwrap() = Some(tx);
        self.request_id.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Open);
        info!("ticker stream connected");

        // Re-read the tracked set: a replacement that landed during the
        // handshake missed the command channel and must shape the first
        // subscribe. A replacement from here on goes through the channel.
        let symbols = self.symbols.read().unwrap().clone();
        let subscribe = self.stream_request("SUBSCRIBE", &symbols);
        if let Err(e) = socket.send_text(&subscribe).await {
            error!(error = %e, "subscribe request failed");
        }

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = socket.send_text(&frame).await {
                            error!(error = %e, "stream request failed");
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.set_state(ConnectionState::Closing);
                        let _ = socket.close().await;
                        break;
                    }
                },
                message = socket.recv() => match message {
                    Some(Ok(WireMessage::Text(text))) => self.import_message(&text),
                    Some(Ok(WireMessage::Other)) => {}
                    Some(Ok(WireMessage::Close)) | None => {
                        info!("ticker stream closed by server");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "ticker stream error");
                        break;
                    }
                },
            }
        }

        *self.commands.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Connection manager for the Binance miniTicker stream.
///
/// Must be created inside a tokio runtime; the connection and the refresh
/// clock run as background tasks.
pub struct BinanceFeed {
    shared: Arc<Shared>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl BinanceFeed {
    /// Creates a feed tracking `symbols` and opens the connection.
    ///
    /// Fails with [`FeedError::EmptySymbolSet`] before any connection
    /// attempt if `symbols` is empty.
    pub fn new<S: AsRef<str>>(
        symbols: &[S],
        refresh_interval: Duration,
    ) -> Result<Self, FeedError> {
        Self::with_transport(symbols, refresh_interval, Arc::new(WsTransport))
    }

    /// Creates a feed over a custom transport. Primarily for tests.
    pub fn with_transport<S: AsRef<str>>(
        symbols: &[S],
        refresh_interval: Duration,
        transport: Arc<dyn FeedTransport>,
    ) -> Result<Self, FeedError> {
        let symbols = normalise_ids(symbols);
        if symbols.is_empty() {
            return Err(FeedError::EmptySymbolSet);
        }

        let ticks = symbols
            .iter()
            .map(|symbol| (symbol.clone(), None))
            .collect();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            transport,
            symbols: RwLock::new(symbols),
            ticks: RwLock::new(ticks),
            state: RwLock::new(ConnectionState::Disconnected),
            request_id: AtomicU64::new(0),
            initialised: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            commands: Mutex::new(None),
            updates,
        });

        shared.clone().spawn_connection();

        let feed = Self {
            shared,
            refresh_task: Mutex::new(None),
        };
        feed.configure_refresh_interval(refresh_interval);
        Ok(feed)
    }

    /// Replaces the tracked symbol set.
    ///
    /// Cache values are preserved for symbols that remain tracked, removed
    /// symbols are dropped and new ones start unknown. The subscription is
    /// replaced on the live connection without reconnecting.
    pub fn set_symbols<S: AsRef<str>>(&self, symbols: &[S]) -> Result<(), FeedError> {
        let symbols = normalise_ids(symbols);
        if symbols.is_empty() {
            return Err(FeedError::EmptySymbolSet);
        }

        let previous = {
            let mut tracked = self.shared.symbols.write().unwrap();
            std::mem::replace(&mut *tracked, symbols.clone())
        };
        {
            let mut ticks = self.shared.ticks.write().unwrap();
            let next = symbols
                .iter()
                .map(|symbol| (symbol.clone(), ticks.get(symbol).cloned().flatten()))
                .collect();
            *ticks = next;
        }

        let unsubscribe = self.shared.stream_request("UNSUBSCRIBE", &previous);
        let subscribe = self.shared.stream_request("SUBSCRIBE", &symbols);
        // Without a command channel the in-flight or next connect reads
        // the new set itself when it opens.
        if self.shared.send_command(Command::Send(unsubscribe)) {
            self.shared.send_command(Command::Send(subscribe));
        }
        Ok(())
    }

    /// Registers a subscriber; every received snapshot is complete and
    /// consistent at the time of emission.
    pub fn subscribe(&self) -> broadcast::Receiver<TickerSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Current cache snapshot.
    pub fn quotes(&self) -> TickerSnapshot {
        self.shared.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Reschedules the refresh clock. Each tick re-emits the current
    /// snapshot once the first message has arrived, and reconnects a
    /// dropped stream.
    pub fn configure_refresh_interval(&self, interval: Duration) {
        let mut slot = self.refresh_task.lock().unwrap();
        if let Some(task) = slot.take() {
            task.abort();
        }
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let shared = self.shared.clone();
        *slot = Some(tokio::spawn(async move {
            let mut clock = tokio::time::interval(interval);
            // The first tick of a tokio interval completes immediately.
            clock.tick().await;
            loop {
                clock.tick().await;
                if shared.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                if shared.initialised.load(Ordering::SeqCst) {
                    shared.emit();
                }
                if shared.state() == ConnectionState::Disconnected {
                    debug!("ticker stream down, health check reconnecting");
                    shared.clone().spawn_connection();
                }
            }
        }));
    }

    /// Tears the feed down: suppresses reconnects, cancels the refresh
    /// clock and closes a live socket with a normal closure. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("destroying ticker feed");
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.send_command(Command::Close);
    }
}

impl Drop for BinanceFeed {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::advance;

    use super::*;
    use crate::transport::mock::MockTransport;

    const REFRESH: Duration = Duration::from_millis(100);

    /// Lets the spawned connection and clock tasks run.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn tick(symbol: &str, close: &str) -> String {
        format!(r#"{{"e":"24hrMiniTicker","s":"{symbol}","c":"{close}"}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_cache_with_unknown_prices() {
        let transport = MockTransport::new();
        let _remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC", "eth", "BTC"], REFRESH, transport).unwrap();
        settle().await;

        let quotes = feed.quotes();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes["btc"], None);
        assert_eq!(quotes["eth"], None);
        assert_eq!(feed.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn rejects_empty_symbol_set() {
        let transport = MockTransport::new();
        let result = BinanceFeed::with_transport::<&str>(&[], REFRESH, transport.clone());
        assert!(matches!(result, Err(FeedError::EmptySymbolSet)));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_subscribe_request_on_open() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let _feed = BinanceFeed::with_transport(&["BTC", "ETH"], REFRESH, transport).unwrap();
        settle().await;

        let frames = remote.sent_frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["params"][0], "btcusdt@miniTicker");
        assert_eq!(frame["params"][1], "ethusdt@miniTicker");
        assert_eq!(frame["id"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn merges_recognised_ticks() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC", "ETH"], REFRESH, transport).unwrap();
        settle().await;
        let mut updates = feed.subscribe();

        remote.send_text(&tick("BTCUSDT", "50000.00"));
        settle().await;

        let snapshot = updates.try_recv().unwrap();
        assert_eq!(
            snapshot["btc"],
            Some(MiniTicker {
                symbol: "BTCUSDT".to_string(),
                close: "50000.00".to_string(),
            })
        );
        assert_eq!(snapshot["eth"], None);
    }

    #[tokio::test(start_paused = true)]
    async fn last_write_wins_per_symbol() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport).unwrap();
        settle().await;

        remote.send_text(&tick("BTCUSDT", "1.00"));
        remote.send_text(&tick("BTCUSDT", "2.00"));
        settle().await;

        assert_eq!(feed.quotes()["btc"].as_ref().unwrap().close, "2.00");
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_unrecognised_messages() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport).unwrap();
        settle().await;
        let mut updates = feed.subscribe();

        // Subscribe ack, an unrelated event kind and a malformed payload.
        remote.send_text(r#"{"result":null,"id":0}"#);
        remote.send_text(r#"{"e":"24hrTicker","s":"BTCUSDT","c":"1.00"}"#);
        remote.send_text("not json");
        settle().await;

        assert_eq!(feed.quotes()["btc"], None);
        assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_symbols_in_place() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed =
            BinanceFeed::with_transport(&["ETH", "BTC"], REFRESH, transport.clone()).unwrap();
        settle().await;

        remote.send_text(&tick("ETHUSDT", "3000.00"));
        settle().await;

        feed.set_symbols(&["ETH"]).unwrap();
        settle().await;

        let quotes = feed.quotes();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes["eth"].as_ref().unwrap().close, "3000.00");

        // No reconnect; the subscription was replaced on the live socket.
        assert_eq!(transport.connect_count(), 1);
        let frames = remote.sent_frames();
        assert_eq!(frames.len(), 3);
        let unsubscribe: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(unsubscribe["method"], "UNSUBSCRIBE");
        assert_eq!(unsubscribe["params"][0], "ethusdt@miniTicker");
        assert_eq!(unsubscribe["params"][1], "btcusdt@miniTicker");
        assert_eq!(unsubscribe["id"], 1);
        let subscribe: serde_json::Value = serde_json::from_str(&frames[2]).unwrap();
        assert_eq!(subscribe["method"], "SUBSCRIBE");
        assert_eq!(subscribe["params"][0], "ethusdt@miniTicker");
        assert_eq!(subscribe["id"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_during_handshake_shapes_first_subscribe() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        transport.hold_connects();
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport.clone()).unwrap();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Connecting);

        // The connect is still in flight; no command channel exists yet.
        feed.set_symbols(&["ETH"]).unwrap();
        transport.release_connects();
        settle().await;

        assert_eq!(feed.state(), ConnectionState::Open);
        assert_eq!(transport.connect_count(), 1);
        let frames = remote.sent_frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["params"][0], "ethusdt@miniTicker");
        assert_eq!(frame["params"].as_array().unwrap().len(), 1);

        // The replacement set receives wire data.
        remote.send_text(&tick("ETHUSDT", "3000.00"));
        settle().await;
        assert_eq!(feed.quotes()["eth"].as_ref().unwrap().close, "3000.00");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_clock_gates_on_first_message() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport).unwrap();
        settle().await;
        let mut updates = feed.subscribe();

        // Nothing received yet: ticks pass without emitting the
        // all-unknown snapshot.
        advance(Duration::from_millis(250)).await;
        settle().await;
        assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));

        remote.send_text(&tick("BTCUSDT", "50000.00"));
        settle().await;
        updates.try_recv().unwrap(); // message-driven emission

        advance(Duration::from_millis(150)).await;
        settle().await;
        let snapshot = updates.try_recv().unwrap(); // periodic re-emission
        assert_eq!(snapshot["btc"].as_ref().unwrap().close, "50000.00");
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_reconnects_after_close() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport.clone()).unwrap();
        settle().await;

        let remote2 = transport.expect_connection();
        remote.close_stream();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Disconnected);

        advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(feed.state(), ConnectionState::Open);

        // Request ids restart on the new connection.
        let frames = remote2.sent_frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["id"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_retries_failed_connects() {
        let transport = MockTransport::new();
        // Empty script: the initial connect fails.
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport.clone()).unwrap();
        settle().await;
        assert_eq!(feed.state(), ConnectionState::Disconnected);

        let _remote = transport.expect_connection();
        advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(feed.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_halts_reconnects_and_updates() {
        let transport = MockTransport::new();
        let remote = transport.expect_connection();
        let feed = BinanceFeed::with_transport(&["BTC"], REFRESH, transport.clone()).unwrap();
        settle().await;

        remote.send_text(&tick("BTCUSDT", "50000.00"));
        settle().await;
        let mut updates = feed.subscribe();

        feed.destroy();
        settle().await;
        assert!(remote.is_closed());

        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(transport.connect_count(), 1);
        assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));

        // Idempotent.
        feed.destroy();
    }
}
