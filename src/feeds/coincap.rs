//! Coincap price stream connection manager
//!
//! Tracks a set of Coincap asset ids. The tracked set is encoded in the
//! connection URL, so replacing it means a full reconnect. Close events
//! schedule exactly one timed reconnect attempt; the refresh clock only
//! acts as a backstop when no attempt is pending. Unknown prices are
//! seeded from the one-shot asset catalog on a best-effort basis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::catalog::{AssetInfo, CatalogCache};
use crate::constants::{COINCAP_WS_URL, RECONNECT_DELAY_MS, UPDATE_CHANNEL_CAPACITY};
use crate::error::FeedError;
use crate::feeds::normalise_ids;
use crate::transport::{FeedTransport, WireMessage, WsTransport};
use crate::types::{ConnectionState, QuoteSnapshot};

enum Command {
    /// Close the socket with a normal closure and stop.
    Close,
    /// Close the socket and immediately open a replacement.
    Reconnect,
}

enum Exit {
    /// Server closed the stream or the transport failed mid-flight.
    Dropped,
    /// Explicit teardown.
    Closed,
    /// Close-then-open requested by `set_assets`.
    Reopen,
}

struct Shared {
    transport: Arc<dyn FeedTransport>,
    catalog: Arc<CatalogCache>,
    assets: RwLock<Vec<String>>,
    quotes: RwLock<HashMap<String, Option<f64>>>,
    api_key: RwLock<Option<String>>,
    state: RwLock<ConnectionState>,
    initialised: AtomicBool,
    destroyed: AtomicBool,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<QuoteSnapshot>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    fn snapshot(&self) -> QuoteSnapshot {
        self.quotes.read().unwrap().clone()
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

    fn reconnect_pending(&self) -> bool {
        self.reconnect_timer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Merges a flat `{assetId: "price"}` payload. Untracked ids and
    /// unparseable prices are discarded without emitting.
    fn import_message(&self, text: &str) {
        let Ok(parsed) = serde_json::from_str::<HashMap<String, String>>(text) else {
            return;
        };
        let mut changed = false;
        {
            let mut quotes = self.quotes.write().unwrap();
            for (id, price) in parsed {
                if let Some(slot) = quotes.get_mut(&id) {
                    if let Ok(value) = price.parse::<f64>() {
                        *slot = Some(value);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            return;
        }
        self.initialised.store(true, Ordering::SeqCst);
        self.emit();
    }

    /// Fills still-unknown prices from the catalog; streamed values win.
    fn apply_catalog_snapshot(&self, catalog: &HashMap<String, AssetInfo>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut quotes = self.quotes.write().unwrap();
            for (id, slot) in quotes.iter_mut() {
                if slot.is_none() {
                    if let Some(asset) = catalog.get(id) {
                        *slot = asset.price_usd.parse().ok();
                    }
                }
            }
        }
        self.emit();
    }

    /// Best-effort catalog fetch; resolution after destroy is a no-op.
    fn spawn_catalog_snapshot(self: Arc<Self>) {
        tokio::spawn(async move {
            let api_key = self.api_key.read().unwrap().clone();
            match self.catalog.assets(api_key.as_deref()).await {
                Ok(catalog) => self.apply_catalog_snapshot(catalog),
                Err(e) => warn!(error = %e, "asset catalog fetch failed"),
            }
        });
    }

    /// Waits the fixed delay, then reconnects unless the socket recovered
    /// or the feed was destroyed. A pending timer is always cancelled
    /// first, so each close event leaves exactly one attempt scheduled.
    fn schedule_reconnect(self: Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        info!("price stream disconnected, retrying in {RECONNECT_DELAY_MS}ms");
        let mut timer = self.reconnect_timer.lock().unwrap();
        if let Some(pending) = timer.take() {
            pending.abort();
        }
        let shared = self.clone();
        *timer = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
            if shared.destroyed.load(Ordering::SeqCst) {
                return;
            }
            if shared.state() == ConnectionState::Open {
                debug!("price stream recovered, skipping reconnect");
                return;
            }
            shared.spawn_connection();
        }));
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
        let assets = self.assets.read().unwrap().clone();
        let url = format!("{}?assets={}", COINCAP_WS_URL, assets.join(","));
        info!(assets = %assets.join(","), "connecting price stream");

        let mut socket = match self.transport.connect(&url).await {
            Ok(socket) => socket,
            Err(e) => {
                // The refresh clock's backstop retries later.
                error!(error = %e, "price stream connect failed");
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
        self.set_state(ConnectionState::Open);
        info!("price stream connected");

        // A replacement that landed during the handshake missed the
        // command channel, and the URL still carries the old asset list.
        // Reopen with the current set. A replacement from here on goes
        // through the channel.
        if *self.assets.read().unwrap() != assets {
            info!("tracked assets changed during connect, reopening");
            self.set_state(ConnectionState::Closing);
            let _ = socket.close().await;
            *self.commands.lock().unwrap() = None;
            self.set_state(ConnectionState::Disconnected);
            self.spawn_connection();
            return;
        }

        let exit = loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Close) | None => {
                        self.set_state(ConnectionState::Closing);
                        let _ = socket.close().await;
                        break Exit::Closed;
                    }
                    Some(Command::Reconnect) => {
                        self.set_state(ConnectionState::Closing);
                        let _ = socket.close().await;
                        break Exit::Reopen;
                    }
                },
                message = socket.recv() => match message {
                    Some(Ok(WireMessage::Text(text))) => self.import_message(&text),
                    Some(Ok(WireMessage::Other)) => {}
                    Some(Ok(WireMessage::Close)) | None => {
                        info!("price stream closed by server");
                        break Exit::Dropped;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "price stream error");
                        break Exit::Dropped;
                    }
                },
            }
        };

        *self.commands.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected);

        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match exit {
            Exit::Dropped => self.schedule_reconnect(),
            Exit::Reopen => self.spawn_connection(),
            Exit::Closed => {}
        }
    }
}

/// Connection manager for the Coincap price stream.
///
/// Must be created inside a tokio runtime; the connection, catalog fetch
/// and refresh clock run as background tasks.
pub struct CoincapFeed {
    shared: Arc<Shared>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoincapFeed {
    /// Creates a feed tracking `assets` and opens the connection. An
    /// `api_key` is forwarded to the catalog as a bearer token.
    ///
    /// Fails with [`FeedError::EmptySymbolSet`] before any connection
    /// attempt if `assets` is empty.
    pub fn new<S: AsRef<str>>(
        assets: &[S],
        api_key: Option<&str>,
        refresh_interval: Duration,
    ) -> Result<Self, FeedError> {
        Self::with_parts(
            assets,
            api_key,
            refresh_interval,
            Arc::new(CatalogCache::new()?),
            Arc::new(WsTransport),
        )
    }

    /// Creates a feed over a custom catalog and transport. Primarily for
    /// tests.
    pub fn with_parts<S: AsRef<str>>(
        assets: &[S],
        api_key: Option<&str>,
        refresh_interval: Duration,
        catalog: Arc<CatalogCache>,
        transport: Arc<dyn FeedTransport>,
    ) -> Result<Self, FeedError> {
        let assets = normalise_ids(assets);
        if assets.is_empty() {
            return Err(FeedError::EmptySymbolSet);
        }

        let quotes = assets.iter().map(|asset| (asset.clone(), None)).collect();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            transport,
            catalog,
            assets: RwLock::new(assets),
            quotes: RwLock::new(quotes),
            api_key: RwLock::new(api_key.map(str::to_string)),
            state: RwLock::new(ConnectionState::Disconnected),
            initialised: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            commands: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
            updates,
        });

        shared.clone().spawn_catalog_snapshot();
        shared.clone().spawn_connection();

        let feed = Self {
            shared,
            refresh_task: Mutex::new(None),
        };
        feed.configure_refresh_interval(refresh_interval);
        Ok(feed)
    }

    /// Replaces the tracked asset set.
    ///
    /// Previously known prices are preserved for assets that remain
    /// tracked, removed assets are dropped and new ones are seeded from
    /// the latest catalog fetch. The stream is reconnected because the
    /// asset list lives in the connection URL.
    pub fn set_assets<S: AsRef<str>>(
        &self,
        assets: &[S],
        api_key: Option<&str>,
    ) -> Result<(), FeedError> {
        let assets = normalise_ids(assets);
        if assets.is_empty() {
            return Err(FeedError::EmptySymbolSet);
        }

        {
            let mut tracked = self.shared.assets.write().unwrap();
            *tracked = assets.clone();
        }
        {
            let mut quotes = self.shared.quotes.write().unwrap();
            let next = assets
                .iter()
                .map(|asset| (asset.clone(), quotes.get(asset).copied().flatten()))
                .collect();
            *quotes = next;
        }
        if api_key.is_some() {
            *self.shared.api_key.write().unwrap() = api_key.map(str::to_string);
        }

        self.shared.clone().spawn_catalog_snapshot();

        // Without a command channel either nothing is live and this opens
        // with the new set, or an in-flight connect detects the change
        // itself when it opens.
        if !self.shared.send_command(Command::Reconnect) {
            self.shared.clone().spawn_connection();
        }
        Ok(())
    }

    /// Registers a subscriber; every received snapshot is complete and
    /// consistent at the time of emission.
    pub fn subscribe(&self) -> broadcast::Receiver<QuoteSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Current cache snapshot.
    pub fn quotes(&self) -> QuoteSnapshot {
        self.shared.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Reschedules the refresh clock. Each tick re-emits the current
    /// snapshot once the first message has arrived, and reconnects a
    /// dropped stream when no timed attempt is already pending.
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
                if shared.state() == ConnectionState::Disconnected && !shared.reconnect_pending() {
                    debug!("price stream down, health check reconnecting");
                    shared.clone().spawn_connection();
                }
            }
        }));
    }

    /// Tears the feed down: suppresses reconnects, cancels the pending
    /// reconnect timer and the refresh clock, and closes a live socket
    /// with a normal closure. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("destroying price feed");
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(timer) = self.shared.reconnect_timer.lock().unwrap().take() {
            timer.abort();
        }
        self.shared.send_command(Command::Close);
    }
}

impl Drop for CoincapFeed {
    fn drop(&mut self) {
        self.destroy();
    }
}
