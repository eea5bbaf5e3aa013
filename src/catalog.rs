//! One-shot catalog fetchers, memoised for the life of the process
//!
//! The feeds need three pieces of reference data: the Binance symbol list,
//! the Coincap asset catalog and the Coincap fiat conversion rates. Each is
//! fetched at most once per [`CatalogCache`] and then served from memory.
//! The cache is an explicit object injected into its consumers rather than
//! ambient global state.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants::{
    BINANCE_API_URL, COINCAP_API_URL, RATE_LIMIT_BACKOFF_MS, REQUEST_TIMEOUT_SECS, USER_AGENT,
};
use crate::error::CatalogError;

/// One Coincap asset definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetInfo {
    pub id: String,
    pub rank: String,
    pub symbol: String,
    pub price_usd: String,
}

/// One Coincap fiat conversion rate.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateInfo {
    pub id: String,
    pub symbol: String,
    pub rate_usd: String,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    base_asset: String,
    quote_asset: String,
}

/// Process-scoped catalog cache with a fetch-once-then-memoize guard per
/// dataset.
pub struct CatalogCache {
    client: Client,
    binance_api: String,
    coincap_api: String,
    rate_limit_backoff: Duration,
    symbols: OnceCell<Vec<String>>,
    assets: OnceCell<HashMap<String, AssetInfo>>,
    rates: OnceCell<HashMap<String, RateInfo>>,
}

impl CatalogCache {
    /// Creates a cache backed by the public Binance and Coincap APIs.
    pub fn new() -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(CatalogError::Network)?;

        Ok(Self {
            client,
            binance_api: BINANCE_API_URL.to_string(),
            coincap_api: COINCAP_API_URL.to_string(),
            rate_limit_backoff: Duration::from_millis(RATE_LIMIT_BACKOFF_MS),
            symbols: OnceCell::new(),
            assets: OnceCell::new(),
            rates: OnceCell::new(),
        })
    }

    /// Builds a cache whose asset catalog is already resolved.
    ///
    /// Primarily for tests and offline use.
    pub fn with_assets(assets: HashMap<String, AssetInfo>) -> Self {
        Self {
            client: Client::new(),
            binance_api: BINANCE_API_URL.to_string(),
            coincap_api: COINCAP_API_URL.to_string(),
            rate_limit_backoff: Duration::from_millis(RATE_LIMIT_BACKOFF_MS),
            symbols: OnceCell::new(),
            assets: OnceCell::new_with(Some(assets)),
            rates: OnceCell::new(),
        }
    }

    #[cfg(test)]
    fn with_endpoints(base: &str, rate_limit_backoff: Duration) -> Self {
        Self {
            client: Client::new(),
            binance_api: base.to_string(),
            coincap_api: base.to_string(),
            rate_limit_backoff,
            symbols: OnceCell::new(),
            assets: OnceCell::new(),
            rates: OnceCell::new(),
        }
    }

    /// Base assets of every Binance symbol quoted in USDT.
    pub async fn symbols(&self) -> Result<&Vec<String>, CatalogError> {
        self.symbols
            .get_or_try_init(|| async {
                let url = format!("{}/api/v3/exchangeInfo", self.binance_api);
                let info: ExchangeInfo = self.get_json(&url, None).await?;
                let symbols = info
                    .symbols
                    .into_iter()
                    .filter(|definition| definition.quote_asset == "USDT")
                    .map(|definition| definition.base_asset)
                    .collect::<Vec<_>>();
                debug!(count = symbols.len(), "fetched Binance symbol catalog");
                Ok(symbols)
            })
            .await
    }

    /// Coincap asset catalog keyed by asset id.
    pub async fn assets(
        &self,
        api_key: Option<&str>,
    ) -> Result<&HashMap<String, AssetInfo>, CatalogError> {
        self.assets
            .get_or_try_init(|| async {
                let url = format!("{}/v2/assets?limit=2000", self.coincap_api);
                let envelope: DataEnvelope<AssetInfo> = self.get_json(&url, api_key).await?;
                debug!(count = envelope.data.len(), "fetched Coincap asset catalog");
                Ok(envelope
                    .data
                    .into_iter()
                    .map(|asset| (asset.id.clone(), asset))
                    .collect())
            })
            .await
    }

    /// Coincap fiat conversion rates keyed by rate id.
    pub async fn rates(
        &self,
        api_key: Option<&str>,
    ) -> Result<&HashMap<String, RateInfo>, CatalogError> {
        self.rates
            .get_or_try_init(|| async {
                let url = format!("{}/v2/rates", self.coincap_api);
                let envelope: DataEnvelope<RateInfo> = self.get_json(&url, api_key).await?;
                debug!(count = envelope.data.len(), "fetched Coincap rate catalog");
                Ok(envelope
                    .data
                    .into_iter()
                    .map(|rate| (rate.id.clone(), rate))
                    .collect())
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        api_key: Option<&str>,
    ) -> Result<T, CatalogError> {
        loop {
            let mut request = self.client.get(url);
            if let Some(key) = api_key.filter(|key| !key.is_empty()) {
                request = request.bearer_auth(key);
            }
            let response = request.send().await?;

            // Retries are uncapped; sustained throttling keeps us in this
            // loop rather than surfacing an error to the feed.
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                warn!(url, "rate limited, sleeping 5s");
                sleep(self.rate_limit_backoff).await;
                continue;
            }

            if !response.status().is_success() {
                return Err(CatalogError::Status(response.status().as_u16()));
            }

            let text = response.text().await.map_err(CatalogError::Network)?;
            return serde_json::from_str(&text).map_err(|e| {
                CatalogError::InvalidResponse(format!("failed to parse {url}: {e}"))
            });
        }
    }
}
