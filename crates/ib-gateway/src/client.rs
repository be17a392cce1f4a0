use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use reqwest::Client;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Semaphore;

use trading_core::provider::{
    BAR_REQUEST_TIMEOUT, MAX_SESSION_RETRIES, STATUS_TIMEOUT, SYNC_GRACE,
};
use trading_core::{
    Bar, BarSource, ContractDetails, KtrdrError, MarketDataProvider, ProviderStatus, Symbol,
    TimeRange, Timeframe, TradingHours,
};

use crate::models::{IbAuthStatus, IbContract, IbHistoryResponse};

/// Pacing backoff parameters: base 1 s, cap 60 s, full jitter.
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;

/// Full-jitter exponential backoff: uniform in
/// `[base, min(cap, base * 2^n)]`. Never retries tighter than the base.
pub fn full_jitter_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let ceiling = BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(BACKOFF_CAP_MS)
        .max(BACKOFF_BASE_MS);
    Duration::from_millis(rng.gen_range(BACKOFF_BASE_MS..=ceiling))
}

#[derive(Debug, Clone)]
pub struct IbGatewayConfig {
    /// Client Portal Gateway URL (default: https://localhost:5000).
    pub gateway_url: String,
    /// Upper bound on concurrent history requests.
    pub max_inflight: usize,
    /// Retries after a pacing violation before surfacing `RateLimited`.
    pub max_pacing_retries: u32,
}

impl Default for IbGatewayConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://localhost:5000".to_string(),
            max_inflight: 4,
            max_pacing_retries: 3,
        }
    }
}

impl IbGatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gateway_url: std::env::var("IB_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            max_inflight: std::env::var("IB_MAX_INFLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_inflight),
            max_pacing_retries: defaults.max_pacing_retries,
        }
    }
}

/// `MarketDataProvider` over the IB Client Portal Gateway REST API.
///
/// Requires the Client Portal Gateway to be running locally; it terminates
/// TLS with a self-signed certificate.
pub struct IbGatewayProvider {
    http: Client,
    config: IbGatewayConfig,
    pacing: Semaphore,
    /// symbol -> contract id
    conid_cache: DashMap<String, i64>,
    details_cache: DashMap<String, ContractDetails>,
    state: RwLock<ProviderStatus>,
}

impl IbGatewayProvider {
    pub fn new(config: IbGatewayConfig) -> Result<Self, KtrdrError> {
        let http = Client::builder()
            .timeout(BAR_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true) // gateway uses self-signed certs
            .build()
            .map_err(|e| KtrdrError::ConnectionLost(format!("http client: {e}")))?;
        Ok(Self {
            http,
            pacing: Semaphore::new(config.max_inflight),
            config,
            conid_cache: DashMap::new(),
            details_cache: DashMap::new(),
            state: RwLock::new(ProviderStatus::Disconnected),
        })
    }

    pub fn from_env() -> Result<Self, KtrdrError> {
        Self::new(IbGatewayConfig::from_env())
    }

    fn set_state(&self, status: ProviderStatus) {
        *self.state.write().unwrap() = status;
    }

    async fn auth_status(&self) -> Result<IbAuthStatus, KtrdrError> {
        let url = format!("{}/v1/api/iserver/auth/status", self.config.gateway_url);
        let response = self
            .http
            .post(&url)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(KtrdrError::ConnectionLost(format!(
                "auth status returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(transport_error)
    }

    /// Resolve a symbol to an IB contract id, with caching.
    async fn resolve_contract(&self, symbol: &Symbol) -> Result<IbContract, KtrdrError> {
        let url = format!("{}/v1/api/iserver/secdef/search", self.config.gateway_url);
        let body = serde_json::json!({ "symbol": symbol.as_str(), "secType": "STK" });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(KtrdrError::Contract {
                symbol: symbol.to_string(),
                message: format!("contract search failed with {}", response.status()),
            });
        }

        let contracts: Vec<IbContract> = response.json().await.map_err(transport_error)?;
        let contract = contracts
            .into_iter()
            .find(|c| c.symbol.as_deref() == Some(symbol.as_str()))
            .ok_or_else(|| KtrdrError::Contract {
                symbol: symbol.to_string(),
                message: "no matching contract".to_string(),
            })?;

        self.conid_cache
            .insert(symbol.to_string(), contract.contract_id);
        Ok(contract)
    }

    async fn conid(&self, symbol: &Symbol) -> Result<i64, KtrdrError> {
        if let Some(conid) = self.conid_cache.get(symbol.as_str()) {
            return Ok(*conid);
        }
        Ok(self.resolve_contract(symbol).await?.contract_id)
    }

    /// One raw history request without pacing retries.
    async fn request_history(
        &self,
        conid: i64,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Bar>, KtrdrError> {
        let url = format!(
            "{}/v1/api/iserver/marketdata/history",
            self.config.gateway_url
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("conid", conid.to_string()),
                ("bar", bar_param(timeframe).to_string()),
                ("period", period_param(timeframe, range)),
                ("startTime", range.start.format("%Y%m%d-%H:%M:%S").to_string()),
                ("outsideRth", "false".to_string()),
            ])
            .timeout(BAR_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().as_u16() == 429 {
            return Err(KtrdrError::RateLimited("history request paced".to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if text.to_ascii_lowercase().contains("pacing") {
                return Err(KtrdrError::RateLimited(text));
            }
            return Err(KtrdrError::ConnectionLost(format!(
                "history returned {status}: {text}"
            )));
        }

        let history: IbHistoryResponse = response.json().await.map_err(transport_error)?;
        let mut bars: Vec<Bar> = history
            .data
            .into_iter()
            .filter_map(|raw| {
                let ts = DateTime::<Utc>::from_timestamp_millis(raw.t)?;
                Some(Bar {
                    ts: timeframe.align_floor(ts),
                    open: raw.o,
                    high: raw.h,
                    low: raw.l,
                    close: raw.c,
                    volume: raw.v.max(0.0),
                    source: BarSource::Broker,
                })
            })
            .filter(|bar| range.contains(bar.ts))
            .collect();
        bars.sort_by_key(|b| b.ts);
        bars.dedup_by_key(|b| b.ts);
        Ok(bars)
    }
}

fn transport_error(e: reqwest::Error) -> KtrdrError {
    KtrdrError::ConnectionLost(e.to_string())
}

/// Map a timeframe onto the gateway's `bar` parameter.
fn bar_param(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::Min1 => "1min",
        Timeframe::Min5 => "5min",
        Timeframe::Min15 => "15min",
        Timeframe::Min30 => "30min",
        Timeframe::Hour1 => "1h",
        Timeframe::Hour2 => "2h",
        Timeframe::Hour4 => "4h",
        Timeframe::Day1 => "1d",
        Timeframe::Week1 => "1w",
        Timeframe::Month1 => "1m",
    }
}

/// History `period` covering the requested range, in the gateway's units.
fn period_param(timeframe: Timeframe, range: TimeRange) -> String {
    let days = (range.duration().num_days() + 1).max(1);
    match timeframe {
        Timeframe::Week1 | Timeframe::Month1 => format!("{}y", (days / 365 + 1).max(1)),
        _ => format!("{days}d"),
    }
}

#[async_trait]
impl MarketDataProvider for IbGatewayProvider {
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Bar>, KtrdrError> {
        // Pacing discipline: bounded in-flight requests; the semaphore is
        // never bypassed by callers.
        let _permit = self
            .pacing
            .acquire()
            .await
            .map_err(|_| KtrdrError::ConnectionLost("provider shut down".to_string()))?;
        let conid = self.conid(symbol).await?;

        let mut attempt = 0u32;
        let bars = loop {
            match self.request_history(conid, timeframe, range).await {
                Err(KtrdrError::RateLimited(msg)) if attempt < self.config.max_pacing_retries => {
                    let delay = full_jitter_delay(attempt, &mut rand::thread_rng());
                    tracing::warn!(
                        symbol = %symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "pacing violation, backing off: {msg}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other?,
            }
        };

        if bars.is_empty() {
            return Err(KtrdrError::NoData {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
            });
        }
        Ok(bars)
    }

    async fn contract_details(&self, symbol: &Symbol) -> Result<ContractDetails, KtrdrError> {
        if let Some(details) = self.details_cache.get(symbol.as_str()) {
            return Ok(details.clone());
        }
        let contract = self.resolve_contract(symbol).await?;
        let trading_hours = match contract.sec_type.as_deref() {
            Some("CASH") | Some("CRYPTO") => TradingHours::around_the_clock(),
            // Regular US equity session in UTC.
            _ => TradingHours::session(
                chrono::NaiveTime::from_hms_opt(14, 30, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            ),
        };
        let details = ContractDetails {
            symbol: symbol.clone(),
            exchange: contract.exchange.unwrap_or_else(|| "SMART".to_string()),
            currency: contract.currency.unwrap_or_else(|| "USD".to_string()),
            trading_hours,
            holidays: Vec::new(),
        };
        self.details_cache
            .insert(symbol.to_string(), details.clone());
        Ok(details)
    }

    /// Wait for the gateway's synchronization-complete signal: an auth
    /// status that is authenticated and connected, followed by the grace
    /// period. Client-id conflicts retry at most `MAX_SESSION_RETRIES`
    /// times with 1-2 s spacing, then fail fast.
    async fn connect(&self) -> Result<(), KtrdrError> {
        self.set_state(ProviderStatus::Connecting);
        let mut last_error = String::from("gateway unreachable");

        for attempt in 1..=MAX_SESSION_RETRIES {
            match self.auth_status().await {
                Ok(status) if status.authenticated && status.connected && !status.competing => {
                    tokio::time::sleep(SYNC_GRACE).await;
                    self.set_state(ProviderStatus::Connected);
                    tracing::info!(attempt, "gateway session synchronized");
                    return Ok(());
                }
                Ok(status) => {
                    last_error = if status.competing {
                        "competing session holds the client id".to_string()
                    } else {
                        "gateway session not yet authenticated".to_string()
                    };
                }
                Err(e) => last_error = e.to_string(),
            }
            if attempt < MAX_SESSION_RETRIES {
                let spacing =
                    Duration::from_millis(1_000 + rand::thread_rng().gen_range(0..=1_000));
                tokio::time::sleep(spacing).await;
            }
        }

        self.set_state(ProviderStatus::Disconnected);
        Err(KtrdrError::ConnectionLost(format!(
            "session not established after {MAX_SESSION_RETRIES} attempts: {last_error}"
        )))
    }

    async fn disconnect(&self) -> Result<(), KtrdrError> {
        let url = format!("{}/v1/api/logout", self.config.gateway_url);
        // Best effort; the gateway drops the session on its own timeout.
        let _ = self.http.post(&url).timeout(STATUS_TIMEOUT).send().await;
        self.set_state(ProviderStatus::Disconnected);
        Ok(())
    }

    /// Lightweight liveness probe against `/tickle`; never issues data calls.
    async fn status(&self) -> ProviderStatus {
        let url = format!("{}/v1/api/tickle", self.config.gateway_url);
        let result = self.http.post(&url).timeout(STATUS_TIMEOUT).send().await;
        let status = match result {
            Ok(r) if r.status().is_success() => *self.state.read().unwrap(),
            Ok(_) => ProviderStatus::Degraded,
            Err(_) => ProviderStatus::Disconnected,
        };
        status
    }

    fn provider_name(&self) -> &str {
        "ib-gateway"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn backoff_is_bounded_and_grows() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for attempt in 0..10u32 {
            let ceiling = BACKOFF_BASE_MS
                .saturating_mul(1u64 << attempt.min(16))
                .min(BACKOFF_CAP_MS);
            for _ in 0..50 {
                let delay = full_jitter_delay(attempt, &mut rng).as_millis() as u64;
                assert!(delay >= BACKOFF_BASE_MS, "retry tighter than the base");
                assert!(delay <= ceiling);
            }
        }
        // Cap applies from attempt 6 on (2^6 = 64 s > 60 s).
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(full_jitter_delay(12, &mut rng).as_millis() as u64 <= BACKOFF_CAP_MS);
        }
    }

    #[test]
    fn bar_param_covers_all_timeframes() {
        assert_eq!(bar_param(Timeframe::Min1), "1min");
        assert_eq!(bar_param(Timeframe::Hour4), "4h");
        assert_eq!(bar_param(Timeframe::Month1), "1m");
    }

    #[test]
    fn period_spans_requested_range() {
        let range = TimeRange::new(
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-10T00:00:00Z".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(period_param(Timeframe::Day1, range), "10d");
        assert_eq!(period_param(Timeframe::Week1, range), "1y");
    }
}
