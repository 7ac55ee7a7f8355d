//! Birdeye public API price oracle.
//!
//! Rates are derived from USD quotes: `rate(currency) = usd(currency) / usd(canonical)`.

use super::{PriceOracle, PriceOracleError};
use crate::domain::{Currency, Decimal, TimeMs, TokenId};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Width of the history window requested around a lookup, in seconds.
const HISTORY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct BirdeyePriceOracle {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    canonical: Currency,
    /// Settlement currency symbol → token mint address.
    mints: HashMap<Currency, String>,
}

impl BirdeyePriceOracle {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        canonical: Currency,
        mints: HashMap<Currency, String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            canonical,
            mints,
        }
    }

    fn mint_for(&self, currency: &Currency) -> Result<&str, PriceOracleError> {
        self.mints
            .get(currency)
            .map(|m| m.as_str())
            .ok_or_else(|| PriceOracleError::UnknownAsset(currency.to_string()))
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, PriceOracleError> {
        let url = format!("{}{}", self.base_url, path);
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let mut request = self
                .client
                .get(&url)
                .query(query)
                .header("x-chain", "solana");
            if let Some(key) = &self.api_key {
                request = request.header("X-API-KEY", key);
            }

            let response = request.send().await.map_err(|e| {
                backoff::Error::transient(PriceOracleError::Network(e.to_string()))
            })?;

            let status = response.status();
            if status == 429 {
                return Err(backoff::Error::transient(PriceOracleError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(PriceOracleError::Http {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(PriceOracleError::Http {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| backoff::Error::permanent(PriceOracleError::Parse(e.to_string())))
        })
        .await
    }

    async fn usd_at(&self, mint: &str, at: TimeMs) -> Result<Option<Decimal>, PriceOracleError> {
        let at_secs = at.as_ms().div_euclid(1000);
        debug!(mint, at_secs, "Fetching historical USD price");

        let body = self
            .get_json(
                "/defi/history_price",
                &[
                    ("address", mint.to_string()),
                    ("address_type", "token".to_string()),
                    ("type", "1m".to_string()),
                    ("time_from", (at_secs - HISTORY_WINDOW_SECS).to_string()),
                    ("time_to", (at_secs + HISTORY_WINDOW_SECS).to_string()),
                ],
            )
            .await?;

        parse_history_price(&body, at_secs)
    }

    async fn usd_now(&self, mint: &str) -> Result<Option<Decimal>, PriceOracleError> {
        let body = self
            .get_json("/defi/price", &[("address", mint.to_string())])
            .await?;
        parse_current_price(&body)
    }
}

#[async_trait]
impl PriceOracle for BirdeyePriceOracle {
    async fn rate_at(
        &self,
        currency: &Currency,
        at: TimeMs,
    ) -> Result<Option<Decimal>, PriceOracleError> {
        if *currency == self.canonical {
            return Ok(Some(Decimal::one()));
        }

        let quote_mint = self.mint_for(currency)?;
        let canonical_mint = self.mint_for(&self.canonical)?;

        let Some(quote_usd) = self.usd_at(quote_mint, at).await? else {
            return Ok(None);
        };
        let Some(canonical_usd) = self.usd_at(canonical_mint, at).await? else {
            return Ok(None);
        };
        Ok(quote_usd.checked_div(canonical_usd))
    }

    async fn current_price(&self, token: &TokenId) -> Result<Option<Decimal>, PriceOracleError> {
        let canonical_mint = self.mint_for(&self.canonical)?;

        let Some(token_usd) = self.usd_now(token.as_str()).await? else {
            return Ok(None);
        };
        let Some(canonical_usd) = self.usd_now(canonical_mint).await? else {
            return Ok(None);
        };
        Ok(token_usd.checked_div(canonical_usd))
    }
}

fn json_decimal(value: &serde_json::Value) -> Option<Decimal> {
    value
        .as_f64()
        .and_then(rust_decimal::Decimal::from_f64)
        .map(Decimal::new)
        .filter(|d| d.is_positive())
}

fn check_success(body: &serde_json::Value) -> Result<(), PriceOracleError> {
    match body.get("success").and_then(|s| s.as_bool()) {
        Some(true) => Ok(()),
        _ => Err(PriceOracleError::Parse(
            "response missing success=true".to_string(),
        )),
    }
}

/// Pick the latest point at or before `at_secs`, else the earliest point in the window.
fn parse_history_price(
    body: &serde_json::Value,
    at_secs: i64,
) -> Result<Option<Decimal>, PriceOracleError> {
    check_success(body)?;
    let items = body
        .pointer("/data/items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| PriceOracleError::Parse("Expected data.items array".to_string()))?;

    let mut best_before: Option<(i64, &serde_json::Value)> = None;
    let mut earliest_after: Option<(i64, &serde_json::Value)> = None;
    for item in items {
        let Some(t) = item.get("unixTime").and_then(|t| t.as_i64()) else {
            continue;
        };
        let Some(value) = item.get("value") else {
            continue;
        };
        if t <= at_secs {
            if best_before.map_or(true, |(bt, _)| t > bt) {
                best_before = Some((t, value));
            }
        } else if earliest_after.map_or(true, |(et, _)| t < et) {
            earliest_after = Some((t, value));
        }
    }

    Ok(best_before
        .or(earliest_after)
        .and_then(|(_, value)| json_decimal(value)))
}

fn parse_current_price(body: &serde_json::Value) -> Result<Option<Decimal>, PriceOracleError> {
    check_success(body)?;
    Ok(body.pointer("/data/value").and_then(json_decimal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_parse_history_price_prefers_latest_before() {
        let body = json!({
            "success": true,
            "data": { "items": [
                { "unixTime": 100, "value": 1.5 },
                { "unixTime": 160, "value": 1.75 },
                { "unixTime": 220, "value": 2.0 }
            ]}
        });
        assert_eq!(parse_history_price(&body, 200).unwrap(), Some(d("1.75")));
    }

    #[test]
    fn test_parse_history_price_falls_forward() {
        let body = json!({
            "success": true,
            "data": { "items": [ { "unixTime": 300, "value": 0.5 } ] }
        });
        assert_eq!(parse_history_price(&body, 200).unwrap(), Some(d("0.5")));
    }

    #[test]
    fn test_parse_history_price_empty_is_none() {
        let body = json!({ "success": true, "data": { "items": [] } });
        assert_eq!(parse_history_price(&body, 200).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_unsuccessful() {
        let body = json!({ "success": false, "message": "Unauthorized" });
        assert!(parse_history_price(&body, 0).is_err());
        assert!(parse_current_price(&body).is_err());
    }

    #[test]
    fn test_parse_current_price() {
        let body = json!({ "success": true, "data": { "value": 152.25 } });
        assert_eq!(parse_current_price(&body).unwrap(), Some(d("152.25")));
    }

    #[tokio::test]
    async fn test_unknown_currency_is_error() {
        let oracle = BirdeyePriceOracle::new(
            "http://example.invalid".to_string(),
            None,
            Currency::new("SOL"),
            HashMap::new(),
        );
        let result = oracle.rate_at(&Currency::new("JUP"), TimeMs::new(0)).await;
        assert_eq!(
            result,
            Err(PriceOracleError::UnknownAsset("JUP".to_string()))
        );
    }

    #[tokio::test]
    async fn test_canonical_rate_is_one_without_network() {
        let oracle = BirdeyePriceOracle::new(
            "http://example.invalid".to_string(),
            None,
            Currency::new("SOL"),
            HashMap::new(),
        );
        let rate = oracle.rate_at(&Currency::new("SOL"), TimeMs::new(0)).await;
        assert_eq!(rate, Ok(Some(Decimal::one())));
    }
}
