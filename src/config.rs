use crate::domain::{Currency, Decimal, WalletId};
use crate::engine::{MatchPolicy, UnmatchedSellPolicy};
use crate::normalize::NormalizerPolicy;
use crate::pricing::ConverterPolicy;
use std::collections::HashMap;
use thiserror::Error;

const DEFAULT_PRICE_API_URL: &str = "https://public-api.birdeye.so";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub price_api_url: String,
    pub price_api_key: Option<String>,
    pub canonical_currency: Currency,
    pub settlement_currencies: Vec<Currency>,
    pub currency_mints: HashMap<Currency, String>,
    pub fallback_rates: HashMap<Currency, Decimal>,
    pub min_buy_quote_amount: Decimal,
    pub dust_threshold_pct: Decimal,
    pub lot_epsilon: Decimal,
    pub unmatched_sell_policy: UnmatchedSellPolicy,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub rate_cache_max_age_minutes: i64,
    pub worker_concurrency: usize,
    pub ledger_mode: LedgerMode,
    pub wallets: Vec<WalletId>,
    pub trades_csv_path: Option<String>,
}

/// Which write path the batch job uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// Recompute every pair and atomically replace its closed lots.
    Full,
    /// Append lots produced by trades past each pair's watermark.
    Incremental,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let price_api_url = env_map
            .get("PRICE_API_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PRICE_API_URL.to_string());

        let price_api_key = env_map
            .get("PRICE_API_KEY")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let canonical_currency = Currency::new(
            env_map
                .get("CANONICAL_CURRENCY")
                .map(|s| s.as_str())
                .unwrap_or("SOL"),
        );

        let mut settlement_currencies: Vec<Currency> = env_map
            .get("SETTLEMENT_CURRENCIES")
            .map(|s| s.as_str())
            .unwrap_or("SOL,USDC,USDT")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Currency::new)
            .collect();
        if !settlement_currencies.contains(&canonical_currency) {
            settlement_currencies.push(canonical_currency.clone());
        }

        let mut currency_mints = default_currency_mints();
        for (symbol, mint) in parse_pairs(&env_map, "CURRENCY_MINTS")? {
            currency_mints.insert(Currency::new(&symbol), mint);
        }

        let mut fallback_rates = HashMap::new();
        for (symbol, rate) in parse_pairs(&env_map, "FALLBACK_RATES")? {
            let rate = Decimal::from_str_canonical(&rate)
                .ok()
                .filter(|r| r.is_positive())
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "FALLBACK_RATES".to_string(),
                        format!("rate for {} must be a positive decimal", symbol),
                    )
                })?;
            fallback_rates.insert(Currency::new(&symbol), rate);
        }

        let min_buy_quote_amount = parse_decimal(&env_map, "MIN_BUY_QUOTE_AMOUNT", "0.001")?;

        let dust_threshold_pct = parse_decimal(&env_map, "DUST_THRESHOLD_PCT", "2")?;
        if dust_threshold_pct.is_negative() || dust_threshold_pct > Decimal::hundred() {
            return Err(ConfigError::InvalidValue(
                "DUST_THRESHOLD_PCT".to_string(),
                "must be between 0 and 100".to_string(),
            ));
        }

        let lot_epsilon = parse_decimal(&env_map, "LOT_EPSILON", "0.000000001")?;
        if lot_epsilon.is_negative() {
            return Err(ConfigError::InvalidValue(
                "LOT_EPSILON".to_string(),
                "must not be negative".to_string(),
            ));
        }

        let unmatched_sell_policy = match env_map
            .get("UNMATCHED_SELL_POLICY")
            .map(|s| s.as_str())
            .unwrap_or("drop")
        {
            "drop" => UnmatchedSellPolicy::Drop,
            "unknown_cost" => UnmatchedSellPolicy::EmitUnknownCost,
            other => {
                return Err(ConfigError::InvalidValue(
                    "UNMATCHED_SELL_POLICY".to_string(),
                    format!("must be drop or unknown_cost, got {}", other),
                ))
            }
        };

        let take_profit_pct = parse_decimal(&env_map, "TAKE_PROFIT_PCT", "0")?;
        let stop_loss_pct = parse_decimal(&env_map, "STOP_LOSS_PCT", "0")?;

        let rate_cache_max_age_minutes = env_map
            .get("RATE_CACHE_MAX_AGE_MINUTES")
            .map(|s| s.as_str())
            .unwrap_or("60")
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "RATE_CACHE_MAX_AGE_MINUTES".to_string(),
                    "must be a positive integer".to_string(),
                )
            })?;

        let worker_concurrency = env_map
            .get("WORKER_CONCURRENCY")
            .map(|s| s.as_str())
            .unwrap_or("4")
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "WORKER_CONCURRENCY".to_string(),
                    "must be a positive integer".to_string(),
                )
            })?;

        let ledger_mode = match env_map
            .get("LEDGER_MODE")
            .map(|s| s.as_str())
            .unwrap_or("full")
        {
            "full" => LedgerMode::Full,
            "incremental" => LedgerMode::Incremental,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LEDGER_MODE".to_string(),
                    format!("must be full or incremental, got {}", other),
                ))
            }
        };

        let wallets = env_map
            .get("WALLETS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(WalletId::new)
                    .collect()
            })
            .unwrap_or_default();

        let trades_csv_path = env_map
            .get("TRADES_CSV_PATH")
            .cloned()
            .filter(|s| !s.trim().is_empty());

        Ok(Config {
            database_path,
            price_api_url,
            price_api_key,
            canonical_currency,
            settlement_currencies,
            currency_mints,
            fallback_rates,
            min_buy_quote_amount,
            dust_threshold_pct,
            lot_epsilon,
            unmatched_sell_policy,
            take_profit_pct,
            stop_loss_pct,
            rate_cache_max_age_minutes,
            worker_concurrency,
            ledger_mode,
            wallets,
            trades_csv_path,
        })
    }

    pub fn normalizer_policy(&self) -> NormalizerPolicy {
        NormalizerPolicy {
            canonical_currency: self.canonical_currency.clone(),
            settlement_currencies: self.settlement_currencies.clone(),
            min_buy_quote_amount: self.min_buy_quote_amount,
        }
    }

    pub fn converter_policy(&self) -> ConverterPolicy {
        ConverterPolicy {
            canonical_currency: self.canonical_currency.clone(),
            max_cache_age_minutes: self.rate_cache_max_age_minutes,
            fallback_rates: self.fallback_rates.clone(),
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            dust_threshold: self.dust_threshold_pct / Decimal::hundred(),
            epsilon: self.lot_epsilon,
            unmatched_sells: self.unmatched_sell_policy,
            take_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
        }
    }
}

fn default_currency_mints() -> HashMap<Currency, String> {
    [
        ("SOL", "So11111111111111111111111111111111111111112"),
        ("USDC", "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"),
        ("USDT", "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB"),
    ]
    .into_iter()
    .map(|(symbol, mint)| (Currency::new(symbol), mint.to_string()))
    .collect()
}

fn parse_decimal(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<Decimal, ConfigError> {
    let raw = env_map.get(key).map(|s| s.as_str()).unwrap_or(default);
    Decimal::from_str_canonical(raw)
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), "must be a decimal".to_string()))
}

/// Parse `KEY=value,KEY=value` lists.
fn parse_pairs(
    env_map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<(String, String)>, ConfigError> {
    let Some(raw) = env_map.get(key) else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        key.to_string(),
                        format!("expected SYMBOL=value, got {}", entry),
                    )
                })
        })
        .collect()
}
