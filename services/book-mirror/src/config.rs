//! Mirror configuration
//!
//! Defaults suit the public spot stream. `from_env` overrides them from
//! process environment variables; an unparseable value is an error rather
//! than a silent fallback.

use std::str::FromStr;
use std::time::Duration;

use tracing::level_filters::LevelFilter;
use types::ids::Symbol;

use crate::protocol::Topic;

pub const MAINNET_URL: &str = "wss://stream.bybit.com/v5/public/spot";
pub const TESTNET_URL: &str = "wss://stream-testnet.bybit.com/v5/public/spot";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Everything the supervisor and the binary need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub ws_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Authentication failure is fatal only when set.
    pub private: bool,
    pub symbols: Vec<Symbol>,
    pub depth: u32,
    /// Also subscribe `trade.<symbol>` for each symbol.
    pub trade_topics: bool,
    pub ping_interval: Duration,
    /// Connection torn down when nothing arrives for this long.
    pub liveness_timeout: Duration,
    /// Initial reconnect backoff; doubles up to `max_reconnect_interval`.
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub monitor_interval: Duration,
    /// Consecutive anomalous deltas before a resync (0 = never).
    pub anomaly_resync_threshold: u32,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: LevelFilter,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            ws_url: MAINNET_URL.to_string(),
            api_key: None,
            api_secret: None,
            private: false,
            symbols: vec![Symbol::new("BTCUSDT")],
            depth: 50,
            trade_topics: false,
            ping_interval: Duration::from_secs(20),
            liveness_timeout: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(30),
            anomaly_resync_threshold: 3,
            log_level: LevelFilter::INFO,
        }
    }
}

impl MirrorConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        let testnet = parse_opt::<bool>(&get, "BYBIT_TESTNET", parse_bool)?.unwrap_or(false);
        config.ws_url = match get("BYBIT_WS_BASE_URL") {
            Some(url) => url,
            None if testnet => TESTNET_URL.to_string(),
            None => MAINNET_URL.to_string(),
        };
        config.api_key = get("BYBIT_API_KEY");
        config.api_secret = get("BYBIT_API_SECRET");
        if let Some(private) = parse_opt(&get, "BYBIT_PRIVATE", parse_bool)? {
            config.private = private;
        }

        if let Some(raw) = get("SYMBOLS") {
            config.symbols = parse_symbols(&raw)?;
        }
        if let Some(depth) = parse_opt(&get, "ORDERBOOK_DEPTH", parse_from_str::<u32>)? {
            config.depth = depth;
        }
        if let Some(trades) = parse_opt(&get, "TRADE_TOPICS", parse_bool)? {
            config.trade_topics = trades;
        }

        let seconds = |key: &'static str, slot: &mut Duration| -> Result<(), ConfigError> {
            if let Some(secs) = parse_opt(&get, key, parse_from_str::<u64>)? {
                *slot = Duration::from_secs(secs);
            }
            Ok(())
        };
        seconds("PING_INTERVAL", &mut config.ping_interval)?;
        seconds("LIVENESS_TIMEOUT", &mut config.liveness_timeout)?;
        seconds("RECONNECT_INTERVAL", &mut config.reconnect_interval)?;
        seconds("MAX_RECONNECT_INTERVAL", &mut config.max_reconnect_interval)?;
        seconds("CONNECT_TIMEOUT", &mut config.connect_timeout)?;
        seconds("MONITOR_INTERVAL", &mut config.monitor_interval)?;

        if let Some(threshold) =
            parse_opt(&get, "ANOMALY_RESYNC_THRESHOLD", parse_from_str::<u32>)?
        {
            config.anomaly_resync_threshold = threshold;
        }
        if let Some(level) = parse_opt(&get, "LOG_LEVEL", parse_from_str::<LevelFilter>)? {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Inconsistent("no symbols configured".into()));
        }
        if self.depth == 0 {
            return Err(ConfigError::Inconsistent("orderbook depth must be positive".into()));
        }
        for (name, value) in [
            ("ping interval", self.ping_interval),
            ("liveness timeout", self.liveness_timeout),
            ("reconnect interval", self.reconnect_interval),
            ("connect timeout", self.connect_timeout),
            ("monitor interval", self.monitor_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Inconsistent(format!("{} must be positive", name)));
            }
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(ConfigError::Inconsistent(
                "max reconnect interval is below the initial interval".into(),
            ));
        }
        if self.liveness_timeout <= self.ping_interval {
            return Err(ConfigError::Inconsistent(
                "liveness timeout must exceed the ping interval".into(),
            ));
        }
        if self.private && self.credentials().is_none() {
            return Err(ConfigError::Inconsistent(
                "private channel requires BYBIT_API_KEY and BYBIT_API_SECRET".into(),
            ));
        }
        Ok(())
    }

    /// API key and secret when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
            _ => None,
        }
    }

    /// Initial subscription set.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .symbols
            .iter()
            .map(|symbol| Topic::order_book(self.depth, symbol.clone()))
            .collect();
        if self.trade_topics {
            topics.extend(self.symbols.iter().cloned().map(Topic::trade));
        }
        topics
    }
}

fn parse_opt<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    parse: fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => parse(raw.trim())
            .map(Some)
            .map_err(|reason| ConfigError::InvalidValue {
                key,
                value: raw,
                reason,
            }),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected a boolean".to_string()),
    }
}

fn parse_from_str<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| e.to_string())
}

fn parse_symbols(raw: &str) -> Result<Vec<Symbol>, ConfigError> {
    let mut symbols = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let symbol = part
            .to_ascii_uppercase()
            .parse::<Symbol>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "SYMBOLS",
                value: raw.to_string(),
                reason: e.to_string(),
            })?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}
