use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub binance: BinanceConfig,
    pub okx: OkxConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    pub ws_url: String,
    pub journal_path: String,
    /// Minimum USDT notional; smaller liquidations are never journaled.
    pub threshold_usdt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkxConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub journal_path: String,
    /// Persistent contract-id → coin-per-contract ratio cache.
    pub cache_path: String,
    pub threshold_usdt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub retention_hours: i64,
    /// Journal tailer polling cadence.
    pub poll_interval_ms: u64,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_port: u16,
    pub ws_port: u16,
    /// Entries returned by /latest_liquidations.
    pub latest_list_size: usize,
    pub sse_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig {
                ws_url: "wss://fstream.binance.com/ws/!forceOrder@arr".into(),
                journal_path: "liquidation_ba.csv".into(),
                threshold_usdt: 10.0,
            },
            okx: OkxConfig {
                ws_url: "wss://ws.okx.com:8443/ws/v5/public".into(),
                rest_url: "https://www.okx.com".into(),
                journal_path: "liquidation_okx.csv".into(),
                cache_path: "okx_contract_ratios.json".into(),
                threshold_usdt: 10.0,
            },
            store: StoreConfig {
                retention_hours: 48,
                poll_interval_ms: 500,
                prune_interval_secs: 30,
            },
            server: ServerConfig {
                http_port: 6680,
                ws_port: 6681,
                latest_list_size: 50,
                sse_interval_secs: 1,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables (.env file) with defaults.
    ///
    /// Optional env vars:
    ///   LIQHUB_BA_JOURNAL, LIQHUB_OKX_JOURNAL — journal file paths
    ///   LIQHUB_OKX_CACHE — contract ratio cache path
    ///   LIQHUB_THRESHOLD_USDT — minimum notional (default: 10)
    ///   LIQHUB_RETENTION_HOURS — rolling window (default: 48)
    ///   LIQHUB_HTTP_PORT, LIQHUB_WS_PORT — listen ports (default: 6680/6681)
    ///   RUST_LOG — log level (default: info)
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();

        let mut config = Self::default();

        if let Ok(path) = std::env::var("LIQHUB_BA_JOURNAL") {
            if !path.is_empty() {
                config.binance.journal_path = path;
            }
        }
        if let Ok(path) = std::env::var("LIQHUB_OKX_JOURNAL") {
            if !path.is_empty() {
                config.okx.journal_path = path;
            }
        }
        if let Ok(path) = std::env::var("LIQHUB_OKX_CACHE") {
            if !path.is_empty() {
                config.okx.cache_path = path;
            }
        }

        if let Ok(threshold) = std::env::var("LIQHUB_THRESHOLD_USDT") {
            if let Ok(value) = threshold.parse::<f64>() {
                config.binance.threshold_usdt = value;
                config.okx.threshold_usdt = value;
            }
        }

        if let Ok(hours) = std::env::var("LIQHUB_RETENTION_HOURS") {
            if let Ok(value) = hours.parse::<i64>() {
                config.store.retention_hours = value;
            }
        }

        if let Ok(port) = std::env::var("LIQHUB_HTTP_PORT") {
            if let Ok(value) = port.parse::<u16>() {
                config.server.http_port = value;
            }
        }
        if let Ok(port) = std::env::var("LIQHUB_WS_PORT") {
            if let Ok(value) = port.parse::<u16>() {
                config.server.ws_port = value;
            }
        }

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.store.retention_hours > 0,
            "retention_hours must be positive, got {}",
            self.store.retention_hours
        );
        anyhow::ensure!(
            self.binance.threshold_usdt >= 0.0 && self.okx.threshold_usdt >= 0.0,
            "threshold_usdt must be non-negative"
        );
        anyhow::ensure!(
            self.server.http_port != self.server.ws_port,
            "HTTP and WS ports must differ, both are {}",
            self.server.http_port
        );
        anyhow::ensure!(self.store.poll_interval_ms > 0, "poll_interval_ms must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.http_port, 6680);
        assert_eq!(config.server.ws_port, 6681);
        assert_eq!(config.store.retention_hours, 48);
        assert_eq!(config.binance.threshold_usdt, 10.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.store.retention_hours = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.ws_port = config.server.http_port;
        assert!(config.validate().is_err());
    }
}
