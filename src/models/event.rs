use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock format used on the journal files and in API responses.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// All timestamps in the system live in a fixed +08:00 zone. Exchange feeds
/// deliver epoch milliseconds; the shift happens exactly once, at the adapter.
pub fn hub_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("static offset")
}

/// Current wall-clock time in the hub zone.
pub fn hub_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&hub_offset())
}

/// Convert an exchange-side epoch-milliseconds timestamp into the hub zone,
/// truncated to second resolution.
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<FixedOffset>> {
    DateTime::<Utc>::from_timestamp(ms / 1000, 0).map(|dt| dt.with_timezone(&hub_offset()))
}

/// Parse a `YYYY-MM-DD HH:MM:SS` wall-clock string as hub-zone time.
pub fn parse_hub_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .ok()
        .and_then(|naive| hub_offset().from_local_datetime(&naive).single())
}

/// Uppercase a raw exchange pair and strip the quote suffix, keeping the base
/// coin: `BTCUSDT` → `BTC`, `ethusdc` → `ETH`.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.to_uppercase();
    for quote in ["USDT", "USDC"] {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    upper
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    #[serde(rename = "OKX")]
    Okx,
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Binance => "Binance",
            Exchange::Okx => "OKX",
        }
    }

    /// Parse a user-supplied filter token. Accepts the public name, the
    /// journal short code, and the legacy Chinese tag for Binance.
    pub fn parse_token(token: &str) -> Option<Self> {
        match token.trim() {
            t if t.eq_ignore_ascii_case("binance") || t.eq_ignore_ascii_case("ba") => {
                Some(Exchange::Binance)
            }
            "币安" => Some(Exchange::Binance),
            t if t.eq_ignore_ascii_case("okx") => Some(Exchange::Okx),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LONG_LIQUIDATED")]
    LongLiquidated,
    #[serde(rename = "SHORT_LIQUIDATED")]
    ShortLiquidated,
}

impl Direction {
    /// Parse a user-supplied filter token. Accepts the public enum name, a
    /// bare `long`/`short`, and the legacy journal token.
    pub fn parse_token(token: &str) -> Option<Self> {
        match token.trim() {
            t if t.eq_ignore_ascii_case("long_liquidated") || t.eq_ignore_ascii_case("long") => {
                Some(Direction::LongLiquidated)
            }
            t if t.eq_ignore_ascii_case("short_liquidated") || t.eq_ignore_ascii_case("short") => {
                Some(Direction::ShortLiquidated)
            }
            "多头爆仓" => Some(Direction::LongLiquidated),
            "空头爆仓" => Some(Direction::ShortLiquidated),
            _ => None,
        }
    }
}

/// A normalized forced-liquidation event, the single value traded between
/// adapters, journals, the store and the fan-out surfaces.
///
/// `amount` is the USDT notional (`base-coin quantity × price`); `symbol` is
/// the uppercased base coin with the USDT/USDC suffix stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationEvent {
    pub timestamp: DateTime<FixedOffset>,
    pub symbol: String,
    pub exchange: Exchange,
    pub price: f64,
    pub direction: Direction,
    pub amount: f64,
}

impl LiquidationEvent {
    pub fn datetime_string(&self) -> String {
        self.timestamp.format(TIME_FORMAT).to_string()
    }
}

/// A `LiquidationEvent` once resident in the store, stamped with the store's
/// monotonic insertion sequence. The sequence is the stream cursor: unlike
/// second-resolution timestamps it never collides.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub seq: u64,
    pub event: LiquidationEvent,
}

/// Wire form of an event on every read surface (REST, SSE, WS push).
#[derive(Debug, Clone, Serialize)]
pub struct PublicEvent {
    pub datetime: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub price: f64,
    pub direction: Direction,
    pub amount: f64,
    pub seq: u64,
}

impl From<&StoredEvent> for PublicEvent {
    fn from(stored: &StoredEvent) -> Self {
        Self {
            datetime: stored.event.datetime_string(),
            symbol: stored.event.symbol.clone(),
            exchange: stored.event.exchange,
            price: stored.event.price,
            direction: stored.event.direction,
            amount: stored.event.amount,
            seq: stored.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("BTCUSDT"), "BTC");
        assert_eq!(normalize_symbol("ethusdc"), "ETH");
        assert_eq!(normalize_symbol("1000PEPEUSDT"), "1000PEPE");
        // No recognised quote suffix: uppercased as-is
        assert_eq!(normalize_symbol("BTCUSD"), "BTCUSD");
        // Degenerate pair that is only the suffix stays intact
        assert_eq!(normalize_symbol("USDT"), "USDT");
    }

    #[test]
    fn test_epoch_ms_shifts_into_hub_zone() {
        let ts = from_epoch_ms(1_700_000_000_000).unwrap();
        // 2023-11-14 22:13:20 UTC == 2023-11-15 06:13:20 +08:00
        assert_eq!(ts.format(TIME_FORMAT).to_string(), "2023-11-15 06:13:20");
    }

    #[test]
    fn test_parse_hub_datetime_round_trip() {
        let ts = parse_hub_datetime("2024-03-01 12:30:45").unwrap();
        assert_eq!(ts.format(TIME_FORMAT).to_string(), "2024-03-01 12:30:45");
        assert_eq!(ts.offset().local_minus_utc(), 8 * 3600);
        assert!(parse_hub_datetime("not a time").is_none());
    }

    #[test]
    fn test_direction_json_names() {
        assert_eq!(
            serde_json::to_string(&Direction::LongLiquidated).unwrap(),
            "\"LONG_LIQUIDATED\""
        );
        assert_eq!(
            serde_json::to_string(&Direction::ShortLiquidated).unwrap(),
            "\"SHORT_LIQUIDATED\""
        );
        assert_eq!(serde_json::to_string(&Exchange::Okx).unwrap(), "\"OKX\"");
    }

    #[test]
    fn test_filter_tokens() {
        assert_eq!(Exchange::parse_token("BA"), Some(Exchange::Binance));
        assert_eq!(Exchange::parse_token("币安"), Some(Exchange::Binance));
        assert_eq!(Exchange::parse_token("okx"), Some(Exchange::Okx));
        assert_eq!(Exchange::parse_token("bybit"), None);

        assert_eq!(Direction::parse_token("LONG"), Some(Direction::LongLiquidated));
        assert_eq!(Direction::parse_token("多头爆仓"), Some(Direction::LongLiquidated));
        assert_eq!(Direction::parse_token("sideways"), None);
    }
}
