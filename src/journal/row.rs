//! Line codec for the on-disk journals.
//!
//! Journals are append-only CSV files, one per exchange, kept byte-compatible
//! with the historical recorders: the header and direction tokens are Chinese
//! and the exchange tag is the short code (`BA`/`OKX`). Those strings are
//! purely lexical; everything behind this module speaks the closed enums.

use crate::models::event::{
    normalize_symbol, parse_hub_datetime, Direction, Exchange, LiquidationEvent,
};
use thiserror::Error;

pub const HEADER: &str = "时间,币对,交易所,价格,方向,金额";
pub const FIELD_COUNT: usize = 6;

const TAG_BINANCE: &str = "BA";
const TAG_BINANCE_LEGACY: &str = "币安";
const TAG_OKX: &str = "OKX";
const TOKEN_LONG: &str = "多头爆仓";
const TOKEN_SHORT: &str = "空头爆仓";

#[derive(Debug, Error)]
pub enum RowError {
    #[error("expected {FIELD_COUNT} fields, got {0}")]
    Width(usize),
    #[error("bad timestamp: {0}")]
    Timestamp(String),
    #[error("bad number: {0}")]
    Number(String),
    #[error("unknown direction token: {0}")]
    Direction(String),
}

pub fn is_header(line: &str) -> bool {
    line.trim() == HEADER
}

fn exchange_tag(exchange: Exchange) -> &'static str {
    match exchange {
        Exchange::Binance => TAG_BINANCE,
        Exchange::Okx => TAG_OKX,
    }
}

fn direction_token(direction: Direction) -> &'static str {
    match direction {
        Direction::LongLiquidated => TOKEN_LONG,
        Direction::ShortLiquidated => TOKEN_SHORT,
    }
}

/// Render one journal line for an event.
///
/// Number formatting follows the historical files: Binance rows carry the
/// fill price to 8 decimals and the notional to 2; OKX rows carry the
/// bankruptcy price as parsed and the notional rounded to whole USDT.
pub fn encode(event: &LiquidationEvent) -> String {
    let (price, amount) = match event.exchange {
        Exchange::Binance => (
            format!("{:.8}", event.price),
            format!("{:.2}", event.amount),
        ),
        Exchange::Okx => (format!("{}", event.price), format!("{}", event.amount)),
    };
    format!(
        "{},{},{},{},{},{}",
        event.datetime_string(),
        event.symbol,
        exchange_tag(event.exchange),
        price,
        direction_token(event.direction),
        amount,
    )
}

/// Parse one journal line back into an event.
///
/// Readers are lenient where the historical files were: fields are trimmed,
/// the symbol is re-normalized, and any exchange tag other than the Binance
/// ones is read as OKX.
pub fn decode(line: &str) -> Result<LiquidationEvent, RowError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(RowError::Width(fields.len()));
    }

    let timestamp =
        parse_hub_datetime(fields[0]).ok_or_else(|| RowError::Timestamp(fields[0].to_string()))?;
    let symbol = normalize_symbol(fields[1]);
    let exchange = match fields[2] {
        TAG_BINANCE | TAG_BINANCE_LEGACY => Exchange::Binance,
        _ => Exchange::Okx,
    };
    let price: f64 = fields[3]
        .parse()
        .map_err(|_| RowError::Number(fields[3].to_string()))?;
    let direction = match fields[4] {
        TOKEN_LONG => Direction::LongLiquidated,
        TOKEN_SHORT => Direction::ShortLiquidated,
        other => return Err(RowError::Direction(other.to_string())),
    };
    let amount: f64 = fields[5]
        .parse()
        .map_err(|_| RowError::Number(fields[5].to_string()))?;

    Ok(LiquidationEvent {
        timestamp,
        symbol,
        exchange,
        price,
        direction,
        amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::parse_hub_datetime;

    fn binance_event() -> LiquidationEvent {
        LiquidationEvent {
            timestamp: parse_hub_datetime("2023-11-15 06:13:20").unwrap(),
            symbol: "BTC".to_string(),
            exchange: Exchange::Binance,
            price: 40000.0,
            direction: Direction::LongLiquidated,
            amount: 20000.0,
        }
    }

    #[test]
    fn test_encode_binance_formatting() {
        let line = encode(&binance_event());
        assert_eq!(
            line,
            "2023-11-15 06:13:20,BTC,BA,40000.00000000,多头爆仓,20000.00"
        );
    }

    #[test]
    fn test_encode_okx_formatting() {
        let event = LiquidationEvent {
            timestamp: parse_hub_datetime("2023-11-15 06:13:20").unwrap(),
            symbol: "ETH".to_string(),
            exchange: Exchange::Okx,
            price: 2000.5,
            direction: Direction::ShortLiquidated,
            amount: 1050.0,
        };
        assert_eq!(encode(&event), "2023-11-15 06:13:20,ETH,OKX,2000.5,空头爆仓,1050");
    }

    #[test]
    fn test_round_trip() {
        let event = binance_event();
        let decoded = decode(&encode(&event)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_legacy_exchange_tag() {
        let line = "2023-11-15 06:13:20,BTCUSDT,币安,40000,多头爆仓,20000";
        let decoded = decode(line).unwrap();
        assert_eq!(decoded.exchange, Exchange::Binance);
        // Symbol is re-normalized on read
        assert_eq!(decoded.symbol, "BTC");
    }

    #[test]
    fn test_decode_rejects_malformed_rows() {
        assert!(matches!(decode("a,b,c"), Err(RowError::Width(3))));
        assert!(matches!(
            decode("not a time,BTC,BA,1,多头爆仓,10"),
            Err(RowError::Timestamp(_))
        ));
        assert!(matches!(
            decode("2023-11-15 06:13:20,BTC,BA,1,sideways,10"),
            Err(RowError::Direction(_))
        ));
        assert!(matches!(
            decode("2023-11-15 06:13:20,BTC,BA,cheap,多头爆仓,10"),
            Err(RowError::Number(_))
        ));
    }

    #[test]
    fn test_header_detection() {
        assert!(is_header("时间,币对,交易所,价格,方向,金额"));
        assert!(!is_header("2023-11-15 06:13:20,BTC,BA,1,多头爆仓,10"));
    }
}
