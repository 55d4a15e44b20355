use crate::models::event::{parse_hub_datetime, Direction, Exchange, LiquidationEvent};
use chrono::{DateTime, FixedOffset};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unparseable time parameter: {0}")]
    Time(String),
    #[error("unknown exchange: {0}")]
    Exchange(String),
    #[error("unknown direction: {0}")]
    Direction(String),
    #[error("invalid limit: {0}")]
    Limit(String),
}

/// Typed form of the comma-separated query parameters accepted by the read
/// endpoints. Parsed once at the endpoint boundary, then passed by value
/// into the store.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub since: Option<DateTime<FixedOffset>>,
    pub until: Option<DateTime<FixedOffset>>,
    pub symbols: Option<HashSet<String>>,
    pub exchanges: Option<HashSet<Exchange>>,
    pub directions: Option<HashSet<Direction>>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn matches(&self, event: &LiquidationEvent) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        if let Some(symbols) = &self.symbols {
            if !symbols.contains(&event.symbol.to_uppercase()) {
                return false;
            }
        }
        if let Some(exchanges) = &self.exchanges {
            if !exchanges.contains(&event.exchange) {
                return false;
            }
        }
        if let Some(directions) = &self.directions {
            if !directions.contains(&event.direction) {
                return false;
            }
        }
        true
    }
}

/// Parse a `since`/`until` value: either `YYYY-MM-DD HH:MM:SS` in the hub
/// zone, or epoch seconds/milliseconds (values above 10^12 are taken as ms).
pub fn parse_time_param(value: &str) -> Result<DateTime<FixedOffset>, FilterError> {
    let value = value.trim();
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        let mut epoch: i64 = value
            .parse()
            .map_err(|_| FilterError::Time(value.to_string()))?;
        if epoch > 1_000_000_000_000 {
            epoch /= 1000;
        }
        return crate::models::event::from_epoch_ms(epoch * 1000)
            .ok_or_else(|| FilterError::Time(value.to_string()));
    }
    parse_hub_datetime(value).ok_or_else(|| FilterError::Time(value.to_string()))
}

/// Split a comma-separated symbols parameter into an uppercase set.
pub fn parse_symbols_param(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn parse_exchanges_param(value: &str) -> Result<HashSet<Exchange>, FilterError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Exchange::parse_token(s).ok_or_else(|| FilterError::Exchange(s.to_string())))
        .collect()
}

pub fn parse_directions_param(value: &str) -> Result<HashSet<Direction>, FilterError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Direction::parse_token(s).ok_or_else(|| FilterError::Direction(s.to_string())))
        .collect()
}

/// Assemble a [`QueryFilter`] from raw query-string parameters. Any
/// unparseable parameter is an error; per the API contract that maps to a
/// 400 rather than a silently-narrowed result.
pub fn build_filter(
    since: Option<&str>,
    until: Option<&str>,
    symbols: Option<&str>,
    exchanges: Option<&str>,
    directions: Option<&str>,
    limit: Option<&str>,
) -> Result<QueryFilter, FilterError> {
    let mut filter = QueryFilter::default();
    if let Some(v) = since {
        filter.since = Some(parse_time_param(v)?);
    }
    if let Some(v) = until {
        filter.until = Some(parse_time_param(v)?);
    }
    if let Some(v) = symbols {
        filter.symbols = Some(parse_symbols_param(v));
    }
    if let Some(v) = exchanges {
        filter.exchanges = Some(parse_exchanges_param(v)?);
    }
    if let Some(v) = directions {
        filter.directions = Some(parse_directions_param(v)?);
    }
    if let Some(v) = limit {
        filter.limit = Some(
            v.trim()
                .parse()
                .map_err(|_| FilterError::Limit(v.to_string()))?,
        );
    }
    Ok(filter)
}
