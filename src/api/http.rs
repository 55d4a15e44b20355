use crate::models::event::{hub_now, Exchange, PublicEvent, TIME_FORMAT};
use crate::models::filter::{build_filter, parse_symbols_param, FilterError, QueryFilter};
use crate::store::{EventStore, SymbolWindowStats, WindowAggregates};
use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<EventStore>,
    pub latest_list_size: usize,
    pub sse_interval: Duration,
}

/// Read endpoints over the event store, all CORS-open:
/// `/data`, `/latest_liquidations`, `/history`, `/symbol_stats`, `/health`
/// and the `/stream` SSE tail.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/data", get(get_data))
        .route("/latest_liquidations", get(get_latest))
        .route("/history", get(get_history))
        .route("/symbol_stats", get(get_symbol_stats))
        .route("/health", get(get_health))
        .route("/stream", get(get_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown. A bind failure propagates out so the
/// process can exit nonzero.
pub async fn serve(
    state: ApiState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind HTTP port {port}"))?;
    info!("HTTP API listening on 0.0.0.0:{port}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

fn bad_request(e: FilterError) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}

async fn get_data(State(state): State<ApiState>) -> Json<BTreeMap<i64, WindowAggregates>> {
    Json(state.store.aggregates().await)
}

async fn get_latest(State(state): State<ApiState>) -> Json<Vec<PublicEvent>> {
    let events = state.store.list_latest(state.latest_list_size).await;
    Json(events.iter().map(PublicEvent::from).collect())
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    since: Option<String>,
    until: Option<String>,
    symbols: Option<String>,
    exchanges: Option<String>,
    directions: Option<String>,
    limit: Option<String>,
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<PublicEvent>>, (StatusCode, String)> {
    let filter = build_filter(
        params.since.as_deref(),
        params.until.as_deref(),
        params.symbols.as_deref(),
        params.exchanges.as_deref(),
        params.directions.as_deref(),
        params.limit.as_deref(),
    )
    .map_err(bad_request)?;

    let events = state.store.query(&filter).await;
    Ok(Json(events.iter().map(PublicEvent::from).collect()))
}

#[derive(Debug, Deserialize)]
struct SymbolStatsParams {
    symbols: Option<String>,
}

async fn get_symbol_stats(
    State(state): State<ApiState>,
    Query(params): Query<SymbolStatsParams>,
) -> Json<HashMap<String, BTreeMap<i64, SymbolWindowStats>>> {
    let symbols = params.symbols.as_deref().map(parse_symbols_param);
    Json(state.store.symbol_stats(symbols.as_ref()).await)
}

#[derive(Debug, Serialize)]
struct ExchangeHealth {
    last_seen: Option<String>,
    lag_seconds: Option<f64>,
}

async fn get_health(State(state): State<ApiState>) -> Json<BTreeMap<Exchange, ExchangeHealth>> {
    let seen = state.store.last_seen().await;
    let now = hub_now();

    let mut health = BTreeMap::new();
    for exchange in [Exchange::Binance, Exchange::Okx] {
        let last = seen.get(&exchange);
        health.insert(
            exchange,
            ExchangeHealth {
                last_seen: last.map(|t| t.format(TIME_FORMAT).to_string()),
                lag_seconds: last.map(|t| (now - *t).num_milliseconds() as f64 / 1000.0),
            },
        );
    }
    Json(health)
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    symbols: Option<String>,
    exchanges: Option<String>,
    directions: Option<String>,
}

/// SSE tail of the store: every tick emits the events appended since the
/// last tick as one JSON array, or a comment frame when there is nothing.
///
/// The cursor is the store's insertion sequence, not a timestamp, so two
/// events landing within the same second can never shadow each other.
async fn get_stream(
    State(state): State<ApiState>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let filter = build_filter(
        None,
        None,
        params.symbols.as_deref(),
        params.exchanges.as_deref(),
        params.directions.as_deref(),
        None,
    )
    .map_err(bad_request)?;

    let cursor = state.store.current_seq().await;
    let tail = SseTail {
        store: state.store.clone(),
        filter,
        cursor,
        interval: state.sse_interval,
    };

    let stream = futures_util::stream::unfold(tail, |mut tail| async move {
        tokio::time::sleep(tail.interval).await;

        let batch = tail.store.events_after(tail.cursor).await;
        if let Some(last) = batch.last() {
            tail.cursor = last.seq;
        }
        let matched: Vec<PublicEvent> = batch
            .iter()
            .filter(|stored| tail.filter.matches(&stored.event))
            .map(PublicEvent::from)
            .collect();

        let frame = if matched.is_empty() {
            Event::default().comment("keep-alive")
        } else {
            match serde_json::to_string(&matched) {
                Ok(json) => Event::default().data(json),
                Err(_) => Event::default().comment("keep-alive"),
            }
        };
        Some((Ok::<_, Infallible>(frame), tail))
    });

    Ok(Sse::new(stream))
}

struct SseTail {
    store: Arc<EventStore>,
    filter: QueryFilter,
    cursor: u64,
    interval: Duration,
}
