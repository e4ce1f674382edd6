//! HTTP endpoints for health checks, relay info, queries, and the indexer API.

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query as AxumQuery, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::filter::Filter;
use crate::relay::Relay;

/// Uniform JSON envelope for the `/api` endpoints.
#[derive(Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Response body for the health endpoints.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
    events: usize,
    connections: usize,
}

/// Start the HTTP server.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/health", get(health))
        .route("/query", get(query))
        .route("/api/health", get(health))
        .route("/api/search", get(search))
        .route("/api/profile/:pubkey", get(profile))
        .route("/api/following/:pubkey", get(following))
        .route("/api/followers/:pubkey", get(followers))
        .route("/api/indexer-stats", get(indexer_stats))
        .with_state(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Minimal NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    /// Human-readable relay name.
    name: String,
    /// Software identifier.
    software: String,
    /// Semantic version string such as "0.1.0".
    version: String,
    supported_nips: Vec<u32>,
}

/// Basic NIP-11 relay information document.
async fn relay_info() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "rivr".into(),
            software: "rivr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 11],
        }),
    )
}

/// Health check endpoint.
async fn health(State(relay): State<Arc<Relay>>) -> Json<ApiResponse<Health>> {
    Json(ApiResponse::ok(Health {
        status: "ok".to_string(),
        events: relay.store().len(),
        connections: relay.registry().connections(),
    }))
}

/// URL query parameters accepted by the `/query` endpoint.
#[derive(Deserialize)]
struct QueryParams {
    /// Comma-separated event ids.
    ids: Option<String>,
    /// Comma-separated hex public keys.
    authors: Option<String>,
    /// Comma-separated kind numbers (e.g. `1,30023`).
    kinds: Option<String>,
    /// Single `#d` tag value.
    d: Option<String>,
    /// Single `#t` topic value.
    t: Option<String>,
    /// Minimum `created_at` timestamp.
    since: Option<String>,
    /// Maximum `created_at` timestamp.
    until: Option<String>,
    /// Maximum number of events to return.
    limit: Option<String>,
}

/// Convert query string parameters into a [`Filter`] shared with the WS API.
///
/// Supported URL parameters mirror Nostr filter fields; returns `None` when
/// no parameter is present so a bare `/query` stays cheap.
///
/// Example: `/query?authors=npub1&kinds=1,30023&since=1700000000`
fn params_to_filter(params: QueryParams) -> Option<Filter> {
    use serde_json::Value;
    let mut obj = serde_json::Map::new();
    if let Some(i) = params.ids {
        let arr = i.split(',').map(|s| Value::String(s.to_string())).collect();
        obj.insert("ids".into(), Value::Array(arr));
    }
    if let Some(a) = params.authors {
        let arr = a.split(',').map(|s| Value::String(s.to_string())).collect();
        obj.insert("authors".into(), Value::Array(arr));
    }
    if let Some(k) = params.kinds {
        let arr = k
            .split(',')
            .filter_map(|v| v.parse::<u32>().ok())
            .map(|v| Value::Number(v.into()))
            .collect();
        obj.insert("kinds".into(), Value::Array(arr));
    }
    if let Some(d) = params.d {
        obj.insert("#d".into(), Value::Array(vec![Value::String(d)]));
    }
    if let Some(t) = params.t {
        obj.insert("#t".into(), Value::Array(vec![Value::String(t)]));
    }
    if let Some(s) = params.since.and_then(|v| v.parse::<u64>().ok()) {
        obj.insert("since".into(), Value::Number(s.into()));
    }
    if let Some(u) = params.until.and_then(|v| v.parse::<u64>().ok()) {
        obj.insert("until".into(), Value::Number(u.into()));
    }
    if let Some(l) = params.limit.and_then(|v| v.parse::<u64>().ok()) {
        obj.insert("limit".into(), Value::Number(l.into()));
    }
    if obj.is_empty() {
        return None;
    }
    Filter::from_value(&Value::Object(obj))
}

/// Parse query parameters and return matching events as NDJSON.
async fn query(
    State(relay): State<Arc<Relay>>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> axum::response::Response {
    let events = match params_to_filter(params) {
        Some(f) => relay.store().query(&[f], relay.default_limit()),
        None => vec![],
    };
    // Newline-delimited JSON so clients can stream and parse incrementally.
    let body = events
        .into_iter()
        .map(|e| serde_json::to_string(&e).unwrap())
        .collect::<Vec<_>>()
        .join("\n");
    axum::response::Response::builder()
        .header("Content-Type", "application/x-ndjson")
        .body(Body::from(body))
        .unwrap()
}

/// URL parameters for `/api/search`.
#[derive(Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default)]
    page: usize,
    #[serde(default = "default_per_page")]
    per_page: usize,
}

fn default_per_page() -> usize {
    20
}

/// Full-text profile search.
async fn search(
    State(relay): State<Arc<Relay>>,
    AxumQuery(params): AxumQuery<SearchParams>,
) -> impl IntoResponse {
    let result = relay
        .indexer()
        .search_profiles(&params.q, params.page, params.per_page);
    Json(ApiResponse::ok(result))
}

/// Single profile lookup.
async fn profile(
    State(relay): State<Arc<Relay>>,
    Path(pubkey): Path<String>,
) -> axum::response::Response {
    match relay.indexer().get_profile(&pubkey) {
        Some(p) => Json(ApiResponse::ok(p)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::err("profile not found")),
        )
            .into_response(),
    }
}

/// URL parameters shared by the contact endpoints.
#[derive(Deserialize)]
struct ContactParams {
    #[serde(default = "default_contact_limit")]
    limit: usize,
}

fn default_contact_limit() -> usize {
    100
}

/// Who this pubkey follows.
async fn following(
    State(relay): State<Arc<Relay>>,
    Path(pubkey): Path<String>,
    AxumQuery(params): AxumQuery<ContactParams>,
) -> impl IntoResponse {
    Json(ApiResponse::ok(
        relay.indexer().get_following(&pubkey, params.limit),
    ))
}

/// Who follows this pubkey.
async fn followers(
    State(relay): State<Arc<Relay>>,
    Path(pubkey): Path<String>,
    AxumQuery(params): AxumQuery<ContactParams>,
) -> impl IntoResponse {
    Json(ApiResponse::ok(
        relay.indexer().get_followers(&pubkey, params.limit),
    ))
}

/// Indexer counters.
async fn indexer_stats(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(ApiResponse::ok(relay.indexer().stats()))
}
