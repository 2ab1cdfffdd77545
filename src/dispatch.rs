//! The public HTTP surface: route introspection/admin endpoints plus the
//! catch-all JSON-RPC reverse proxy that dispatches by decoded `to`
//! address.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::rlp;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<RwLock<Store>>,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/routes", get(get_routes).post(post_routes))
        .route("/status", get(get_status))
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn get_routes(State(state): State<Arc<AppState>>) -> Json<HashMap<String, String>> {
    let store = state.store.read().await;
    let map = store.routes().iter().map(|(addr, route)| (addr.clone(), route.url.clone())).collect();
    Json(map)
}

async fn post_routes(State(state): State<Arc<AppState>>, Json(body): Json<HashMap<String, String>>) -> impl IntoResponse {
    let mut store = state.store.write().await;
    match store.merge_admin_urls(body) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            error!(error = %err, "admin route merge failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: "internal error".into() })).into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(rename = "topicId")]
    topic_id: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    network: &'static str,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusBody> {
    let store = state.store.read().await;
    let public_key = store.rsa_keys().map(|k| k.public_key.clone()).unwrap_or_default();
    let network = match state.config.network {
        crate::config::Network::Testnet => "testnet",
        crate::config::Network::Mainnet => "mainnet",
    };
    Json(StatusBody { topic_id: state.config.topic_id.clone(), public_key, network })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// `ANY *`: decode the raw transaction embedded in the request body (if
/// any), resolve its backend by the decoded `to` address, and forward
/// the request unmodified otherwise.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let backend = resolve_backend(&state, &body).await;
    let target = format!("{}{}", backend.trim_end_matches('/'), uri.path_and_query().map(|p| p.as_str()).unwrap_or(""));

    let mut outbound = state.http.request(method, &target);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    outbound = outbound.body(body.to_vec());

    let timeout = Duration::from_secs(state.config.proxy_timeout_secs);
    match tokio::time::timeout(timeout, outbound.send()).await {
        Ok(Ok(resp)) => forward_response(resp).await,
        Ok(Err(err)) => {
            warn!(target = %target, error = %err, "upstream unreachable");
            (StatusCode::BAD_GATEWAY, Json(ErrorBody { error: "Proxy Error".into() })).into_response()
        }
        Err(_) => {
            warn!(target = %target, "upstream timed out");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

async fn resolve_backend(state: &AppState, body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return state.config.default_backend.clone();
    };
    let Some(raw_hex) = extract_raw_tx_hex(&value) else {
        return state.config.default_backend.clone();
    };
    let Ok(raw_bytes) = hex::decode(raw_hex.trim_start_matches("0x")) else {
        return state.config.default_backend.clone();
    };
    let to_addr = match rlp::extract_to(&raw_bytes) {
        Ok(addr) => addr,
        Err(err) => {
            info!(error = %err, "transaction undecodable, routing to default backend");
            return state.config.default_backend.clone();
        }
    };
    let Some(addr) = to_addr else {
        return state.config.default_backend.clone();
    };
    let store = state.store.read().await;
    store.get_target(&addr).map(|s| s.to_string()).unwrap_or_else(|| state.config.default_backend.clone())
}

/// Looks for a raw tx hex string under `params[0]`, `raw`, `data`, or
/// `transaction` — the shapes a JSON-RPC client or a generic forwarder
/// might use.
fn extract_raw_tx_hex(value: &serde_json::Value) -> Option<String> {
    if let Some(params) = value.get("params").and_then(|p| p.as_array()) {
        if let Some(s) = params.first().and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    for key in ["raw", "data", "transaction"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

async fn forward_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers().iter() {
        if name == reqwest::header::CONTENT_LENGTH || name == reqwest::header::TRANSFER_ENCODING {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes())) {
            headers.insert(name, value);
        }
    }
    let bytes = resp.bytes().await.unwrap_or_default();
    let mut builder = Response::builder().status(status.as_u16());
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder.body(axum::body::Body::from(bytes)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_raw_tx_from_params_array() {
        let value = serde_json::json!({"params": ["0xdeadbeef"]});
        assert_eq!(extract_raw_tx_hex(&value), Some("0xdeadbeef".to_string()));
    }

    #[test]
    fn extracts_raw_tx_from_named_fields() {
        assert_eq!(extract_raw_tx_hex(&serde_json::json!({"raw": "0x01"})), Some("0x01".to_string()));
        assert_eq!(extract_raw_tx_hex(&serde_json::json!({"data": "0x02"})), Some("0x02".to_string()));
        assert_eq!(extract_raw_tx_hex(&serde_json::json!({"transaction": "0x03"})), Some("0x03".to_string()));
    }

    #[test]
    fn returns_none_for_unrelated_body() {
        assert_eq!(extract_raw_tx_hex(&serde_json::json!({"method": "eth_blockNumber"})), None);
    }
}
