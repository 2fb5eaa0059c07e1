//! HTTP gateway in front of the coordinator.
//!
//! Exposes health and relay info, filter queries fanned out over the
//! configured relays, and the coordinator's performance view. `POST /query`
//! speaks the same wire format the HTTP strategy expects, so one gateway can
//! serve as the HTTP endpoint of another.

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query as AxumQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, info};

use crate::{
    coordinator::HybridQueryCoordinator,
    filter::Filter,
    metrics::RelayPerformanceMetrics,
    query::{MultiRelayResult, QueryOptions},
};

#[derive(Clone)]
struct GatewayState {
    coordinator: HybridQueryCoordinator,
    relays: Arc<Vec<String>>,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
    relays: usize,
}

/// Build the gateway routes over `relays`.
pub fn router(coordinator: HybridQueryCoordinator, relays: Vec<String>) -> Router {
    let state = GatewayState {
        coordinator,
        relays: Arc::new(relays),
    };
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/query", get(query_params).post(query_body))
        .route("/metrics", get(metrics))
        .route("/relays/best", get(best_relays))
        .with_state(state)
}

/// Start the gateway on `addr` until `shutdown` resolves.
pub async fn serve_http(
    addr: SocketAddr,
    coordinator: HybridQueryCoordinator,
    relays: Vec<String>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, relays = relays.len(), "gateway listening");
    let app = router(coordinator, relays);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz(State(state): State<GatewayState>) -> Json<Health> {
    debug!("GET /healthz");
    Json(Health {
        status: "ok".to_string(),
        relays: state.relays.len(),
    })
}

/// Minimal NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    software: String,
    version: String,
}

async fn relay_info() -> impl IntoResponse {
    debug!("GET /");
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "relayq".into(),
            description: "query gateway over upstream nostr relays".into(),
            software: "relayq".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }),
    )
}

/// Fan a filter out over the configured relays.
async fn fan_out(state: &GatewayState, filter: &Filter) -> MultiRelayResult {
    state
        .coordinator
        .query_multiple_relays(&state.relays, filter, &QueryOptions::default())
        .await
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response()
}

/// JSON filter in, JSON array of events out.
async fn query_body(State(state): State<GatewayState>, Json(body): Json<Value>) -> Response {
    if !body.is_object() {
        return bad_request("filter must be a JSON object".into());
    }
    let filter = Filter::from_value(&body);
    if let Err(e) = filter.validate() {
        return bad_request(e.to_string());
    }
    let result = fan_out(&state, &filter).await;
    debug!(
        events = result.events.len(),
        successful_relays = result.successful_relays,
        "POST /query"
    );
    Json(result.events).into_response()
}

/// URL query parameters accepted by `GET /query`.
#[derive(Deserialize)]
struct QueryParams {
    /// Comma-separated hex public keys.
    authors: Option<String>,
    /// Comma-separated kind numbers (e.g. `1,33404`).
    kinds: Option<String>,
    d: Option<String>,
    t: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
}

/// Convert query string parameters into a [`Filter`].
///
/// Example: `/query?authors=abc&kinds=1301&since=1700000000&limit=10`.
/// Unparseable numbers are ignored.
fn params_to_filter(params: QueryParams) -> Filter {
    let mut obj = serde_json::Map::new();
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
    for (key, raw) in [("since", params.since), ("until", params.until), ("limit", params.limit)] {
        if let Some(n) = raw.and_then(|v| v.parse::<u64>().ok()) {
            obj.insert(key.into(), Value::Number(n.into()));
        }
    }
    Filter::from_value(&Value::Object(obj))
}

/// Query string in, newline-delimited JSON events out.
async fn query_params(
    State(state): State<GatewayState>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> Response {
    let filter = params_to_filter(params);
    if let Err(e) = filter.validate() {
        return bad_request(e.to_string());
    }
    let result = fan_out(&state, &filter).await;
    debug!(events = result.events.len(), "GET /query");
    let body = result
        .events
        .iter()
        .filter_map(|e| serde_json::to_string(e).ok())
        .collect::<Vec<_>>()
        .join("\n");
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from(body)).into_response()
}

async fn metrics(State(state): State<GatewayState>) -> Json<HashMap<String, RelayPerformanceMetrics>> {
    Json(state.coordinator.performance_metrics())
}

#[derive(Deserialize)]
struct BestParams {
    limit: Option<usize>,
}

async fn best_relays(
    State(state): State<GatewayState>,
    AxumQuery(params): AxumQuery<BestParams>,
) -> Json<Vec<String>> {
    let limit = params.limit.unwrap_or(state.relays.len().max(1));
    Json(state.coordinator.best_performing_relays(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::CoordinatorConfig,
        event::{sample_event, Event},
        testing::{Reply, ScriptedTransport},
    };
    use std::time::Duration;
    use tokio::task;

    fn gateway(transport: &Arc<ScriptedTransport>, relays: &[&str]) -> Router {
        let coord = HybridQueryCoordinator::with_transport(
            CoordinatorConfig {
                batch_delay: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
            transport.clone(),
        );
        router(coord, relays.iter().map(|r| r.to_string()).collect())
    }

    async fn spawn(app: Router) -> (String, task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = task::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    fn two_relays() -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "wss://a",
            Reply::Events(vec![sample_event("e1", 1, 1), sample_event("e2", 1, 2)]),
            Reply::Fail,
            Reply::Fail,
        );
        transport.script(
            "wss://b",
            Reply::Events(vec![sample_event("e2", 1, 2), sample_event("e3", 1, 3)]),
            Reply::Fail,
            Reply::Fail,
        );
        transport
    }

    #[tokio::test]
    async fn health_and_info() {
        let transport = Arc::new(ScriptedTransport::new());
        let (base, handle) = spawn(gateway(&transport, &["wss://a"])).await;
        let health: Health = reqwest::get(format!("{base}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.relays, 1);

        let resp = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let info: RelayInfo = resp.json().await.unwrap();
        assert_eq!(info.software, "relayq");
        handle.abort();
    }

    #[tokio::test]
    async fn post_query_merges_relays() {
        let transport = two_relays();
        let (base, handle) = spawn(gateway(&transport, &["wss://a", "wss://b"])).await;
        let events: Vec<Event> = reqwest::Client::new()
            .post(format!("{base}/query"))
            .json(&serde_json::json!({"kinds": [1], "limit": 10}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert_eq!(transport.calls()[0].filter.kinds, Some(vec![1]));
        handle.abort();
    }

    #[tokio::test]
    async fn post_query_rejects_invalid_filters() {
        let transport = two_relays();
        let (base, handle) = spawn(gateway(&transport, &["wss://a"])).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/query"))
            .json(&serde_json::json!({"since": 10, "until": 5}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let resp = client
            .post(format!("{base}/query"))
            .json(&serde_json::json!([1, 2]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(transport.calls().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn get_query_returns_ndjson() {
        let transport = two_relays();
        let (base, handle) = spawn(gateway(&transport, &["wss://a", "wss://b"])).await;
        let body = reqwest::get(format!("{base}/query?kinds=1&t=run&limit=nah"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body.lines().count(), 3);
        let sent = &transport.calls()[0].filter;
        assert_eq!(sent.tags.get("#t"), Some(&vec!["run".to_string()]));
        assert_eq!(sent.limit, None);
        handle.abort();
    }

    #[tokio::test]
    async fn metrics_and_best_relays() {
        let transport = two_relays();
        transport.script("wss://down", Reply::Fail, Reply::Fail, Reply::Fail);
        let (base, handle) = spawn(gateway(&transport, &["wss://down", "wss://a"])).await;
        reqwest::get(format!("{base}/query?kinds=1")).await.unwrap();

        let metrics: Value = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["wss://a"]["http_success"], 1);
        assert_eq!(metrics["wss://down"]["websocket_failure"], 1);

        let best: Vec<String> = reqwest::get(format!("{base}/relays/best?limit=1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(best, vec!["wss://a"]);
        handle.abort();
    }

    #[tokio::test]
    async fn serve_http_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport: Arc<ScriptedTransport> = Arc::new(ScriptedTransport::new());
        let coord = HybridQueryCoordinator::with_transport(CoordinatorConfig::default(), transport);
        assert!(serve_http(addr, coord, vec![], std::future::pending())
            .await
            .is_err());
    }
}
