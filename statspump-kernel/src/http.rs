/**
 * STATUS API - read-only HTTP view of a running pump
 *
 * ROLE:
 * Lets operators and monitoring see what the pump is doing: node
 * reachability, bus queues and connections, per-poller cycle counters.
 *
 * HOW IT WORKS:
 * - axum router, JSON responses, nothing here mutates pump state
 * - /health is always open; every other route needs the x-api-key header
 *   to match STATSPUMP_API_KEY, and is denied when that key is not set
 */

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

use crate::appliance::{ApplianceSnapshot, LogicalAppliance};
use crate::bus::{BusSnapshot, MessageBusRegistry};
use crate::health::{PumpHealth, PumpHealthReport};
use crate::scheduler::{PollStats, PollTracker};

pub const API_KEY_ENV: &str = "STATSPUMP_API_KEY";

#[derive(Clone)]
pub struct StatusState {
    pub appliances: Arc<Vec<Arc<LogicalAppliance>>>,
    pub buses: Arc<MessageBusRegistry>,
    pub health: PumpHealth,
    pub polls: PollTracker,
    /// Expected x-api-key; `None` denies everything but /health.
    pub api_key: Option<String>,
}

/// Key from the environment, empty counts as unset.
pub fn api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty())
}

async fn require_api_key(State(state): State<StatusState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = state.api_key.as_deref() else {
        warn!("{API_KEY_ENV} not set, status API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/appliances", get(list_appliances))
        .route("/appliances/{name}", get(get_appliance))
        .route("/buses", get(list_buses))
        .route("/polls", get(list_polls))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

// GET /health
async fn get_health(State(state): State<StatusState>) -> Json<PumpHealthReport> {
    let nodes: Vec<_> = state.appliances.iter().flat_map(|a| a.nodes()).collect();
    let reachable = nodes.iter().filter(|n| n.is_reachable()).count();
    Json(state.health.get_health(state.appliances.len(), (reachable, nodes.len()), state.buses.metrics()))
}

// GET /appliances
async fn list_appliances(State(state): State<StatusState>) -> Json<Vec<ApplianceSnapshot>> {
    Json(state.appliances.iter().map(|a| a.snapshot()).collect())
}

// GET /appliances/{name}
async fn get_appliance(
    State(state): State<StatusState>,
    Path(name): Path<String>,
) -> Result<Json<ApplianceSnapshot>, StatusCode> {
    let Some(appliance) = state.appliances.iter().find(|a| a.name == name) else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(appliance.snapshot()))
}

// GET /buses
async fn list_buses(State(state): State<StatusState>) -> Json<Vec<BusSnapshot>> {
    Json(state.buses.all().iter().map(|b| b.snapshot()).collect())
}

// GET /polls
async fn list_polls(State(state): State<StatusState>) -> Json<Vec<PollStats>> {
    Json(state.polls.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusDefinition, BusKind};
    use crate::containers::EncodingKind;
    use crate::test_support::{bus_registry, logical_with};

    async fn serve(api_key: Option<&str>) -> String {
        let (registry, _broker) = bus_registry(4);
        let bus = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        let logical = logical_with(vec![bus], vec![], vec![]);
        logical.primary.declare_reachable();
        let state = StatusState {
            appliances: Arc::new(vec![logical]),
            buses: Arc::new(registry),
            health: PumpHealth::new(),
            polls: PollTracker::new(),
            api_key: api_key.map(str::to_string),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn get(url: &str, key: Option<&str>) -> (StatusCode, String) {
        let client = reqwest::Client::new();
        let mut req = client.get(url);
        if let Some(key) = key {
            req = req.header("x-api-key", key);
        }
        let resp = req.send().await.unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.text().await.unwrap())
    }

    #[tokio::test]
    async fn health_is_open_and_counts_nodes() {
        let base = serve(None).await;
        let (status, body) = get(&format!("{base}/health"), None).await;
        assert_eq!(status, StatusCode::OK);
        let report: PumpHealthReport = serde_json::from_str(&body).unwrap();
        assert_eq!(report.appliances, 1);
        assert_eq!(report.nodes_reachable, 1);
        assert_eq!(report.nodes_total, 1);
        assert_eq!(report.bus_queues, 1);
    }

    #[tokio::test]
    async fn other_routes_need_the_key() {
        let base = serve(Some("secret")).await;
        assert_eq!(get(&format!("{base}/buses"), None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(get(&format!("{base}/buses"), Some("wrong")).await.0, StatusCode::UNAUTHORIZED);

        let (status, body) = get(&format!("{base}/buses"), Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        let buses: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(buses[0]["vpn"], "mgmt");
        assert_eq!(buses[0]["kind"], "mgmt");
    }

    #[tokio::test]
    async fn unset_key_denies_everything_but_health() {
        let base = serve(None).await;
        assert_eq!(get(&format!("{base}/polls"), Some("anything")).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(get(&format!("{base}/health"), None).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn appliance_lookup_by_name() {
        let base = serve(Some("k")).await;
        let (status, body) = get(&format!("{base}/appliances"), Some("k")).await;
        assert_eq!(status, StatusCode::OK);
        let list: serde_json::Value = serde_json::from_str(&body).unwrap();
        let name = list[0]["name"].as_str().unwrap().to_string();

        let (status, body) = get(&format!("{base}/appliances/{name}"), Some("k")).await;
        assert_eq!(status, StatusCode::OK);
        let one: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(one["nodes"][0]["reachable"], true);

        assert_eq!(get(&format!("{base}/appliances/missing"), Some("k")).await.0, StatusCode::NOT_FOUND);
    }
}
