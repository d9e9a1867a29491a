use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::{NodeConfig, StartupError};
use crate::services::Services;

const READINESS_CHECK_BLOB_ID: &str = "docvault-readiness-check";
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub config: NodeConfig,
    pub services: Services,
}

pub async fn router(config: NodeConfig) -> Result<Router, StartupError> {
    let services = Services::build(&config).await?;
    Ok(router_with_services(config, services))
}

pub fn router_with_services(config: NodeConfig, services: Services) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(AppState { config, services })
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let mut checks = BTreeMap::new();

    let ledger_ready = tokio::time::timeout(READINESS_TIMEOUT, state.services.ledger.ping())
        .await
        .is_ok_and(|res| res.is_ok());
    checks.insert("ledger", ledger_ready);

    // Any answer from the blob store, including "absent", means it is reachable.
    let blobs_ready = tokio::time::timeout(
        READINESS_TIMEOUT,
        state.services.blobs.head(READINESS_CHECK_BLOB_ID),
    )
    .await
    .is_ok_and(|res| res.is_ok());
    checks.insert("blob_store", blobs_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    if !all_ready {
        tracing::warn!(
            ledger = ledger_ready,
            blob_store = blobs_ready,
            ledger_mode = ?state.config.ledger_mode,
            "readiness check failed"
        );
    }
    crate::metrics::observe_http_request("/readyz", status.as_u16(), started.elapsed());

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
        .into_response()
}

async fn metrics() -> Response {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::net::SocketAddr;

    use docvault_ledger::{MemoryLedger, MetadataLedger};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn spawn_server(
        app: Router,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        (addr, shutdown_tx, handle)
    }

    fn memory_config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig::from_kv(&HashMap::from([
            ("DOCVAULT_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
            (
                "DOCVAULT_LOCAL_CACHE_PATH".to_string(),
                dir.join("cache.json").to_string_lossy().to_string(),
            ),
        ]))
        .expect("config should be valid")
    }

    #[tokio::test]
    async fn operator_endpoints_report_health_readiness_and_metrics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = memory_config(dir.path());
        let app = router(config).await.expect("router should build");
        let (addr, shutdown, task) = spawn_server(app).await;
        let client = reqwest::Client::new();

        let health = client
            .get(format!("http://{}/healthz", addr))
            .send()
            .await
            .expect("healthz request");
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let ready = client
            .get(format!("http://{}/readyz", addr))
            .send()
            .await
            .expect("readyz request");
        assert_eq!(ready.status(), reqwest::StatusCode::OK);
        let body = ready.json::<serde_json::Value>().await.expect("readyz json");
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"]["ledger"], true);

        let metrics = client
            .get(format!("http://{}/metrics", addr))
            .send()
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("metrics body");
        assert!(metrics.contains("docvault_node_http_requests_total"));

        shutdown.send(()).ok();
        let _ = task.await;
    }

    #[tokio::test]
    async fn readyz_is_unavailable_when_ledger_is_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = memory_config(dir.path());
        let mut services = Services::build(&config).await.expect("services");
        let ledger = std::sync::Arc::new(MemoryLedger::new());
        ledger.set_offline(true);
        let ledger: std::sync::Arc<dyn MetadataLedger> = ledger;
        services.ledger = ledger;

        let (addr, shutdown, task) =
            spawn_server(router_with_services(config, services)).await;
        let resp = reqwest::Client::new()
            .get(format!("http://{}/readyz", addr))
            .send()
            .await
            .expect("readyz request");
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body = resp.json::<serde_json::Value>().await.expect("readyz json");
        assert_eq!(body["checks"]["ledger"], false);
        assert_eq!(body["checks"]["blob_store"], true);

        shutdown.send(()).ok();
        let _ = task.await;
    }
}
