//! Delegated location against local coordination services

mod common;

use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use synergy_proxy::admin::{build_router, AdminState};
use synergy_proxy::location::{Address, Location};
use synergy_proxy::ProxyError;
use tokio::net::TcpListener;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn delegated(url: &str, host: Option<&str>, port: Option<u16>) -> Location {
    serde_json::from_value(json!({"kind": "delegated", "url": url, "type": "pro", "host": host, "port": port})).unwrap()
}

#[derive(Clone, Default)]
struct Recorded {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

/// Coordination stub that already knows every proxy and doubles `cid`
fn stub(recorded: Recorded) -> Router {
    async fn create(
        State(recorded): State<Recorded>,
        Path(kind): Path<String>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        recorded.calls.lock().unwrap().push((format!("create {}", kind), body));
        StatusCode::BAD_REQUEST
    }
    async fn update(State(recorded): State<Recorded>, Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
        let cid = body["cid"].as_u64().unwrap_or(0);
        recorded.calls.lock().unwrap().push((format!("update {}", id), body));
        Json(json!({"cid": cid * 2}))
    }
    Router::new()
        .route("/proxy/:id", post(create))
        .route("/proxy/:id/update", post(update))
        .with_state(recorded)
}

#[tokio::test]
async fn test_existing_proxy_still_receives_payload() {
    let recorded = Recorded::default();
    let url = serve(stub(recorded.clone())).await;
    let location = delegated(&url, None, None);

    let address = Address::new("10.0.0.5", 1119);
    let (resolved, payload) = location.resolve(address.clone(), json!({"cid": 21})).await.unwrap();
    assert_eq!(resolved, address);
    assert_eq!(payload, json!({"cid": 42}));

    let calls = recorded.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "create pro");
    assert_eq!(calls[0].1["host"], "10.0.0.5");
    assert_eq!(calls[0].1["port"], 1119);
    assert_eq!(calls[1].0, format!("update {}", calls[0].1["id"].as_str().unwrap()));
}

#[tokio::test]
async fn test_management_api_as_coordination_service() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = common::supervisor(&dir);
    let url = serve(build_router(AdminState::new(Arc::clone(&supervisor), None))).await;
    let port = common::free_port();
    let location = delegated(&url, Some("127.0.0.1"), Some(port));

    let (resolved, payload) = location
        .resolve(Address::new("10.0.0.5", 1119), json!({"cid": 7, "k0": "AAE="}))
        .await
        .unwrap();
    assert_eq!(resolved, Address::new("127.0.0.1", port));
    assert_eq!(payload["cid"], 7);

    let proxies = supervisor.list();
    assert_eq!(proxies.len(), 1);
    assert!(proxies[0].is_running());
    assert_eq!(proxies[0].material().cid, 7);

    // a second referral reuses the proxy
    location
        .resolve(Address::new("10.0.0.5", 1119), json!({"cid": 8}))
        .await
        .unwrap();
    assert_eq!(supervisor.list().len(), 1);
    assert_eq!(supervisor.list()[0].material().cid, 8);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_failing_service_is_a_location_error() {
    let app = Router::new().route("/proxy/:id", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let url = serve(app).await;

    let error = delegated(&url, None, None)
        .resolve(Address::new("10.0.0.5", 1119), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, ProxyError::Location(_)));
}
