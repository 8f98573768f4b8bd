//! Admin API Request Handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use futures::Stream;
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use crate::admin::error::{AdminError, AdminResult};
use crate::config::ProxyStore;
use crate::proxy::{ProxyDefinition, ProxyKind, ProxyStatus, Supervisor};

/// Shared state of every handler
#[derive(Clone)]
pub struct AdminState {
    pub supervisor: Arc<Supervisor>,
    /// Where `persist` requests write the proxy list
    pub store: Option<ProxyStore>,
}

impl AdminState {
    pub fn new(supervisor: Arc<Supervisor>, store: Option<ProxyStore>) -> Self {
        Self { supervisor, store }
    }

    fn persist(&self) -> AdminResult<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| AdminError::BadRequest("No proxies file configured".to_string()))?;
        store.save(&self.supervisor.definitions())?;
        Ok(())
    }

    fn status(&self, id: &str) -> AdminResult<ProxyStatus> {
        self.supervisor
            .get(id)
            .map(|proxy| proxy.status())
            .ok_or_else(|| AdminError::NotFound(format!("Proxy {} not found", id)))
    }
}

/// `?autoStart&persist`; a bare flag counts as set
#[derive(Debug, Default, Deserialize)]
pub struct CreateQuery {
    #[serde(default, rename = "autoStart", deserialize_with = "flag")]
    pub auto_start: bool,
    #[serde(default, deserialize_with = "flag")]
    pub persist: bool,
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(matches!(value.as_deref(), Some("") | Some("true") | Some("1") | Some("yes")))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub id: String,
    pub stopped: bool,
}

fn parse_body(body: &Bytes) -> AdminResult<Value> {
    if body.is_empty() {
        return Err(AdminError::BadRequest("Empty request body".to_string()));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn register(state: &AdminState, definition: ProxyDefinition, query: &CreateQuery) -> AdminResult<ProxyStatus> {
    let id = definition.id().to_string();
    if !state.supervisor.add(definition)? {
        return Err(AdminError::BadRequest(format!("Proxy {} already exists", id)));
    }
    if query.auto_start {
        state.supervisor.start(&id)?;
    }
    if query.persist {
        state.persist()?;
    }
    info!("Registered proxy {} through the admin API", id);
    state.status(&id)
}

/// `POST /proxy`: the body carries its own `type`
pub async fn create_proxy(
    State(state): State<AdminState>,
    Query(query): Query<CreateQuery>,
    body: Bytes,
) -> AdminResult<Json<ProxyStatus>> {
    let definition: ProxyDefinition = serde_json::from_value(parse_body(&body)?)?;
    Ok(Json(register(&state, definition, &query)?))
}

/// `POST /proxy/{type}`: the type comes from the path
pub async fn create_typed_proxy(
    State(state): State<AdminState>,
    Path(kind): Path<String>,
    Query(query): Query<CreateQuery>,
    body: Bytes,
) -> AdminResult<Json<ProxyStatus>> {
    let kind: ProxyKind = kind.parse()?;
    let definition = ProxyDefinition::from_typed_json(kind, parse_body(&body)?)?;
    Ok(Json(register(&state, definition, &query)?))
}

/// `DELETE /proxy/{id}`
pub async fn remove_proxy(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<CreateQuery>,
) -> AdminResult<Json<ProxyStatus>> {
    let removed = state
        .supervisor
        .remove(&id)
        .await
        .ok_or_else(|| AdminError::NotFound(format!("Proxy {} not found", id)))?;
    if query.persist {
        state.persist()?;
    }
    Ok(Json(removed.status()))
}

/// `GET /proxy`
pub async fn list_proxies(State(state): State<AdminState>) -> Json<Vec<ProxyStatus>> {
    Json(state.supervisor.list().iter().map(|proxy| proxy.status()).collect())
}

/// `GET /proxy/{id}/start`
pub async fn start_proxy(State(state): State<AdminState>, Path(id): Path<String>) -> AdminResult<Json<ProxyStatus>> {
    state.supervisor.start(&id)?;
    Ok(Json(state.status(&id)?))
}

/// `GET /proxy/{id}/stop`
pub async fn stop_proxy(State(state): State<AdminState>, Path(id): Path<String>) -> AdminResult<Json<StopResponse>> {
    let stopped = state.supervisor.stop(&id).await?;
    Ok(Json(StopResponse { id, stopped }))
}

/// `POST /proxy/{id}/update`
pub async fn update_proxy(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Bytes,
) -> AdminResult<Json<Value>> {
    let effective = state.supervisor.update(&id, parse_body(&body)?)?;
    Ok(Json(effective))
}

/// `GET /event`: proxy events as server-sent events
pub async fn events(State(state): State<AdminState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.supervisor.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let data = match serde_json::to_string(&event) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Dropping unserializable event: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok::<_, Infallible>(Event::default().data(data)), receiver));
                }
                Err(RecvError::Lagged(skipped)) => warn!("Event subscriber lagged, {} events skipped", skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /ca.pem`: the root certificate clients must trust
pub async fn ca_certificate(State(state): State<AdminState>) -> AdminResult<impl IntoResponse> {
    let pem = state.supervisor.context().authority.root_certificate_pem()?;
    Ok(([(header::CONTENT_TYPE, "application/x-pem-file")], pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_flags_are_set() {
        let query: CreateQuery = parse_query("autoStart&persist=false");
        assert!(query.auto_start);
        assert!(!query.persist);

        let query: CreateQuery = parse_query("");
        assert!(!query.auto_start);
    }

    fn parse_query(raw: &str) -> CreateQuery {
        let uri: axum::http::Uri = format!("/proxy?{}", raw).parse().unwrap();
        Query::<CreateQuery>::try_from_uri(&uri).unwrap().0
    }
}
