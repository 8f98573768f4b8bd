//! Registry of proxy instances
//!
//! Owns the event channel every instance publishes on and hands out
//! receivers to whoever wants to watch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::info;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::common::{ProxyError, Result};
use super::context::ProxyContext;
use super::definition::ProxyDefinition;
use super::event::{EventSink, ProxyEvent, EVENT_CAPACITY};
use super::instance::ProxyInstance;

pub struct Supervisor {
    context: Arc<ProxyContext>,
    proxies: RwLock<HashMap<String, Arc<ProxyInstance>>>,
    events: broadcast::Sender<ProxyEvent>,
}

impl Supervisor {
    pub fn new(context: Arc<ProxyContext>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { context, proxies: RwLock::new(HashMap::new()), events }
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ProxyInstance>>> {
        self.proxies.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ProxyInstance>>> {
        self.proxies.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a proxy; false if its id is taken
    pub fn add(&self, definition: ProxyDefinition) -> Result<bool> {
        let mut proxies = self.write();
        if proxies.contains_key(definition.id()) {
            return Ok(false);
        }
        let id = definition.id().to_string();
        let events = EventSink::new(id.clone(), self.events.clone());
        let instance = ProxyInstance::new(definition, Arc::clone(&self.context), events)?;
        info!("Added {} proxy {}", instance.definition().kind(), id);
        proxies.insert(id, Arc::new(instance));
        Ok(true)
    }

    /// Stop and unregister a proxy
    pub async fn remove(&self, id: &str) -> Option<Arc<ProxyInstance>> {
        let instance = self.write().remove(id)?;
        instance.stop().await;
        info!("Removed proxy {}", id);
        Some(instance)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyInstance>> {
        self.read().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<ProxyInstance>> {
        self.get(id).ok_or_else(|| ProxyError::NotFound(id.to_string()))
    }

    /// All proxies ordered by id
    pub fn list(&self) -> Vec<Arc<ProxyInstance>> {
        let mut proxies: Vec<_> = self.read().values().cloned().collect();
        proxies.sort_by(|a, b| a.id().cmp(b.id()));
        proxies
    }

    pub fn definitions(&self) -> Vec<ProxyDefinition> {
        self.list().iter().map(|proxy| proxy.definition().clone()).collect()
    }

    pub fn start(&self, id: &str) -> Result<SocketAddr> {
        self.require(id)?.start()
    }

    /// Stop a proxy; false if it was not running
    pub async fn stop(&self, id: &str) -> Result<bool> {
        Ok(self.require(id)?.stop().await)
    }

    pub fn update(&self, id: &str, body: Value) -> Result<Value> {
        self.require(id)?.update(body)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    pub async fn stop_all(&self) {
        for proxy in self.list() {
            proxy.stop().await;
        }
    }
}
