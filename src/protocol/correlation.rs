//! Request/response correlation
//!
//! Each socket owns one table. A request written to the socket records its
//! token; the response read back from the same socket consumes it. Reading and
//! writing happen on different tasks, hence the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use super::registry::MethodDescriptor;

/// Outstanding requests of one socket, keyed by token
#[derive(Debug, Clone, Default)]
pub struct PendingResponses {
    inner: Arc<Mutex<HashMap<u32, Arc<MethodDescriptor>>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Arc<MethodDescriptor>>> {
        // A poisoned table is still a valid map.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember that `token` expects the response of `method`
    ///
    /// Void methods are ignored.
    pub fn record(&self, token: u32, method: Arc<MethodDescriptor>) {
        if !method.has_response() {
            return;
        }
        if let Some(previous) = self.lock().insert(token, method) {
            warn!("Token {} reused before {} was answered", token, previous.full_name());
        }
    }

    /// Consume the entry for `token`
    pub fn take(&self, token: u32) -> Option<Arc<MethodDescriptor>> {
        self.lock().remove(&token)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
