use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::EngineError;

fn host_of(url: &str) -> Result<String, EngineError> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .ok_or_else(|| EngineError::InvalidUrl(url.to_string()))
}

/// Two-level semaphore: a global connection cap plus a per-host cap, created
/// lazily on first use and never torn down for the engine's lifetime.
///
/// The global permit is always acquired before the per-host permit and
/// released after, which rules out lock-inversion deadlocks across hosts.
pub struct ConnectionPool {
    global: Arc<Semaphore>,
    max_per_host: usize,
    hosts: AsyncMutex<HashMap<String, Arc<Semaphore>>>,
    url_inflight: Arc<StdMutex<HashMap<String, u32>>>,
    host_inflight: Arc<StdMutex<HashMap<String, u32>>>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize, max_per_host: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_connections.max(1))),
            max_per_host: max_per_host.max(1),
            hosts: AsyncMutex::new(HashMap::new()),
            url_inflight: Arc::new(StdMutex::new(HashMap::new())),
            host_inflight: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    async fn host_gate(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }

    /// Acquires a slot for `url`, suspending until both the global and
    /// per-host gates admit this caller.
    pub async fn acquire(&self, url: &str) -> Result<PoolGuard, EngineError> {
        let host = host_of(url)?;
        let host_gate = self.host_gate(&host).await;

        let global_permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("global semaphore is never closed");
        let host_permit = host_gate
            .acquire_owned()
            .await
            .expect("host semaphore is never closed");

        {
            let mut counts = self.url_inflight.lock().unwrap();
            *counts.entry(url.to_string()).or_insert(0) += 1;
        }
        {
            let mut counts = self.host_inflight.lock().unwrap();
            *counts.entry(host.clone()).or_insert(0) += 1;
        }
        debug!(url, host, "acquired connection pool slot");

        Ok(PoolGuard {
            _host: host_permit,
            _global: global_permit,
            host,
            url: url.to_string(),
            url_inflight: self.url_inflight.clone(),
            host_inflight: self.host_inflight.clone(),
        })
    }

    pub fn host_inflight(&self, url: &str) -> u32 {
        let Ok(host) = host_of(url) else { return 0 };
        *self.host_inflight.lock().unwrap().get(&host).unwrap_or(&0)
    }

    pub fn url_inflight(&self, url: &str) -> u32 {
        *self.url_inflight.lock().unwrap().get(url).unwrap_or(&0)
    }
}

/// RAII handle for one acquired pool slot. Dropping it releases the
/// per-host gate then the global gate, in that order, and decrements the
/// observational counters.
pub struct PoolGuard {
    // Declaration order is drop order: the host permit must release before
    // the global one to mirror the acquire-global-then-host ordering.
    _host: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    host: String,
    url: String,
    url_inflight: Arc<StdMutex<HashMap<String, u32>>>,
    host_inflight: Arc<StdMutex<HashMap<String, u32>>>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        {
            let mut counts = self.url_inflight.lock().unwrap();
            if let Some(n) = counts.get_mut(&self.url) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    counts.remove(&self.url);
                }
            }
        }
        {
            let mut counts = self.host_inflight.lock().unwrap();
            if let Some(n) = counts.get_mut(&self.host) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    counts.remove(&self.host);
                }
            }
        }
    }
}
