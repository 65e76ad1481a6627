//! Named pools, created on first use.
//!
//! A [`Registry`] is constructed explicitly and shared by reference (usually
//! behind an `Arc`). Each test or embedding gets its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use offload_core::{Config, PoolConfig};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pool::{Pool, PoolError, PoolSpec, PoolStats};
use crate::signals::shutdown_signal;

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No pool named '{name}' exists and none is configured")]
    UnknownPool { name: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Process-wide lookup of pools by name.
#[derive(Debug, Default)]
pub struct Registry {
    /// Live pools keyed by name.
    pools: RwLock<HashMap<String, Pool>>,
    /// Pool settings used when a pool is requested without a spec.
    configured: HashMap<String, PoolConfig>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that can start the pools named in `config` on demand.
    pub fn from_config(config: &Config) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            configured: config.pools.clone(),
        }
    }

    /// Return the live pool called `name`, starting it if needed.
    ///
    /// An existing pool wins and `spec` is ignored. Otherwise `spec`, or
    /// failing that the configured settings for `name`, is used to start a
    /// new pool. A pool that has been shut down is replaced.
    pub async fn get_pool(&self, name: &str, spec: Option<PoolSpec>) -> Result<Pool, RegistryError> {
        if let Some(pool) = self.pools.read().await.get(name)
            && !pool.is_closed()
        {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        // Another caller may have started it while we waited for the lock.
        if let Some(pool) = pools.get(name) {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
            debug!(pool = name, "Replacing pool that was shut down");
        }

        let spec = match spec {
            Some(spec) => spec,
            None => {
                let config = self
                    .configured
                    .get(name)
                    .ok_or_else(|| RegistryError::UnknownPool {
                        name: name.to_string(),
                    })?;
                PoolSpec::from_config(config)?
            }
        };
        let pool = Pool::start(name, spec)?;
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// The live pool called `name`, without starting one.
    pub async fn pool(&self, name: &str) -> Option<Pool> {
        self.pools
            .read()
            .await
            .get(name)
            .filter(|pool| !pool.is_closed())
            .cloned()
    }

    /// Names of live pools, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .await
            .iter()
            .filter(|(_, pool)| !pool.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Shut down and forget one pool. Returns `false` if it was not
    /// registered.
    pub async fn shutdown_pool(&self, name: &str) -> bool {
        let removed = self.pools.write().await.remove(name);
        match removed {
            Some(pool) => {
                pool.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut down every pool and clear the registry.
    pub async fn shutdown_all(&self) {
        let pools: Vec<Pool> = self.pools.write().await.drain().map(|(_, pool)| pool).collect();
        if pools.is_empty() {
            return;
        }
        info!(count = pools.len(), "Shutting down all pools");
        for pool in pools {
            pool.shutdown().await;
        }
    }

    /// Statistics for every live pool, sorted by name.
    pub async fn stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Pool> = self.pools.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            // A pool closing concurrently simply drops out of the listing.
            if let Ok(pool_stats) = pool.stats().await {
                stats.push(pool_stats);
            }
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

/// Shut every pool in `registry` down on Ctrl+C or SIGTERM, so in-flight
/// tasks fail instead of hanging. The handle resolves once they have.
pub fn install_exit_hook(registry: Arc<Registry>) -> JoinHandle<()> {
    exit_hook_on(registry, shutdown_signal())
}

/// [`install_exit_hook`] fired by `trigger` instead of a process signal.
pub fn exit_hook_on<F>(registry: Arc<Registry>, trigger: F) -> JoinHandle<()>
where
    F: Future + Send + 'static,
    F::Output: fmt::Display + Send,
{
    tokio::spawn(async move {
        let reason = trigger.await;
        info!(%reason, "Shutting down pools on exit");
        registry.shutdown_all().await;
    })
}
