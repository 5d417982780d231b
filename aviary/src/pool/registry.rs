//! Name-keyed pool registry and the process-wide sweeper.
//!
//! Pools are created on first lookup from `config_resource_<name>`
//! documents: the document's `protocol` field picks the resource
//! implementation out of an explicit constructor registry, and the
//! `pool__*` meta-fields size the pool. Tests and embedders may also
//! register fully programmatic pools.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use faststr::FastStr;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    config::ConfigStore,
    error::{Error, Result},
    pool::{PoolOptions, ResourcePool},
    resource::BoxResource,
    value::ValueMap,
};

/// Builds one resource instance for a configured protocol. Receives the
/// pool name, the instance id and the (expanded) resource configuration.
pub type ProtocolFactory =
    Arc<dyn Fn(&FastStr, u64, &ValueMap) -> Result<BoxResource> + Send + Sync>;

/// Builds one resource instance for a specific pool.
pub type InstanceFactory = Arc<dyn Fn(&FastStr, u64) -> Result<BoxResource> + Send + Sync>;

pub struct PoolRegistry {
    shared: Arc<RegistryShared>,
}

struct RegistryShared {
    config: Option<Arc<ConfigStore>>,
    protocols: DashMap<FastStr, ProtocolFactory>,
    pools: DashMap<FastStr, Arc<ResourcePool>>,
    sweep_period: Duration,
    stopping: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolRegistry {
    pub fn new(config: Option<Arc<ConfigStore>>, sweep_period: Duration) -> Self {
        PoolRegistry {
            shared: Arc::new(RegistryShared {
                config,
                protocols: DashMap::new(),
                pools: DashMap::new(),
                sweep_period,
                stopping: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn sweep_period(&self) -> Duration {
        self.shared.sweep_period
    }

    /// Registers the constructor for a resource protocol, e.g. `"void"`.
    pub fn register_protocol(&self, protocol: impl Into<FastStr>, factory: ProtocolFactory) {
        self.shared.protocols.insert(protocol.into(), factory);
    }

    /// Registers a pool bypassing configuration lookup.
    pub fn register_pool(
        &self,
        name: impl Into<FastStr>,
        options: PoolOptions,
        factory: InstanceFactory,
    ) -> Arc<ResourcePool> {
        let name = name.into();
        let pool = Arc::new(ResourcePool::new(name.clone(), options, factory));
        self.shared.pools.insert(name, pool.clone());
        pool
    }

    /// The pool for `name`, created from `config_resource_<name>` on first
    /// lookup.
    pub fn get(&self, name: &str) -> Result<Arc<ResourcePool>> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Error::Stopped("resource pool registry".into()));
        }
        if let Some(pool) = self.shared.pools.get(name) {
            return Ok(pool.clone());
        }
        let pool = self
            .shared
            .pools
            .entry(FastStr::new(name))
            .or_try_insert_with(|| self.build_from_config(name).map(Arc::new))?
            .clone();
        Ok(pool)
    }

    fn build_from_config(&self, name: &str) -> Result<ResourcePool> {
        let config = self
            .shared
            .config
            .as_ref()
            .ok_or_else(|| Error::config(format!("resource pool '{name}' is not registered")))?;
        let document = config.copy(&format!("resource_{name}"))?;
        let protocol = document
            .get("protocol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::config(format!(
                    "config_resource_{name} does not declare a protocol"
                ))
            })?
            .to_string();
        let factory = self
            .shared
            .protocols
            .get(protocol.as_str())
            .map(|f| f.clone())
            .ok_or_else(|| Error::config(format!("unknown resource protocol '{protocol}'")))?;
        let options = PoolOptions::from_config(&document)?;
        let document = Arc::new(document);
        let instance_factory: InstanceFactory =
            Arc::new(move |pool: &FastStr, id: u64| factory(pool, id, &document));
        tracing::info!(
            "[AVIARY] created resource pool '{name}' over protocol '{protocol}', size {}",
            options.size
        );
        Ok(ResourcePool::new(
            FastStr::new(name),
            options,
            instance_factory,
        ))
    }

    /// Spawns the process-wide housekeeping task; one per registry.
    pub fn start_sweeper(&self) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                let pools: Vec<Arc<ResourcePool>> =
                    shared.pools.iter().map(|p| p.clone()).collect();
                for pool in pools {
                    pool.sweep().await;
                }
            }
        });
        let mut sweeper = self.shared.sweeper.lock();
        if let Some(old) = sweeper.replace(handle) {
            old.abort();
        }
    }

    /// Stops the sweeper and drains every pool; no instance outlives this.
    pub async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Some(handle) = self.shared.sweeper.lock().take() {
            handle.abort();
        }
        let pools: Vec<Arc<ResourcePool>> = self.shared.pools.iter().map(|p| p.clone()).collect();
        for pool in pools {
            pool.drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        request::Request,
        resource::callable::{CallableConfig, CallableResource},
    };

    fn callable_factory() -> InstanceFactory {
        Arc::new(|pool: &FastStr, id: u64| {
            Ok(
                Box::new(CallableResource::new(pool.clone(), id, CallableConfig::default()))
                    as BoxResource,
            )
        })
    }

    #[tokio::test(start_paused = true)]
    async fn registered_pool_is_returned_on_lookup() {
        let registry = PoolRegistry::new(None, Duration::from_secs(1));
        registry.register_pool("callable_1", PoolOptions::default(), callable_factory());
        let pool = registry.get("callable_1").unwrap();
        assert_eq!(pool.name(), "callable_1");
        assert!(registry.get("missing").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_stopped() {
        let registry = PoolRegistry::new(None, Duration::from_millis(100));
        let pool = registry.register_pool(
            "callable_1",
            PoolOptions {
                idle_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            callable_factory(),
        );
        registry.start_sweeper();

        let request = Request::fake(Duration::from_secs(10));
        let guard = pool.checkout(&request).await.unwrap();
        guard.release(false).await;
        assert_eq!(pool.counts(), (0, 1));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.counts(), (0, 0));

        registry.stop().await;
        assert!(registry.get("callable_1").is_err());
    }
}
