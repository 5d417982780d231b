//! Bounded pools of reusable resource instances.
//!
//! Each pool multiplexes up to `size` instances of one named resource.
//! Checkout prefers a live idle instance, lazily constructs a new one
//! while under the cap, and otherwise waits on the pool's condition for
//! `min(request.remain, standby_timeout)`. The return path disconnects
//! instances tagged terminal, expired or past their maximum age; everyone
//! else goes back on the idle shelf with a fresh idle clock.

pub mod cache;
pub mod registry;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use faststr::FastStr;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

pub use cache::{CacheControl, CacheKey, CacheOptions, CachePolicy, ResultCache};
pub use registry::{InstanceFactory, PoolRegistry, ProtocolFactory};

use crate::{
    error::{Error, Result},
    request::Request,
    resource::BoxResource,
    value::ValueMap,
};

#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Hard cap on instances, idle and checked out together.
    pub size: usize,
    /// Upper bound on one wait for a free slot.
    pub standby_timeout: Duration,
    /// An instance idle longer than this is disconnected by the sweeper.
    pub idle_timeout: Duration,
    /// Absolute instance lifetime.
    pub max_age: Duration,
    pub cache: Option<CacheOptions>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            size: 4,
            standby_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            max_age: Duration::from_secs(600),
            cache: None,
        }
    }
}

impl PoolOptions {
    /// Reads the `pool__*` meta-fields of a resource configuration,
    /// falling back to the defaults field by field.
    pub fn from_config(config: &ValueMap) -> Result<PoolOptions> {
        let defaults = PoolOptions::default();
        let size = match config.get("pool__size") {
            Some(v) => v
                .as_int()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::config("pool__size must be a positive integer"))?
                as usize,
            None => defaults.size,
        };
        let duration = |key: &str, fallback: Duration| -> Result<Duration> {
            match config.get(key) {
                Some(v) => v
                    .as_duration()
                    .ok_or_else(|| Error::config(format!("{key} must be a number of seconds"))),
                None => Ok(fallback),
            }
        };
        let cache = match config.get("pool__cache_size") {
            Some(v) => {
                let size = v
                    .as_int()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| Error::config("pool__cache_size must be an integer"))?
                    as usize;
                if size == 0 {
                    None
                } else {
                    let cache_defaults = CacheOptions::default();
                    let policy = match config.get("pool__cache_policy") {
                        Some(v) => v
                            .as_str()
                            .ok_or_else(|| Error::config("pool__cache_policy must be a string"))?
                            .parse()?,
                        None => cache_defaults.policy,
                    };
                    Some(CacheOptions {
                        size,
                        policy,
                        default_ttl: duration(
                            "pool__cache_default_ttl",
                            cache_defaults.default_ttl,
                        )?,
                        evict_period: duration(
                            "pool__cache_evict_period",
                            cache_defaults.evict_period,
                        )?,
                    })
                }
            }
            None => None,
        };
        Ok(PoolOptions {
            size,
            standby_timeout: duration("pool__standby_timeout", defaults.standby_timeout)?,
            idle_timeout: duration("pool__idle_timeout", defaults.idle_timeout)?,
            max_age: duration("pool__max_age", defaults.max_age)?,
            cache,
        })
    }
}

pub(crate) struct Instance {
    pub(crate) resource: BoxResource,
    pub(crate) id: u64,
    pub(crate) created: Instant,
    pub(crate) idle_since: Instant,
    pub(crate) expired: bool,
}

impl Instance {
    fn stale(&self, options: &PoolOptions) -> bool {
        self.expired
            || self.idle_since.elapsed() > options.idle_timeout
            || self.created.elapsed() > options.max_age
    }
}

struct PoolState {
    idle: Vec<Instance>,
    in_use: usize,
    next_id: u64,
}

pub(crate) struct PoolShared {
    name: FastStr,
    options: PoolOptions,
    factory: InstanceFactory,
    state: Mutex<PoolState>,
    returned: Notify,
    cache: Option<ResultCache>,
    stopping: AtomicBool,
}

pub struct ResourcePool {
    shared: Arc<PoolShared>,
}

impl ResourcePool {
    pub(crate) fn new(name: FastStr, options: PoolOptions, factory: InstanceFactory) -> Self {
        let cache = options.cache.clone().map(ResultCache::new);
        ResourcePool {
            shared: Arc::new(PoolShared {
                name,
                options,
                factory,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: 0,
                    next_id: 0,
                }),
                returned: Notify::new(),
                cache,
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &FastStr {
        &self.shared.name
    }

    pub fn size(&self) -> usize {
        self.shared.options.size
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.shared.cache.as_ref()
    }

    /// `(in_use, idle)` instance counts.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.in_use, state.idle.len())
    }

    /// Checks out an instance, constructing one lazily while under the
    /// size cap, waiting for a returned one otherwise.
    pub async fn checkout(&self, request: &Request) -> Result<PooledResource> {
        enum Plan {
            Reuse(Instance),
            Construct(u64),
            Wait,
        }

        let shared = &self.shared;
        loop {
            if shared.stopping.load(Ordering::Acquire) {
                return Err(Error::Stopped(
                    format!("resource pool '{}'", shared.name).into(),
                ));
            }
            if request.expired() {
                return Err(Error::deadline());
            }

            let returned = shared.returned.notified();
            let (plan, stale) = {
                let mut state = shared.state.lock();
                let mut stale = Vec::new();
                let mut picked = None;
                while let Some(instance) = state.idle.pop() {
                    if instance.stale(&shared.options) {
                        stale.push(instance);
                    } else {
                        picked = Some(instance);
                        break;
                    }
                }
                let plan = if let Some(instance) = picked {
                    state.in_use += 1;
                    Plan::Reuse(instance)
                } else if state.in_use + state.idle.len() < shared.options.size {
                    state.in_use += 1;
                    let id = state.next_id;
                    state.next_id += 1;
                    Plan::Construct(id)
                } else {
                    Plan::Wait
                };
                (plan, stale)
            };

            for mut instance in stale {
                tracing::debug!(
                    "[AVIARY] disconnecting stale idle instance {}/{}",
                    shared.name,
                    instance.id
                );
                instance.resource.disconnect().await;
            }

            match plan {
                Plan::Reuse(mut instance) => {
                    if instance.resource.ping().await {
                        tracing::trace!(
                            "[AVIARY] reusing idle instance {}/{}",
                            shared.name,
                            instance.id
                        );
                        return Ok(PooledResource {
                            shared: shared.clone(),
                            instance: Some(instance),
                        });
                    }
                    tracing::debug!(
                        "[AVIARY] idle instance {}/{} failed liveness probe, discarding",
                        shared.name,
                        instance.id
                    );
                    instance.resource.disconnect().await;
                    release_slot(shared);
                }
                Plan::Construct(id) => {
                    match self.construct(request, id).await {
                        Ok(instance) => return Ok(instance),
                        Err(e) => {
                            release_slot(shared);
                            return Err(e);
                        }
                    };
                }
                Plan::Wait => {
                    // a timed-out standby wait is not fatal by itself; the
                    // loop re-enters until the request itself expires
                    let _ = request
                        .bound_by(shared.options.standby_timeout, returned)
                        .await;
                }
            }
        }
    }

    async fn construct(&self, request: &Request, id: u64) -> Result<PooledResource> {
        let shared = &self.shared;
        let mut resource = (shared.factory)(&shared.name, id)?;
        request.bound(resource.connect(request)).await??;
        tracing::debug!("[AVIARY] connected new instance {}/{id}", shared.name);
        let now = Instant::now();
        Ok(PooledResource {
            shared: shared.clone(),
            instance: Some(Instance {
                resource,
                id,
                created: now,
                idle_since: now,
                expired: false,
            }),
        })
    }

    /// One housekeeping pass: disconnect idle instances past their idle
    /// timeout or maximum age and give the result cache an eviction
    /// opportunity. Driven by the process-wide sweeper.
    pub(crate) async fn sweep(&self) {
        let shared = &self.shared;
        let stale = {
            let mut state = shared.state.lock();
            let mut keep = Vec::with_capacity(state.idle.len());
            let mut stale = Vec::new();
            for instance in state.idle.drain(..) {
                if instance.stale(&shared.options) {
                    stale.push(instance);
                } else {
                    keep.push(instance);
                }
            }
            state.idle = keep;
            stale
        };
        if !stale.is_empty() {
            for mut instance in stale {
                tracing::debug!(
                    "[AVIARY] sweeper disconnecting instance {}/{}",
                    shared.name,
                    instance.id
                );
                instance.resource.disconnect().await;
            }
            shared.returned.notify_waiters();
        }
        if let Some(cache) = &shared.cache {
            cache.maybe_evict();
        }
    }

    /// Refuses further checkouts and disconnects everything idle;
    /// checked-out instances are discarded as they come back.
    pub(crate) async fn drain(&self) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::Release);
        let idle = {
            let mut state = shared.state.lock();
            std::mem::take(&mut state.idle)
        };
        for mut instance in idle {
            instance.resource.disconnect().await;
        }
        shared.returned.notify_waiters();
    }
}

fn release_slot(shared: &Arc<PoolShared>) {
    shared.state.lock().in_use -= 1;
    shared.returned.notify_one();
}

async fn release_instance(shared: &Arc<PoolShared>, mut instance: Instance, terminal: bool) {
    let discard = terminal
        || instance.expired
        || instance.created.elapsed() > shared.options.max_age
        || shared.stopping.load(Ordering::Acquire);
    if discard {
        tracing::debug!(
            "[AVIARY] disconnecting instance {}/{} on release",
            shared.name,
            instance.id
        );
        instance.resource.disconnect().await;
        release_slot(shared);
    } else {
        instance.idle_since = Instant::now();
        let mut state = shared.state.lock();
        state.in_use -= 1;
        state.idle.push(instance);
        drop(state);
        shared.returned.notify_one();
    }
}

/// An instance on loan from a pool.
///
/// Dereferences to the underlying [`crate::resource::Resource`]. Release
/// it explicitly with the terminal flag the last operation earned;
/// dropping the guard without releasing discards the instance, since its
/// state is then unknown.
pub struct PooledResource {
    shared: Arc<PoolShared>,
    instance: Option<Instance>,
}

impl std::fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResource").finish()
    }
}

impl PooledResource {
    pub fn pool_name(&self) -> &FastStr {
        &self.shared.name
    }

    pub fn instance_id(&self) -> u64 {
        self.instance.as_ref().expect("released").id
    }

    /// Marks the instance expired so it is discarded on release.
    pub fn expire(&mut self) {
        if let Some(instance) = self.instance.as_mut() {
            instance.expired = true;
        }
    }

    pub async fn release(mut self, terminal: bool) {
        if let Some(instance) = self.instance.take() {
            release_instance(&self.shared, instance, terminal).await;
        }
    }
}

impl std::ops::Deref for PooledResource {
    type Target = BoxResource;

    fn deref(&self) -> &Self::Target {
        &self.instance.as_ref().expect("released").resource
    }
}

impl std::ops::DerefMut for PooledResource {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.instance.as_mut().expect("released").resource
    }
}

impl Drop for PooledResource {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                release_instance(&shared, instance, true).await;
            });
        }
    }
}
