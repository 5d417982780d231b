//! The process-wide context and lifecycle orchestrator of one cage.
//!
//! A [`Cage`] owns every runtime component — configuration store, worker
//! pool, resource pools, dispatcher, shared primitives — so there are no
//! process globals. Startup wires the components in dependency order and
//! shutdown reverses it; periodic maintenance reconciles the configured
//! interface set and restarts interfaces whose configuration changed.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use faststr::FastStr;
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    config::ConfigStore,
    dispatcher::Dispatcher,
    error::Result,
    interface::{
        file::FileInterface, schedule::ScheduleInterface, Handler, HandlerRegistry, Interface,
        InterfaceContext, InterfaceFactory, InterfaceRegistry, InterfaceRuntime, LoadedInterface,
    },
    pool::{PoolRegistry, ProtocolFactory},
    request::{Request, DEFAULT_REQUEST_TIMEOUT},
    resource::{callable::CallableResource, void::VoidResource, BoxResource},
    sync::{SharedLocks, SharedQueues},
    telemetry::Performance,
    transaction::Transaction,
    value::{Value, ValueMap},
    worker::{WorkerPool, WorkerPoolConfig},
};

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(3);
const HEALTH_MONITOR_CAGE: &str = "health_monitor";
// a worker is replaced after a few sweep periods of service
const WORKER_MAX_AGE_SWEEPS: u32 = 4;

#[derive(Clone, Debug)]
pub struct CageOptions {
    pub node: FastStr,
    pub name: FastStr,
    pub cages_dir: PathBuf,
    pub config_cache_timeout: Duration,
    pub config_settle_timeout: Duration,
}

impl CageOptions {
    pub fn new(node: impl Into<FastStr>, name: impl Into<FastStr>, cages_dir: impl Into<PathBuf>) -> Self {
        CageOptions {
            node: node.into(),
            name: name.into(),
            cages_dir: cages_dir.into(),
            config_cache_timeout: Duration::from_secs(2),
            config_settle_timeout: Duration::from_secs(1),
        }
    }
}

struct Settings {
    request_timeout: Duration,
    sweep_period: Duration,
}

#[derive(Clone)]
pub struct Cage {
    shared: Arc<CageShared>,
}

struct CageShared {
    node: FastStr,
    name: FastStr,
    config: Arc<ConfigStore>,
    performance: Arc<Performance>,
    workers: Arc<WorkerPool>,
    pools: Arc<PoolRegistry>,
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<HandlerRegistry>,
    interface_factories: Arc<InterfaceRegistry>,
    loaded: tokio::sync::Mutex<LinkedHashMap<FastStr, LoadedInterface>>,
    queues: Arc<SharedQueues>,
    locks: Arc<SharedLocks>,
    settings: Settings,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl Cage {
    /// Builds the cage's components from its configuration; must run
    /// inside a tokio runtime. `config_interfaces.yaml` supplies
    /// `thread_count`, `sweep_period`, `request_timeout`, `queue_size`
    /// and the `interfaces` tuple, each falling back to a default.
    pub fn new(options: CageOptions) -> Result<Cage> {
        let cage_dir = options.cages_dir.join(options.name.as_str());
        let config = Arc::new(ConfigStore::new(
            options.node.clone(),
            options.name.clone(),
            cage_dir,
            options.config_cache_timeout,
            options.config_settle_timeout,
        )?);

        let thread_count = config
            .get_or("interfaces", "thread_count", Value::Int(4))
            .as_int()
            .unwrap_or(4)
            .max(1) as usize;
        let queue_size = config
            .get_or("interfaces", "queue_size", Value::Int(64))
            .as_int()
            .unwrap_or(64)
            .max(1) as usize;
        let sweep_period = config
            .get_or("interfaces", "sweep_period", Value::Int(10))
            .as_duration()
            .unwrap_or(Duration::from_secs(10));
        let request_timeout = config
            .get_or(
                "interfaces",
                "request_timeout",
                Value::Int(DEFAULT_REQUEST_TIMEOUT.as_secs() as i64),
            )
            .as_duration()
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let performance = Arc::new(Performance::default());
        let workers = Arc::new(WorkerPool::start(WorkerPoolConfig {
            workers: thread_count,
            queue_size,
            max_age: sweep_period * WORKER_MAX_AGE_SWEEPS,
            drain_timeout: request_timeout,
        }));
        let pools = Arc::new(PoolRegistry::new(Some(config.clone()), sweep_period));
        let dispatcher = Arc::new(Dispatcher::new(
            request_timeout,
            workers.clone(),
            performance.clone(),
        ));

        let handlers = Arc::new(HandlerRegistry::new());
        let interface_factories = Arc::new(InterfaceRegistry::new());
        interface_factories.register("file", FileInterface::factory());
        interface_factories.register("schedule", ScheduleInterface::factory());

        pools.register_protocol(
            "void",
            Arc::new(|pool: &FastStr, _id: u64, _config: &ValueMap| {
                Ok(Box::new(VoidResource::new(pool.clone())) as BoxResource)
            }),
        );
        pools.register_protocol(
            "callable",
            Arc::new(|pool: &FastStr, id: u64, _config: &ValueMap| {
                Ok(Box::new(CallableResource::new(pool.clone(), id, Default::default()))
                    as BoxResource)
            }),
        );

        Ok(Cage {
            shared: Arc::new(CageShared {
                node: options.node,
                name: options.name,
                config,
                performance,
                workers,
                pools,
                dispatcher,
                handlers,
                interface_factories,
                loaded: tokio::sync::Mutex::new(LinkedHashMap::new()),
                queues: Arc::new(SharedQueues::new()),
                locks: Arc::new(SharedLocks::new()),
                settings: Settings {
                    request_timeout,
                    sweep_period,
                },
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                health: Mutex::new(None),
            }),
        })
    }

    pub fn node(&self) -> &FastStr {
        &self.shared.node
    }

    pub fn name(&self) -> &FastStr {
        &self.shared.name
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.shared.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.shared.pools
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.shared.workers
    }

    pub fn performance(&self) -> &Arc<Performance> {
        &self.shared.performance
    }

    pub fn shared_queues(&self) -> &Arc<SharedQueues> {
        &self.shared.queues
    }

    pub fn shared_locks(&self) -> &Arc<SharedLocks> {
        &self.shared.locks
    }

    pub fn request_timeout(&self) -> Duration {
        self.shared.settings.request_timeout
    }

    pub fn register_handler(&self, name: impl Into<FastStr>, handler: Handler) {
        self.shared.handlers.register(name, handler);
    }

    pub fn register_resource_protocol(&self, protocol: impl Into<FastStr>, factory: ProtocolFactory) {
        self.shared.pools.register_protocol(protocol, factory);
    }

    pub fn register_interface_protocol(&self, protocol: impl Into<FastStr>, factory: InterfaceFactory) {
        self.shared.interface_factories.register(protocol, factory);
    }

    pub fn get_interface(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.shared.dispatcher.get_interface(name)
    }

    /// A new transaction envelope under `request`.
    pub fn transaction(&self, request: &Request, options: ValueMap) -> Transaction {
        Transaction::new(self.shared.pools.clone(), request.clone(), options)
    }

    fn interface_runtime(&self) -> InterfaceRuntime {
        InterfaceRuntime {
            config: self.shared.config.clone(),
            factories: self.shared.interface_factories.clone(),
            context: InterfaceContext {
                dispatcher: self.shared.dispatcher.clone(),
                handlers: self.shared.handlers.clone(),
            },
        }
    }

    fn configured_interfaces(&self) -> Vec<FastStr> {
        self.shared
            .config
            .get_or("interfaces", "interfaces", Value::Seq(Vec::new()))
            .as_seq()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.as_str().map(FastStr::new))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Starts pools, then interfaces in their configured order, then the
    /// health monitor when this cage is the one.
    pub async fn start(&self) {
        tracing::info!(
            "[AVIARY] cage {}.{} is starting up",
            self.shared.node,
            self.shared.name
        );
        self.shared.pools.start_sweeper();
        let names = self.configured_interfaces();
        self.update_interfaces(names).await;
        if self.shared.name == HEALTH_MONITOR_CAGE {
            self.start_health_monitor();
        }
        tracing::info!("[AVIARY] as of this moment requests can be created");
    }

    /// Stops everything in reverse order of start.
    pub async fn stop(&self) {
        if let Some(task) = self.shared.health.lock().take() {
            task.abort();
        }
        {
            let loaded = self.shared.loaded.lock().await;
            for (_, interface) in loaded.iter() {
                interface.cease().await;
            }
        }
        self.shared.dispatcher.cease().await;
        {
            let mut loaded = self.shared.loaded.lock().await;
            let names: Vec<FastStr> = loaded.keys().cloned().collect();
            for name in names {
                if let Some(mut interface) = loaded.remove(&name) {
                    interface.stop(&self.shared.dispatcher).await;
                }
            }
        }
        self.shared.workers.stop().await;
        self.shared.pools.stop().await;
        tracing::info!(
            "[AVIARY] cage {}.{} has stopped",
            self.shared.node,
            self.shared.name
        );
    }

    /// One maintenance pass: reconcile the configured interface set and
    /// restart interfaces whose configuration version advanced. Errors
    /// are logged and never propagate.
    pub async fn maintenance(&self) {
        let names = self.configured_interfaces();
        self.update_interfaces(names).await;
        let runtime = self.interface_runtime();
        let mut loaded = self.shared.loaded.lock().await;
        for (_, interface) in loaded.iter_mut() {
            interface.reload(&runtime).await;
        }
    }

    async fn update_interfaces(&self, names: Vec<FastStr>) {
        let runtime = self.interface_runtime();
        let mut loaded = self.shared.loaded.lock().await;

        for name in &names {
            if !loaded.contains_key(name) {
                let interface = LoadedInterface::new(name.clone(), &runtime);
                interface.start(&self.shared.dispatcher).await;
                loaded.insert(name.clone(), interface);
            }
        }

        let vanished: Vec<FastStr> = loaded
            .keys()
            .filter(|name| !names.contains(name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(mut interface) = loaded.remove(&name) {
                interface.cease().await;
                interface.stop(&self.shared.dispatcher).await;
            }
        }
    }

    fn start_health_monitor(&self) {
        tracing::info!("[AVIARY] starting health monitor");
        let dispatcher = self.shared.dispatcher.clone();
        let period = self.shared.settings.sweep_period;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (busy, queued, rate) = dispatcher.activity();
                tracing::debug!(
                    "[AVIARY] activity: {busy} busy, {queued} queued, {rate:.1} rps"
                );
            }
        });
        *self.shared.health.lock() = Some(task);
    }

    /// Starts the cage and serves maintenance until [`Cage::exit`] is
    /// called, then stops it. This is the secondary process's main loop.
    pub async fn run(&self) {
        self.start().await;
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let shutdown = self.shared.shutdown_notify.notified();
            tokio::select! {
                _ = shutdown => break,
                _ = tokio::time::sleep(MAINTENANCE_PERIOD) => self.maintenance().await,
            }
        }
        self.stop().await;
    }

    /// Triggers an orderly shutdown of [`Cage::run`]; safe to call from
    /// any task, more than once.
    pub fn exit(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.shutdown_notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}
