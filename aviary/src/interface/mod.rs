//! Inbound protocol endpoints.
//!
//! An [`Interface`] is a listener with a three-step lifecycle: `start`
//! accepts work, `cease` stops accepting while letting accepted work
//! finish, `stop` shuts the listener down completely. The
//! [`LoadedInterface`] wrapper ties an interface to its configuration
//! document so the lifecycle orchestrator can restart it when the
//! document changes; every wrapper operation logs failures instead of
//! propagating them, since a broken interface must not take the cage
//! down.

pub mod file;
pub mod schedule;

use std::sync::Arc;

use dashmap::DashMap;
use faststr::FastStr;
use futures::future::BoxFuture;

use crate::{
    config::ConfigStore,
    dispatcher::Dispatcher,
    error::Result,
    value::{Value, ValueMap},
};

pub trait Interface: Send + Sync + 'static {
    fn name(&self) -> FastStr;

    /// Distinguishes instances across restarts of the same interface.
    fn instance_id(&self) -> u64;

    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Stop accepting new incoming events; accepted ones may finish.
    fn cease(&self) -> BoxFuture<'_, ()>;

    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// A named request handler; the ambient [`crate::Request`] is installed
/// by the worker pool before the handler runs.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Interface configuration names its handler; the registry resolves the
/// name at dispatch time, so a hot-reloaded interface picks up handler
/// changes too.
pub struct HandlerRegistry {
    handlers: DashMap<FastStr, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<FastStr>, handler: Handler) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).map(|h| h.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

/// What every interface needs from the cage it runs in.
#[derive(Clone)]
pub struct InterfaceContext {
    pub dispatcher: Arc<Dispatcher>,
    pub handlers: Arc<HandlerRegistry>,
}

/// Builds an interface from its (expanded) configuration mapping.
pub type InterfaceFactory =
    Arc<dyn Fn(FastStr, ValueMap, InterfaceContext) -> Result<Arc<dyn Interface>> + Send + Sync>;

pub struct InterfaceRegistry {
    factories: DashMap<FastStr, InterfaceFactory>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        InterfaceRegistry {
            factories: DashMap::new(),
        }
    }

    pub fn register(&self, protocol: impl Into<FastStr>, factory: InterfaceFactory) {
        self.factories.insert(protocol.into(), factory);
    }

    pub fn get(&self, protocol: &str) -> Option<InterfaceFactory> {
        self.factories.get(protocol).map(|f| f.clone())
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        InterfaceRegistry::new()
    }
}

/// Everything needed to (re)create interfaces from configuration.
pub struct InterfaceRuntime {
    pub config: Arc<ConfigStore>,
    pub factories: Arc<InterfaceRegistry>,
    pub context: InterfaceContext,
}

/// An interface bound to the configuration version it was created from.
pub struct LoadedInterface {
    name: FastStr,
    version: Option<u64>,
    interface: Option<Arc<dyn Interface>>,
}

impl LoadedInterface {
    pub fn new(name: FastStr, runtime: &InterfaceRuntime) -> Self {
        let loaded = Self::load_config(&name, runtime);
        let (interface, version) = match loaded {
            Some((config, version)) => (Self::create(&name, config, runtime), Some(version)),
            None => (None, None),
        };
        LoadedInterface {
            name,
            version,
            interface,
        }
    }

    pub fn name(&self) -> &FastStr {
        &self.name
    }

    pub fn interface(&self) -> Option<Arc<dyn Interface>> {
        self.interface.clone()
    }

    fn load_config(name: &FastStr, runtime: &InterfaceRuntime) -> Option<(ValueMap, u64)> {
        let module = format!("interface_{name}");
        let version = runtime.config.version(&module)?;
        match runtime.config.copy(&module) {
            Ok(config) => Some((config, version)),
            Err(e) => {
                tracing::error!("[AVIARY] cannot read config_{module}: {e}");
                None
            }
        }
    }

    fn create(
        name: &FastStr,
        config: ValueMap,
        runtime: &InterfaceRuntime,
    ) -> Option<Arc<dyn Interface>> {
        let protocol = match config.get("protocol").and_then(Value::as_str) {
            Some(protocol) => protocol.to_string(),
            None => {
                tracing::error!(
                    "[AVIARY] interface {name} could not be created: no protocol configured"
                );
                return None;
            }
        };
        let factory = match runtime.factories.get(&protocol) {
            Some(factory) => factory,
            None => {
                tracing::error!(
                    "[AVIARY] interface {name} could not be created: \
                     unknown protocol '{protocol}'"
                );
                return None;
            }
        };
        match factory(name.clone(), config, runtime.context.clone()) {
            Ok(interface) => Some(interface),
            Err(e) => {
                tracing::error!("[AVIARY] interface {name} could not be created: {e}");
                None
            }
        }
    }

    pub async fn start(&self, dispatcher: &Dispatcher) {
        let Some(interface) = &self.interface else {
            return;
        };
        tracing::info!("[AVIARY] starting interface {}", self.name);
        match interface.start().await {
            Ok(()) => {
                dispatcher.install_interface(interface.clone());
                tracing::info!("[AVIARY] interface {} has started", self.name);
            }
            Err(e) => {
                tracing::error!("[AVIARY] interface {} failed to start: {e}", self.name);
            }
        }
    }

    pub async fn cease(&self) {
        let Some(interface) = &self.interface else {
            return;
        };
        tracing::info!("[AVIARY] ceasing interface {}", self.name);
        interface.cease().await;
        tracing::info!("[AVIARY] interface {} has ceased", self.name);
    }

    pub async fn stop(&mut self, dispatcher: &Dispatcher) {
        let Some(interface) = self.interface.take() else {
            return;
        };
        tracing::info!("[AVIARY] stopping interface {}", self.name);
        interface.stop().await;
        dispatcher.remove_interface(&self.name);
        tracing::info!("[AVIARY] interface {} has stopped", self.name);
    }

    /// Restarts the interface when its configuration document has a newer
    /// version than the one it was created from.
    pub async fn reload(&mut self, runtime: &InterfaceRuntime) {
        let Some((config, version)) = Self::load_config(&self.name, runtime) else {
            return; // current configuration is broken, do nothing
        };
        if let Some(current) = self.version {
            if version <= current {
                return;
            }
        }
        tracing::info!(
            "[AVIARY] restarting interface {} due to configuration change",
            self.name
        );
        self.cease().await;
        self.stop(&runtime.context.dispatcher).await;

        self.interface = Self::create(&self.name, config, runtime);
        self.start(&runtime.context.dispatcher).await;
        self.version = Some(version);
    }
}
