//! Outbound capability handles.
//!
//! A [`Resource`] is one connection-like instance living inside a
//! [`crate::pool::ResourcePool`]. Transactional adapters implement the
//! full capability set; fire-and-forget adapters implement `execute` only
//! and inherit the no-op defaults.

pub mod callable;
pub mod void;

use faststr::FastStr;
use futures::future::BoxFuture;

use crate::{
    error::Result,
    pool::cache::CacheControl,
    request::Request,
    value::{Value, ValueMap},
};

/// Per-transaction context handed to `begin_transaction`.
#[derive(Clone, Debug, Default)]
pub struct TransactionOpen {
    pub xid: FastStr,
    /// Free-form options attached to the whole transaction.
    pub options: ValueMap,
    /// Positional arguments addressed to the resource itself.
    pub resource_args: Vec<Value>,
    /// Keyword arguments addressed to the resource itself.
    pub resource_kwargs: ValueMap,
}

/// One recorded invocation: the call name (conventionally `execute`), its
/// arguments and the caching directives that accompany it.
#[derive(Clone, Default)]
pub struct Call {
    pub name: FastStr,
    pub args: Vec<Value>,
    pub kwargs: ValueMap,
    pub cache: CacheControl,
}

impl Call {
    pub fn execute(args: Vec<Value>, kwargs: ValueMap) -> Call {
        Call {
            name: FastStr::from_static_str("execute"),
            args,
            kwargs,
            cache: CacheControl::default(),
        }
    }

    pub fn with_cache(mut self, cache: CacheControl) -> Call {
        self.cache = cache;
        self
    }

    /// Deterministic cache key derived from the call itself, used when no
    /// explicit key was supplied.
    pub fn derived_cache_key(&self) -> FastStr {
        let shape = Value::Seq(vec![
            Value::Str(self.name.clone()),
            Value::Seq(self.args.clone()),
            Value::Map(self.kwargs.clone()),
        ]);
        shape.canonical()
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

pub type BoxResource = Box<dyn Resource>;

/// The capability set of a pooled resource instance.
///
/// All methods take `&mut self`: an instance is owned by exactly one
/// helper task between checkout and release. Errors returned from any
/// method carry their own classification (see [`crate::error::Error`]).
pub trait Resource: Send + 'static {
    /// Establishes the connection; runs once per instance, bounded by the
    /// checking-out request's deadline.
    fn connect<'a>(&'a mut self, request: &'a Request) -> BoxFuture<'a, Result<()>> {
        let _ = request;
        Box::pin(async { Ok(()) })
    }

    fn begin_transaction<'a>(&'a mut self, open: &'a TransactionOpen) -> BoxFuture<'a, Result<()>> {
        let _ = open;
        Box::pin(async { Ok(()) })
    }

    fn execute<'a>(&'a mut self, call: &'a Call) -> BoxFuture<'a, Result<Value>>;

    fn commit<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn rollback<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Best-effort teardown; implementations log their own failures.
    fn disconnect<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Cheap liveness probe used when an idle instance is reused; the
    /// default pings by rolling back.
    fn ping<'a>(&'a mut self) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.rollback().await.is_ok() })
    }
}
