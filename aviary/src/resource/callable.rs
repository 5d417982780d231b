//! A passthrough resource driven by user-supplied hooks for every action.
//!
//! Useful for wiring arbitrary in-process behaviour into the transaction
//! machinery, and as the standard vehicle for exercising pools and
//! transactions in tests: with a trace queue attached, every lifecycle
//! step the instance performs is observable in order.

use std::sync::Arc;

use faststr::FastStr;
use futures::future::BoxFuture;

use crate::{
    error::{Error, Result},
    request::Request,
    resource::{Call, Resource, TransactionOpen},
    sync::SharedQueue,
    value::Value,
};

pub type ConnectHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;
pub type BeginHook = Arc<dyn Fn(&TransactionOpen) -> Result<()> + Send + Sync>;
pub type ExecuteHook = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type PlainHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CallableHooks {
    pub connect: Option<ConnectHook>,
    pub begin_transaction: Option<BeginHook>,
    pub execute: Option<ExecuteHook>,
    pub commit: Option<PlainHook>,
    pub rollback: Option<PlainHook>,
    pub disconnect: Option<PlainHook>,
}

/// Lifecycle steps recorded by a traced instance, in the order the
/// instance performed them.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    Connect,
    BeginTransaction(FastStr),
    Execute(Vec<Value>),
    Commit,
    Rollback,
    Disconnect,
}

#[derive(Clone, Default)]
pub struct CallableConfig {
    pub hooks: CallableHooks,
    pub trace: Option<Arc<SharedQueue<TraceEvent>>>,
}

pub struct CallableResource {
    pool: FastStr,
    instance: u64,
    config: CallableConfig,
}

impl CallableResource {
    pub fn new(pool: FastStr, instance: u64, config: CallableConfig) -> Self {
        CallableResource {
            pool,
            instance,
            config,
        }
    }

    fn trace(&self, event: TraceEvent) {
        if let Some(trace) = &self.config.trace {
            trace.push(event);
        }
    }

    /// Default execute when no hook is installed: each positional argument
    /// is a template whose `{name}` references are filled from the keyword
    /// arguments, and the filled templates are returned joined.
    fn format_args(call: &Call) -> Result<Value> {
        let mut parts = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            let template = arg
                .as_str()
                .ok_or_else(|| Error::input(format!("expected a str argument, got {}", arg.kind())))?;
            let mut text = template.to_string();
            for (key, value) in call.kwargs.iter() {
                let needle = format!("{{{key}}}");
                if let Some(s) = value.as_str() {
                    text = text.replace(&needle, s);
                }
            }
            parts.push(text);
        }
        Ok(Value::from(parts.join(", ")))
    }
}

impl Resource for CallableResource {
    fn connect<'a>(&'a mut self, _request: &'a Request) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.trace(TraceEvent::Connect);
            match &self.config.hooks.connect {
                Some(hook) => hook(),
                None => Ok(()),
            }
        })
    }

    fn begin_transaction<'a>(&'a mut self, open: &'a TransactionOpen) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.trace(TraceEvent::BeginTransaction(open.xid.clone()));
            match &self.config.hooks.begin_transaction {
                Some(hook) => hook(open),
                None => Ok(()),
            }
        })
    }

    fn execute<'a>(&'a mut self, call: &'a Call) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.trace(TraceEvent::Execute(call.args.clone()));
            match &self.config.hooks.execute {
                Some(hook) => hook(call.clone()).await,
                None => Self::format_args(call),
            }
        })
    }

    fn commit<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.trace(TraceEvent::Commit);
            match &self.config.hooks.commit {
                Some(hook) => hook(),
                None => Ok(()),
            }
        })
    }

    fn rollback<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.trace(TraceEvent::Rollback);
            match &self.config.hooks.rollback {
                Some(hook) => hook(),
                None => Ok(()),
            }
        })
    }

    fn disconnect<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.trace(TraceEvent::Disconnect);
            if let Some(hook) = &self.config.hooks.disconnect {
                if let Err(e) = hook() {
                    tracing::error!(
                        "[AVIARY] resource {}/{} failed to disconnect: {e}",
                        self.pool,
                        self.instance
                    );
                }
            }
        })
    }

    // the instance holds no real connection, so reuse needs no probing
    fn ping<'a>(&'a mut self) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    #[tokio::test]
    async fn default_execute_formats_args_with_kwargs() {
        let mut resource = CallableResource::new("callable_1".into(), 0, Default::default());
        let call = Call::execute(
            vec!["{a}".into(), "{b}".into()],
            value_map! { "a" => "foo", "b" => "bar" },
        );
        let result = resource.execute(&call).await.unwrap();
        assert_eq!(result, Value::from("foo, bar"));
    }

    #[tokio::test]
    async fn hooks_and_trace_are_invoked_in_order() {
        let trace = Arc::new(SharedQueue::new());
        let mut resource = CallableResource::new(
            "callable_1".into(),
            0,
            CallableConfig {
                hooks: CallableHooks {
                    execute: Some(Arc::new(|_| {
                        Box::pin(async { Ok(Value::from("ok")) }) as BoxFuture<'static, Result<Value>>
                    })),
                    ..Default::default()
                },
                trace: Some(trace.clone()),
            },
        );

        let request = Request::fake(std::time::Duration::from_secs(1));
        resource.connect(&request).await.unwrap();
        let open = TransactionOpen {
            xid: "XA-1".into(),
            ..Default::default()
        };
        resource.begin_transaction(&open).await.unwrap();
        let call = Call::execute(vec!["x".into()], Default::default());
        assert_eq!(resource.execute(&call).await.unwrap(), Value::from("ok"));
        resource.commit().await.unwrap();

        assert_eq!(trace.try_pop(), Some(TraceEvent::Connect));
        assert_eq!(
            trace.try_pop(),
            Some(TraceEvent::BeginTransaction("XA-1".into()))
        );
        assert_eq!(trace.try_pop(), Some(TraceEvent::Execute(vec!["x".into()])));
        assert_eq!(trace.try_pop(), Some(TraceEvent::Commit));
        assert_eq!(trace.try_pop(), None);
    }
}
