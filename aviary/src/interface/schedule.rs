//! The schedule interface: fires the configured handler on a fixed
//! period, each firing running under its own request.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use faststr::FastStr;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    error::{Error, Result},
    interface::{Interface, InterfaceContext, InterfaceFactory},
    request::RequestSpec,
    value::{Value, ValueMap},
};

pub struct ScheduleInterface {
    shared: Arc<ScheduleShared>,
}

struct ScheduleShared {
    name: FastStr,
    instance: u64,
    period: Duration,
    handler: FastStr,
    ctx: InterfaceContext,
    ceased: AtomicBool,
    stopping: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleInterface {
    pub fn factory() -> InterfaceFactory {
        Arc::new(|name, config, ctx| {
            Ok(Arc::new(ScheduleInterface::from_config(name, &config, ctx)?) as Arc<dyn Interface>)
        })
    }

    pub fn from_config(name: FastStr, config: &ValueMap, ctx: InterfaceContext) -> Result<Self> {
        let period = config
            .get("period")
            .and_then(Value::as_duration)
            .ok_or_else(|| Error::config("schedule interface needs a numeric 'period'"))?;
        let handler = config
            .get("handler")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config("schedule interface needs a 'handler'"))?;
        Ok(ScheduleInterface {
            shared: Arc::new(ScheduleShared {
                name,
                instance: rand::random(),
                period,
                handler: FastStr::new(handler),
                ctx,
                ceased: AtomicBool::new(false),
                stopping: Notify::new(),
                task: Mutex::new(None),
            }),
        })
    }
}

impl Interface for ScheduleInterface {
    fn name(&self) -> FastStr {
        self.shared.name.clone()
    }

    fn instance_id(&self) -> u64 {
        self.shared.instance
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let shared = self.shared.clone();
            let task = tokio::spawn(async move { tick_loop(shared).await });
            *self.shared.task.lock() = Some(task);
            Ok(())
        })
    }

    fn cease(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.ceased.store(true, Ordering::Release);
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.ceased.store(true, Ordering::Release);
            self.shared.stopping.notify_waiters();
            if let Some(task) = self.shared.task.lock().take() {
                task.abort();
            }
        })
    }
}

async fn tick_loop(shared: Arc<ScheduleShared>) {
    loop {
        let stopping = shared.stopping.notified();
        tokio::select! {
            _ = stopping => return,
            _ = tokio::time::sleep(shared.period) => {}
        }
        if !shared.ceased.load(Ordering::Acquire) {
            fire(&shared).await;
        }
    }
}

async fn fire(shared: &Arc<ScheduleShared>) {
    let request = match shared.ctx.dispatcher.begin_request(RequestSpec {
        interface: shared.name.clone(),
        protocol: FastStr::from_static_str("schedule"),
        description: format!("scheduled firing of {}", shared.name).into(),
        ..Default::default()
    }) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("[AVIARY] interface {} skipped a firing: {e}", shared.name);
            return;
        }
    };
    let outcome = match shared.ctx.handlers.get(&shared.handler) {
        Some(handler) => {
            match shared
                .ctx
                .dispatcher
                .enqueue(&request, move || handler(Value::Null))
                .await
            {
                Ok(handle) => handle.wait().await,
                Err(e) => Err(e),
            }
        }
        None => Err(Error::config(format!(
            "handler '{}' is not registered",
            shared.handler
        ))),
    };
    match outcome {
        Ok(_) => shared.ctx.dispatcher.end_request(Some(true), &request),
        Err(e) => {
            tracing::error!("[AVIARY] interface {} firing failed: {e}", shared.name);
            shared.ctx.dispatcher.end_request(Some(false), &request);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;

    use super::*;
    use crate::{
        dispatcher::Dispatcher,
        interface::HandlerRegistry,
        telemetry::Performance,
        value_map,
        worker::{WorkerPool, WorkerPoolConfig},
    };

    #[tokio::test]
    async fn fires_on_the_period_until_ceased() {
        let ctx = InterfaceContext {
            dispatcher: Arc::new(Dispatcher::new(
                Duration::from_secs(5),
                Arc::new(WorkerPool::start(WorkerPoolConfig::default())),
                Arc::new(Performance::default()),
            )),
            handlers: Arc::new(HandlerRegistry::new()),
        };
        let firings = Arc::new(AtomicUsize::new(0));
        let counter = firings.clone();
        ctx.handlers.register(
            "beat",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Ok(Value::Null) }.boxed()
            }),
        );
        let config = value_map! {
            "protocol" => "schedule",
            "period" => 0.05,
            "handler" => "beat",
        };
        let interface =
            ScheduleInterface::from_config("schedule_1".into(), &config, ctx).unwrap();
        interface.start().await.unwrap();

        let give_up = std::time::Instant::now() + Duration::from_secs(3);
        while firings.load(Ordering::Relaxed) < 3 {
            assert!(std::time::Instant::now() < give_up, "schedule never fired");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        interface.cease().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_cease = firings.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(firings.load(Ordering::Relaxed), after_cease);

        interface.stop().await;
    }
}
