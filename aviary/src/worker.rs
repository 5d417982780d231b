//! The request processing pool: a fixed set of long-lived workers
//! executing handler work-units in FIFO order.
//!
//! Work-units run with their request installed as the ambient context, so
//! nested code reaches it through [`crate::request::current`] without
//! plumbing. A unit whose request expired while queued is never run; the
//! waiter observes the usual deadline failure.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    error::{Error, Result},
    request::{self, Request},
    telemetry::RateSampler,
    value::Value,
};

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Bound on queued-but-unstarted work-units; enqueues past it block
    /// until a slot frees or the request deadline fires.
    pub queue_size: usize,
    /// A worker past this age is replaced once it goes idle.
    pub max_age: Duration,
    /// How long `stop` waits for in-flight units before giving up.
    pub drain_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            workers: 4,
            queue_size: 64,
            max_age: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

type WorkFuture = BoxFuture<'static, Result<Value>>;
type WorkFn = Box<dyn FnOnce() -> WorkFuture + Send + 'static>;

struct WorkUnit {
    request: Request,
    work: WorkFn,
    result: oneshot::Sender<Result<Value>>,
}

/// Single-shot promise for a work-unit's outcome, consumable by at most
/// one waiter.
#[derive(Debug)]
pub struct WorkUnitHandle {
    request: Request,
    rx: oneshot::Receiver<Result<Value>>,
}

impl WorkUnitHandle {
    /// Waits for the result, bounded by the request deadline.
    pub async fn wait(self) -> Result<Value> {
        match self.request.bound(self.rx).await? {
            Ok(result) => result,
            Err(_) => Err(Error::Stopped("worker pool".into())),
        }
    }

    /// Waits at most `min(limit, remain)`.
    pub async fn wait_for(self, limit: Duration) -> Result<Value> {
        match self.request.bound_by(limit, self.rx).await? {
            Ok(result) => result,
            Err(_) => Err(Error::Stopped("worker pool".into())),
        }
    }

    /// Abandons the result; the unit still runs unless its request expires
    /// first.
    pub fn cancel(self) {}
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    config: WorkerPoolConfig,
    tx: Mutex<Option<mpsc::Sender<WorkUnit>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<WorkUnit>>,
    busy: AtomicUsize,
    queued: AtomicUsize,
    live: AtomicUsize,
    rate: RateSampler,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates the pool and spawns its workers; must run inside a tokio
    /// runtime.
    pub fn start(config: WorkerPoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            busy: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            rate: RateSampler::default(),
            workers: Mutex::new(Vec::new()),
        });
        for _ in 0..worker_count {
            spawn_worker(&shared);
        }
        tracing::debug!("[AVIARY] worker pool started with {worker_count} worker(s)");
        WorkerPool { shared }
    }

    /// Appends a work-unit to the queue. Blocks while the queue is
    /// saturated, for at most `request.remain()`.
    pub async fn enqueue<F, Fut>(&self, request: &Request, work: F) -> Result<WorkUnitHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let tx = self
            .shared
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::Stopped("worker pool".into()))?;
        let (result_tx, result_rx) = oneshot::channel();
        let unit = WorkUnit {
            request: request.clone(),
            work: Box::new(move || work().boxed()),
            result: result_tx,
        };
        // counted before the send: a worker may dequeue the unit before
        // this task resumes
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        match request.bound(tx.send(unit)).await {
            Ok(Ok(())) => Ok(WorkUnitHandle {
                request: request.clone(),
                rx: result_rx,
            }),
            Ok(Err(_)) => {
                self.shared.queued.fetch_sub(1, Ordering::Relaxed);
                Err(Error::Stopped("worker pool".into()))
            }
            Err(deadline) => {
                self.shared.queued.fetch_sub(1, Ordering::Relaxed);
                Err(deadline)
            }
        }
    }

    /// Workers currently executing a unit.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Relaxed)
    }

    /// Units accepted but not yet started.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Relaxed)
    }

    /// Units started per second over the sampling window.
    pub fn rate(&self) -> f64 {
        self.shared.rate.avg()
    }

    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    /// Stops accepting new work; already queued units still run.
    pub fn cease(&self) {
        self.shared.tx.lock().take();
    }

    /// Ceases, then gives in-flight units `drain_timeout` to finish before
    /// the workers are stopped unconditionally.
    pub async fn stop(&self) {
        self.cease();
        let deadline = Instant::now() + self.shared.config.drain_timeout;
        while self.shared.live.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let stragglers = self.shared.live.load(Ordering::Relaxed);
        if stragglers > 0 {
            tracing::warn!(
                "[AVIARY] proceeding with worker pool shutdown although \
                 {stragglers} unit(s) are still in flight"
            );
        }
        for handle in self.shared.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    shared.live.fetch_add(1, Ordering::Relaxed);
    let worker_shared = shared.clone();
    let handle = tokio::spawn(async move {
        worker_main(&worker_shared).await;
        worker_shared.live.fetch_sub(1, Ordering::Relaxed);
    });
    let mut workers = shared.workers.lock();
    workers.retain(|h| !h.is_finished());
    workers.push(handle);
}

async fn worker_main(shared: &Arc<Shared>) {
    let born = Instant::now();
    loop {
        let unit = {
            let mut rx = shared.rx.lock().await;
            rx.recv().await
        };
        let Some(unit) = unit else {
            return; // queue closed and drained
        };
        shared.queued.fetch_sub(1, Ordering::Relaxed);

        if unit.request.expired() {
            tracing::warn!(
                "[AVIARY] request {} expired while queued, dropping its work-unit",
                unit.request.id()
            );
            let _ = unit.result.send(Err(Error::deadline()));
        } else {
            shared.busy.fetch_add(1, Ordering::Relaxed);
            // the guard keeps the counter honest even when the worker is
            // aborted mid-unit during an unconditional stop
            let busy = scopeguard::guard(shared.clone(), |shared| {
                shared.busy.fetch_sub(1, Ordering::Relaxed);
            });
            shared.rate.tick();
            let request = unit.request.clone();
            let outcome = AssertUnwindSafe(request::with_request(request, (unit.work)()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::unclassified(panic_message(&payload))));
            drop(busy);
            let _ = unit.result.send(outcome);
        }

        if born.elapsed() >= shared.config.max_age {
            tracing::debug!("[AVIARY] worker aged out, replacing");
            spawn_worker(shared);
            return;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("work-unit panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("work-unit panicked: {s}")
    } else {
        "work-unit panicked".to_string()
    }
}
