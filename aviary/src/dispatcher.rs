//! The adapter between protocol listeners and the worker pool.
//!
//! Listeners produce one incoming event at a time and call
//! `begin_request` / `enqueue` / `end_request`. The dispatcher counts
//! live requests through an interlocked factory so that shutdown can
//! refuse new work and drain the rest, and feeds the telemetry taps with
//! per-interface rates and response times.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use faststr::FastStr;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::{
    error::{Error, Result},
    interface::Interface,
    request::{Request, RequestSpec},
    telemetry::{Performance, RateSampler},
    value::Value,
    worker::{WorkUnitHandle, WorkerPool},
};

/// Counts live requests; once stopped it refuses creation, and `wait`
/// blocks until the count drains (or the timeout runs out).
struct InterlockedFactory {
    state: Mutex<FactoryState>,
    drained: Notify,
}

struct FactoryState {
    stopped: bool,
    count: usize,
}

impl InterlockedFactory {
    fn new() -> Self {
        InterlockedFactory {
            state: Mutex::new(FactoryState {
                stopped: false,
                count: 0,
            }),
            drained: Notify::new(),
        }
    }

    fn create(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::FactoryShutdown);
        }
        state.count += 1;
        Ok(state.count)
    }

    fn destroyed(&self) -> usize {
        let count = {
            let mut state = self.state.lock();
            state.count = state.count.saturating_sub(1);
            state.count
        };
        if count == 0 {
            self.drained.notify_waiters();
        }
        count
    }

    fn count(&self) -> usize {
        self.state.lock().count
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
    }

    async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.drained.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

pub struct Dispatcher {
    request_timeout: Duration,
    factory: InterlockedFactory,
    pool: Arc<WorkerPool>,
    performance: Arc<Performance>,
    rate: RateSampler,
    interfaces: RwLock<AHashMap<FastStr, Arc<dyn Interface>>>,
}

impl Dispatcher {
    pub fn new(
        request_timeout: Duration,
        pool: Arc<WorkerPool>,
        performance: Arc<Performance>,
    ) -> Self {
        Dispatcher {
            request_timeout,
            factory: InterlockedFactory::new(),
            pool,
            performance,
            rate: RateSampler::default(),
            interfaces: RwLock::new(AHashMap::new()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Creates and registers a request for an incoming event.
    pub fn begin_request(&self, mut spec: RequestSpec) -> Result<Request> {
        let count = self.factory.create()?;
        if spec.timeout.is_none() {
            spec.timeout = Some(self.request_timeout);
        }
        let interface = spec.interface.clone();
        let request = Request::new(spec);
        self.performance
            .event(format!("interface.{interface}.request_rate"));
        tracing::trace!(
            "[AVIARY] request {} is created, {count} request(s) are now active",
            request.id()
        );
        Ok(request)
    }

    /// Posts a work-unit processing `request` to the worker pool.
    pub async fn enqueue<F, Fut>(&self, request: &Request, work: F) -> Result<WorkUnitHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.rate.tick();
        self.pool.enqueue(request, work).await
    }

    /// Registers the request's completion. `Some(true)` is a normal
    /// completion, `Some(false)` a handler failure; `None` means the
    /// request was abandoned without a verdict and is excluded from the
    /// response histograms.
    pub fn end_request(&self, success: Option<bool>, request: &Request) {
        if let Some(success) = success {
            let outcome = if success { "success" } else { "failure" };
            let interface = request.interface();
            self.performance.sample(
                format!("interface.{interface}.response_time.{outcome}"),
                request.elapsed().as_secs_f64() * 1000.0,
            );
            self.performance
                .event(format!("interface.{interface}.response_rate.{outcome}"));
        }
        let left = self.factory.destroyed();
        tracing::trace!(
            "[AVIARY] request {} {}, {left} request(s) are still active",
            request.id(),
            match success {
                Some(true) => "ends with success",
                Some(false) => "ends with failure",
                None => "is being abandoned",
            }
        );
    }

    pub fn active_requests(&self) -> usize {
        self.factory.count()
    }

    /// `(busy, queued, rate)` for the health monitor page.
    pub fn activity(&self) -> (usize, usize, f64) {
        (self.pool.busy(), self.pool.queued(), self.rate.avg())
    }

    pub fn performance(&self) -> &Arc<Performance> {
        &self.performance
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Makes a running interface discoverable by its peers, e.g. the RPC
    /// client asking the RPC listener for its advertised address. Also
    /// how self-tests inject fakes.
    pub fn install_interface(&self, interface: Arc<dyn Interface>) {
        self.interfaces
            .write()
            .insert(interface.name(), interface);
    }

    pub fn remove_interface(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.interfaces.write().remove(name)
    }

    pub fn get_interface(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.interfaces.read().get(name).cloned()
    }

    /// Refuses new requests, then waits up to one full request timeout
    /// for the outstanding ones to finish.
    pub async fn cease(&self) {
        self.factory.stop();
        let active = self.factory.count();
        tracing::info!(
            "[AVIARY] no more requests can be created{}",
            if active > 0 {
                format!(", {active} request(s) are still active")
            } else {
                String::new()
            }
        );
        if !self.factory.wait(self.request_timeout).await {
            let active = self.factory.count();
            tracing::warn!(
                "[AVIARY] proceeding with shutdown although {active} request(s) \
                 are still active"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPoolConfig;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Duration::from_secs(5),
            Arc::new(WorkerPool::start(WorkerPoolConfig::default())),
            Arc::new(Performance::default()),
        )
    }

    fn spec(interface: &str) -> RequestSpec {
        RequestSpec {
            interface: FastStr::new(interface),
            protocol: "test".into(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_accounting_and_samplers() {
        let dispatcher = dispatcher();
        let request = dispatcher.begin_request(spec("http_1")).unwrap();
        assert_eq!(dispatcher.active_requests(), 1);
        assert!(dispatcher.performance().rate("interface.http_1.request_rate") > 0.0);

        let handle = dispatcher
            .enqueue(&request, || async { Ok(Value::from("done")) })
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), Value::from("done"));

        dispatcher.end_request(Some(true), &request);
        assert_eq!(dispatcher.active_requests(), 0);
        assert_eq!(
            dispatcher
                .performance()
                .stats("interface.http_1.response_time.success")
                .unwrap()
                .count,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_requests_skip_the_histograms() {
        let dispatcher = dispatcher();
        let request = dispatcher.begin_request(spec("smpp_1")).unwrap();
        dispatcher.end_request(None, &request);
        assert_eq!(dispatcher.active_requests(), 0);
        assert!(dispatcher
            .performance()
            .stats("interface.smpp_1.response_time.success")
            .is_none());
        assert!(dispatcher
            .performance()
            .stats("interface.smpp_1.response_time.failure")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_is_applied() {
        let dispatcher = dispatcher();
        let request = dispatcher.begin_request(spec("http_1")).unwrap();
        assert!(request.remain() <= Duration::from_secs(5));
        assert!(request.remain() > Duration::from_secs(4));
        dispatcher.end_request(None, &request);
    }

    #[tokio::test(start_paused = true)]
    async fn ceased_dispatcher_refuses_requests() {
        let dispatcher = dispatcher();
        let lingering = dispatcher.begin_request(spec("http_1")).unwrap();

        let cease = dispatcher.cease();
        tokio::pin!(cease);
        // cease blocks while a request is outstanding
        assert!(futures::poll!(&mut cease).is_pending());

        let err = dispatcher.begin_request(spec("http_1")).unwrap_err();
        assert!(matches!(err, Error::FactoryShutdown));
        assert_eq!(
            err.to_string(),
            "request cannot begin, request factory has been shut down"
        );

        dispatcher.end_request(Some(false), &lingering);
        cease.await;
    }
}
