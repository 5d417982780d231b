//! The inbound unit of work: identity, deadline and bookkeeping carried
//! across every layer of the runtime.
//!
//! Every blocking operation in the system reduces its wait to
//! `min(configured_timeout, request.remain())` and fails with a uniform
//! "request deadline" error when the remainder hits zero; [`Request::bound`]
//! and [`Request::bound_by`] are the two helpers enforcing that rule.

use std::{cmp, sync::Arc, time::Duration};

use faststr::FastStr;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::{
    error::{Error, Result},
    value::Value,
};

/// Process-wide fallback applied when a request is created without an
/// explicit timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// far enough to never expire within a process lifetime
const INFINITE_TIMEOUT: Duration = Duration::from_secs(3600 * 24 * 365);

/// A cheap cloneable handle; clones share deadline and identity, which is
/// what fanned-out helper work wants.
#[derive(Clone)]
pub struct Request {
    shared: Arc<Shared>,
}

struct Shared {
    id: FastStr,
    interface: FastStr,
    protocol: FastStr,
    start: Instant,
    deadline: Instant,
    parameters: Value,
    description: RwLock<FastStr>,
    self_test: Option<FastStr>,
}

/// Everything `begin_request` knows about an incoming event.
#[derive(Clone, Debug, Default)]
pub struct RequestSpec {
    pub interface: FastStr,
    pub protocol: FastStr,
    pub timeout: Option<Duration>,
    pub parameters: Value,
    pub description: FastStr,
    pub self_test: Option<FastStr>,
}

impl Request {
    pub fn new(spec: RequestSpec) -> Self {
        let now = Instant::now();
        let timeout = spec.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Request {
            shared: Arc::new(Shared {
                id: unique_token(""),
                interface: spec.interface,
                protocol: spec.protocol,
                start: now,
                deadline: now + timeout,
                parameters: spec.parameters,
                description: RwLock::new(spec.description),
                self_test: spec.self_test,
            }),
        }
    }

    /// A request for process-internal work that must not be cut short.
    pub fn infinite() -> Self {
        Request::new(RequestSpec {
            interface: FastStr::from_static_str("-"),
            protocol: FastStr::from_static_str("-"),
            timeout: Some(INFINITE_TIMEOUT),
            ..Default::default()
        })
    }

    /// A self-test request, the moral equivalent of an inbound one.
    pub fn fake(timeout: Duration) -> Self {
        Request::new(RequestSpec {
            interface: FastStr::from_static_str("-"),
            protocol: FastStr::from_static_str("-"),
            timeout: Some(timeout),
            self_test: Some(FastStr::from_static_str("self_test")),
            ..Default::default()
        })
    }

    pub fn id(&self) -> &FastStr {
        &self.shared.id
    }

    pub fn interface(&self) -> &FastStr {
        &self.shared.interface
    }

    pub fn protocol(&self) -> &FastStr {
        &self.shared.protocol
    }

    pub fn parameters(&self) -> &Value {
        &self.shared.parameters
    }

    /// Authentication tokens conventionally carried in `parameters`.
    pub fn auth_tokens(&self) -> Option<&Value> {
        self.shared.parameters.get("auth_tokens")
    }

    pub fn deadline(&self) -> Instant {
        self.shared.deadline
    }

    pub fn start(&self) -> Instant {
        self.shared.start
    }

    pub fn remain(&self) -> Duration {
        self.shared
            .deadline
            .saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remain() == Duration::ZERO
    }

    pub fn elapsed(&self) -> Duration {
        self.shared.start.elapsed()
    }

    pub fn self_test(&self) -> Option<&FastStr> {
        self.shared.self_test.as_ref()
    }

    /// Late-binds the human-readable description once the identity of the
    /// request is known, e.g. after the method name has been parsed.
    pub fn describe(&self, text: impl Into<FastStr>) {
        *self.shared.description.write() = text.into();
    }

    pub fn description(&self) -> FastStr {
        self.shared.description.read().clone()
    }

    /// Acquires a deadline-aware lock, waiting at most `remain`; the
    /// returned token releases on drop.
    pub async fn acquire(&self, lock: &crate::sync::DeadlineLock) -> Result<crate::sync::LockToken> {
        lock.acquire(self).await
    }

    /// Runs `fut` for at most the time this request has left; the timeout
    /// surfaces as a deadline error.
    pub async fn bound<F>(&self, fut: F) -> Result<F::Output>
    where
        F: std::future::Future,
    {
        tokio::time::timeout_at(self.shared.deadline, fut)
            .await
            .map_err(|_| Error::deadline())
    }

    /// Runs `fut` for at most `min(limit, remain)`. A configured timeout is
    /// always an upper bound, never an extension of the request deadline.
    pub async fn bound_by<F>(&self, limit: Duration, fut: F) -> Result<F::Output>
    where
        F: std::future::Future,
    {
        let deadline = cmp::min(self.shared.deadline, Instant::now() + limit);
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| Error::deadline())
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("interface", &self.shared.interface)
            .field("protocol", &self.shared.protocol)
            .field("remain", &self.remain())
            .field("description", &*self.shared.description.read())
            .finish()
    }
}

tokio::task_local! {
    static CURRENT: Request;
}

/// The request the executing task is working on behalf of, if any.
pub fn current() -> Option<Request> {
    CURRENT.try_with(Request::clone).ok()
}

/// Like [`current`], falling back to an unexpiring internal request.
pub fn current_or_infinite() -> Request {
    current().unwrap_or_else(Request::infinite)
}

/// Installs `request` as the ambient request for the duration of `fut`.
pub async fn with_request<F>(request: Request, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT.scope(request, fut).await
}

/// A process-unique opaque token; used for request ids and xids.
pub(crate) fn unique_token(prefix: &str) -> FastStr {
    format!("{prefix}{:016x}", rand::random::<u64>()).into()
}
