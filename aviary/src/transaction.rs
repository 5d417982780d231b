//! The multi-resource transaction coordinator.
//!
//! A transaction collects participants (one per resource invocation),
//! then `execute()` fans them out concurrently, each participant running
//! `checkout -> begin_transaction -> execute -> commit | rollback ->
//! release` on its own helper task. No commit is issued until every
//! execute succeeded and the request deadline has not fired; rollback is
//! ordered to every participant that reached begin and is not waited
//! upon, so the classified error reaches the caller first.
//!
//! A transaction never re-executes; a retry is a new transaction.

use std::sync::Arc;

use faststr::FastStr;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    pool::{cache::CacheKey, CacheControl, PoolRegistry, ResourcePool},
    request::{self, Request},
    resource::{Call, TransactionOpen},
    value::{Value, ValueMap},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Building,
    Executing,
    Committed,
    RolledBack,
    Failed,
}

pub struct Participant {
    pool: FastStr,
    resource_args: Vec<Value>,
    resource_kwargs: ValueMap,
    call: Call,
}

pub struct Transaction {
    registry: Arc<PoolRegistry>,
    request: Request,
    options: ValueMap,
    xid: FastStr,
    participants: Vec<Participant>,
    state: TransactionState,
}

impl Transaction {
    pub fn new(registry: Arc<PoolRegistry>, request: Request, options: ValueMap) -> Self {
        Transaction {
            registry,
            request,
            options,
            xid: request::unique_token("XA-"),
            participants: Vec::new(),
            state: TransactionState::Building,
        }
    }

    pub fn xid(&self) -> &FastStr {
        &self.xid
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Adds a participant against the named pool; finish it with one of
    /// the builder's call methods.
    pub fn participant(&mut self, pool: impl Into<FastStr>) -> ParticipantBuilder<'_> {
        ParticipantBuilder {
            transaction: self,
            pool: pool.into(),
            resource_args: Vec::new(),
            resource_kwargs: ValueMap::new(),
        }
    }

    /// Runs all participants to completion and returns their results in
    /// insertion order.
    pub async fn execute(mut self) -> Result<Vec<Value>> {
        let n = self.participants.len();
        if n == 0 {
            self.state = TransactionState::Committed;
            return Ok(Vec::new());
        }
        self.state = TransactionState::Executing;
        tracing::debug!(
            "[AVIARY] transaction {} starts with {n} participant(s)",
            self.xid
        );

        let mut result_rxs = Vec::with_capacity(n);
        let mut decision_txs = Vec::with_capacity(n);
        let mut outcome_rxs = Vec::with_capacity(n);
        for (index, participant) in self.participants.drain(..).enumerate() {
            let (result_tx, result_rx) = oneshot::channel();
            let (decision_tx, decision_rx) = oneshot::channel();
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let ctx = HelperContext {
                registry: self.registry.clone(),
                request: self.request.clone(),
                xid: self.xid.clone(),
                options: self.options.clone(),
                index,
            };
            tokio::spawn(request::with_request(
                self.request.clone(),
                helper_main(ctx, participant, result_tx, decision_rx, outcome_tx),
            ));
            result_rxs.push(result_rx);
            decision_txs.push(decision_tx);
            outcome_rxs.push(outcome_rx);
        }

        // intermediate barrier: all participants must produce a value
        // before the deadline for the commit phase to begin
        let deadline = self.request.deadline();
        let mut results: Vec<Option<Value>> = (0..n).map(|_| None).collect();
        let mut failure: Option<(usize, Error)> = None;
        let mut deadline_hit = false;
        let mut pending: FuturesUnordered<_> = result_rxs
            .into_iter()
            .enumerate()
            .map(|(i, rx)| async move { (i, rx.await) })
            .collect();
        while !pending.is_empty() {
            let (index, received) = match tokio::time::timeout_at(deadline, pending.next()).await {
                Err(_) => {
                    deadline_hit = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(next)) => next,
            };
            match flatten_result(index, received) {
                Ok(value) => results[index] = Some(value),
                Err(e) => {
                    record_failure(&mut failure, index, e);
                    // pick up whatever else already resolved so the error
                    // surfaced is the lowest-index one
                    while let Some(Some((i, received))) = pending.next().now_or_never() {
                        match flatten_result(i, received) {
                            Ok(value) => results[i] = Some(value),
                            Err(e) => record_failure(&mut failure, i, e),
                        }
                    }
                    break;
                }
            }
        }

        if let Some((index, error)) = failure {
            tracing::warn!(
                "[AVIARY] transaction {} failed at participant {index}: {error}",
                self.xid
            );
            for tx in decision_txs {
                let _ = tx.send(Decision::Rollback);
            }
            self.state = TransactionState::Failed;
            return Err(error);
        }

        if deadline_hit {
            tracing::warn!(
                "[AVIARY] transaction {} ran out of request time before all \
                 intermediate results arrived",
                self.xid
            );
            for tx in decision_txs {
                let _ = tx.send(Decision::Rollback);
            }
            self.state = TransactionState::Failed;
            return Err(Error::deadline_waiting("intermediate result"));
        }

        // commit phase; failures here are reported but earlier commits stand
        for tx in decision_txs {
            let _ = tx.send(Decision::Commit);
        }
        let mut commit_failure: Option<Error> = None;
        for (index, outcome_rx) in outcome_rxs.into_iter().enumerate() {
            let outcome = match self.request.bound(outcome_rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::TransactionExecution(
                    format!("participant {index} terminated during commit").into(),
                )),
                Err(deadline) => Err(deadline),
            };
            if let Err(e) = outcome {
                tracing::error!(
                    "[AVIARY] transaction {} participant {index} failed to commit: {e}",
                    self.xid
                );
                if commit_failure.is_none() {
                    commit_failure = Some(e);
                }
            }
        }
        if let Some(e) = commit_failure {
            self.state = TransactionState::Failed;
            return Err(e);
        }

        self.state = TransactionState::Committed;
        tracing::debug!("[AVIARY] transaction {} committed", self.xid);
        Ok(results
            .into_iter()
            .map(|v| v.expect("barrier passed with a missing result"))
            .collect())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("participants", &self.participants.len())
            .field("state", &self.state)
            .finish()
    }
}

pub struct ParticipantBuilder<'a> {
    transaction: &'a mut Transaction,
    pool: FastStr,
    resource_args: Vec<Value>,
    resource_kwargs: ValueMap,
}

impl ParticipantBuilder<'_> {
    /// Positional arguments addressed to the resource itself rather than
    /// to the call, e.g. a queue name for a JMS destination.
    pub fn resource_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.resource_args = args.into_iter().collect();
        self
    }

    pub fn resource_kwargs(mut self, kwargs: ValueMap) -> Self {
        self.resource_kwargs = kwargs;
        self
    }

    /// Records an arbitrary named call as this participant's invocation.
    pub fn call(self, call: Call) {
        self.transaction.participants.push(Participant {
            pool: self.pool,
            resource_args: self.resource_args,
            resource_kwargs: self.resource_kwargs,
            call,
        });
    }

    pub fn execute(self, args: Vec<Value>, kwargs: ValueMap) {
        self.call(Call::execute(args, kwargs));
    }

    pub fn execute_cached(self, args: Vec<Value>, kwargs: ValueMap, cache: CacheControl) {
        self.call(Call::execute(args, kwargs).with_cache(cache));
    }
}

enum Decision {
    Commit,
    Rollback,
}

struct HelperContext {
    registry: Arc<PoolRegistry>,
    request: Request,
    xid: FastStr,
    options: ValueMap,
    index: usize,
}

fn record_failure(failure: &mut Option<(usize, Error)>, index: usize, error: Error) {
    match failure {
        Some((existing, _)) if *existing <= index => {
            tracing::warn!("[AVIARY] participant {index} also failed: {error}");
        }
        _ => *failure = Some((index, error)),
    }
}

fn flatten_result(
    index: usize,
    received: Result<Result<Value>, oneshot::error::RecvError>,
) -> Result<Value> {
    match received {
        Ok(result) => result,
        Err(_) => Err(Error::TransactionExecution(
            format!("participant {index} terminated without a result").into(),
        )),
    }
}

async fn helper_main(
    ctx: HelperContext,
    participant: Participant,
    result_tx: oneshot::Sender<Result<Value>>,
    mut decision_rx: oneshot::Receiver<Decision>,
    outcome_tx: oneshot::Sender<Result<()>>,
) {
    let pool = match ctx.registry.get(&participant.pool) {
        Ok(pool) => pool,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            let _ = outcome_tx.send(Ok(()));
            return;
        }
    };
    let mut resource = match pool.checkout(&ctx.request).await {
        Ok(resource) => resource,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            let _ = outcome_tx.send(Ok(()));
            return;
        }
    };

    // a cache hit keeps pool accounting intact but skips the whole
    // begin/execute/commit sequence
    let cache_key = effective_cache_key(&pool, &participant.call);
    if let Some(key) = &cache_key {
        if let Some(value) = cache_lookup(&pool, &participant.call.cache, key) {
            tracing::debug!(
                "[AVIARY] transaction {} participant {} served from cache",
                ctx.xid,
                ctx.index
            );
            let _ = result_tx.send(Ok(value));
            resource.release(false).await;
            let _ = outcome_tx.send(Ok(()));
            return;
        }
    }

    let open = TransactionOpen {
        xid: ctx.xid.clone(),
        options: ctx.options.clone(),
        resource_args: participant.resource_args,
        resource_kwargs: participant.resource_kwargs,
    };
    let begun = match ctx.request.bound(resource.begin_transaction(&open)).await {
        Ok(result) => result,
        Err(deadline) => Err(deadline),
    };
    if let Err(e) = begun {
        let terminal = e.terminal();
        let _ = result_tx.send(Err(e));
        resource.release(terminal).await;
        let _ = outcome_tx.send(Ok(()));
        return;
    }

    // execute, racing an early rollback order from the coordinator
    let executed = {
        let exec = resource.execute(&participant.call);
        tokio::pin!(exec);
        tokio::select! {
            result = &mut exec => Some(result),
            _ = &mut decision_rx => None,
        }
    };
    let Some(executed) = executed else {
        // ordered to roll back while still executing; the instance state
        // is unknown, so it does not go back to the pool
        if let Err(e) = resource.rollback().await {
            tracing::error!(
                "[AVIARY] transaction {} participant {} failed to roll back: {e}",
                ctx.xid,
                ctx.index
            );
        }
        resource.release(true).await;
        let _ = outcome_tx.send(Ok(()));
        return;
    };

    match executed {
        Err(e) => {
            let terminal = e.terminal();
            let _ = result_tx.send(Err(e));
            if let Err(e) = resource.rollback().await {
                tracing::error!(
                    "[AVIARY] transaction {} participant {} failed to roll back: {e}",
                    ctx.xid,
                    ctx.index
                );
            }
            resource.release(terminal).await;
            let _ = outcome_tx.send(Ok(()));
        }
        Ok(value) => {
            if let Some(key) = &cache_key {
                cache_store(&pool, &participant.call.cache, key, &value);
            }
            let _ = result_tx.send(Ok(value));
            match decision_rx.await {
                Ok(Decision::Commit) => match resource.commit().await {
                    Ok(()) => {
                        resource.release(false).await;
                        let _ = outcome_tx.send(Ok(()));
                    }
                    Err(e) => {
                        resource.release(true).await;
                        let _ = outcome_tx
                            .send(Err(Error::TransactionCommit(e.to_string().into())));
                    }
                },
                Ok(Decision::Rollback) | Err(_) => {
                    if let Err(e) = resource.rollback().await {
                        tracing::error!(
                            "[AVIARY] transaction {} participant {} failed to roll back: {e}",
                            ctx.xid,
                            ctx.index
                        );
                    }
                    resource.release(false).await;
                    let _ = outcome_tx.send(Ok(()));
                }
            }
        }
    }
}

fn effective_cache_key(pool: &ResourcePool, call: &Call) -> Option<FastStr> {
    let control = &call.cache;
    let active =
        control.get_hook.is_some() || control.put_hook.is_some() || pool.cache().is_some();
    if !active {
        return None;
    }
    match &control.key {
        CacheKey::Disabled => None,
        CacheKey::Explicit(key) => Some(key.clone()),
        CacheKey::Derived => Some(call.derived_cache_key()),
    }
}

fn cache_lookup(pool: &ResourcePool, control: &CacheControl, key: &FastStr) -> Option<Value> {
    let attempt = if let Some(hook) = &control.get_hook {
        hook(key)
    } else if let Some(cache) = pool.cache() {
        Ok(cache.get(key))
    } else {
        Ok(None)
    };
    match attempt {
        Ok(hit) => hit,
        Err(e) => {
            tracing::warn!(
                "[AVIARY] cache get failed for pool '{}': {e}",
                pool.name()
            );
            None
        }
    }
}

fn cache_store(pool: &ResourcePool, control: &CacheControl, key: &FastStr, value: &Value) {
    let attempt = if let Some(hook) = &control.put_hook {
        hook(key, value)
    } else if let Some(cache) = pool.cache() {
        cache.put(key.clone(), value.clone(), control.ttl, control.weight);
        Ok(())
    } else {
        Ok(())
    };
    if let Err(e) = attempt {
        tracing::warn!(
            "[AVIARY] cache put failed for pool '{}': {e}",
            pool.name()
        );
    }
}
