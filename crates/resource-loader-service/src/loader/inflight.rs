//! The merge table, the admission queue and the retrying network operation behind them.

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{LoaderEvent, LoaderInner, LoaderState};
use crate::error::LoadError;
use crate::fetch::FetchRequest;
use crate::types::{LoadOptions, RawResource, RequestId};
use crate::utils::futures::CallOnDrop;

/// The outcome of one network operation, shared by every merged caller.
pub(super) type SharedLoad = Shared<oneshot::Receiver<Result<RawResource, LoadError>>>;

/// The effective priority of a network operation: the highest priority of all callers
/// that joined it.
pub(super) type SharedPriority = Arc<AtomicU32>;

/// One dispatched attempt.
#[derive(Debug)]
pub(super) struct ActiveRequest {
    pub url: String,
    pub priority: SharedPriority,
    pub started: Instant,
    pub cancel: CancellationToken,
}

impl ActiveRequest {
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }
}

/// An attempt waiting for a free slot.
#[derive(Debug)]
pub(super) struct QueuedRequest {
    /// Ids are handed out in submission order and break priority ties.
    pub id: RequestId,
    pub request: ActiveRequest,
    pub ready: oneshot::Sender<()>,
}

/// The outstanding network operation for a url.
#[derive(Debug)]
pub(super) struct PendingLoad {
    /// Identifies the operation, so that a settling operation never evicts a newer one.
    pub op: u64,
    pub options: LoadOptions,
    pub priority: SharedPriority,
    pub channel: SharedLoad,
}

/// Moves queued attempts into the active table, highest priority first, until `limit`
/// attempts are active.
pub(super) fn admit_queued(state: &mut LoaderState, limit: usize) {
    while state.active.len() < limit {
        let next = state
            .queue
            .iter()
            .enumerate()
            .max_by_key(|(_, queued)| (queued.request.priority(), Reverse(queued.id)))
            .map(|(index, _)| index);
        let Some(next) = next else {
            break;
        };

        let QueuedRequest {
            id,
            mut request,
            ready,
        } = state.queue.swap_remove(next);
        request.started = Instant::now();
        state.active.insert(id, request);
        if ready.send(()).is_err() {
            // the waiting attempt is gone
            state.active.remove(&id);
        }
    }
}

impl LoaderInner {
    /// Joins the pending operation for `key`, or spawns a new one.
    pub(super) fn join_or_spawn(self: &Arc<Self>, key: &str, options: &LoadOptions) -> SharedLoad {
        let merging = self.config.enable_request_merging;
        let mut state = self.state.lock();

        if merging {
            if let Some(pending) = state.pending.get(key) {
                let same_options = pending.options == *options;
                let channel = pending.channel.clone();
                pending.priority.fetch_max(options.priority, Ordering::Relaxed);
                state.stats.merged += 1;
                drop(state);

                tracing::debug!(same_options, "joined pending request");
                metric!(counter("loader.merged") += 1, "same_options" => if same_options { "true" } else { "false" });
                self.emit(LoaderEvent::RequestMerged {
                    url: key.to_owned(),
                    same_options,
                });
                return channel;
            }
        }

        let op = state.next_id();
        let priority = Arc::new(AtomicU32::new(options.priority));
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        if merging {
            state.pending.insert(
                key.to_owned(),
                PendingLoad {
                    op,
                    options: options.clone(),
                    priority: priority.clone(),
                    channel: channel.clone(),
                },
            );
        }
        drop(state);

        self.spawn_operation(op, sender, key, options, priority, merging);
        channel
    }

    /// Spawns the network operation for `key` on the loader's runtime.
    ///
    /// The operation runs to completion even if every caller goes away, so that the
    /// result still makes it into the cache.
    fn spawn_operation(
        self: &Arc<Self>,
        op: u64,
        sender: oneshot::Sender<Result<RawResource, LoadError>>,
        key: &str,
        options: &LoadOptions,
        priority: SharedPriority,
        merging: bool,
    ) {
        let remove_pending_token = merging.then(|| {
            let inner = Arc::downgrade(self);
            let key = key.to_owned();
            CallOnDrop::new(move || {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut state = inner.state.lock();
                if state.pending.get(&key).is_some_and(|pending| pending.op == op) {
                    state.pending.remove(&key);
                }
            })
        });

        let inner = self.clone();
        let key = key.to_owned();
        let options = options.clone();
        let operation = async move {
            let result = inner.execute(&key, &options, &priority).await;
            // Evict from the table first. This ensures that callers either get a channel
            // that will receive data, or they spawn a new operation.
            drop(remove_pending_token);
            sender.send(result).ok();
        };
        self.runtime.spawn(operation);
    }

    /// Dispatches attempts until one succeeds, a non-retryable error occurs or the
    /// retries are exhausted.
    async fn execute(
        &self,
        key: &str,
        options: &LoadOptions,
        priority: &SharedPriority,
    ) -> Result<RawResource, LoadError> {
        let max_retries = options.retry_count.unwrap_or(self.config.retry.count);
        let timeout = options.timeout.unwrap_or(self.config.timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.dispatch(key, priority, attempt, timeout).await {
                Ok(raw) => {
                    if let Some(cache) = self.caching_enabled() {
                        cache.store(key, raw.clone()).await;
                    }
                    self.scorer.record_outcome(key, true);
                    return Ok(raw);
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt > max_retries || self.is_destroyed() {
                if error != LoadError::Cancelled {
                    self.scorer.record_outcome(key, false);
                }
                return Err(error);
            }

            let delay = self.config.retry.delay_for(attempt, &mut rand::rng());
            self.state.lock().stats.retried += 1;
            tracing::debug!(url = key, attempt, %error, delay = %humantime::format_duration(delay), "retrying");
            metric!(counter("loader.retry") += 1, "reason" => error.metrics_tag());
            self.emit(LoaderEvent::RetryScheduled {
                url: key.to_owned(),
                attempt,
                delay,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(LoadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Waits for a slot in the active table, queueing behind other attempts when the
    /// current batch size is exhausted.
    ///
    /// Returns `false` if the attempt was cancelled while queued.
    async fn admit(&self, id: RequestId, request: ActiveRequest) -> bool {
        let cancel = request.cancel.clone();
        let limit = self.current_batch_size();
        let admitted = {
            let mut state = self.state.lock();
            if state.queue.is_empty() && state.active.len() < limit {
                state.active.insert(id, request);
                None
            } else {
                let (ready, admitted) = oneshot::channel();
                state.queue.push(QueuedRequest { id, request, ready });
                Some(admitted)
            }
        };
        let Some(admitted) = admitted else {
            return true;
        };

        tracing::trace!(%id, limit, "queued");
        metric!(counter("loader.queued") += 1);
        tokio::select! {
            biased;

            _ = cancel.cancelled() => false,
            // the sender is dropped when `destroy` clears the queue
            admitted = admitted => admitted.is_ok(),
        }
    }

    /// Removes an attempt from the queue and the active table and admits the next ones.
    fn release(&self, id: RequestId) {
        let limit = self.current_batch_size();
        let mut state = self.state.lock();
        state.queue.retain(|queued| queued.id != id);
        state.active.remove(&id);
        admit_queued(&mut state, limit);
    }

    /// Performs a single attempt with a fresh cancellation token and active-table entry.
    async fn dispatch(
        &self,
        key: &str,
        priority: &SharedPriority,
        attempt: u32,
        timeout: Duration,
    ) -> Result<RawResource, LoadError> {
        let cancel = self.shutdown.child_token();
        let id = RequestId(self.state.lock().next_id());
        let request = ActiveRequest {
            url: key.to_owned(),
            priority: priority.clone(),
            started: Instant::now(),
            cancel: cancel.clone(),
        };
        if !self.admit(id, request).await {
            self.release(id);
            return Err(LoadError::Cancelled);
        }

        tracing::trace!(%id, url = key, attempt, "dispatching");
        self.emit(LoaderEvent::LoadStarted {
            id,
            url: key.to_owned(),
            attempt,
        });

        let request = FetchRequest {
            url: key.to_owned(),
            bearer_token: self.bearer_token(),
        };
        let started = Instant::now();
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            result = tokio::time::timeout(timeout, self.fetcher.fetch(request)) => match result {
                Ok(result) => result,
                Err(_elapsed) => {
                    cancel.cancel();
                    Err(LoadError::Timeout(timeout))
                }
            },
        };
        metric!(timer("loader.fetch.duration") = started.elapsed(), "status" => if result.is_ok() { "ok" } else { "error" });

        // already gone if it was cancelled under memory pressure or by `destroy`
        self.release(id);
        result
    }
}
