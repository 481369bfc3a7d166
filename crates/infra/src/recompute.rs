use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use apc_domain::jobs::JobDefaults;
use apc_domain::ports::recompute::RecomputeScheduler;
use apc_domain::recompute::{RecomputeJob, RecomputeRunner};
use metrics::counter;
use tokio::sync::{Notify, mpsc};

use crate::jobs::RedisJobQueue;

const RECOMPUTE_JOBS_TOTAL: &str = "apc_recompute_jobs_total";
const RECOMPUTE_COALESCED_TOTAL: &str = "apc_recompute_jobs_coalesced_total";

struct QueueState {
    sender: mpsc::UnboundedSender<RecomputeJob>,
    pending: Mutex<HashSet<RecomputeJob>>,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Runs recompute jobs on a background task of the current runtime. A job that is
/// already waiting for the same gathering and kind absorbs new requests.
#[derive(Clone)]
pub struct InProcessRecomputeQueue {
    state: Arc<QueueState>,
}

impl InProcessRecomputeQueue {
    pub fn start(runner: RecomputeRunner) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RecomputeJob>();
        let state = Arc::new(QueueState {
            sender,
            pending: Mutex::new(HashSet::new()),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let worker_state = state.clone();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                // Later requests for this job must trigger another run.
                worker_state
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&job);
                let result = match runner.run(&job).await {
                    Ok(()) => "ok",
                    Err(err) => {
                        tracing::warn!(
                            gathering_id = %job.gathering_id,
                            kind = job.kind.as_str(),
                            error = %err,
                            "recompute job failed"
                        );
                        "error"
                    }
                };
                counter!(RECOMPUTE_JOBS_TOTAL, "kind" => job.kind.as_str(), "result" => result)
                    .increment(1);
                worker_state.finish_one();
            }
        });

        Self { state }
    }

    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::Acquire)
    }

    /// Resolves once every scheduled job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl RecomputeScheduler for InProcessRecomputeQueue {
    fn schedule(&self, job: RecomputeJob) {
        let mut pending = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !pending.insert(job.clone()) {
            counter!(RECOMPUTE_COALESCED_TOTAL, "kind" => job.kind.as_str()).increment(1);
            tracing::debug!(job = %job, "recompute already pending");
            return;
        }
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.state.sender.send(job) {
            pending.remove(&err.0);
            drop(pending);
            self.state.finish_one();
            tracing::warn!(job = %err.0, "recompute queue closed; job dropped");
        }
    }
}

/// Hands recompute jobs to the worker through Redis. Enqueueing happens on a
/// spawned task; a pending marker per job kind and gathering collapses bursts.
#[derive(Clone)]
pub struct QueuedRecomputeScheduler {
    queue: RedisJobQueue,
    defaults: JobDefaults,
    dedupe_ttl_ms: u64,
}

impl QueuedRecomputeScheduler {
    pub fn new(queue: RedisJobQueue, defaults: JobDefaults, dedupe_ttl_ms: u64) -> Self {
        Self {
            queue,
            defaults,
            dedupe_ttl_ms,
        }
    }
}

impl RecomputeScheduler for QueuedRecomputeScheduler {
    fn schedule(&self, job: RecomputeJob) {
        let envelope = match job.to_envelope(self.defaults.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(job = %job, error = %err, "recompute job not encodable");
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(job = %job, "no runtime available; recompute job dropped");
            return;
        };
        let queue = self.queue.clone();
        let dedupe_ttl_ms = self.dedupe_ttl_ms;
        handle.spawn(async move {
            match queue
                .enqueue_if_absent(&envelope, &job.dedupe_key(), dedupe_ttl_ms)
                .await
            {
                Ok(true) => tracing::debug!(job = %job, job_id = %envelope.job_id, "recompute job enqueued"),
                Ok(false) => {
                    counter!(RECOMPUTE_COALESCED_TOTAL, "kind" => job.kind.as_str()).increment(1);
                    tracing::debug!(job = %job, "recompute already pending");
                }
                Err(err) => tracing::warn!(job = %job, error = %err, "recompute enqueue failed"),
            }
        });
    }
}
