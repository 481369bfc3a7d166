mod observability;

use std::time::{Duration, Instant};

use apc_domain::jobs::{backoff_ms, now_ms};
use apc_domain::ports::jobs::{JobEnvelope, JobQueue};
use apc_domain::recompute::{RecomputeJob, RecomputeRunner};
use apc_infra::config::AppConfig;
use apc_infra::jobs::RedisJobQueue;
use apc_infra::logging::init_tracing;
use apc_infra::stores::Stores;
use tracing::{info, warn};

const REQUEUE_ON_START_LIMIT: usize = 1_000;

#[derive(Clone, Debug)]
struct WorkerSettings {
    poll_interval: Duration,
    promote_batch: usize,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl WorkerSettings {
    fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms.max(1)),
            promote_batch: config.worker_promote_batch.max(1),
            backoff_base_ms: config.worker_backoff_base_ms,
            backoff_max_ms: config.worker_backoff_max_ms,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config, "worker")?;
    if let Err(err) = observability::init_metrics() {
        warn!(error = %err, "metrics recorder not installed");
    }

    let stores = Stores::from_config(&config).await?;
    let runner = stores.recompute_runner();
    let queue =
        RedisJobQueue::connect_with_prefix(&config.redis_url, config.worker_queue_prefix.clone())
            .await?;
    let settings = WorkerSettings::from_config(&config);

    let recovered = queue.requeue_processing(REQUEUE_ON_START_LIMIT).await?;
    if recovered > 0 {
        info!(recovered, "requeued jobs left in processing");
    }

    info!(prefix = %config.worker_queue_prefix, "worker started");
    tokio::select! {
        _ = run_loop(&queue, &runner, &settings) => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    info!("worker shutdown");
    Ok(())
}

async fn run_loop(queue: &RedisJobQueue, runner: &RecomputeRunner, settings: &WorkerSettings) {
    loop {
        if let Err(err) = queue.promote_due(now_ms(), settings.promote_batch).await {
            warn!(error = %err, "promoting delayed jobs failed");
        }
        refresh_queue_gauges(queue).await;

        match queue.dequeue(settings.poll_interval).await {
            Ok(Some(job)) => process_job(queue, runner, settings, job).await,
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "dequeue failed");
                tokio::time::sleep(settings.poll_interval).await;
            }
        }
    }
}

async fn process_job(
    queue: &RedisJobQueue,
    runner: &RecomputeRunner,
    settings: &WorkerSettings,
    envelope: JobEnvelope,
) {
    let started = Instant::now();
    let job = match RecomputeJob::from_envelope(&envelope) {
        Ok(job) => job,
        Err(err) => {
            warn!(job_id = %envelope.job_id, error = %err, "dropping undecodable job");
            if let Err(err) = queue.ack(&envelope.job_id).await {
                warn!(job_id = %envelope.job_id, error = %err, "ack failed");
            }
            observability::register_job_processed("unknown", "dropped", elapsed_ms(started));
            return;
        }
    };
    // Requests arriving while this job runs must enqueue a fresh one.
    if let Err(err) = queue.clear_dedupe(&job.dedupe_key()).await {
        warn!(job = %job, error = %err, "clearing dedupe marker failed");
    }

    let kind = job.kind.as_str();
    match runner.run(&job).await {
        Ok(()) => {
            if let Err(err) = queue.ack(&envelope.job_id).await {
                warn!(job_id = %envelope.job_id, error = %err, "ack failed");
            }
            observability::register_job_processed(kind, "ok", elapsed_ms(started));
        }
        Err(err) if envelope.is_exhausted() => {
            warn!(
                job = %job,
                attempt = envelope.attempt,
                error = %err,
                "recompute job exhausted its attempts"
            );
            if let Err(err) = queue.ack(&envelope.job_id).await {
                warn!(job_id = %envelope.job_id, error = %err, "ack failed");
            }
            observability::register_job_processed(kind, "exhausted", elapsed_ms(started));
        }
        Err(err) => {
            let (retry, delay) = retry_envelope(&envelope, settings, now_ms());
            warn!(
                job = %job,
                attempt = envelope.attempt,
                retry_in_ms = delay,
                error = %err,
                "recompute job failed; retrying"
            );
            if let Err(err) = queue.restore_processing_with_retry_delay(&retry).await {
                warn!(job_id = %envelope.job_id, error = %err, "retry scheduling failed");
            }
            observability::register_job_processed(kind, "retry", elapsed_ms(started));
        }
    }
}

async fn refresh_queue_gauges(queue: &RedisJobQueue) {
    match queue.metrics_snapshot().await {
        Ok(snapshot) => {
            observability::set_queue_depth_gauge(
                snapshot.ready,
                snapshot.delayed,
                snapshot.processing,
            );
            if let Some(oldest) = snapshot.oldest_delayed_ms {
                observability::set_queue_lag_ms(now_ms() - oldest);
            }
        }
        Err(err) => tracing::debug!(error = %err, "queue snapshot unavailable"),
    }
}

/// Next attempt of a failed job, delayed by the capped exponential backoff.
fn retry_envelope(
    envelope: &JobEnvelope,
    settings: &WorkerSettings,
    now_ms: i64,
) -> (JobEnvelope, u64) {
    let delay = backoff_ms(
        settings.backoff_base_ms,
        envelope.attempt,
        settings.backoff_max_ms,
    );
    let retry = JobEnvelope {
        attempt: envelope.next_attempt(),
        ..envelope.clone()
    }
    .with_run_at(now_ms + delay as i64);
    (retry, delay)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use apc_domain::jobs::JobDefaults;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(100),
            promote_batch: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
        }
    }

    fn finalize_envelope() -> JobEnvelope {
        RecomputeJob::finalize("g-1")
            .to_envelope(JobDefaults { max_attempts: 3 })
            .unwrap()
    }

    #[test]
    fn retry_bumps_attempt_and_delays_run() {
        let envelope = finalize_envelope();
        let (retry, delay) = retry_envelope(&envelope, &settings(), 10_000);
        assert_eq!(retry.attempt, envelope.attempt + 1);
        assert_eq!(retry.job_id, envelope.job_id);
        assert_eq!(retry.run_at_ms, 10_000 + delay as i64);
        assert!(delay > 0);
        assert_eq!(RecomputeJob::from_envelope(&retry).unwrap(), RecomputeJob::finalize("g-1"));
    }

    #[test]
    fn retry_delay_is_capped() {
        let mut envelope = finalize_envelope();
        envelope.attempt = 30;
        let (_, delay) = retry_envelope(&envelope, &settings(), 0);
        assert_eq!(delay, 5_000);
    }
}
