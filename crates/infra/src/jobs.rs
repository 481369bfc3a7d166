use std::time::Duration;

use apc_domain::jobs::now_ms;
use apc_domain::ports::BoxFuture;
use apc_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError};
use redis::AsyncCommands;
use redis::Value;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "apc:jobs";

fn operation(err: redis::RedisError) -> JobQueueError {
    JobQueueError::Operation(err.to_string())
}

/// Redis-backed queue: a ready list, a delayed sorted set scored by run time, a
/// processing list for in-flight jobs and a hash of payloads keyed by job id.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    ready_key: String,
    delayed_key: String,
    processing_key: String,
    payload_key: String,
    dedupe_prefix: String,
}

#[derive(Debug, Clone)]
pub struct JobQueueMetricsSnapshot {
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    pub oldest_delayed_ms: Option<i64>,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, JobQueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let prefix = prefix.into();
        Ok(Self {
            manager,
            ready_key: format!("{prefix}:ready"),
            delayed_key: format!("{prefix}:delayed"),
            processing_key: format!("{prefix}:processing"),
            payload_key: format!("{prefix}:payloads"),
            dedupe_prefix: format!("{prefix}:pending"),
        })
    }

    fn serialize(job: &JobEnvelope) -> Result<String, JobQueueError> {
        serde_json::to_string(job).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<JobEnvelope, JobQueueError> {
        serde_json::from_str(payload).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    fn marker_key(&self, dedupe_key: &str) -> String {
        format!("{}:{dedupe_key}", self.dedupe_prefix)
    }

    /// Enqueues `job` unless a job with the same dedupe key is still pending.
    /// The marker expires after `dedupe_ttl_ms` even if nobody clears it.
    pub async fn enqueue_if_absent(
        &self,
        job: &JobEnvelope,
        dedupe_key: &str,
        dedupe_ttl_ms: u64,
    ) -> Result<bool, JobQueueError> {
        let payload = Self::serialize(job)?;
        let marker_key = self.marker_key(dedupe_key);
        let mut conn = self.manager.clone();
        let script = redis::Script::new(
            r#"
                local payload_key = KEYS[1]
                local ready_key = KEYS[2]
                local delayed_key = KEYS[3]
                local marker_key = KEYS[4]
                local job_id = ARGV[1]
                local payload = ARGV[2]
                local run_at_ms = tonumber(ARGV[3])
                local now_ms = tonumber(ARGV[4])
                local ttl_ms = tonumber(ARGV[5])

                if redis.call('SET', marker_key, job_id, 'PX', ttl_ms, 'NX') == false then
                    return 0
                end

                redis.call('HSET', payload_key, job_id, payload)
                if run_at_ms <= now_ms then
                    redis.call('RPUSH', ready_key, job_id)
                else
                    redis.call('ZADD', delayed_key, run_at_ms, job_id)
                end
                return 1
            "#,
        );
        let inserted: i32 = script
            .key(&self.payload_key)
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .key(&marker_key)
            .arg(&job.job_id)
            .arg(payload)
            .arg(job.run_at_ms)
            .arg(now_ms())
            .arg(dedupe_ttl_ms.max(1) as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(operation)?;

        Ok(inserted == 1)
    }

    /// Drops the pending marker so the next change schedules a fresh job.
    /// Called once a job has been picked up, before it runs.
    pub async fn clear_dedupe(&self, dedupe_key: &str) -> Result<(), JobQueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .del(self.marker_key(dedupe_key))
            .await
            .map_err(operation)?;
        Ok(())
    }

    /// Moves an in-flight job back to ready or delayed with its updated envelope.
    pub async fn restore_processing_with_retry_delay(
        &self,
        job: &JobEnvelope,
    ) -> Result<(), JobQueueError> {
        let payload = Self::serialize(job)?;
        let mut conn = self.manager.clone();

        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline
            .cmd("HSET")
            .arg(&self.payload_key)
            .arg(&job.job_id)
            .arg(payload);
        pipeline
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&job.job_id);
        if job.run_at_ms <= now_ms() {
            pipeline.cmd("LPUSH").arg(&self.ready_key).arg(&job.job_id);
        } else {
            pipeline
                .cmd("ZADD")
                .arg(&self.delayed_key)
                .arg(job.run_at_ms)
                .arg(&job.job_id);
        }

        let _: Vec<Value> = pipeline.query_async(&mut conn).await.map_err(operation)?;
        Ok(())
    }

    pub async fn metrics_snapshot(&self) -> Result<JobQueueMetricsSnapshot, JobQueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = conn.llen(&self.ready_key).await.map_err(operation)?;
        let delayed: u64 = conn.zcard(&self.delayed_key).await.map_err(operation)?;
        let processing: u64 = conn.llen(&self.processing_key).await.map_err(operation)?;

        let oldest_delayed_ms = if delayed == 0 {
            None
        } else {
            let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
                .arg(&self.delayed_key)
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
                .map_err(operation)?;
            head.into_iter().next().map(|(_, score)| score as i64)
        };

        Ok(JobQueueMetricsSnapshot {
            ready,
            delayed,
            processing,
            oldest_delayed_ms,
        })
    }
}

impl JobQueue for RedisJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let payload = match Self::serialize(job) {
            Ok(payload) => payload,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let run_at_ms = job.run_at_ms;
        let job_id = job.job_id.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn
                .hset(&self.payload_key, &job_id, payload)
                .await
                .map_err(operation)?;
            if run_at_ms <= now_ms() {
                let _: i64 = conn
                    .rpush(&self.ready_key, &job_id)
                    .await
                    .map_err(operation)?;
            } else {
                let _: i64 = conn
                    .zadd(&self.delayed_key, &job_id, run_at_ms)
                    .await
                    .map_err(operation)?;
            }
            Ok(())
        })
    }

    fn dequeue(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        let timeout_secs = timeout.as_secs().max(1) as usize;
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let popped: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&self.ready_key)
                .arg(&self.processing_key)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(operation)?;
            let Some(job_id) = popped else {
                return Ok(None);
            };
            let payload: Option<String> = conn
                .hget(&self.payload_key, &job_id)
                .await
                .map_err(operation)?;
            let Some(payload) = payload else {
                let _: i64 = conn
                    .lrem(&self.processing_key, 1, &job_id)
                    .await
                    .map_err(operation)?;
                return Err(JobQueueError::Operation(format!(
                    "missing payload for job_id {job_id}"
                )));
            };
            Ok(Some(Self::deserialize(&payload)?))
        })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn
                .lrem(&self.processing_key, 1, &job_id)
                .await
                .map_err(operation)?;
            let _: i64 = conn
                .hdel(&self.payload_key, &job_id)
                .await
                .map_err(operation)?;
            Ok(())
        })
    }

    fn promote_due(&self, now_ms: i64, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut moved = 0usize;
            while moved < limit {
                let head: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                    .arg(&self.delayed_key)
                    .arg(1)
                    .query_async(&mut conn)
                    .await
                    .map_err(operation)?;
                let Some((job_id, score)) = head.into_iter().next() else {
                    break;
                };
                if score as i64 > now_ms {
                    let _: i64 = conn
                        .zadd(&self.delayed_key, job_id, score)
                        .await
                        .map_err(operation)?;
                    break;
                }
                let _: i64 = conn
                    .lpush(&self.ready_key, job_id)
                    .await
                    .map_err(operation)?;
                moved += 1;
            }
            Ok(moved)
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let job_ids: Vec<String> = conn
                .lrange(&self.processing_key, 0, limit.saturating_sub(1) as isize)
                .await
                .map_err(operation)?;
            if job_ids.is_empty() {
                return Ok(0);
            }
            let _: i64 = conn
                .rpush(&self.ready_key, &job_ids)
                .await
                .map_err(operation)?;
            let _: () = conn
                .ltrim(&self.processing_key, job_ids.len() as isize, -1)
                .await
                .map_err(operation)?;
            Ok(job_ids.len())
        })
    }
}
