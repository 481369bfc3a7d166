use std::time::{SystemTime, UNIX_EPOCH};

use crate::ports::jobs::{JobEnvelope, JobType};

#[derive(Clone, Debug)]
pub struct JobDefaults {
    pub max_attempts: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    base_ms.saturating_mul(pow).min(max_ms)
}

pub fn new_job(
    job_id: String,
    job_type: JobType,
    payload: serde_json::Value,
    defaults: JobDefaults,
) -> JobEnvelope {
    let now = now_ms();
    JobEnvelope {
        job_id,
        job_type,
        payload,
        attempt: 1,
        max_attempts: defaults.max_attempts,
        run_at_ms: now,
        created_at_ms: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_is_zero_before_first_attempt() {
        assert_eq!(backoff_ms(500, 0, 30_000), 0);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff_ms(500, 1, 30_000), 500);
        assert_eq!(backoff_ms(500, 2, 30_000), 1_000);
        assert_eq!(backoff_ms(500, 4, 30_000), 4_000);
        assert_eq!(backoff_ms(500, 12, 30_000), 30_000);
    }

    #[test]
    fn new_job_starts_at_first_attempt_and_runs_now() {
        let job = new_job(
            "recompute:tallies:g-1".to_string(),
            JobType::Recompute,
            json!({"gathering_id": "g-1", "kind": "tallies"}),
            JobDefaults { max_attempts: 3 },
        );
        assert_eq!(job.attempt, 1);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.created_at_ms, job.run_at_ms);
        assert!(!job.is_exhausted());
        assert_eq!(job.payload["kind"], "tallies");
    }
}
