use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::jobs::{JobDefaults, new_job};
use crate::ports::gatherings::GatheringRepository;
use crate::ports::jobs::{JobEnvelope, JobType};
use crate::results::ResultsService;
use crate::stats::StatsService;
use crate::tally::TallyService;
use crate::util::uuid_v7_without_dashes;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeKind {
    ParticipationStats,
    Tallies,
    Finalize,
}

impl RecomputeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParticipationStats => "participation_stats",
            Self::Tallies => "tallies",
            Self::Finalize => "finalize",
        }
    }
}

/// One unit of derived-data maintenance for a gathering. Jobs are idempotent:
/// running the same job twice leaves the same state behind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecomputeJob {
    pub gathering_id: String,
    pub kind: RecomputeKind,
}

impl RecomputeJob {
    pub fn participation(gathering_id: &str) -> Self {
        Self::new(gathering_id, RecomputeKind::ParticipationStats)
    }

    pub fn tallies(gathering_id: &str) -> Self {
        Self::new(gathering_id, RecomputeKind::Tallies)
    }

    pub fn finalize(gathering_id: &str) -> Self {
        Self::new(gathering_id, RecomputeKind::Finalize)
    }

    fn new(gathering_id: &str, kind: RecomputeKind) -> Self {
        Self {
            gathering_id: gathering_id.to_string(),
            kind,
        }
    }

    pub fn dedupe_key(&self) -> String {
        format!("recompute:{}:{}", self.kind.as_str(), self.gathering_id)
    }

    pub fn to_envelope(&self, defaults: JobDefaults) -> DomainResult<JobEnvelope> {
        let payload = serde_json::to_value(self)
            .map_err(|err| DomainError::Validation(format!("invalid recompute job: {err}")))?;
        let job_id = format!("{}:{}", self.dedupe_key(), uuid_v7_without_dashes());
        Ok(new_job(job_id, JobType::Recompute, payload, defaults))
    }

    pub fn from_envelope(envelope: &JobEnvelope) -> DomainResult<Self> {
        if envelope.job_type != JobType::Recompute {
            return Err(DomainError::Validation(format!(
                "unexpected job type: {}",
                envelope.job_type.as_str()
            )));
        }
        serde_json::from_value(envelope.payload.clone())
            .map_err(|err| DomainError::Validation(format!("invalid recompute payload: {err}")))
    }
}

impl fmt::Display for RecomputeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dedupe_key())
    }
}

/// Executes recompute jobs against the stores. Shared by the in-process queue and
/// the standalone worker.
#[derive(Clone)]
pub struct RecomputeRunner {
    gatherings: Arc<dyn GatheringRepository>,
    stats: StatsService,
    tallies: TallyService,
    results: ResultsService,
}

impl RecomputeRunner {
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        stats: StatsService,
        tallies: TallyService,
        results: ResultsService,
    ) -> Self {
        Self {
            gatherings,
            stats,
            tallies,
            results,
        }
    }

    pub async fn run(&self, job: &RecomputeJob) -> DomainResult<()> {
        let gathering_id = job.gathering_id.as_str();
        match job.kind {
            RecomputeKind::ParticipationStats => {
                self.stats.refresh_participation(gathering_id).await?;
            }
            RecomputeKind::Tallies => {
                self.tallies.refresh(gathering_id).await?;
            }
            RecomputeKind::Finalize => {
                self.stats.refresh_participation(gathering_id).await?;
                self.tallies.refresh(gathering_id).await?;
            }
        }
        self.results.invalidate(gathering_id).await?;

        if job.kind == RecomputeKind::Finalize {
            self.finalize(gathering_id).await?;
        }
        tracing::debug!(job = %job, "recompute job finished");
        Ok(())
    }

    async fn finalize(&self, gathering_id: &str) -> DomainResult<()> {
        let Some(gathering) = self.gatherings.find_by_id(gathering_id).await? else {
            tracing::warn!(gathering_id, "finalize skipped; gathering not found");
            return Ok(());
        };
        let results = self.results.compute_and_store(&gathering).await?;
        let passed = results.matters.iter().filter(|matter| matter.is_passed).count();
        tracing::info!(
            gathering_id,
            quorum_met = results.quorum.met,
            achieved_percentage = results.quorum.achieved_percentage,
            matters = results.matters.len(),
            passed,
            "final results computed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedupe_key_names_kind_and_gathering() {
        assert_eq!(
            RecomputeJob::participation("g-1").dedupe_key(),
            "recompute:participation_stats:g-1"
        );
        assert_eq!(RecomputeJob::finalize("g-2").to_string(), "recompute:finalize:g-2");
    }

    #[test]
    fn envelope_carries_the_job() {
        let job = RecomputeJob::tallies("g-1");
        let envelope = job
            .to_envelope(JobDefaults::default())
            .expect("envelope");
        assert!(envelope.job_id.starts_with("recompute:tallies:g-1:"));
        assert_eq!(envelope.payload, json!({"gathering_id": "g-1", "kind": "tallies"}));
        assert_eq!(RecomputeJob::from_envelope(&envelope).expect("decode"), job);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let mut envelope = RecomputeJob::tallies("g-1")
            .to_envelope(JobDefaults::default())
            .expect("envelope");
        envelope.payload = json!({"gathering_id": "g-1", "kind": "reindex"});
        let err = RecomputeJob::from_envelope(&envelope).expect_err("must fail");
        assert!(matches!(err, DomainError::Validation(msg) if msg.starts_with("invalid recompute payload")));
    }
}
