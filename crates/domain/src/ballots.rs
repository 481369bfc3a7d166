use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::audit::{AuditEntry, AuditTrail};
use crate::error::DomainError;
use crate::gathering::{GatheringGuard, GatheringStatus};
use crate::identity::ActorIdentity;
use crate::jobs::now_ms;
use crate::ports::ballots::BallotRepository;
use crate::ports::participants::ParticipantRepository;
use crate::ports::recompute::RecomputeScheduler;
use crate::recompute::RecomputeJob;
use crate::util::content_hash;

const MAX_REASON_LENGTH: usize = 500;

/// One vote inside a ballot. An explicit option id wins over the literal value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BallotVote {
    pub matter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_value: Option<String>,
}

impl BallotVote {
    pub fn choice_key(&self) -> Option<&str> {
        self.option_id
            .as_deref()
            .filter(|value| !value.is_empty())
            .or_else(|| self.vote_value.as_deref().filter(|value| !value.is_empty()))
    }
}

/// Matter id to vote. Ordered so serialization is deterministic.
pub type VoteMap = BTreeMap<String, BallotVote>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ballot {
    pub ballot_id: String,
    pub gathering_id: String,
    pub participant_id: String,
    /// Serialized vote map exactly as hashed.
    pub content: String,
    pub content_hash: String,
    pub submitted_at_ms: i64,
    pub origin_ip: Option<String>,
    pub user_agent: Option<String>,
    pub is_valid: bool,
    pub invalidation_reason: Option<String>,
    pub invalidated_at_ms: Option<i64>,
}

impl Ballot {
    pub fn votes(&self) -> DomainResult<VoteMap> {
        serde_json::from_str(&self.content)
            .map_err(|err| DomainError::Validation(format!("invalid ballot content: {err}")))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BallotVerification {
    pub ballot_id: String,
    pub valid: bool,
    pub submitted_at_ms: i64,
    pub is_valid: bool,
}

/// Ballot listing without vote content.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BallotMetadata {
    pub ballot_id: String,
    pub participant_id: String,
    pub participant_name: Option<String>,
    pub unit_ids: Vec<i64>,
    pub units_part: f64,
    pub units_area: f64,
    pub content_hash: String,
    pub submitted_at_ms: i64,
    pub is_valid: bool,
    pub invalidation_reason: Option<String>,
}

pub fn serialize_votes(votes: &VoteMap) -> DomainResult<String> {
    serde_json::to_string(votes)
        .map_err(|err| DomainError::Validation(format!("failed to serialize ballot: {err}")))
}

#[derive(Clone)]
pub struct BallotLedger {
    guard: GatheringGuard,
    participants: Arc<dyn ParticipantRepository>,
    ballots: Arc<dyn BallotRepository>,
    audit: AuditTrail,
    scheduler: Arc<dyn RecomputeScheduler>,
}

impl BallotLedger {
    pub fn new(
        guard: GatheringGuard,
        participants: Arc<dyn ParticipantRepository>,
        ballots: Arc<dyn BallotRepository>,
        audit: AuditTrail,
        scheduler: Arc<dyn RecomputeScheduler>,
    ) -> Self {
        Self {
            guard,
            participants,
            ballots,
            audit,
            scheduler,
        }
    }

    pub async fn submit(
        &self,
        actor: &ActorIdentity,
        association_id: i64,
        gathering_id: &str,
        participant_id: &str,
        votes: VoteMap,
    ) -> DomainResult<Ballot> {
        validate_votes(&votes)?;
        self.guard
            .require_state(association_id, gathering_id, GatheringStatus::Active)
            .await?;
        let participant = self
            .participants
            .get(gathering_id, participant_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if self
            .ballots
            .find_valid_by_participant(gathering_id, participant_id)
            .await?
            .is_some()
        {
            return Err(already_voted());
        }

        let content = serialize_votes(&votes)?;
        let ballot = Ballot {
            ballot_id: crate::util::uuid_v7_without_dashes(),
            gathering_id: gathering_id.to_string(),
            participant_id: participant_id.to_string(),
            content_hash: content_hash(content.as_bytes()),
            content,
            submitted_at_ms: now_ms(),
            origin_ip: actor.origin_ip.clone(),
            user_agent: actor.user_agent.clone(),
            is_valid: true,
            invalidation_reason: None,
            invalidated_at_ms: None,
        };
        // The storage uniqueness constraint closes the window after the check above.
        let ballot = self.ballots.create(&ballot).await.map_err(|err| match err {
            DomainError::Conflict => already_voted(),
            other => other,
        })?;

        self.audit
            .record(
                AuditEntry::new("ballot", &ballot.ballot_id, "submitted", actor)
                    .in_gathering(gathering_id)
                    .with_details(json!({
                        "hash": ballot.content_hash,
                        "voter_type": participant.participant_type.as_str(),
                    })),
            )
            .await;
        self.schedule_recompute(gathering_id);
        Ok(ballot)
    }

    /// True only if the claimed hash matches both the stored hash and a fresh hash
    /// of the stored content.
    pub async fn verify(
        &self,
        gathering_id: &str,
        ballot_id: &str,
        claimed_hash: &str,
    ) -> DomainResult<BallotVerification> {
        let ballot = self
            .ballots
            .get(ballot_id)
            .await?
            .filter(|ballot| ballot.gathering_id == gathering_id)
            .ok_or(DomainError::NotFound)?;
        let recomputed = content_hash(ballot.content.as_bytes());
        let claimed = claimed_hash.trim().to_ascii_lowercase();
        Ok(BallotVerification {
            valid: recomputed == claimed && ballot.content_hash == claimed,
            ballot_id: ballot.ballot_id,
            submitted_at_ms: ballot.submitted_at_ms,
            is_valid: ballot.is_valid,
        })
    }

    pub async fn list_metadata(&self, gathering_id: &str) -> DomainResult<Vec<BallotMetadata>> {
        let participants: HashMap<String, _> = self
            .participants
            .list_by_gathering(gathering_id)
            .await?
            .into_iter()
            .map(|participant| (participant.participant_id.clone(), participant))
            .collect();
        let ballots = self.ballots.list_by_gathering(gathering_id).await?;
        Ok(ballots
            .into_iter()
            .map(|ballot| {
                let participant = participants.get(&ballot.participant_id);
                BallotMetadata {
                    participant_name: participant.map(|p| p.participant_name.clone()),
                    unit_ids: participant.map(|p| p.unit_ids.clone()).unwrap_or_default(),
                    units_part: participant.map(|p| p.units_part).unwrap_or_default(),
                    units_area: participant.map(|p| p.units_area).unwrap_or_default(),
                    ballot_id: ballot.ballot_id,
                    participant_id: ballot.participant_id,
                    content_hash: ballot.content_hash,
                    submitted_at_ms: ballot.submitted_at_ms,
                    is_valid: ballot.is_valid,
                    invalidation_reason: ballot.invalidation_reason,
                }
            })
            .collect())
    }

    pub async fn list(&self, gathering_id: &str) -> DomainResult<Vec<Ballot>> {
        self.ballots.list_by_gathering(gathering_id).await
    }

    /// Marks a ballot invalid. The participant may then submit again.
    pub async fn invalidate(
        &self,
        actor: &ActorIdentity,
        gathering_id: &str,
        ballot_id: &str,
        reason: &str,
    ) -> DomainResult<Ballot> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DomainError::Validation("reason is required".into()));
        }
        if reason.chars().count() > MAX_REASON_LENGTH {
            return Err(DomainError::Validation(format!(
                "reason must be at most {MAX_REASON_LENGTH} characters"
            )));
        }
        let ballot = self
            .ballots
            .get(ballot_id)
            .await?
            .filter(|ballot| ballot.gathering_id == gathering_id)
            .ok_or(DomainError::NotFound)?;
        if !ballot.is_valid {
            return Err(DomainError::StateConflict("ballot already invalidated".into()));
        }
        let ballot = self.ballots.invalidate(ballot_id, reason, now_ms()).await?;
        self.audit
            .record(
                AuditEntry::new("ballot", ballot_id, "invalidated", actor)
                    .in_gathering(gathering_id)
                    .with_details(json!({ "reason": reason })),
            )
            .await;
        self.schedule_recompute(gathering_id);
        Ok(ballot)
    }

    fn schedule_recompute(&self, gathering_id: &str) {
        self.scheduler
            .schedule(RecomputeJob::participation(gathering_id));
        self.scheduler.schedule(RecomputeJob::tallies(gathering_id));
    }
}

fn already_voted() -> DomainError {
    DomainError::StateConflict("participant already has a valid ballot".into())
}

fn validate_votes(votes: &VoteMap) -> DomainResult<()> {
    if votes.is_empty() {
        return Err(DomainError::Validation("ballot has no votes".into()));
    }
    for (matter_id, vote) in votes {
        if matter_id.trim().is_empty() {
            return Err(DomainError::Validation("vote is missing a matter id".into()));
        }
        if vote.matter_id != *matter_id {
            return Err(DomainError::Validation(format!(
                "vote for matter '{matter_id}' names matter '{}'",
                vote.matter_id
            )));
        }
        if vote.choice_key().is_none() {
            return Err(DomainError::Validation(format!(
                "vote for matter '{matter_id}' has no value"
            )));
        }
    }
    Ok(())
}
