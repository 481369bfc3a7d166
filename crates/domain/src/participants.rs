use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::audit::{AuditEntry, AuditTrail};
use crate::error::DomainError;
use crate::gathering::{Gathering, GatheringGuard, GatheringStatus};
use crate::identity::ActorIdentity;
use crate::jobs::now_ms;
use crate::ports::ballots::BallotRepository;
use crate::ports::gatherings::GatheringRepository;
use crate::ports::participants::ParticipantRepository;
use crate::ports::recompute::RecomputeScheduler;
use crate::qualification::QualificationResolver;
use crate::recompute::RecomputeJob;
use crate::slots::{ClaimOutcome, SlotAllocator};
use crate::units::Owner;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    Owner,
    Delegate,
}

impl ParticipantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Delegate => "delegate",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub participant_id: String,
    pub gathering_id: String,
    pub participant_type: ParticipantType,
    /// Owner whose units this participant holds.
    pub effective_owner_id: i64,
    pub delegating_owner_id: Option<i64>,
    pub delegation_document_ref: Option<String>,
    pub participant_name: String,
    pub participant_identification: String,
    pub unit_ids: Vec<i64>,
    pub units_part: f64,
    pub units_area: f64,
    pub checked_in_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ParticipantRegistration {
    pub participant_type: ParticipantType,
    pub owner_id: Option<i64>,
    pub delegating_owner_id: Option<i64>,
    pub delegate_name: Option<String>,
    pub delegation_document_ref: Option<String>,
    pub unit_ids: Vec<i64>,
}

impl ParticipantRegistration {
    /// Owner whose units the registration would hold.
    pub fn effective_owner_id(&self) -> DomainResult<i64> {
        match self.participant_type {
            ParticipantType::Owner => self
                .owner_id
                .filter(|id| *id > 0)
                .ok_or_else(|| DomainError::Validation("owner id is required".into())),
            ParticipantType::Delegate => self
                .delegating_owner_id
                .filter(|id| *id > 0)
                .ok_or_else(|| DomainError::Validation("delegating owner id is required".into())),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ParticipantSummary {
    #[serde(flatten)]
    pub participant: Participant,
    pub has_voted: bool,
}

#[derive(Clone)]
pub struct ParticipantRegistry {
    gatherings: Arc<dyn GatheringRepository>,
    guard: GatheringGuard,
    resolver: QualificationResolver,
    allocator: SlotAllocator,
    participants: Arc<dyn ParticipantRepository>,
    ballots: Arc<dyn BallotRepository>,
    audit: AuditTrail,
    scheduler: Arc<dyn RecomputeScheduler>,
}

impl ParticipantRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        guard: GatheringGuard,
        resolver: QualificationResolver,
        allocator: SlotAllocator,
        participants: Arc<dyn ParticipantRepository>,
        ballots: Arc<dyn BallotRepository>,
        audit: AuditTrail,
        scheduler: Arc<dyn RecomputeScheduler>,
    ) -> Self {
        Self {
            gatherings,
            guard,
            resolver,
            allocator,
            participants,
            ballots,
            audit,
            scheduler,
        }
    }

    pub async fn register(
        &self,
        actor: &ActorIdentity,
        association_id: i64,
        gathering_id: &str,
        input: ParticipantRegistration,
    ) -> DomainResult<Participant> {
        self.guard
            .require_state(association_id, gathering_id, GatheringStatus::Active)
            .await?;
        let requested = requested_units(&input.unit_ids)?;
        let effective_owner_id = input.effective_owner_id()?;

        let gathering = self
            .gatherings
            .get(association_id, gathering_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let inventory = self.resolver.inventory();
        let owner = inventory
            .owner(association_id, effective_owner_id)
            .await?
            .ok_or_else(|| DomainError::Validation("owner not found".into()))?;

        let eligible = self.owner_qualified_units(&gathering, &owner).await?;
        let participant_id = crate::util::uuid_v7_without_dashes();
        let mut unit_ids = Vec::new();
        let mut units_part = 0.0;
        let mut units_area = 0.0;
        for unit_id in requested {
            if !eligible.contains(&unit_id) {
                tracing::debug!(gathering_id, unit_id, "requested unit not eligible for owner");
                continue;
            }
            match self
                .allocator
                .claim(gathering_id, unit_id, &participant_id)
                .await
            {
                Ok(ClaimOutcome::Claimed(slot)) => {
                    units_part += slot.part;
                    units_area += slot.area;
                    unit_ids.push(unit_id);
                }
                Ok(ClaimOutcome::HeldByOther(_)) => {
                    tracing::info!(gathering_id, unit_id, "unit slot already claimed; skipping");
                }
                Ok(ClaimOutcome::Missing) => {
                    tracing::warn!(gathering_id, unit_id, "no unit slot for qualified unit");
                }
                Err(err) => {
                    tracing::warn!(gathering_id, unit_id, error = %err, "unit slot claim failed");
                }
            }
        }

        if unit_ids.is_empty() {
            return Err(DomainError::StateConflict(
                "none of the requested units could be claimed".into(),
            ));
        }

        let participant = Participant {
            participant_id,
            gathering_id: gathering_id.to_string(),
            participant_type: input.participant_type,
            effective_owner_id,
            delegating_owner_id: match input.participant_type {
                ParticipantType::Owner => None,
                ParticipantType::Delegate => Some(effective_owner_id),
            },
            delegation_document_ref: non_blank(input.delegation_document_ref.clone()),
            participant_name: match input.participant_type {
                ParticipantType::Owner => owner.name.clone(),
                ParticipantType::Delegate => {
                    non_blank(input.delegate_name).unwrap_or_else(|| owner.name.clone())
                }
            },
            participant_identification: non_blank(input.delegation_document_ref)
                .unwrap_or_else(|| owner.identification_number.clone()),
            unit_ids,
            units_part,
            units_area,
            checked_in_at_ms: None,
            created_at_ms: now_ms(),
        };
        let participant = match self.participants.create(&participant).await {
            Ok(participant) => participant,
            Err(err) => {
                tracing::error!(
                    gathering_id,
                    participant_id = %participant.participant_id,
                    error = %err,
                    "participant persist failed after claiming slots"
                );
                self.allocator
                    .release_all(gathering_id, &participant.unit_ids, &participant.participant_id)
                    .await;
                return Err(err);
            }
        };

        self.audit
            .record(
                AuditEntry::new("participant", &participant.participant_id, "registered", actor)
                    .in_gathering(gathering_id)
                    .with_details(json!({
                        "participant_type": participant.participant_type.as_str(),
                        "owner_id": participant.effective_owner_id,
                        "unit_ids": participant.unit_ids,
                    })),
            )
            .await;
        self.scheduler
            .schedule(RecomputeJob::participation(gathering_id));
        Ok(participant)
    }

    pub async fn get(&self, gathering_id: &str, participant_id: &str) -> DomainResult<Participant> {
        self.participants
            .get(gathering_id, participant_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    pub async fn list(&self, gathering_id: &str) -> DomainResult<Vec<ParticipantSummary>> {
        let participants = self.participants.list_by_gathering(gathering_id).await?;
        let voted: HashSet<String> = self
            .ballots
            .list_by_gathering(gathering_id)
            .await?
            .into_iter()
            .filter(|ballot| ballot.is_valid)
            .map(|ballot| ballot.participant_id)
            .collect();
        Ok(participants
            .into_iter()
            .map(|participant| {
                let has_voted = voted.contains(&participant.participant_id);
                ParticipantSummary {
                    participant,
                    has_voted,
                }
            })
            .collect())
    }

    pub async fn check_in(
        &self,
        actor: &ActorIdentity,
        gathering_id: &str,
        participant_id: &str,
    ) -> DomainResult<Participant> {
        let existing = self.get(gathering_id, participant_id).await?;
        if existing.checked_in_at_ms.is_some() {
            return Err(DomainError::StateConflict(
                "participant already checked in".into(),
            ));
        }
        let participant = self
            .participants
            .check_in(gathering_id, participant_id, now_ms())
            .await?;
        self.audit
            .record(
                AuditEntry::new("participant", participant_id, "checked_in", actor)
                    .in_gathering(gathering_id),
            )
            .await;
        Ok(participant)
    }

    async fn owner_qualified_units(
        &self,
        gathering: &Gathering,
        owner: &Owner,
    ) -> DomainResult<BTreeSet<i64>> {
        let qualified = self
            .resolver
            .resolve(gathering.association_id, &gathering.qualification)
            .await?;
        let owned = self
            .resolver
            .inventory()
            .owner_active_units(gathering.association_id, owner.owner_id)
            .await?;
        Ok(owned
            .into_iter()
            .map(|unit| unit.unit_id)
            .filter(|unit_id| qualified.contains(*unit_id))
            .collect())
    }
}

fn requested_units(unit_ids: &[i64]) -> DomainResult<BTreeSet<i64>> {
    let requested: BTreeSet<i64> = unit_ids.iter().copied().filter(|id| *id > 0).collect();
    if requested.is_empty() {
        return Err(DomainError::Validation("at least one unit is required".into()));
    }
    Ok(requested)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_participant(unit_ids: Vec<i64>, units_part: f64) -> Participant {
        Participant {
            participant_id: format!("p-{}", unit_ids.first().copied().unwrap_or_default()),
            gathering_id: "g-1".to_string(),
            participant_type: ParticipantType::Owner,
            effective_owner_id: 1,
            delegating_owner_id: None,
            delegation_document_ref: None,
            participant_name: "Ana".to_string(),
            participant_identification: "ID-1".to_string(),
            units_area: units_part * 4.0,
            unit_ids,
            units_part,
            checked_in_at_ms: None,
            created_at_ms: 0,
        }
    }

    fn registration(participant_type: ParticipantType) -> ParticipantRegistration {
        ParticipantRegistration {
            participant_type,
            owner_id: None,
            delegating_owner_id: None,
            delegate_name: None,
            delegation_document_ref: None,
            unit_ids: vec![1],
        }
    }

    #[test]
    fn non_positive_unit_ids_are_discarded() {
        let requested = requested_units(&[0, -3, 4, 4, 2]).expect("units");
        assert_eq!(requested.into_iter().collect::<Vec<_>>(), vec![2, 4]);

        let err = requested_units(&[0, -1]).expect_err("empty");
        assert!(matches!(err, DomainError::Validation(msg) if msg == "at least one unit is required"));
    }

    #[test]
    fn delegate_weight_comes_from_delegating_owner() {
        let mut input = registration(ParticipantType::Delegate);
        input.owner_id = Some(99);
        assert!(matches!(
            input.effective_owner_id(),
            Err(DomainError::Validation(msg)) if msg == "delegating owner id is required"
        ));
        input.delegating_owner_id = Some(12);
        assert_eq!(input.effective_owner_id().expect("owner"), 12);

        let mut owner = registration(ParticipantType::Owner);
        assert!(owner.effective_owner_id().is_err());
        owner.owner_id = Some(5);
        assert_eq!(owner.effective_owner_id().expect("owner"), 5);
    }
}
