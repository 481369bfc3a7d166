use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::gathering::Gathering;
use crate::jobs::now_ms;
use crate::ports::slots::UnitSlotRepository;
use crate::qualification::QualificationResolver;
use crate::strategy::WeightedUnit;

/// The single voting right of one unit in one gathering. Part and area are
/// captured when the slot is created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnitSlot {
    pub gathering_id: String,
    pub unit_id: i64,
    pub part: f64,
    pub area: f64,
    pub participant_id: Option<String>,
    pub claimed_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl UnitSlot {
    pub fn is_claimed(&self) -> bool {
        self.participant_id.is_some()
    }

    pub fn weighted(&self) -> WeightedUnit {
        WeightedUnit {
            unit_id: self.unit_id,
            part: self.part,
            area: self.area,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClaimOutcome {
    Claimed(UnitSlot),
    /// Someone else got there first.
    HeldByOther(UnitSlot),
    /// No slot exists for the unit in this gathering.
    Missing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SlotSyncReport {
    pub created: usize,
    pub existing: usize,
    /// Unclaimed slots whose unit no longer qualifies.
    pub removed: usize,
}

#[derive(Clone)]
pub struct SlotAllocator {
    slots: Arc<dyn UnitSlotRepository>,
    resolver: QualificationResolver,
}

impl SlotAllocator {
    pub fn new(slots: Arc<dyn UnitSlotRepository>, resolver: QualificationResolver) -> Self {
        Self { slots, resolver }
    }

    /// Ensures one slot per qualified unit. Existing slots are left untouched and
    /// unclaimed slots of units that dropped out of the rule are removed. Claimed
    /// slots stay with their participant.
    pub async fn sync(&self, gathering: &Gathering) -> DomainResult<SlotSyncReport> {
        let qualified = self
            .resolver
            .resolve(gathering.association_id, &gathering.qualification)
            .await?;
        let now = now_ms();
        let mut report = SlotSyncReport::default();
        for unit in qualified.units() {
            let slot = UnitSlot {
                gathering_id: gathering.gathering_id.clone(),
                unit_id: unit.unit_id,
                part: unit.part,
                area: unit.area,
                participant_id: None,
                claimed_at_ms: None,
                created_at_ms: now,
            };
            if self.slots.create_if_absent(&slot).await? {
                report.created += 1;
            } else {
                report.existing += 1;
            }
        }
        for slot in self.slots.list_by_gathering(&gathering.gathering_id).await? {
            if slot.is_claimed() || qualified.contains(slot.unit_id) {
                continue;
            }
            if self
                .slots
                .remove_unclaimed(&gathering.gathering_id, slot.unit_id)
                .await?
            {
                report.removed += 1;
            }
        }
        tracing::debug!(
            gathering_id = %gathering.gathering_id,
            created = report.created,
            existing = report.existing,
            removed = report.removed,
            "unit slots synced"
        );
        Ok(report)
    }

    pub async fn claim(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
    ) -> DomainResult<ClaimOutcome> {
        let slot = self
            .slots
            .claim(gathering_id, unit_id, participant_id, now_ms())
            .await?;
        Ok(match slot {
            None => ClaimOutcome::Missing,
            Some(slot) if slot.participant_id.as_deref() == Some(participant_id) => {
                ClaimOutcome::Claimed(slot)
            }
            Some(slot) => ClaimOutcome::HeldByOther(slot),
        })
    }

    /// Hands back slots claimed for a participant that was never stored.
    pub async fn release_all(&self, gathering_id: &str, unit_ids: &[i64], participant_id: &str) {
        for &unit_id in unit_ids {
            match self.slots.release(gathering_id, unit_id, participant_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(gathering_id, unit_id, "slot no longer held; nothing to release")
                }
                Err(err) => {
                    tracing::error!(gathering_id, unit_id, error = %err, "slot release failed")
                }
            }
        }
    }

    pub async fn list(&self, gathering_id: &str) -> DomainResult<Vec<UnitSlot>> {
        self.slots.list_by_gathering(gathering_id).await
    }
}
