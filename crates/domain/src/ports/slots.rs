use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::gathering::UnitAggregate;
use crate::slots::UnitSlot;

use super::BoxFuture;

/// Raw aggregate as returned by storage. Sums over an empty set come back absent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StoredUnitStats {
    pub count: u64,
    pub total_part: Option<f64>,
    pub total_area: Option<f64>,
}

impl StoredUnitStats {
    pub fn into_aggregate(self) -> UnitAggregate {
        UnitAggregate {
            count: self.count,
            weight: self.total_part.unwrap_or(0.0),
            area: self.total_area.unwrap_or(0.0),
        }
    }
}

pub trait UnitSlotRepository: Send + Sync {
    /// Returns `true` when the slot was created, `false` when it already existed.
    fn create_if_absent(&self, slot: &UnitSlot) -> BoxFuture<'_, DomainResult<bool>>;
    /// Atomically assigns an unclaimed slot. Returns the slot row as stored after the
    /// attempt, or `None` when no slot exists for the unit.
    fn claim(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
        claimed_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<UnitSlot>>>;
    /// Clears the claim only while `participant_id` still holds it. Returns whether
    /// the slot was released.
    fn release(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<bool>>;
    /// Deletes the slot only while nobody holds it. Returns whether it was deleted.
    fn remove_unclaimed(&self, gathering_id: &str, unit_id: i64)
    -> BoxFuture<'_, DomainResult<bool>>;
    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<UnitSlot>>>;
    /// Count, part and area over claimed slots.
    fn participating_stats(&self, gathering_id: &str)
    -> BoxFuture<'_, DomainResult<StoredUnitStats>>;
}
