use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::gatherings::GatheringRepository;
use crate::ports::slots::UnitSlotRepository;
use crate::qualification::{QualificationResolver, QualifiedUnits};
use crate::slots::UnitSlot;
use crate::units::{Owner, OwnerUnit, Unit};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct QualifiedUnitView {
    #[serde(flatten)]
    pub unit: Unit,
    pub owners: Vec<Owner>,
    pub is_participating: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct VoterUnit {
    #[serde(flatten)]
    pub unit: Unit,
    /// Slot exists and nobody has claimed it yet.
    pub is_available: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EligibleVoter {
    pub owner: Owner,
    pub units: Vec<VoterUnit>,
    pub total_weight: f64,
    pub total_area: f64,
    pub total_available_weight: f64,
    pub total_available_area: f64,
    pub available_units_count: u64,
    pub has_available_units: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct NonParticipatingOwner {
    #[serde(flatten)]
    pub owner: Owner,
    pub units_count: u64,
}

fn slots_by_unit(slots: Vec<UnitSlot>) -> HashMap<i64, UnitSlot> {
    slots.into_iter().map(|slot| (slot.unit_id, slot)).collect()
}

fn is_claimed(slots: &HashMap<i64, UnitSlot>, unit_id: i64) -> bool {
    slots.get(&unit_id).is_some_and(UnitSlot::is_claimed)
}

fn is_available(slots: &HashMap<i64, UnitSlot>, unit_id: i64) -> bool {
    slots.get(&unit_id).is_some_and(|slot| !slot.is_claimed())
}

/// Qualified owners with their qualified units, ordered by owner id.
fn owners_of_qualified<'a>(
    qualified: &'a QualifiedUnits,
    ownerships: &'a [OwnerUnit],
) -> BTreeMap<i64, (&'a Owner, Vec<&'a Unit>)> {
    let mut owners: BTreeMap<i64, (&Owner, Vec<&Unit>)> = BTreeMap::new();
    for link in ownerships {
        let Some(unit) = qualified.get(link.unit_id) else {
            continue;
        };
        let entry = owners
            .entry(link.owner.owner_id)
            .or_insert_with(|| (&link.owner, Vec::new()));
        if !entry.1.iter().any(|known| known.unit_id == unit.unit_id) {
            entry.1.push(unit);
        }
    }
    owners
}

pub fn qualified_unit_views(
    qualified: &QualifiedUnits,
    ownerships: &[OwnerUnit],
    slots: &HashMap<i64, UnitSlot>,
) -> Vec<QualifiedUnitView> {
    qualified
        .units()
        .map(|unit| QualifiedUnitView {
            unit: unit.clone(),
            owners: ownerships
                .iter()
                .filter(|link| link.unit_id == unit.unit_id)
                .map(|link| link.owner.clone())
                .collect(),
            is_participating: is_claimed(slots, unit.unit_id),
        })
        .collect()
}

pub fn eligible_voters(
    qualified: &QualifiedUnits,
    ownerships: &[OwnerUnit],
    slots: &HashMap<i64, UnitSlot>,
) -> Vec<EligibleVoter> {
    owners_of_qualified(qualified, ownerships)
        .into_values()
        .map(|(owner, units)| {
            let mut voter = EligibleVoter {
                owner: owner.clone(),
                units: Vec::with_capacity(units.len()),
                total_weight: 0.0,
                total_area: 0.0,
                total_available_weight: 0.0,
                total_available_area: 0.0,
                available_units_count: 0,
                has_available_units: false,
            };
            for unit in units {
                let available = is_available(slots, unit.unit_id);
                voter.total_weight += unit.part;
                voter.total_area += unit.area;
                if available {
                    voter.total_available_weight += unit.part;
                    voter.total_available_area += unit.area;
                    voter.available_units_count += 1;
                    voter.has_available_units = true;
                }
                voter.units.push(VoterUnit {
                    unit: unit.clone(),
                    is_available: available,
                });
            }
            voter
        })
        .collect()
}

/// Owners of qualified units none of which has been claimed.
pub fn non_participating_owners(
    qualified: &QualifiedUnits,
    ownerships: &[OwnerUnit],
    slots: &HashMap<i64, UnitSlot>,
) -> Vec<NonParticipatingOwner> {
    owners_of_qualified(qualified, ownerships)
        .into_values()
        .filter(|(_, units)| !units.iter().any(|unit| is_claimed(slots, unit.unit_id)))
        .map(|(owner, units)| NonParticipatingOwner {
            owner: owner.clone(),
            units_count: units.len() as u64,
        })
        .collect()
}

#[derive(Clone)]
pub struct EligibilityService {
    gatherings: Arc<dyn GatheringRepository>,
    resolver: QualificationResolver,
    slots: Arc<dyn UnitSlotRepository>,
}

struct Snapshot {
    qualified: QualifiedUnits,
    ownerships: Vec<OwnerUnit>,
    slots: HashMap<i64, UnitSlot>,
}

impl EligibilityService {
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        resolver: QualificationResolver,
        slots: Arc<dyn UnitSlotRepository>,
    ) -> Self {
        Self {
            gatherings,
            resolver,
            slots,
        }
    }

    async fn snapshot(&self, association_id: i64, gathering_id: &str) -> DomainResult<Snapshot> {
        let gathering = self
            .gatherings
            .get(association_id, gathering_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let qualified = self
            .resolver
            .resolve(association_id, &gathering.qualification)
            .await?;
        let ownerships = self
            .resolver
            .inventory()
            .active_ownerships(association_id)
            .await?;
        let slots = slots_by_unit(self.slots.list_by_gathering(gathering_id).await?);
        Ok(Snapshot {
            qualified,
            ownerships,
            slots,
        })
    }

    pub async fn qualified_units(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<Vec<QualifiedUnitView>> {
        let snapshot = self.snapshot(association_id, gathering_id).await?;
        Ok(qualified_unit_views(
            &snapshot.qualified,
            &snapshot.ownerships,
            &snapshot.slots,
        ))
    }

    pub async fn eligible_voters(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<Vec<EligibleVoter>> {
        let snapshot = self.snapshot(association_id, gathering_id).await?;
        Ok(eligible_voters(
            &snapshot.qualified,
            &snapshot.ownerships,
            &snapshot.slots,
        ))
    }

    pub async fn non_participating_owners(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<Vec<NonParticipatingOwner>> {
        let snapshot = self.snapshot(association_id, gathering_id).await?;
        Ok(non_participating_owners(
            &snapshot.qualified,
            &snapshot.ownerships,
            &snapshot.slots,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(unit_id: i64, part: f64) -> Unit {
        Unit {
            unit_id,
            association_id: 7,
            building_id: 1,
            cadastral_number: format!("C-{unit_id}"),
            unit_number: unit_id.to_string(),
            address: "Main 1".to_string(),
            entrance: 1,
            floor: 1,
            unit_type: "apartment".to_string(),
            area: part * 4.0,
            part,
            room_count: 2,
        }
    }

    fn owner(owner_id: i64) -> Owner {
        Owner {
            owner_id,
            association_id: 7,
            name: format!("Owner {owner_id}"),
            identification_number: format!("ID-{owner_id}"),
        }
    }

    fn link(owner_id: i64, unit_id: i64) -> OwnerUnit {
        OwnerUnit {
            owner: owner(owner_id),
            unit_id,
        }
    }

    fn slot(unit_id: i64, part: f64, participant: Option<&str>) -> UnitSlot {
        UnitSlot {
            gathering_id: "g-1".to_string(),
            unit_id,
            part,
            area: part * 4.0,
            participant_id: participant.map(str::to_string),
            claimed_at_ms: participant.map(|_| 1),
            created_at_ms: 0,
        }
    }

    fn fixture() -> (QualifiedUnits, Vec<OwnerUnit>, HashMap<i64, UnitSlot>) {
        let qualified = QualifiedUnits::from_units([unit(1, 10.0), unit(2, 20.0), unit(3, 30.0)]);
        // Owner 4 holds only a non-qualified unit.
        let ownerships = vec![link(1, 1), link(1, 2), link(2, 2), link(3, 3), link(4, 9)];
        let slots = slots_by_unit(vec![
            slot(1, 10.0, Some("p-1")),
            slot(2, 20.0, None),
            slot(3, 30.0, None),
        ]);
        (qualified, ownerships, slots)
    }

    #[test]
    fn qualified_views_list_co_owners_and_claims() {
        let (qualified, ownerships, slots) = fixture();
        let views = qualified_unit_views(&qualified, &ownerships, &slots);
        assert_eq!(views.len(), 3);
        assert!(views[0].is_participating);
        assert_eq!(views[1].owners.len(), 2);
        assert!(!views[1].is_participating);
    }

    #[test]
    fn eligible_voters_total_available_units_only() {
        let (qualified, ownerships, slots) = fixture();
        let voters = eligible_voters(&qualified, &ownerships, &slots);
        assert_eq!(voters.len(), 3);
        let first = &voters[0];
        assert_eq!(first.owner.owner_id, 1);
        assert_eq!(first.total_weight, 30.0);
        assert_eq!(first.total_available_weight, 20.0);
        assert_eq!(first.available_units_count, 1);
        assert!(first.has_available_units);
        assert!(!first.units[0].is_available);
    }

    #[test]
    fn units_without_slots_are_not_available() {
        let (qualified, ownerships, _) = fixture();
        let voters = eligible_voters(&qualified, &ownerships, &HashMap::new());
        assert!(voters.iter().all(|voter| !voter.has_available_units));
    }

    #[test]
    fn non_participating_owners_exclude_claimants() {
        let (qualified, ownerships, slots) = fixture();
        let owners = non_participating_owners(&qualified, &ownerships, &slots);
        let ids: Vec<i64> = owners.iter().map(|entry| entry.owner.owner_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(owners[0].units_count, 1);
    }
}
