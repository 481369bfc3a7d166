use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use apc_domain::DomainResult;
use apc_domain::audit::AuditEntry;
use apc_domain::ballots::Ballot;
use apc_domain::error::DomainError;
use apc_domain::gathering::{Gathering, GatheringStatus, QualificationRule, UnitAggregate};
use apc_domain::matters::VotingMatter;
use apc_domain::notifications::Notification;
use apc_domain::participants::Participant;
use apc_domain::ports::BoxFuture;
use apc_domain::ports::audit::AuditLogSink;
use apc_domain::ports::ballots::BallotRepository;
use apc_domain::ports::gatherings::GatheringRepository;
use apc_domain::ports::matters::VotingMatterRepository;
use apc_domain::ports::notifications::NotificationSender;
use apc_domain::ports::participants::ParticipantRepository;
use apc_domain::ports::results::{CachedResultsRow, ResultsCacheRepository};
use apc_domain::ports::slots::{StoredUnitStats, UnitSlotRepository};
use apc_domain::ports::tallies::TallyRepository;
use apc_domain::ports::units::UnitInventory;
use apc_domain::slots::UnitSlot;
use apc_domain::tally::MatterTally;
use apc_domain::units::{Owner, OwnerUnit, Unit};
use tokio::sync::RwLock;

#[derive(Default)]
struct GatheringState {
    gatherings: HashMap<String, Gathering>,
    matters: HashMap<String, VotingMatter>,
    slots: BTreeMap<(String, i64), UnitSlot>,
    participants: HashMap<String, Participant>,
    ballots: HashMap<String, Ballot>,
    /// (gathering, participant) to the id of the participant's valid ballot.
    valid_ballots: HashMap<(String, String), String>,
    tallies: BTreeMap<(String, String), MatterTally>,
    results: HashMap<String, CachedResultsRow>,
    results_generation: HashMap<String, u64>,
}

impl GatheringState {
    fn stats(parts: impl Iterator<Item = (u64, f64, f64)>) -> StoredUnitStats {
        let mut stats = StoredUnitStats::default();
        for (count, part, area) in parts {
            stats.count += count;
            *stats.total_part.get_or_insert(0.0) += part;
            *stats.total_area.get_or_insert(0.0) += area;
        }
        stats
    }
}

/// Every gathering-side port over one lock. Uniqueness rules and the conditional
/// slot claim are checked under the write lock.
#[derive(Clone, Default)]
pub struct InMemoryGatheringStore {
    state: Arc<RwLock<GatheringState>>,
}

impl InMemoryGatheringStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GatheringRepository for InMemoryGatheringStore {
    fn create(&self, gathering: &Gathering) -> BoxFuture<'_, DomainResult<Gathering>> {
        let gathering = gathering.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.gatherings.contains_key(&gathering.gathering_id) {
                return Err(DomainError::Conflict);
            }
            state
                .gatherings
                .insert(gathering.gathering_id.clone(), gathering.clone());
            Ok(gathering)
        })
    }

    fn get(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Gathering>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .gatherings
                .get(&gathering_id)
                .filter(|gathering| gathering.association_id == association_id)
                .cloned())
        })
    }

    fn find_by_id(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Option<Gathering>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move { Ok(self.state.read().await.gatherings.get(&gathering_id).cloned()) })
    }

    fn list_by_association(
        &self,
        association_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<Gathering>>> {
        Box::pin(async move {
            let mut gatherings = self
                .state
                .read()
                .await
                .gatherings
                .values()
                .filter(|gathering| gathering.association_id == association_id)
                .cloned()
                .collect::<Vec<_>>();
            gatherings.sort_by(|a, b| {
                b.gathering_date_ms
                    .cmp(&a.gathering_date_ms)
                    .then_with(|| b.gathering_id.cmp(&a.gathering_id))
            });
            Ok(gatherings)
        })
    }

    fn update_status(
        &self,
        gathering_id: &str,
        status: GatheringStatus,
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Gathering>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let gathering = state
                .gatherings
                .get_mut(&gathering_id)
                .ok_or(DomainError::NotFound)?;
            gathering.status = status;
            gathering.updated_at_ms = updated_at_ms;
            Ok(gathering.clone())
        })
    }

    fn update_qualified_stats(
        &self,
        gathering_id: &str,
        aggregate: &UnitAggregate,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        let aggregate = *aggregate;
        Box::pin(async move {
            let mut state = self.state.write().await;
            let gathering = state
                .gatherings
                .get_mut(&gathering_id)
                .ok_or(DomainError::NotFound)?;
            gathering.qualified = Some(aggregate);
            Ok(())
        })
    }

    fn update_participation_stats(
        &self,
        gathering_id: &str,
        aggregate: &UnitAggregate,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        let aggregate = *aggregate;
        Box::pin(async move {
            let mut state = self.state.write().await;
            let gathering = state
                .gatherings
                .get_mut(&gathering_id)
                .ok_or(DomainError::NotFound)?;
            gathering.participating = Some(aggregate);
            Ok(())
        })
    }
}

impl VotingMatterRepository for InMemoryGatheringStore {
    fn create(&self, matter: &VotingMatter) -> BoxFuture<'_, DomainResult<VotingMatter>> {
        let matter = matter.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.matters.contains_key(&matter.matter_id) {
                return Err(DomainError::Conflict);
            }
            state.matters.insert(matter.matter_id.clone(), matter.clone());
            Ok(matter)
        })
    }

    fn update(&self, matter: &VotingMatter) -> BoxFuture<'_, DomainResult<VotingMatter>> {
        let matter = matter.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.matters.get_mut(&matter.matter_id) {
                Some(stored) if stored.gathering_id == matter.gathering_id => {
                    *stored = matter.clone();
                    Ok(matter)
                }
                _ => Err(DomainError::NotFound),
            }
        })
    }

    fn delete(&self, gathering_id: &str, matter_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        let matter_id = matter_id.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let owned = state
                .matters
                .get(&matter_id)
                .is_some_and(|matter| matter.gathering_id == gathering_id);
            if !owned {
                return Err(DomainError::NotFound);
            }
            state.matters.remove(&matter_id);
            state.tallies.remove(&(gathering_id, matter_id));
            Ok(())
        })
    }

    fn get(
        &self,
        gathering_id: &str,
        matter_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<VotingMatter>>> {
        let gathering_id = gathering_id.to_string();
        let matter_id = matter_id.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .matters
                .get(&matter_id)
                .filter(|matter| matter.gathering_id == gathering_id)
                .cloned())
        })
    }

    fn list_by_gathering(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<VotingMatter>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut matters = self
                .state
                .read()
                .await
                .matters
                .values()
                .filter(|matter| matter.gathering_id == gathering_id)
                .cloned()
                .collect::<Vec<_>>();
            matters.sort_by(|a, b| {
                a.order_index
                    .cmp(&b.order_index)
                    .then_with(|| a.matter_id.cmp(&b.matter_id))
            });
            Ok(matters)
        })
    }
}

impl UnitSlotRepository for InMemoryGatheringStore {
    fn create_if_absent(&self, slot: &UnitSlot) -> BoxFuture<'_, DomainResult<bool>> {
        let slot = slot.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let key = (slot.gathering_id.clone(), slot.unit_id);
            if state.slots.contains_key(&key) {
                return Ok(false);
            }
            state.slots.insert(key, slot);
            Ok(true)
        })
    }

    fn claim(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
        claimed_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<UnitSlot>>> {
        let key = (gathering_id.to_string(), unit_id);
        let participant_id = participant_id.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(slot) = state.slots.get_mut(&key) else {
                return Ok(None);
            };
            if slot.participant_id.is_none() {
                slot.participant_id = Some(participant_id);
                slot.claimed_at_ms = Some(claimed_at_ms);
            }
            Ok(Some(slot.clone()))
        })
    }

    fn release(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let key = (gathering_id.to_string(), unit_id);
        let participant_id = participant_id.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.slots.get_mut(&key) {
                Some(slot) if slot.participant_id.as_deref() == Some(participant_id.as_str()) => {
                    slot.participant_id = None;
                    slot.claimed_at_ms = None;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn remove_unclaimed(
        &self,
        gathering_id: &str,
        unit_id: i64,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let key = (gathering_id.to_string(), unit_id);
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.slots.get(&key).is_some_and(|slot| !slot.is_claimed()) {
                state.slots.remove(&key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<UnitSlot>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .slots
                .values()
                .filter(|slot| slot.gathering_id == gathering_id)
                .cloned()
                .collect())
        })
    }

    fn participating_stats(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<StoredUnitStats>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(GatheringState::stats(
                state
                    .slots
                    .values()
                    .filter(|slot| slot.gathering_id == gathering_id && slot.is_claimed())
                    .map(|slot| (1, slot.part, slot.area)),
            ))
        })
    }
}

impl ParticipantRepository for InMemoryGatheringStore {
    fn create(&self, participant: &Participant) -> BoxFuture<'_, DomainResult<Participant>> {
        let participant = participant.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.participants.contains_key(&participant.participant_id) {
                return Err(DomainError::Conflict);
            }
            state
                .participants
                .insert(participant.participant_id.clone(), participant.clone());
            Ok(participant)
        })
    }

    fn get(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Participant>>> {
        let gathering_id = gathering_id.to_string();
        let participant_id = participant_id.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .participants
                .get(&participant_id)
                .filter(|participant| participant.gathering_id == gathering_id)
                .cloned())
        })
    }

    fn list_by_gathering(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Participant>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut participants = self
                .state
                .read()
                .await
                .participants
                .values()
                .filter(|participant| participant.gathering_id == gathering_id)
                .cloned()
                .collect::<Vec<_>>();
            participants.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.participant_id.cmp(&b.participant_id))
            });
            Ok(participants)
        })
    }

    fn check_in(
        &self,
        gathering_id: &str,
        participant_id: &str,
        checked_in_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Participant>> {
        let gathering_id = gathering_id.to_string();
        let participant_id = participant_id.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let participant = state
                .participants
                .get_mut(&participant_id)
                .filter(|participant| participant.gathering_id == gathering_id)
                .ok_or(DomainError::NotFound)?;
            if participant.checked_in_at_ms.is_some() {
                return Err(DomainError::StateConflict(
                    "participant already checked in".into(),
                ));
            }
            participant.checked_in_at_ms = Some(checked_in_at_ms);
            Ok(participant.clone())
        })
    }
}

impl BallotRepository for InMemoryGatheringStore {
    fn create(&self, ballot: &Ballot) -> BoxFuture<'_, DomainResult<Ballot>> {
        let ballot = ballot.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let key = (ballot.gathering_id.clone(), ballot.participant_id.clone());
            if state.ballots.contains_key(&ballot.ballot_id)
                || (ballot.is_valid && state.valid_ballots.contains_key(&key))
            {
                return Err(DomainError::Conflict);
            }
            if ballot.is_valid {
                state.valid_ballots.insert(key, ballot.ballot_id.clone());
            }
            state.ballots.insert(ballot.ballot_id.clone(), ballot.clone());
            Ok(ballot)
        })
    }

    fn get(&self, ballot_id: &str) -> BoxFuture<'_, DomainResult<Option<Ballot>>> {
        let ballot_id = ballot_id.to_string();
        Box::pin(async move { Ok(self.state.read().await.ballots.get(&ballot_id).cloned()) })
    }

    fn find_valid_by_participant(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Ballot>>> {
        let key = (gathering_id.to_string(), participant_id.to_string());
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .valid_ballots
                .get(&key)
                .and_then(|ballot_id| state.ballots.get(ballot_id))
                .cloned())
        })
    }

    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<Ballot>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut ballots = self
                .state
                .read()
                .await
                .ballots
                .values()
                .filter(|ballot| ballot.gathering_id == gathering_id)
                .cloned()
                .collect::<Vec<_>>();
            ballots.sort_by(|a, b| {
                a.submitted_at_ms
                    .cmp(&b.submitted_at_ms)
                    .then_with(|| a.ballot_id.cmp(&b.ballot_id))
            });
            Ok(ballots)
        })
    }

    fn invalidate(
        &self,
        ballot_id: &str,
        reason: &str,
        invalidated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Ballot>> {
        let ballot_id = ballot_id.to_string();
        let reason = reason.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let ballot = state
                .ballots
                .get_mut(&ballot_id)
                .ok_or(DomainError::NotFound)?;
            if !ballot.is_valid {
                return Err(DomainError::StateConflict("ballot already invalidated".into()));
            }
            ballot.is_valid = false;
            ballot.invalidation_reason = Some(reason);
            ballot.invalidated_at_ms = Some(invalidated_at_ms);
            let updated = ballot.clone();
            state
                .valid_ballots
                .remove(&(updated.gathering_id.clone(), updated.participant_id.clone()));
            Ok(updated)
        })
    }

    fn voted_stats(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<StoredUnitStats>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(GatheringState::stats(
                state
                    .valid_ballots
                    .iter()
                    .filter(|((ballot_gathering, _), _)| *ballot_gathering == gathering_id)
                    .filter_map(|((_, participant_id), _)| state.participants.get(participant_id))
                    .map(|participant| {
                        (
                            participant.unit_ids.len() as u64,
                            participant.units_part,
                            participant.units_area,
                        )
                    }),
            ))
        })
    }
}

impl TallyRepository for InMemoryGatheringStore {
    fn upsert(&self, tally: &MatterTally) -> BoxFuture<'_, DomainResult<()>> {
        let tally = tally.clone();
        Box::pin(async move {
            self.state
                .write()
                .await
                .tallies
                .insert((tally.gathering_id.clone(), tally.matter_id.clone()), tally);
            Ok(())
        })
    }

    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<MatterTally>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .tallies
                .values()
                .filter(|tally| tally.gathering_id == gathering_id)
                .cloned()
                .collect())
        })
    }

    fn delete_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            self.state
                .write()
                .await
                .tallies
                .retain(|(tally_gathering, _), _| *tally_gathering != gathering_id);
            Ok(())
        })
    }
}

impl ResultsCacheRepository for InMemoryGatheringStore {
    fn generation(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<u64>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .results_generation
                .get(&gathering_id)
                .copied()
                .unwrap_or_default())
        })
    }

    fn upsert(&self, row: &CachedResultsRow) -> BoxFuture<'_, DomainResult<bool>> {
        let row = row.clone();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let current = state
                .results_generation
                .get(&row.gathering_id)
                .copied()
                .unwrap_or_default();
            if row.generation != current {
                return Ok(false);
            }
            state.results.insert(row.gathering_id.clone(), row);
            Ok(true)
        })
    }

    fn get(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Option<CachedResultsRow>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move { Ok(self.state.read().await.results.get(&gathering_id).cloned()) })
    }

    fn delete(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            *state
                .results_generation
                .entry(gathering_id.clone())
                .or_default() += 1;
            state.results.remove(&gathering_id);
            Ok(())
        })
    }
}

#[derive(Default)]
struct InventoryState {
    units: BTreeMap<i64, Unit>,
    owners: BTreeMap<i64, Owner>,
    ownerships: Vec<(i64, i64)>,
    inactive_units: HashSet<i64>,
}

/// Seedable unit inventory for tests and the memory backend.
#[derive(Clone, Default)]
pub struct InMemoryUnitInventory {
    state: Arc<RwLock<InventoryState>>,
}

impl InMemoryUnitInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_unit(&self, unit: Unit) {
        self.state.write().await.units.insert(unit.unit_id, unit);
    }

    pub async fn add_owner(&self, owner: Owner) {
        self.state.write().await.owners.insert(owner.owner_id, owner);
    }

    pub async fn link(&self, owner_id: i64, unit_id: i64) {
        let mut state = self.state.write().await;
        if !state.ownerships.contains(&(owner_id, unit_id)) {
            state.ownerships.push((owner_id, unit_id));
        }
    }

    pub async fn deactivate_unit(&self, unit_id: i64) {
        self.state.write().await.inactive_units.insert(unit_id);
    }
}

impl InventoryState {
    fn active_units(&self, association_id: i64) -> impl Iterator<Item = &Unit> {
        self.units.values().filter(move |unit| {
            unit.association_id == association_id && !self.inactive_units.contains(&unit.unit_id)
        })
    }
}

impl UnitInventory for InMemoryUnitInventory {
    fn qualified_units(
        &self,
        association_id: i64,
        rule: &QualificationRule,
    ) -> BoxFuture<'_, DomainResult<Vec<Unit>>> {
        let rule = rule.clone();
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .active_units(association_id)
                .filter(|unit| rule.matches(unit))
                .cloned()
                .collect())
        })
    }

    fn owner(
        &self,
        association_id: i64,
        owner_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Owner>>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .owners
                .get(&owner_id)
                .filter(|owner| owner.association_id == association_id)
                .cloned())
        })
    }

    fn owner_active_units(
        &self,
        association_id: i64,
        owner_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<Unit>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let owned: HashSet<i64> = state
                .ownerships
                .iter()
                .filter(|(owner, _)| *owner == owner_id)
                .map(|(_, unit)| *unit)
                .collect();
            Ok(state
                .active_units(association_id)
                .filter(|unit| owned.contains(&unit.unit_id))
                .cloned()
                .collect())
        })
    }

    fn active_ownerships(&self, association_id: i64) -> BoxFuture<'_, DomainResult<Vec<OwnerUnit>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let active: HashSet<i64> = state
                .active_units(association_id)
                .map(|unit| unit.unit_id)
                .collect();
            Ok(state
                .ownerships
                .iter()
                .filter(|(_, unit_id)| active.contains(unit_id))
                .filter_map(|(owner_id, unit_id)| {
                    state.owners.get(owner_id).map(|owner| OwnerUnit {
                        owner: owner.clone(),
                        unit_id: *unit_id,
                    })
                })
                .collect())
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLogSink for InMemoryAuditLog {
    fn append(&self, entry: &AuditEntry) -> BoxFuture<'_, DomainResult<()>> {
        let entry = entry.clone();
        Box::pin(async move {
            self.entries.write().await.push(entry);
            Ok(())
        })
    }

    fn list_by_gathering(
        &self,
        gathering_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<AuditEntry>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut entries = self
                .entries
                .read()
                .await
                .iter()
                .filter(|entry| entry.gathering_id.as_deref() == Some(gathering_id.as_str()))
                .cloned()
                .collect::<Vec<_>>();
            entries.sort_by(|a, b| {
                b.created_at_ms
                    .cmp(&a.created_at_ms)
                    .then_with(|| b.entry_id.cmp(&a.entry_id))
            });
            entries.truncate(limit);
            Ok(entries)
        })
    }
}

/// Records notifications instead of delivering them. Owner ids marked
/// unreachable fail delivery.
#[derive(Clone, Default)]
pub struct InMemoryNotificationOutbox {
    sent: Arc<RwLock<Vec<Notification>>>,
    unreachable: Arc<RwLock<HashSet<i64>>>,
}

impl InMemoryNotificationOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_unreachable(&self, owner_id: i64) {
        self.unreachable.write().await.insert(owner_id);
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }
}

impl NotificationSender for InMemoryNotificationOutbox {
    fn send(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<()>> {
        let notification = notification.clone();
        Box::pin(async move {
            if self.unreachable.read().await.contains(&notification.owner_id) {
                return Err(DomainError::Collaborator(format!(
                    "owner {} has no reachable contact",
                    notification.owner_id
                )));
            }
            self.sent.write().await.push(notification);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use apc_domain::gathering::GatheringType;
    use apc_domain::strategy::VotingMode;

    use super::*;

    fn slot(unit_id: i64) -> UnitSlot {
        UnitSlot {
            gathering_id: "g-1".to_string(),
            unit_id,
            part: 12.5,
            area: 40.0,
            participant_id: None,
            claimed_at_ms: None,
            created_at_ms: 1,
        }
    }

    fn ballot(ballot_id: &str, participant_id: &str) -> Ballot {
        Ballot {
            ballot_id: ballot_id.to_string(),
            gathering_id: "g-1".to_string(),
            participant_id: participant_id.to_string(),
            content: "{}".to_string(),
            content_hash: "00".to_string(),
            submitted_at_ms: 1,
            origin_ip: None,
            user_agent: None,
            is_valid: true,
            invalidation_reason: None,
            invalidated_at_ms: None,
        }
    }

    #[tokio::test]
    async fn slot_rows_are_unique_per_unit() {
        let store = InMemoryGatheringStore::new();
        assert!(store.create_if_absent(&slot(1)).await.unwrap());
        assert!(!store.create_if_absent(&slot(1)).await.unwrap());
        assert_eq!(
            UnitSlotRepository::list_by_gathering(&store, "g-1")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn claim_keeps_the_first_participant() {
        let store = InMemoryGatheringStore::new();
        store.create_if_absent(&slot(1)).await.unwrap();

        let first = store.claim("g-1", 1, "p-1", 10).await.unwrap().unwrap();
        let second = store.claim("g-1", 1, "p-2", 20).await.unwrap().unwrap();
        assert_eq!(first.participant_id.as_deref(), Some("p-1"));
        assert_eq!(second.participant_id.as_deref(), Some("p-1"));
        assert_eq!(second.claimed_at_ms, Some(10));
        assert!(store.claim("g-1", 99, "p-1", 10).await.unwrap().is_none());

        let stats = store.participating_stats("g-1").await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_part, Some(12.5));
    }

    #[tokio::test]
    async fn one_valid_ballot_per_participant() {
        let store = InMemoryGatheringStore::new();
        BallotRepository::create(&store, &ballot("b-1", "p-1"))
            .await
            .unwrap();
        let err = BallotRepository::create(&store, &ballot("b-2", "p-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict));

        store.invalidate("b-1", "wrong voter", 5).await.unwrap();
        let err = store.invalidate("b-1", "again", 6).await.unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));

        BallotRepository::create(&store, &ballot("b-2", "p-1"))
            .await
            .unwrap();
        let valid = store
            .find_valid_by_participant("g-1", "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(valid.ballot_id, "b-2");
    }

    fn cached(generation: u64) -> CachedResultsRow {
        CachedResultsRow {
            gathering_id: "g-1".to_string(),
            results_json: "{}".to_string(),
            voting_mode: VotingMode::ByWeight,
            gathering_type: GatheringType::Initial,
            total_possible_weight: 100.0,
            total_possible_count: 4,
            quorum_threshold_percentage: 50.0,
            quorum_met: false,
            computed_at_ms: 1,
            generation,
        }
    }

    #[tokio::test]
    async fn release_and_prune_respect_the_claim_holder() {
        let store = InMemoryGatheringStore::new();
        store.create_if_absent(&slot(1)).await.unwrap();
        store.create_if_absent(&slot(2)).await.unwrap();
        store.claim("g-1", 1, "p-1", 10).await.unwrap();

        assert!(!store.remove_unclaimed("g-1", 1).await.unwrap());
        assert!(!store.release("g-1", 1, "p-2").await.unwrap());
        assert!(store.release("g-1", 1, "p-1").await.unwrap());
        assert!(!store.release("g-1", 1, "p-1").await.unwrap());

        assert!(store.remove_unclaimed("g-1", 2).await.unwrap());
        let units: Vec<i64> = UnitSlotRepository::list_by_gathering(&store, "g-1")
            .await
            .unwrap()
            .into_iter()
            .map(|slot| slot.unit_id)
            .collect();
        assert_eq!(units, vec![1]);
    }

    #[tokio::test]
    async fn stale_results_are_not_cached_after_invalidation() {
        let store = InMemoryGatheringStore::new();
        assert_eq!(store.generation("g-1").await.unwrap(), 0);
        assert!(ResultsCacheRepository::upsert(&store, &cached(0)).await.unwrap());

        ResultsCacheRepository::delete(&store, "g-1").await.unwrap();
        assert_eq!(store.generation("g-1").await.unwrap(), 1);
        assert!(ResultsCacheRepository::get(&store, "g-1").await.unwrap().is_none());

        assert!(!ResultsCacheRepository::upsert(&store, &cached(0)).await.unwrap());
        assert!(ResultsCacheRepository::get(&store, "g-1").await.unwrap().is_none());

        assert!(ResultsCacheRepository::upsert(&store, &cached(1)).await.unwrap());
        let row = ResultsCacheRepository::get(&store, "g-1").await.unwrap().unwrap();
        assert_eq!(row.generation, 1);
    }
}
