use std::collections::{HashMap, HashSet};
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
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

use crate::db::DbConfig;

const SCHEMA: &str = "\
    DEFINE TABLE IF NOT EXISTS gathering SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS gathering_association ON TABLE gathering FIELDS association_id; \
    DEFINE TABLE IF NOT EXISTS voting_matter SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS voting_matter_gathering ON TABLE voting_matter FIELDS gathering_id; \
    DEFINE TABLE IF NOT EXISTS unit_slot SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS unit_slot_unique ON TABLE unit_slot FIELDS gathering_id, unit_id UNIQUE; \
    DEFINE TABLE IF NOT EXISTS participant SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS participant_gathering ON TABLE participant FIELDS gathering_id; \
    DEFINE TABLE IF NOT EXISTS ballot SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS ballot_valid_key ON TABLE ballot FIELDS valid_key UNIQUE; \
    DEFINE INDEX IF NOT EXISTS ballot_gathering ON TABLE ballot FIELDS gathering_id; \
    DEFINE TABLE IF NOT EXISTS matter_tally SCHEMALESS; \
    DEFINE TABLE IF NOT EXISTS results_cache SCHEMALESS; \
    DEFINE TABLE IF NOT EXISTS results_generation SCHEMALESS; \
    DEFINE TABLE IF NOT EXISTS audit_log SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS audit_log_gathering ON TABLE audit_log FIELDS gathering_id, created_at_ms; \
    DEFINE TABLE IF NOT EXISTS voting_notification SCHEMALESS; \
    DEFINE TABLE IF NOT EXISTS unit SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS unit_association ON TABLE unit FIELDS association_id; \
    DEFINE TABLE IF NOT EXISTS owner SCHEMALESS; \
    DEFINE TABLE IF NOT EXISTS ownership SCHEMALESS; \
    DEFINE INDEX IF NOT EXISTS ownership_owner ON TABLE ownership FIELDS association_id, owner_id;";

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let error_message = err.to_string().to_lowercase();
    if error_message.contains("already exists")
        || error_message.contains("duplicate")
        || error_message.contains("unique")
        || error_message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    DomainError::Collaborator(format!("surreal query failed: {error_message}"))
}

/// Serializes `value` as record content. Absent optionals are dropped so that
/// they read back as NONE rather than NULL.
fn content<T: Serialize>(value: &T) -> DomainResult<Value> {
    let mut value = serde_json::to_value(value)
        .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
    if let Value::Object(fields) = &mut value {
        fields.retain(|_, field| !field.is_null());
    }
    Ok(value)
}

fn decode<T: DeserializeOwned>(rows: Vec<Value>, what: &str) -> DomainResult<Vec<T>> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value::<T>(row)
                .map_err(|err| DomainError::Collaborator(format!("invalid {what} row: {err}")))
        })
        .collect()
}

fn first<T>(mut rows: Vec<T>) -> Option<T> {
    if rows.is_empty() { None } else { Some(rows.swap_remove(0)) }
}

/// Creates tables and indexes. Safe to run on every start.
pub async fn ensure_schema(client: &Surreal<Client>) -> DomainResult<()> {
    client.query(SCHEMA).await.map_err(map_surreal_error)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct BallotRow {
    #[serde(flatten)]
    ballot: Ballot,
    /// Unique while the ballot is valid; rewritten on invalidation.
    valid_key: String,
}

impl BallotRow {
    fn valid_key(gathering_id: &str, participant_id: &str) -> String {
        format!("{gathering_id}:{participant_id}")
    }

    fn from_ballot(ballot: &Ballot) -> Self {
        let valid_key = if ballot.is_valid {
            Self::valid_key(&ballot.gathering_id, &ballot.participant_id)
        } else {
            format!("invalidated:{}", ballot.ballot_id)
        };
        Self {
            ballot: ballot.clone(),
            valid_key,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatsRow {
    #[serde(default)]
    count: u64,
    total_part: Option<f64>,
    total_area: Option<f64>,
}

/// Gathering-side ports over SurrealDB. Slot and ballot uniqueness rest on the
/// UNIQUE indexes from `ensure_schema`.
#[derive(Clone)]
pub struct SurrealGatheringStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealGatheringStore {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let client = db_config.connect().await?;
        ensure_schema(&client).await?;
        Ok(Self { client })
    }

    async fn select<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, Value)>,
        what: &str,
    ) -> DomainResult<Vec<T>> {
        let mut query = self.client.query(sql);
        for (name, value) in binds {
            query = query.bind((name, value));
        }
        let mut response = query.await.map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
        decode(rows, what)
    }

    async fn participant_row(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> DomainResult<Option<Participant>> {
        let rows = self
            .select(
                "SELECT * OMIT id FROM participant \
                 WHERE participant_id = $participant_id AND gathering_id = $gathering_id LIMIT 1",
                vec![
                    ("participant_id", Value::from(participant_id)),
                    ("gathering_id", Value::from(gathering_id)),
                ],
                "participant",
            )
            .await?;
        Ok(first(rows))
    }

    async fn ballot_row(&self, ballot_id: &str) -> DomainResult<Option<Ballot>> {
        let rows: Vec<BallotRow> = self
            .select(
                "SELECT * OMIT id FROM ballot WHERE ballot_id = $ballot_id LIMIT 1",
                vec![("ballot_id", Value::from(ballot_id))],
                "ballot",
            )
            .await?;
        Ok(first(rows).map(|row| row.ballot))
    }

    async fn update_gathering_field(
        &self,
        gathering_id: &str,
        sql: &'static str,
        binds: Vec<(&'static str, Value)>,
    ) -> DomainResult<Gathering> {
        let mut all = vec![("gathering_id", Value::from(gathering_id))];
        all.extend(binds);
        let rows = self.select(sql, all, "gathering").await?;
        first(rows).ok_or(DomainError::NotFound)
    }
}

impl GatheringRepository for SurrealGatheringStore {
    fn create(&self, gathering: &Gathering) -> BoxFuture<'_, DomainResult<Gathering>> {
        let payload = content(gathering);
        let gathering = gathering.clone();
        Box::pin(async move {
            let payload = payload?;
            self.client
                .query("CREATE type::record('gathering', $gathering_id) CONTENT $payload")
                .bind(("gathering_id", gathering.gathering_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
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
            let rows = self
                .select(
                    "SELECT * OMIT id FROM gathering \
                     WHERE gathering_id = $gathering_id AND association_id = $association_id LIMIT 1",
                    vec![
                        ("gathering_id", Value::from(gathering_id)),
                        ("association_id", Value::from(association_id)),
                    ],
                    "gathering",
                )
                .await?;
            Ok(first(rows))
        })
    }

    fn find_by_id(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Option<Gathering>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let rows = self
                .select(
                    "SELECT * OMIT id FROM gathering WHERE gathering_id = $gathering_id LIMIT 1",
                    vec![("gathering_id", Value::from(gathering_id))],
                    "gathering",
                )
                .await?;
            Ok(first(rows))
        })
    }

    fn list_by_association(
        &self,
        association_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<Gathering>>> {
        Box::pin(async move {
            self.select(
                "SELECT * OMIT id FROM gathering WHERE association_id = $association_id \
                 ORDER BY gathering_date_ms DESC, gathering_id DESC",
                vec![("association_id", Value::from(association_id))],
                "gathering",
            )
            .await
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
            self.update_gathering_field(
                &gathering_id,
                "UPDATE gathering SET status = $status, updated_at_ms = $updated_at_ms \
                 WHERE gathering_id = $gathering_id RETURN AFTER",
                vec![
                    ("status", Value::from(status.as_str())),
                    ("updated_at_ms", Value::from(updated_at_ms)),
                ],
            )
            .await
        })
    }

    fn update_qualified_stats(
        &self,
        gathering_id: &str,
        aggregate: &UnitAggregate,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        let aggregate = content(aggregate);
        Box::pin(async move {
            self.update_gathering_field(
                &gathering_id,
                "UPDATE gathering SET qualified = $aggregate \
                 WHERE gathering_id = $gathering_id RETURN AFTER",
                vec![("aggregate", aggregate?)],
            )
            .await?;
            Ok(())
        })
    }

    fn update_participation_stats(
        &self,
        gathering_id: &str,
        aggregate: &UnitAggregate,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        let aggregate = content(aggregate);
        Box::pin(async move {
            self.update_gathering_field(
                &gathering_id,
                "UPDATE gathering SET participating = $aggregate \
                 WHERE gathering_id = $gathering_id RETURN AFTER",
                vec![("aggregate", aggregate?)],
            )
            .await?;
            Ok(())
        })
    }
}

impl VotingMatterRepository for SurrealGatheringStore {
    fn create(&self, matter: &VotingMatter) -> BoxFuture<'_, DomainResult<VotingMatter>> {
        let payload = content(matter);
        let matter = matter.clone();
        Box::pin(async move {
            self.client
                .query("CREATE type::record('voting_matter', $matter_id) CONTENT $payload")
                .bind(("matter_id", matter.matter_id.clone()))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
            Ok(matter)
        })
    }

    fn update(&self, matter: &VotingMatter) -> BoxFuture<'_, DomainResult<VotingMatter>> {
        let payload = content(matter);
        let matter_id = matter.matter_id.clone();
        let gathering_id = matter.gathering_id.clone();
        Box::pin(async move {
            let rows = self
                .select(
                    "UPDATE voting_matter CONTENT $payload \
                     WHERE matter_id = $matter_id AND gathering_id = $gathering_id RETURN AFTER",
                    vec![
                        ("payload", payload?),
                        ("matter_id", Value::from(matter_id)),
                        ("gathering_id", Value::from(gathering_id)),
                    ],
                    "voting matter",
                )
                .await?;
            first(rows).ok_or(DomainError::NotFound)
        })
    }

    fn delete(&self, gathering_id: &str, matter_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        let matter_id = matter_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "DELETE voting_matter WHERE matter_id = $matter_id AND gathering_id = $gathering_id \
                     RETURN BEFORE; \
                     DELETE matter_tally WHERE matter_id = $matter_id AND gathering_id = $gathering_id;",
                )
                .bind(("matter_id", matter_id))
                .bind(("gathering_id", gathering_id))
                .await
                .map_err(map_surreal_error)?;
            let removed: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            if removed.is_empty() {
                return Err(DomainError::NotFound);
            }
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
            let rows = self
                .select(
                    "SELECT * OMIT id FROM voting_matter \
                     WHERE matter_id = $matter_id AND gathering_id = $gathering_id LIMIT 1",
                    vec![
                        ("matter_id", Value::from(matter_id)),
                        ("gathering_id", Value::from(gathering_id)),
                    ],
                    "voting matter",
                )
                .await?;
            Ok(first(rows))
        })
    }

    fn list_by_gathering(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<VotingMatter>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            self.select(
                "SELECT * OMIT id FROM voting_matter WHERE gathering_id = $gathering_id \
                 ORDER BY order_index ASC, matter_id ASC",
                vec![("gathering_id", Value::from(gathering_id))],
                "voting matter",
            )
            .await
        })
    }
}

impl UnitSlotRepository for SurrealGatheringStore {
    fn create_if_absent(&self, slot: &UnitSlot) -> BoxFuture<'_, DomainResult<bool>> {
        let payload = content(slot);
        let record_key = format!("{}_{}", slot.gathering_id, slot.unit_id);
        Box::pin(async move {
            let created = self
                .client
                .query("CREATE type::record('unit_slot', $record_key) CONTENT $payload")
                .bind(("record_key", record_key))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)
                .and_then(|mut response| {
                    response
                        .take::<Vec<Value>>(0)
                        .map_err(map_surreal_error)
                });
            match created {
                Ok(_) => Ok(true),
                Err(DomainError::Conflict) => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn claim(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
        claimed_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<UnitSlot>>> {
        let gathering_id = gathering_id.to_string();
        let participant_id = participant_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "UPDATE unit_slot SET participant_id = $participant_id, claimed_at_ms = $claimed_at_ms \
                     WHERE gathering_id = $gathering_id AND unit_id = $unit_id AND participant_id IS NONE; \
                     SELECT * OMIT id FROM unit_slot \
                     WHERE gathering_id = $gathering_id AND unit_id = $unit_id LIMIT 1;",
                )
                .bind(("participant_id", participant_id))
                .bind(("claimed_at_ms", claimed_at_ms))
                .bind(("gathering_id", gathering_id))
                .bind(("unit_id", unit_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(1).map_err(map_surreal_error)?;
            Ok(first(decode(rows, "unit slot")?))
        })
    }

    fn release(
        &self,
        gathering_id: &str,
        unit_id: i64,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let gathering_id = gathering_id.to_string();
        let participant_id = participant_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "UPDATE unit_slot SET participant_id = NONE, claimed_at_ms = NONE \
                     WHERE gathering_id = $gathering_id AND unit_id = $unit_id \
                     AND participant_id = $participant_id RETURN AFTER;",
                )
                .bind(("gathering_id", gathering_id))
                .bind(("unit_id", unit_id))
                .bind(("participant_id", participant_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            Ok(!rows.is_empty())
        })
    }

    fn remove_unclaimed(
        &self,
        gathering_id: &str,
        unit_id: i64,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let rows: Vec<Value> = self
                .client
                .query(
                    "DELETE unit_slot WHERE gathering_id = $gathering_id AND unit_id = $unit_id \
                     AND participant_id IS NONE RETURN BEFORE;",
                )
                .bind(("gathering_id", gathering_id))
                .bind(("unit_id", unit_id))
                .await
                .map_err(map_surreal_error)?
                .take(0)
                .map_err(map_surreal_error)?;
            Ok(!rows.is_empty())
        })
    }

    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<UnitSlot>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            self.select(
                "SELECT * OMIT id FROM unit_slot WHERE gathering_id = $gathering_id ORDER BY unit_id ASC",
                vec![("gathering_id", Value::from(gathering_id))],
                "unit slot",
            )
            .await
        })
    }

    fn participating_stats(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<StoredUnitStats>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let rows: Vec<StatsRow> = self
                .select(
                    "SELECT count() AS count, math::sum(part) AS total_part, math::sum(area) AS total_area \
                     FROM unit_slot WHERE gathering_id = $gathering_id AND participant_id IS NOT NONE \
                     GROUP ALL",
                    vec![("gathering_id", Value::from(gathering_id))],
                    "slot stats",
                )
                .await?;
            let row = first(rows).unwrap_or_default();
            Ok(StoredUnitStats {
                count: row.count,
                total_part: row.total_part,
                total_area: row.total_area,
            })
        })
    }
}

impl ParticipantRepository for SurrealGatheringStore {
    fn create(&self, participant: &Participant) -> BoxFuture<'_, DomainResult<Participant>> {
        let payload = content(participant);
        let participant = participant.clone();
        Box::pin(async move {
            self.client
                .query("CREATE type::record('participant', $participant_id) CONTENT $payload")
                .bind(("participant_id", participant.participant_id.clone()))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
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
        Box::pin(async move { self.participant_row(&gathering_id, &participant_id).await })
    }

    fn list_by_gathering(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Participant>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            self.select(
                "SELECT * OMIT id FROM participant WHERE gathering_id = $gathering_id \
                 ORDER BY created_at_ms ASC, participant_id ASC",
                vec![("gathering_id", Value::from(gathering_id))],
                "participant",
            )
            .await
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
            let rows: Vec<Participant> = self
                .select(
                    "UPDATE participant SET checked_in_at_ms = $checked_in_at_ms \
                     WHERE participant_id = $participant_id AND gathering_id = $gathering_id \
                     AND checked_in_at_ms IS NONE RETURN AFTER",
                    vec![
                        ("checked_in_at_ms", Value::from(checked_in_at_ms)),
                        ("participant_id", Value::from(participant_id.as_str())),
                        ("gathering_id", Value::from(gathering_id.as_str())),
                    ],
                    "participant",
                )
                .await?;
            if let Some(participant) = first(rows) {
                return Ok(participant);
            }
            match self.participant_row(&gathering_id, &participant_id).await? {
                Some(_) => Err(DomainError::StateConflict(
                    "participant already checked in".into(),
                )),
                None => Err(DomainError::NotFound),
            }
        })
    }
}

impl BallotRepository for SurrealGatheringStore {
    fn create(&self, ballot: &Ballot) -> BoxFuture<'_, DomainResult<Ballot>> {
        let payload = content(&BallotRow::from_ballot(ballot));
        let ballot = ballot.clone();
        Box::pin(async move {
            self.client
                .query("CREATE type::record('ballot', $ballot_id) CONTENT $payload")
                .bind(("ballot_id", ballot.ballot_id.clone()))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
            Ok(ballot)
        })
    }

    fn get(&self, ballot_id: &str) -> BoxFuture<'_, DomainResult<Option<Ballot>>> {
        let ballot_id = ballot_id.to_string();
        Box::pin(async move { self.ballot_row(&ballot_id).await })
    }

    fn find_valid_by_participant(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Ballot>>> {
        let valid_key = BallotRow::valid_key(gathering_id, participant_id);
        Box::pin(async move {
            let rows: Vec<BallotRow> = self
                .select(
                    "SELECT * OMIT id FROM ballot WHERE valid_key = $valid_key LIMIT 1",
                    vec![("valid_key", Value::from(valid_key))],
                    "ballot",
                )
                .await?;
            Ok(first(rows).map(|row| row.ballot))
        })
    }

    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<Ballot>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let rows: Vec<BallotRow> = self
                .select(
                    "SELECT * OMIT id FROM ballot WHERE gathering_id = $gathering_id \
                     ORDER BY submitted_at_ms ASC, ballot_id ASC",
                    vec![("gathering_id", Value::from(gathering_id))],
                    "ballot",
                )
                .await?;
            Ok(rows.into_iter().map(|row| row.ballot).collect())
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
            let rows: Vec<BallotRow> = self
                .select(
                    "UPDATE ballot SET is_valid = false, invalidation_reason = $reason, \
                     invalidated_at_ms = $invalidated_at_ms, valid_key = $released_key \
                     WHERE ballot_id = $ballot_id AND is_valid = true RETURN AFTER",
                    vec![
                        ("reason", Value::from(reason)),
                        ("invalidated_at_ms", Value::from(invalidated_at_ms)),
                        ("released_key", Value::from(format!("invalidated:{ballot_id}"))),
                        ("ballot_id", Value::from(ballot_id.as_str())),
                    ],
                    "ballot",
                )
                .await?;
            if let Some(row) = first(rows) {
                return Ok(row.ballot);
            }
            match self.ballot_row(&ballot_id).await? {
                Some(_) => Err(DomainError::StateConflict("ballot already invalidated".into())),
                None => Err(DomainError::NotFound),
            }
        })
    }

    fn voted_stats(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<StoredUnitStats>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT VALUE participant_id FROM ballot \
                     WHERE gathering_id = $gathering_id AND is_valid = true; \
                     SELECT * OMIT id FROM participant WHERE gathering_id = $gathering_id;",
                )
                .bind(("gathering_id", gathering_id))
                .await
                .map_err(map_surreal_error)?;
            let voters: Vec<String> = response.take(0).map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(1).map_err(map_surreal_error)?;
            let participants: Vec<Participant> = decode(rows, "participant")?;
            let voters: HashSet<String> = voters.into_iter().collect();

            let mut stats = StoredUnitStats::default();
            for participant in participants
                .iter()
                .filter(|participant| voters.contains(&participant.participant_id))
            {
                stats.count += participant.unit_ids.len() as u64;
                *stats.total_part.get_or_insert(0.0) += participant.units_part;
                *stats.total_area.get_or_insert(0.0) += participant.units_area;
            }
            Ok(stats)
        })
    }
}

impl TallyRepository for SurrealGatheringStore {
    fn upsert(&self, tally: &MatterTally) -> BoxFuture<'_, DomainResult<()>> {
        let payload = content(tally);
        let record_key = format!("{}_{}", tally.gathering_id, tally.matter_id);
        Box::pin(async move {
            self.client
                .query("UPSERT type::record('matter_tally', $record_key) CONTENT $payload")
                .bind(("record_key", record_key))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }

    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<MatterTally>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            self.select(
                "SELECT * OMIT id FROM matter_tally WHERE gathering_id = $gathering_id ORDER BY matter_id ASC",
                vec![("gathering_id", Value::from(gathering_id))],
                "tally",
            )
            .await
        })
    }

    fn delete_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            self.client
                .query("DELETE matter_tally WHERE gathering_id = $gathering_id")
                .bind(("gathering_id", gathering_id))
                .await
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }
}

impl ResultsCacheRepository for SurrealGatheringStore {
    fn generation(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<u64>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let generations: Vec<u64> = self
                .client
                .query(
                    "SELECT VALUE generation FROM results_generation \
                     WHERE gathering_id = $gathering_id LIMIT 1",
                )
                .bind(("gathering_id", gathering_id))
                .await
                .map_err(map_surreal_error)?
                .take(0)
                .map_err(map_surreal_error)?;
            Ok(first(generations).unwrap_or_default())
        })
    }

    fn upsert(&self, row: &CachedResultsRow) -> BoxFuture<'_, DomainResult<bool>> {
        let payload = content(row);
        let gathering_id = row.gathering_id.clone();
        let generation = row.generation;
        Box::pin(async move {
            // One statement, so the generation check and the write share a transaction.
            let stored: Option<bool> = self
                .client
                .query(
                    "IF (type::record('results_generation', $gathering_id).generation ?? 0) = $generation { \
                         UPSERT type::record('results_cache', $gathering_id) CONTENT $payload RETURN NONE; \
                         RETURN true; \
                     } ELSE { \
                         RETURN false; \
                     };",
                )
                .bind(("gathering_id", gathering_id))
                .bind(("generation", generation))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take(0)
                .map_err(map_surreal_error)?;
            Ok(stored.unwrap_or(false))
        })
    }

    fn get(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Option<CachedResultsRow>>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            let rows = self
                .select(
                    "SELECT * OMIT id FROM results_cache WHERE gathering_id = $gathering_id LIMIT 1",
                    vec![("gathering_id", Value::from(gathering_id))],
                    "results cache",
                )
                .await?;
            Ok(first(rows))
        })
    }

    fn delete(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let gathering_id = gathering_id.to_string();
        Box::pin(async move {
            // Bump before deleting so a writer holding the old generation cannot slip in between.
            self.client
                .query(
                    "UPSERT type::record('results_generation', $gathering_id) \
                     SET gathering_id = $gathering_id, generation = (generation ?? 0) + 1 RETURN NONE; \
                     DELETE results_cache WHERE gathering_id = $gathering_id;",
                )
                .bind(("gathering_id", gathering_id))
                .await
                .map_err(map_surreal_error)?
                .check()
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
struct OwnershipRow {
    owner_id: i64,
    unit_id: i64,
}

/// Reads the association inventory from the `unit`, `owner` and `ownership`
/// tables. Only rows flagged `is_active` take part.
#[derive(Clone)]
pub struct SurrealUnitInventory {
    client: Arc<Surreal<Client>>,
}

impl SurrealUnitInventory {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn active_units(&self, association_id: i64) -> DomainResult<Vec<Unit>> {
        let mut response = self
            .client
            .query(
                "SELECT * OMIT id, is_active FROM unit \
                 WHERE association_id = $association_id AND is_active = true ORDER BY unit_id ASC",
            )
            .bind(("association_id", association_id))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
        decode(rows, "unit")
    }

    async fn active_links(
        &self,
        association_id: i64,
        owner_id: Option<i64>,
    ) -> DomainResult<Vec<OwnershipRow>> {
        let mut response = self
            .client
            .query(
                "SELECT owner_id, unit_id FROM ownership \
                 WHERE association_id = $association_id AND is_active = true \
                 AND ($owner_id IS NONE OR owner_id = $owner_id)",
            )
            .bind(("association_id", association_id))
            .bind(("owner_id", owner_id))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
        decode(rows, "ownership")
    }
}

impl UnitInventory for SurrealUnitInventory {
    fn qualified_units(
        &self,
        association_id: i64,
        rule: &QualificationRule,
    ) -> BoxFuture<'_, DomainResult<Vec<Unit>>> {
        let rule = rule.clone();
        Box::pin(async move {
            let units = self.active_units(association_id).await?;
            Ok(units.into_iter().filter(|unit| rule.matches(unit)).collect())
        })
    }

    fn owner(
        &self,
        association_id: i64,
        owner_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Owner>>> {
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT owner_id, association_id, name, identification_number FROM owner \
                     WHERE owner_id = $owner_id AND association_id = $association_id LIMIT 1",
                )
                .bind(("owner_id", owner_id))
                .bind(("association_id", association_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            Ok(first(decode(rows, "owner")?))
        })
    }

    fn owner_active_units(
        &self,
        association_id: i64,
        owner_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<Unit>>> {
        Box::pin(async move {
            let owned: HashSet<i64> = self
                .active_links(association_id, Some(owner_id))
                .await?
                .into_iter()
                .map(|link| link.unit_id)
                .collect();
            let units = self.active_units(association_id).await?;
            Ok(units
                .into_iter()
                .filter(|unit| owned.contains(&unit.unit_id))
                .collect())
        })
    }

    fn active_ownerships(&self, association_id: i64) -> BoxFuture<'_, DomainResult<Vec<OwnerUnit>>> {
        Box::pin(async move {
            let links = self.active_links(association_id, None).await?;
            let active: HashSet<i64> = self
                .active_units(association_id)
                .await?
                .into_iter()
                .map(|unit| unit.unit_id)
                .collect();
            let mut response = self
                .client
                .query(
                    "SELECT owner_id, association_id, name, identification_number FROM owner \
                     WHERE association_id = $association_id",
                )
                .bind(("association_id", association_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            let owners: HashMap<i64, Owner> = decode::<Owner>(rows, "owner")?
                .into_iter()
                .map(|owner| (owner.owner_id, owner))
                .collect();
            Ok(links
                .into_iter()
                .filter(|link| active.contains(&link.unit_id))
                .filter_map(|link| {
                    owners.get(&link.owner_id).map(|owner| OwnerUnit {
                        owner: owner.clone(),
                        unit_id: link.unit_id,
                    })
                })
                .collect())
        })
    }
}

#[derive(Clone)]
pub struct SurrealAuditLog {
    client: Arc<Surreal<Client>>,
}

impl SurrealAuditLog {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl AuditLogSink for SurrealAuditLog {
    fn append(&self, entry: &AuditEntry) -> BoxFuture<'_, DomainResult<()>> {
        let payload = content(entry);
        let entry_id = entry.entry_id.clone();
        Box::pin(async move {
            self.client
                .query("CREATE type::record('audit_log', $entry_id) CONTENT $payload")
                .bind(("entry_id", entry_id))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
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
            let mut response = self
                .client
                .query(
                    "SELECT * OMIT id FROM audit_log WHERE gathering_id = $gathering_id \
                     ORDER BY created_at_ms DESC, entry_id DESC LIMIT $limit",
                )
                .bind(("gathering_id", gathering_id))
                .bind(("limit", limit as i64))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(map_surreal_error)?;
            decode(rows, "audit")
        })
    }
}

/// Persists each notification to `voting_notification`; delivery channels read
/// from that table.
#[derive(Clone)]
pub struct SurrealNotificationOutbox {
    client: Arc<Surreal<Client>>,
}

impl SurrealNotificationOutbox {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl NotificationSender for SurrealNotificationOutbox {
    fn send(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<()>> {
        let payload = content(notification);
        let notification_id = notification.notification_id.clone();
        Box::pin(async move {
            self.client
                .query("CREATE type::record('voting_notification', $notification_id) CONTENT $payload")
                .bind(("notification_id", notification_id))
                .bind(("payload", payload?))
                .await
                .map_err(map_surreal_error)?
                .take::<Vec<Value>>(0)
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }
}
