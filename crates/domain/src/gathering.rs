use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::audit::{AuditEntry, AuditTrail};
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::jobs::now_ms;
use crate::ports::gatherings::GatheringRepository;
use crate::ports::recompute::RecomputeScheduler;
use crate::recompute::RecomputeJob;
use crate::slots::SlotAllocator;
use crate::stats::StatsService;
use crate::strategy::VotingMode;
use crate::units::Unit;

const MAX_TITLE_LENGTH: usize = 255;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatheringType {
    Initial,
    Repeated,
    Remote,
}

impl GatheringType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Repeated => "repeated",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for GatheringType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initial" => Ok(Self::Initial),
            "repeated" => Ok(Self::Repeated),
            "remote" => Ok(Self::Remote),
            other => Err(DomainError::Validation(format!(
                "invalid gathering type '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatheringStatus {
    Draft,
    Published,
    Active,
    Closed,
    Tallied,
}

impl GatheringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Tallied => "tallied",
        }
    }
}

impl FromStr for GatheringStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "tallied" => Ok(Self::Tallied),
            _ => Err(DomainError::Validation("invalid status".into())),
        }
    }
}

/// Which units may vote. Empty lists do not filter. The custom rule is kept as an
/// annotation and never evaluated.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualificationRule {
    #[serde(default)]
    pub unit_types: Vec<String>,
    #[serde(default)]
    pub floors: Vec<i64>,
    #[serde(default)]
    pub entrances: Vec<i64>,
    #[serde(default)]
    pub custom_rule: Option<String>,
}

impl QualificationRule {
    /// AND across dimensions, OR within one dimension.
    pub fn matches(&self, unit: &Unit) -> bool {
        (self.unit_types.is_empty() || self.unit_types.iter().any(|t| *t == unit.unit_type))
            && (self.floors.is_empty() || self.floors.contains(&unit.floor))
            && (self.entrances.is_empty() || self.entrances.contains(&unit.entrance))
    }

    fn normalized(mut self) -> Self {
        self.unit_types.retain(|value| !value.trim().is_empty());
        self.unit_types.sort();
        self.unit_types.dedup();
        self.floors.sort_unstable();
        self.floors.dedup();
        self.entrances.sort_unstable();
        self.entrances.dedup();
        self.custom_rule = self
            .custom_rule
            .map(|rule| rule.trim().to_string())
            .filter(|rule| !rule.is_empty());
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UnitAggregate {
    pub count: u64,
    pub weight: f64,
    pub area: f64,
}

impl UnitAggregate {
    pub fn add(&mut self, part: f64, area: f64) {
        self.count += 1;
        self.weight += part;
        self.area += area;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Gathering {
    pub gathering_id: String,
    pub association_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub intent: Option<String>,
    pub location: String,
    pub gathering_date_ms: i64,
    pub gathering_type: GatheringType,
    pub voting_mode: VotingMode,
    pub status: GatheringStatus,
    pub qualification: QualificationRule,
    /// `None` until the qualified set has been resolved successfully.
    pub qualified: Option<UnitAggregate>,
    pub participating: Option<UnitAggregate>,
    pub created_by: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Gathering {
    pub fn qualified_or_zero(&self) -> UnitAggregate {
        self.qualified.unwrap_or_default()
    }

    pub fn participating_or_zero(&self) -> UnitAggregate {
        self.participating.unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct GatheringCreate {
    pub title: String,
    pub description: Option<String>,
    pub intent: Option<String>,
    pub location: String,
    pub gathering_date_ms: i64,
    pub gathering_type: String,
    pub voting_mode: Option<String>,
    pub qualification: QualificationRule,
}

/// Lifecycle predicate shared by every operation gated on gathering status.
#[derive(Clone)]
pub struct GatheringGuard {
    gatherings: Arc<dyn GatheringRepository>,
}

impl GatheringGuard {
    pub fn new(gatherings: Arc<dyn GatheringRepository>) -> Self {
        Self { gatherings }
    }

    /// Lookup failures and missing gatherings count as "not in state".
    pub async fn is_in_state(
        &self,
        association_id: i64,
        gathering_id: &str,
        expected: GatheringStatus,
    ) -> bool {
        match self.gatherings.get(association_id, gathering_id).await {
            Ok(Some(gathering)) => gathering.status == expected,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(gathering_id, error = %err, "gathering state lookup failed");
                false
            }
        }
    }

    pub async fn require_state(
        &self,
        association_id: i64,
        gathering_id: &str,
        expected: GatheringStatus,
    ) -> DomainResult<()> {
        if self
            .is_in_state(association_id, gathering_id, expected)
            .await
        {
            Ok(())
        } else {
            Err(DomainError::StateConflict(format!(
                "gathering must be {}",
                expected.as_str()
            )))
        }
    }
}

#[derive(Clone)]
pub struct GatheringService {
    gatherings: Arc<dyn GatheringRepository>,
    stats: StatsService,
    slots: SlotAllocator,
    audit: AuditTrail,
    scheduler: Arc<dyn RecomputeScheduler>,
}

impl GatheringService {
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        stats: StatsService,
        slots: SlotAllocator,
        audit: AuditTrail,
        scheduler: Arc<dyn RecomputeScheduler>,
    ) -> Self {
        Self {
            gatherings,
            stats,
            slots,
            audit,
            scheduler,
        }
    }

    pub async fn create(
        &self,
        actor: &ActorIdentity,
        association_id: i64,
        input: GatheringCreate,
    ) -> DomainResult<Gathering> {
        let (gathering_type, voting_mode) = validate_gathering_create(&input)?;
        let now = now_ms();
        let mut gathering = Gathering {
            gathering_id: crate::util::uuid_v7_without_dashes(),
            association_id,
            title: input.title.trim().to_string(),
            description: non_blank(input.description),
            intent: non_blank(input.intent),
            location: input.location.trim().to_string(),
            gathering_date_ms: input.gathering_date_ms,
            gathering_type,
            voting_mode,
            status: GatheringStatus::Draft,
            qualification: input.qualification.normalized(),
            qualified: None,
            participating: Some(UnitAggregate::default()),
            created_by: actor.user_id.clone(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        let created = self.gatherings.create(&gathering).await?;
        gathering = created;

        match self.stats.refresh_qualified(&gathering).await {
            Ok(aggregate) => gathering.qualified = Some(aggregate),
            Err(err) => tracing::warn!(
                gathering_id = %gathering.gathering_id,
                error = %err,
                "qualified stats unavailable after create"
            ),
        }

        self.audit
            .record(
                AuditEntry::new("gathering", &gathering.gathering_id, "created", actor)
                    .in_gathering(&gathering.gathering_id)
                    .with_details(json!({
                        "title": gathering.title,
                        "gathering_type": gathering.gathering_type.as_str(),
                        "voting_mode": gathering.voting_mode.as_str(),
                    })),
            )
            .await;

        self.slots.sync(&gathering).await.map_err(|err| {
            tracing::error!(
                gathering_id = %gathering.gathering_id,
                error = %err,
                "unit slot sync failed; gathering left without slots"
            );
            err
        })?;

        Ok(gathering)
    }

    pub async fn get(&self, association_id: i64, gathering_id: &str) -> DomainResult<Gathering> {
        self.gatherings
            .get(association_id, gathering_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    pub async fn list(&self, association_id: i64) -> DomainResult<Vec<Gathering>> {
        self.gatherings.list_by_association(association_id).await
    }

    /// Writes any declared status regardless of the current one.
    pub async fn transition_status(
        &self,
        actor: &ActorIdentity,
        association_id: i64,
        gathering_id: &str,
        target: &str,
    ) -> DomainResult<Gathering> {
        let target = target.trim().parse::<GatheringStatus>()?;
        let current = self.get(association_id, gathering_id).await?;
        let updated = self
            .gatherings
            .update_status(gathering_id, target, now_ms())
            .await?;

        self.audit
            .record(
                AuditEntry::new("gathering", gathering_id, "status_changed", actor)
                    .in_gathering(gathering_id)
                    .with_details(json!({
                        "from": current.status.as_str(),
                        "to": target.as_str(),
                    })),
            )
            .await;

        if target == GatheringStatus::Closed {
            self.scheduler.schedule(RecomputeJob::finalize(gathering_id));
        }
        Ok(updated)
    }

    /// Re-resolves the qualified set, stores its aggregate and creates slots for
    /// units that became eligible since the last sync.
    pub async fn refresh_qualification(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<UnitAggregate> {
        let gathering = self.get(association_id, gathering_id).await?;
        let aggregate = self.stats.refresh_qualified(&gathering).await?;
        self.slots.sync(&gathering).await?;
        Ok(aggregate)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn validate_gathering_create(input: &GatheringCreate) -> DomainResult<(GatheringType, VotingMode)> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(DomainError::Validation("title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(DomainError::Validation(format!(
            "title must be at most {MAX_TITLE_LENGTH} characters"
        )));
    }
    if input.location.trim().is_empty() {
        return Err(DomainError::Validation("location is required".into()));
    }
    let gathering_type = input.gathering_type.trim();
    if gathering_type.is_empty() {
        return Err(DomainError::Validation("gathering type is required".into()));
    }
    let gathering_type = gathering_type.parse::<GatheringType>()?;
    let voting_mode = match input.voting_mode.as_deref().map(str::trim) {
        None | Some("") => VotingMode::default(),
        Some(value) => VotingMode::parse(value)
            .ok_or_else(|| DomainError::Validation(format!("invalid voting mode '{value}'")))?,
    };
    Ok((gathering_type, voting_mode))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_gathering() -> Gathering {
        Gathering {
            gathering_id: "g-1".to_string(),
            association_id: 7,
            title: "Annual meeting".to_string(),
            description: None,
            intent: None,
            location: "Lobby".to_string(),
            gathering_date_ms: 1_700_000_000_000,
            gathering_type: GatheringType::Initial,
            voting_mode: VotingMode::ByWeight,
            status: GatheringStatus::Draft,
            qualification: QualificationRule::default(),
            qualified: None,
            participating: None,
            created_by: "manager-1".to_string(),
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn create_input() -> GatheringCreate {
        GatheringCreate {
            title: "Roof repair".to_string(),
            description: Some("  ".to_string()),
            intent: None,
            location: "Hall".to_string(),
            gathering_date_ms: 0,
            gathering_type: "initial".to_string(),
            voting_mode: None,
            qualification: QualificationRule::default(),
        }
    }

    fn unit(unit_type: &str, floor: i64, entrance: i64) -> Unit {
        Unit {
            unit_id: 1,
            association_id: 7,
            building_id: 1,
            cadastral_number: "c-1".to_string(),
            unit_number: "1".to_string(),
            address: "Main st 1".to_string(),
            entrance,
            floor,
            unit_type: unit_type.to_string(),
            area: 50.0,
            part: 0.1,
            room_count: 2,
        }
    }

    #[test]
    fn status_parse_rejects_unknown_values() {
        assert_eq!(
            "closed".parse::<GatheringStatus>().expect("status"),
            GatheringStatus::Closed
        );
        let err = "archived".parse::<GatheringStatus>().expect_err("invalid");
        assert!(matches!(err, DomainError::Validation(msg) if msg == "invalid status"));
    }

    #[test]
    fn rule_filters_conjunctively_across_dimensions() {
        let rule = QualificationRule {
            unit_types: vec!["apartment".to_string(), "office".to_string()],
            floors: vec![2, 3],
            entrances: vec![],
            custom_rule: Some("owners only".to_string()),
        };
        assert!(rule.matches(&unit("apartment", 2, 9)));
        assert!(rule.matches(&unit("office", 3, 1)));
        assert!(!rule.matches(&unit("garage", 2, 1)));
        assert!(!rule.matches(&unit("apartment", 4, 1)));
        assert!(QualificationRule::default().matches(&unit("garage", -1, 0)));
    }

    #[test]
    fn normalized_rule_drops_blank_custom_rule() {
        let rule = QualificationRule {
            unit_types: vec!["office".to_string(), " ".to_string(), "office".to_string()],
            floors: vec![3, 1, 3],
            entrances: vec![],
            custom_rule: Some("   ".to_string()),
        }
        .normalized();
        assert_eq!(rule.unit_types, vec!["office".to_string()]);
        assert_eq!(rule.floors, vec![1, 3]);
        assert_eq!(rule.custom_rule, None);
    }

    #[test]
    fn create_requires_title_location_and_type() {
        let mut input = create_input();
        input.title = " ".to_string();
        let err = validate_gathering_create(&input).expect_err("title");
        assert!(matches!(err, DomainError::Validation(msg) if msg == "title is required"));

        let mut input = create_input();
        input.location = String::new();
        let err = validate_gathering_create(&input).expect_err("location");
        assert!(matches!(err, DomainError::Validation(msg) if msg == "location is required"));

        let mut input = create_input();
        input.gathering_type = "extraordinary".to_string();
        assert!(matches!(
            validate_gathering_create(&input),
            Err(DomainError::Validation(_))
        ));

        let (gathering_type, voting_mode) =
            validate_gathering_create(&create_input()).expect("valid");
        assert_eq!(gathering_type, GatheringType::Initial);
        assert_eq!(voting_mode, VotingMode::ByWeight);
    }
}
