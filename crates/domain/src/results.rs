use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::gathering::{Gathering, GatheringStatus, GatheringType, UnitAggregate};
use crate::jobs::now_ms;
use crate::matters::{MajorityRule, MatterType, VotingConfig, VotingMatter};
use crate::ports::gatherings::GatheringRepository;
use crate::ports::matters::VotingMatterRepository;
use crate::ports::results::{CachedResultsRow, ResultsCacheRepository};
use crate::ports::slots::UnitSlotRepository;
use crate::quorum::{QuorumInfo, calculate_if_passed, calculate_quorum};
use crate::slots::UnitSlot;
use crate::stats::StatsService;
use crate::strategy::{VotingMode, WeightedUnit};
use crate::tally::{ABSTAIN, MatterTally, NO, TallyService, YES};
use crate::util::{percentage, round3};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChoiceResult {
    pub choice: String,
    pub label: String,
    pub count: u64,
    pub units: u64,
    pub weight: f64,
    pub area: f64,
    pub count_percentage: f64,
    pub percent_of_cast: f64,
    pub percent_of_qualified: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatterResult {
    pub matter_id: String,
    pub order_index: i32,
    pub title: String,
    pub matter_type: MatterType,
    pub voting_config: VotingConfig,
    pub choices: Vec<ChoiceResult>,
    pub total_voted: f64,
    pub total_abstained: f64,
    pub leading_choice: Option<String>,
    pub is_passed: bool,
    pub outcome: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GatheringSummary {
    pub qualified: UnitAggregate,
    pub participating: UnitAggregate,
    pub voted: UnitAggregate,
    /// Participating over qualified units.
    pub participation_rate: f64,
    /// Voted over participating units.
    pub voting_completion_rate: f64,
    pub participation_rate_by_weight: f64,
    pub voting_completion_rate_by_weight: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VoteResults {
    pub gathering_id: String,
    pub status: GatheringStatus,
    pub voting_mode: VotingMode,
    pub gathering_type: GatheringType,
    pub quorum: QuorumInfo,
    pub summary: GatheringSummary,
    pub matters: Vec<MatterResult>,
    pub computed_at_ms: i64,
}

pub fn summarize(
    qualified: UnitAggregate,
    participating: UnitAggregate,
    voted: UnitAggregate,
) -> GatheringSummary {
    GatheringSummary {
        participation_rate: round3(percentage(
            participating.count as f64,
            qualified.count as f64,
        )),
        voting_completion_rate: round3(percentage(voted.count as f64, participating.count as f64)),
        participation_rate_by_weight: round3(percentage(participating.weight, qualified.weight)),
        voting_completion_rate_by_weight: round3(percentage(voted.weight, participating.weight)),
        qualified,
        participating,
        voted,
    }
}

/// Builds the read model for one matter from its tally.
pub fn matter_result(matter: &VotingMatter, tally: &MatterTally, qualified_weight: f64) -> MatterResult {
    let choices = ordered_choice_keys(matter, tally)
        .into_iter()
        .filter_map(|key| {
            tally.choices.get(&key).map(|choice| ChoiceResult {
                label: matter.choice_label(&key),
                count: choice.count,
                units: choice.units,
                weight: choice.weight,
                area: choice.area,
                count_percentage: choice.count_percentage,
                percent_of_cast: choice.percent_of_cast,
                percent_of_qualified: round3(percentage(choice.weight, qualified_weight)),
                choice: key,
            })
        })
        .collect();
    let is_passed = calculate_if_passed(
        tally,
        matter.matter_type,
        &matter.voting_config,
        qualified_weight,
    );
    let leading_choice = tally.leading_choice().map(|(key, _)| key.to_string());
    let outcome = outcome_label(matter, leading_choice.as_deref(), is_passed);
    MatterResult {
        matter_id: matter.matter_id.clone(),
        order_index: matter.order_index,
        title: matter.title.clone(),
        matter_type: matter.matter_type,
        voting_config: matter.voting_config.clone(),
        choices,
        total_voted: tally.total_voted(),
        total_abstained: tally.total_abstained(),
        leading_choice,
        is_passed,
        outcome,
    }
}

fn ordered_choice_keys(matter: &VotingMatter, tally: &MatterTally) -> Vec<String> {
    let mut keys: Vec<String> = match matter.matter_type {
        MatterType::YesNo => vec![YES.to_string(), NO.to_string()],
        MatterType::SingleChoice | MatterType::MultipleChoice => matter
            .voting_config
            .options
            .iter()
            .map(|option| option.id.clone())
            .collect(),
    };
    keys.push(ABSTAIN.to_string());
    for key in tally.choices.keys() {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

fn outcome_label(matter: &VotingMatter, leading: Option<&str>, is_passed: bool) -> String {
    if matter.voting_config.required_majority == MajorityRule::Informative {
        return "informative".to_string();
    }
    match matter.matter_type {
        MatterType::YesNo if is_passed => "approved".to_string(),
        MatterType::YesNo => "rejected".to_string(),
        MatterType::SingleChoice | MatterType::MultipleChoice => match leading {
            Some(key) if is_passed => format!("approved: {}", matter.choice_label(key)),
            Some(key) => format!("no majority reached (leading: {})", matter.choice_label(key)),
            None => "no votes".to_string(),
        },
    }
}

fn aggregate_slots<'a>(slots: impl Iterator<Item = &'a UnitSlot>) -> UnitAggregate {
    let mut aggregate = UnitAggregate::default();
    for slot in slots {
        aggregate.add(slot.part, slot.area);
    }
    aggregate
}

#[derive(Clone)]
pub struct ResultsService {
    gatherings: Arc<dyn GatheringRepository>,
    matters: Arc<dyn VotingMatterRepository>,
    slots: Arc<dyn UnitSlotRepository>,
    stats: StatsService,
    tallies: TallyService,
    cache: Arc<dyn ResultsCacheRepository>,
}

impl ResultsService {
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        matters: Arc<dyn VotingMatterRepository>,
        slots: Arc<dyn UnitSlotRepository>,
        stats: StatsService,
        tallies: TallyService,
        cache: Arc<dyn ResultsCacheRepository>,
    ) -> Self {
        Self {
            gatherings,
            matters,
            slots,
            stats,
            tallies,
            cache,
        }
    }

    pub async fn get_or_compute(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<VoteResults> {
        let gathering = self
            .gatherings
            .get(association_id, gathering_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        match self.cache.get(gathering_id).await {
            Ok(Some(row)) => match serde_json::from_str::<VoteResults>(&row.results_json) {
                Ok(results) => return Ok(results),
                Err(err) => {
                    tracing::warn!(gathering_id, error = %err, "cached results unreadable; recomputing");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(gathering_id, error = %err, "results cache read failed; recomputing");
            }
        }
        self.compute_and_store(&gathering).await
    }

    pub async fn compute_and_store(&self, gathering: &Gathering) -> DomainResult<VoteResults> {
        let generation = match self.cache.generation(&gathering.gathering_id).await {
            Ok(generation) => Some(generation),
            Err(err) => {
                tracing::warn!(gathering_id = %gathering.gathering_id, error = %err, "results cache generation unavailable");
                None
            }
        };
        let results = self.compute(gathering).await?;
        let Some(generation) = generation else {
            return Ok(results);
        };
        match serde_json::to_string(&results) {
            Ok(results_json) => {
                let row = CachedResultsRow {
                    gathering_id: gathering.gathering_id.clone(),
                    results_json,
                    voting_mode: results.voting_mode,
                    gathering_type: results.gathering_type,
                    total_possible_weight: results.quorum.total_possible.weight,
                    total_possible_count: results.quorum.total_possible.count,
                    quorum_threshold_percentage: results.quorum.threshold_percentage,
                    quorum_met: results.quorum.met,
                    computed_at_ms: results.computed_at_ms,
                    generation,
                };
                match self.cache.upsert(&row).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(gathering_id = %gathering.gathering_id, "results changed while computing; snapshot not cached");
                    }
                    Err(err) => {
                        tracing::warn!(gathering_id = %gathering.gathering_id, error = %err, "results cache write failed");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(gathering_id = %gathering.gathering_id, error = %err, "results serialization failed");
            }
        }
        Ok(results)
    }

    pub async fn compute(&self, gathering: &Gathering) -> DomainResult<VoteResults> {
        let gathering_id = gathering.gathering_id.as_str();
        let matters = self.matters.list_by_gathering(gathering_id).await?;
        let mut tallies: HashMap<String, MatterTally> = self
            .tallies
            .list(gathering_id)
            .await?
            .into_iter()
            .map(|tally| (tally.matter_id.clone(), tally))
            .collect();
        if matters
            .iter()
            .any(|matter| !tallies.contains_key(&matter.matter_id))
        {
            tallies = self
                .tallies
                .refresh(gathering_id)
                .await?
                .into_iter()
                .map(|tally| (tally.matter_id.clone(), tally))
                .collect();
        }

        let slots = self.slots.list_by_gathering(gathering_id).await?;
        let qualified_units: Vec<WeightedUnit> = slots.iter().map(UnitSlot::weighted).collect();
        let participated_units: Vec<WeightedUnit> = slots
            .iter()
            .filter(|slot| slot.is_claimed())
            .map(UnitSlot::weighted)
            .collect();
        let qualified = aggregate_slots(slots.iter());
        let participating = aggregate_slots(slots.iter().filter(|slot| slot.is_claimed()));
        let voted = self.stats.voted(gathering_id).await?;

        let quorum = calculate_quorum(gathering, &qualified_units, &participated_units, &voted);
        let matters = matters
            .iter()
            .map(|matter| match tallies.get(&matter.matter_id) {
                Some(tally) => matter_result(matter, tally, qualified.weight),
                None => {
                    let empty = MatterTally {
                        gathering_id: gathering_id.to_string(),
                        matter_id: matter.matter_id.clone(),
                        choices: crate::tally::seed_choices(matter),
                        computed_at_ms: now_ms(),
                    };
                    matter_result(matter, &empty, qualified.weight)
                }
            })
            .collect();

        Ok(VoteResults {
            gathering_id: gathering_id.to_string(),
            status: gathering.status,
            voting_mode: gathering.voting_mode,
            gathering_type: gathering.gathering_type,
            quorum,
            summary: summarize(qualified, participating, voted),
            matters,
            computed_at_ms: now_ms(),
        })
    }

    /// Drops the cached snapshot. A missing snapshot is fine.
    pub async fn invalidate(&self, gathering_id: &str) -> DomainResult<()> {
        self.cache.delete(gathering_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matters::tests::{choice_matter, option, yes_no_matter};
    use crate::tally::ChoiceTally;
    use std::collections::BTreeMap;

    fn tally_of(matter_id: &str, entries: &[(&str, u64, f64)]) -> MatterTally {
        let choices: BTreeMap<String, ChoiceTally> = entries
            .iter()
            .map(|(key, count, weight)| {
                (
                    key.to_string(),
                    ChoiceTally {
                        count: *count,
                        units: *count,
                        weight: *weight,
                        ..ChoiceTally::default()
                    },
                )
            })
            .collect();
        MatterTally {
            gathering_id: "g-1".to_string(),
            matter_id: matter_id.to_string(),
            choices,
            computed_at_ms: 0,
        }
    }

    #[test]
    fn yes_no_outcome_and_qualified_percentages() {
        let matter = yes_no_matter("m-1", MajorityRule::Simple);
        let tally = tally_of("m-1", &[("yes", 2, 20.0), ("no", 1, 10.0)]);
        let result = matter_result(&matter, &tally, 60.0);
        assert!(!result.is_passed);
        assert_eq!(result.outcome, "rejected");
        assert_eq!(result.choices[0].choice, "yes");
        assert_eq!(result.choices[0].percent_of_qualified, 33.333);
        assert_eq!(result.choices[1].choice, "no");

        let passed = matter_result(&matter, &tally, 30.0);
        assert!(passed.is_passed);
        assert_eq!(passed.outcome, "approved");
    }

    #[test]
    fn choice_outcome_names_the_leading_option() {
        let matter = choice_matter("m-2", vec![option("a", "Alpha"), option("b", "Beta")]);
        let winning = tally_of("m-2", &[("a", 1, 10.0), ("b", 3, 30.0)]);
        let result = matter_result(&matter, &winning, 40.0);
        assert_eq!(result.outcome, "approved: Beta");
        assert_eq!(result.leading_choice.as_deref(), Some("b"));
        assert_eq!(result.choices[0].label, "Alpha");

        let split = tally_of("m-2", &[("a", 1, 20.0), ("b", 1, 20.0)]);
        let result = matter_result(&matter, &split, 40.0);
        assert_eq!(result.outcome, "no majority reached (leading: Alpha)");

        let empty = tally_of("m-2", &[("a", 0, 0.0), ("b", 0, 0.0)]);
        assert_eq!(matter_result(&matter, &empty, 40.0).outcome, "no votes");
    }

    #[test]
    fn informative_matters_report_informative() {
        let matter = yes_no_matter("m-3", MajorityRule::Informative);
        let tally = tally_of("m-3", &[("yes", 0, 0.0), ("no", 1, 5.0)]);
        let result = matter_result(&matter, &tally, 40.0);
        assert!(result.is_passed);
        assert_eq!(result.outcome, "informative");
    }

    #[test]
    fn summary_rates_guard_empty_denominators() {
        let summary = summarize(
            UnitAggregate::default(),
            UnitAggregate::default(),
            UnitAggregate::default(),
        );
        assert_eq!(summary.participation_rate, 0.0);
        assert_eq!(summary.voting_completion_rate, 0.0);

        let summary = summarize(
            UnitAggregate { count: 4, weight: 40.0, area: 400.0 },
            UnitAggregate { count: 3, weight: 30.0, area: 300.0 },
            UnitAggregate { count: 1, weight: 10.0, area: 100.0 },
        );
        assert_eq!(summary.participation_rate, 75.0);
        assert_eq!(summary.voting_completion_rate, 33.333);
        assert_eq!(summary.participation_rate_by_weight, 75.0);
    }
}
