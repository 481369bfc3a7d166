use serde::{Deserialize, Serialize};

use crate::gathering::{Gathering, GatheringType, UnitAggregate};
use crate::participants::Participant;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VotingMode {
    #[default]
    ByWeight,
    ByUnit,
}

impl VotingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByWeight => "by_weight",
            Self::ByUnit => "by_unit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "by_weight" => Some(Self::ByWeight),
            "by_unit" => Some(Self::ByUnit),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ByWeight => "Vote by weight",
            Self::ByUnit => "Vote by unit",
        }
    }
}

/// The slice of a unit the counting rules care about.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightedUnit {
    pub unit_id: i64,
    pub part: f64,
    pub area: f64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TotalPossibleVotes {
    pub weight: f64,
    pub count: u64,
}

pub trait VotingStrategy: Send + Sync {
    fn mode(&self) -> VotingMode;

    fn vote_weight(&self, participant: &Participant) -> f64;

    /// Value compared against the quorum for an aggregate of units.
    fn primary_metric(&self, aggregate: &UnitAggregate) -> f64;

    fn primary_total(&self, total: &TotalPossibleVotes) -> f64;

    fn total_possible_votes(
        &self,
        gathering: &Gathering,
        qualified: &[WeightedUnit],
        participated: &[WeightedUnit],
    ) -> TotalPossibleVotes {
        let units = denominator_units(gathering.gathering_type, qualified, participated);
        TotalPossibleVotes {
            weight: units.iter().map(|unit| unit.part).sum(),
            count: units.len() as u64,
        }
    }
}

/// Remote gatherings count every qualified unit; the others only the units present.
pub fn denominator_units<'a>(
    gathering_type: GatheringType,
    qualified: &'a [WeightedUnit],
    participated: &'a [WeightedUnit],
) -> &'a [WeightedUnit] {
    match gathering_type {
        GatheringType::Remote => qualified,
        GatheringType::Initial | GatheringType::Repeated => participated,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ByWeightStrategy;

impl VotingStrategy for ByWeightStrategy {
    fn mode(&self) -> VotingMode {
        VotingMode::ByWeight
    }

    fn vote_weight(&self, participant: &Participant) -> f64 {
        participant.units_part
    }

    fn primary_metric(&self, aggregate: &UnitAggregate) -> f64 {
        aggregate.weight
    }

    fn primary_total(&self, total: &TotalPossibleVotes) -> f64 {
        total.weight
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ByUnitStrategy;

impl VotingStrategy for ByUnitStrategy {
    fn mode(&self) -> VotingMode {
        VotingMode::ByUnit
    }

    fn vote_weight(&self, participant: &Participant) -> f64 {
        participant.unit_ids.len() as f64
    }

    fn primary_metric(&self, aggregate: &UnitAggregate) -> f64 {
        aggregate.count as f64
    }

    fn primary_total(&self, total: &TotalPossibleVotes) -> f64 {
        total.count as f64
    }
}

pub fn strategy_for(mode: VotingMode) -> &'static dyn VotingStrategy {
    match mode {
        VotingMode::ByWeight => &ByWeightStrategy,
        VotingMode::ByUnit => &ByUnitStrategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gathering::tests::sample_gathering;
    use crate::participants::tests::sample_participant;

    fn units(parts: &[f64]) -> Vec<WeightedUnit> {
        parts
            .iter()
            .enumerate()
            .map(|(idx, part)| WeightedUnit {
                unit_id: idx as i64 + 1,
                part: *part,
                area: part * 2.0,
            })
            .collect()
    }

    #[test]
    fn vote_weight_follows_mode() {
        let participant = sample_participant(vec![1, 2, 3], 0.42);
        assert_eq!(strategy_for(VotingMode::ByWeight).vote_weight(&participant), 0.42);
        assert_eq!(strategy_for(VotingMode::ByUnit).vote_weight(&participant), 3.0);
    }

    #[test]
    fn remote_gathering_counts_all_qualified_units() {
        let mut gathering = sample_gathering();
        gathering.gathering_type = GatheringType::Remote;
        let qualified = units(&[10.0, 20.0, 30.0]);
        let participated = units(&[10.0, 20.0]);

        let total = ByWeightStrategy.total_possible_votes(&gathering, &qualified, &participated);
        assert_eq!(total, TotalPossibleVotes { weight: 60.0, count: 3 });
    }

    #[test]
    fn initial_and_repeated_gatherings_count_participated_units() {
        let qualified = units(&[10.0, 20.0, 30.0]);
        let participated = units(&[10.0, 20.0]);
        for gathering_type in [GatheringType::Initial, GatheringType::Repeated] {
            let mut gathering = sample_gathering();
            gathering.gathering_type = gathering_type;
            let total = ByUnitStrategy.total_possible_votes(&gathering, &qualified, &participated);
            assert_eq!(total, TotalPossibleVotes { weight: 30.0, count: 2 });
            assert_eq!(ByUnitStrategy.primary_total(&total), 2.0);
            assert_eq!(ByWeightStrategy.primary_total(&total), 30.0);
        }
    }

    #[test]
    fn voting_mode_parses_known_values_only() {
        assert_eq!(VotingMode::parse("by_unit"), Some(VotingMode::ByUnit));
        assert_eq!(VotingMode::parse("by_area"), None);
        assert_eq!(VotingMode::default(), VotingMode::ByWeight);
    }
}
