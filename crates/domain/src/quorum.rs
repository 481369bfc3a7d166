use serde::{Deserialize, Serialize};

use crate::gathering::{Gathering, GatheringType, UnitAggregate};
use crate::matters::{MajorityRule, MatterType, VotingConfig};
use crate::strategy::{TotalPossibleVotes, VotingMode, WeightedUnit, strategy_for};
use crate::tally::{ABSTAIN, MatterTally, YES};
use crate::util::{percentage, round3};

pub const QUALIFIED_MAJORITY_PERCENT: f64 = 66.67;

pub fn quorum_threshold_percentage(gathering_type: GatheringType) -> f64 {
    match gathering_type {
        GatheringType::Initial => 50.0,
        GatheringType::Repeated => 25.0,
        GatheringType::Remote => 100.0,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuorumInfo {
    pub voting_mode: VotingMode,
    pub gathering_type: GatheringType,
    pub threshold_percentage: f64,
    pub total_possible: TotalPossibleVotes,
    pub required: f64,
    pub achieved: f64,
    pub achieved_percentage: f64,
    pub met: bool,
}

/// Gathering-level quorum. Achieved is measured on units that cast a valid ballot.
pub fn calculate_quorum(
    gathering: &Gathering,
    qualified: &[WeightedUnit],
    participated: &[WeightedUnit],
    voted: &UnitAggregate,
) -> QuorumInfo {
    let strategy = strategy_for(gathering.voting_mode);
    let total_possible = strategy.total_possible_votes(gathering, qualified, participated);
    let threshold = quorum_threshold_percentage(gathering.gathering_type);
    let total = strategy.primary_total(&total_possible);
    let required = total * threshold / 100.0;
    let achieved = strategy.primary_metric(voted);
    QuorumInfo {
        voting_mode: gathering.voting_mode,
        gathering_type: gathering.gathering_type,
        threshold_percentage: threshold,
        total_possible,
        required,
        achieved,
        achieved_percentage: round3(percentage(achieved, total)),
        met: achieved >= required,
    }
}

/// Whether `percentage` satisfies `rule`. Informative always does.
pub fn majority_reached(rule: MajorityRule, custom_value: Option<f64>, percentage: f64) -> bool {
    match rule {
        MajorityRule::Simple => percentage > 50.0,
        MajorityRule::Qualified | MajorityRule::Supermajority => {
            percentage >= QUALIFIED_MAJORITY_PERCENT
        }
        MajorityRule::Unanimous => percentage >= 100.0,
        MajorityRule::Custom => custom_value.is_some_and(|value| percentage >= value),
        MajorityRule::Informative => true,
    }
}

/// Pass/fail for one matter. Yes/no matters are measured against the qualified
/// weight, choice matters against the weight cast on real choices.
pub fn calculate_if_passed(
    tally: &MatterTally,
    matter_type: MatterType,
    config: &VotingConfig,
    qualified_weight: f64,
) -> bool {
    if config.required_majority == MajorityRule::Informative {
        return true;
    }
    let total_voted = tally.total_voted();
    if total_voted <= 0.0 {
        return false;
    }
    if config.quorum > 0.0
        && qualified_weight > 0.0
        && percentage(total_voted, qualified_weight) < config.quorum
    {
        return false;
    }

    let share = match matter_type {
        MatterType::YesNo => percentage(tally.weight_of(YES), qualified_weight),
        MatterType::SingleChoice | MatterType::MultipleChoice => {
            let max_weight = tally
                .choices
                .iter()
                .filter(|(key, _)| key.as_str() != ABSTAIN)
                .map(|(_, choice)| choice.weight)
                .fold(0.0, f64::max);
            percentage(max_weight, total_voted)
        }
    };
    majority_reached(config.required_majority, config.required_majority_value, share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gathering::tests::sample_gathering;
    use crate::tally::ChoiceTally;
    use std::collections::BTreeMap;

    fn units(parts: &[f64]) -> Vec<WeightedUnit> {
        parts
            .iter()
            .enumerate()
            .map(|(idx, part)| WeightedUnit {
                unit_id: idx as i64 + 1,
                part: *part,
                area: 0.0,
            })
            .collect()
    }

    fn voted(count: u64, weight: f64) -> UnitAggregate {
        UnitAggregate {
            count,
            weight,
            area: 0.0,
        }
    }

    fn tally(entries: &[(&str, f64)]) -> MatterTally {
        let choices: BTreeMap<String, ChoiceTally> = entries
            .iter()
            .map(|(key, weight)| {
                (
                    key.to_string(),
                    ChoiceTally {
                        count: u64::from(*weight > 0.0),
                        weight: *weight,
                        ..ChoiceTally::default()
                    },
                )
            })
            .collect();
        MatterTally {
            gathering_id: "g-1".to_string(),
            matter_id: "m-1".to_string(),
            choices,
            computed_at_ms: 0,
        }
    }

    fn config(rule: MajorityRule) -> VotingConfig {
        VotingConfig {
            required_majority: rule,
            ..VotingConfig::default()
        }
    }

    #[test]
    fn threshold_depends_on_gathering_type() {
        assert_eq!(quorum_threshold_percentage(GatheringType::Initial), 50.0);
        assert_eq!(quorum_threshold_percentage(GatheringType::Repeated), 25.0);
        assert_eq!(quorum_threshold_percentage(GatheringType::Remote), 100.0);
    }

    #[test]
    fn initial_by_weight_full_turnout_meets_quorum_and_passes() {
        let gathering = sample_gathering();
        let present = units(&[10.0, 20.0]);
        let quorum = calculate_quorum(&gathering, &present, &present, &voted(2, 30.0));
        assert_eq!(quorum.required, 15.0);
        assert_eq!(quorum.achieved, 30.0);
        assert!(quorum.met);

        let result = tally(&[("yes", 30.0), ("no", 0.0)]);
        assert!(calculate_if_passed(
            &result,
            MatterType::YesNo,
            &config(MajorityRule::Simple),
            30.0
        ));
    }

    #[test]
    fn initial_by_weight_partial_turnout_misses_quorum_and_fails() {
        let gathering = sample_gathering();
        let present = units(&[10.0, 20.0]);
        let quorum = calculate_quorum(&gathering, &present, &present, &voted(1, 10.0));
        assert_eq!(quorum.required, 15.0);
        assert_eq!(quorum.achieved, 10.0);
        assert!(!quorum.met);

        let result = tally(&[("yes", 10.0), ("no", 0.0)]);
        assert!(!calculate_if_passed(
            &result,
            MatterType::YesNo,
            &config(MajorityRule::Simple),
            30.0
        ));
    }

    #[test]
    fn remote_gathering_needs_every_qualified_unit() {
        let mut gathering = sample_gathering();
        gathering.gathering_type = GatheringType::Remote;
        let qualified = units(&[10.0, 20.0, 30.0]);
        let participated = units(&[10.0, 20.0]);
        let quorum = calculate_quorum(&gathering, &qualified, &participated, &voted(2, 30.0));
        assert_eq!(quorum.total_possible.weight, 60.0);
        assert_eq!(quorum.required, 60.0);
        assert_eq!(quorum.achieved, 30.0);
        assert_eq!(quorum.achieved_percentage, 50.0);
        assert!(!quorum.met);
    }

    #[test]
    fn by_unit_quorum_counts_units() {
        let mut gathering = sample_gathering();
        gathering.voting_mode = VotingMode::ByUnit;
        gathering.gathering_type = GatheringType::Repeated;
        let present = units(&[0.5, 0.1, 0.1, 0.1]);
        let quorum = calculate_quorum(&gathering, &present, &present, &voted(1, 0.5));
        assert_eq!(quorum.required, 1.0);
        assert_eq!(quorum.achieved, 1.0);
        assert!(quorum.met);
    }

    #[test]
    fn quorum_met_is_monotonic_in_achieved() {
        let gathering = sample_gathering();
        let present = units(&[10.0, 20.0, 30.0]);
        let mut previously_met = false;
        for step in 0..=60 {
            let quorum = calculate_quorum(&gathering, &present, &present, &voted(0, step as f64));
            assert!(!(previously_met && !quorum.met));
            previously_met = quorum.met;
        }
        assert!(previously_met);
    }

    #[test]
    fn majority_rules_apply_their_thresholds() {
        assert!(!majority_reached(MajorityRule::Simple, None, 50.0));
        assert!(majority_reached(MajorityRule::Simple, None, 50.001));
        assert!(!majority_reached(MajorityRule::Qualified, None, 66.66));
        assert!(majority_reached(MajorityRule::Supermajority, None, 66.67));
        assert!(!majority_reached(MajorityRule::Unanimous, None, 99.9));
        assert!(majority_reached(MajorityRule::Custom, Some(40.0), 40.0));
        assert!(!majority_reached(MajorityRule::Custom, None, 100.0));
    }

    #[test]
    fn informative_matters_always_pass_even_without_votes() {
        let result = tally(&[("yes", 0.0), ("no", 0.0)]);
        assert!(calculate_if_passed(
            &result,
            MatterType::YesNo,
            &config(MajorityRule::Informative),
            30.0
        ));
        assert!(!calculate_if_passed(
            &result,
            MatterType::YesNo,
            &config(MajorityRule::Simple),
            30.0
        ));
    }

    #[test]
    fn per_matter_quorum_blocks_low_turnout() {
        let result = tally(&[("yes", 20.0), ("no", 0.0)]);
        let mut strict = config(MajorityRule::Simple);
        strict.quorum = 75.0;
        assert!(!calculate_if_passed(&result, MatterType::YesNo, &strict, 30.0));
        strict.quorum = 60.0;
        assert!(calculate_if_passed(&result, MatterType::YesNo, &strict, 30.0));
    }

    #[test]
    fn choice_matters_ignore_abstentions_in_share() {
        let result = tally(&[("a", 30.0), ("b", 20.0), ("abstain", 50.0)]);
        assert!(calculate_if_passed(
            &result,
            MatterType::SingleChoice,
            &config(MajorityRule::Simple),
            100.0
        ));
        assert!(!calculate_if_passed(
            &result,
            MatterType::MultipleChoice,
            &config(MajorityRule::Qualified),
            100.0
        ));
    }

    #[test]
    fn yes_no_without_qualified_weight_fails() {
        let result = tally(&[("yes", 10.0), ("no", 0.0)]);
        assert!(!calculate_if_passed(
            &result,
            MatterType::YesNo,
            &config(MajorityRule::Simple),
            0.0
        ));
    }
}
