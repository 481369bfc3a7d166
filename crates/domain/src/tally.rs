use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::ballots::Ballot;
use crate::jobs::now_ms;
use crate::matters::{MatterType, VotingMatter};
use crate::participants::Participant;
use crate::ports::ballots::BallotRepository;
use crate::ports::matters::VotingMatterRepository;
use crate::ports::participants::ParticipantRepository;
use crate::ports::tallies::TallyRepository;
use crate::util::{percentage, round3};

pub const YES: &str = "yes";
pub const NO: &str = "no";
pub const ABSTAIN: &str = "abstain";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChoiceTally {
    /// Ballots that picked this choice.
    pub count: u64,
    /// Units behind those ballots.
    pub units: u64,
    pub weight: f64,
    pub area: f64,
    pub count_percentage: f64,
    /// Share of all weight cast on the matter, abstentions included.
    pub percent_of_cast: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatterTally {
    pub gathering_id: String,
    pub matter_id: String,
    pub choices: BTreeMap<String, ChoiceTally>,
    pub computed_at_ms: i64,
}

impl MatterTally {
    /// Weight cast on real choices, abstentions excluded.
    pub fn total_voted(&self) -> f64 {
        self.choices
            .iter()
            .filter(|(key, _)| key.as_str() != ABSTAIN)
            .map(|(_, choice)| choice.weight)
            .sum()
    }

    pub fn total_abstained(&self) -> f64 {
        self.choices
            .get(ABSTAIN)
            .map(|choice| choice.weight)
            .unwrap_or_default()
    }

    pub fn weight_of(&self, key: &str) -> f64 {
        self.choices
            .get(key)
            .map(|choice| choice.weight)
            .unwrap_or_default()
    }

    /// Heaviest non-abstain choice; ties go to the first key in order.
    pub fn leading_choice(&self) -> Option<(&str, &ChoiceTally)> {
        let mut leading: Option<(&str, &ChoiceTally)> = None;
        for (key, choice) in &self.choices {
            if key == ABSTAIN || choice.weight <= 0.0 {
                continue;
            }
            match leading {
                Some((_, best)) if best.weight >= choice.weight => {}
                _ => leading = Some((key.as_str(), choice)),
            }
        }
        leading
    }
}

pub fn seed_choices(matter: &VotingMatter) -> BTreeMap<String, ChoiceTally> {
    let mut choices = BTreeMap::new();
    match matter.matter_type {
        MatterType::YesNo => {
            choices.insert(YES.to_string(), ChoiceTally::default());
            choices.insert(NO.to_string(), ChoiceTally::default());
        }
        MatterType::SingleChoice | MatterType::MultipleChoice => {
            for option in &matter.voting_config.options {
                choices.insert(option.id.clone(), ChoiceTally::default());
            }
        }
    }
    if matter.voting_config.allow_abstention {
        choices.insert(ABSTAIN.to_string(), ChoiceTally::default());
    }
    choices
}

/// Aggregates valid ballots for one matter. Votes for keys outside the seeded
/// table and ballots without a known participant are ignored.
pub fn tally_matter(
    matter: &VotingMatter,
    ballots: &[Ballot],
    participants: &HashMap<String, Participant>,
) -> MatterTally {
    let mut choices = seed_choices(matter);
    for ballot in ballots.iter().filter(|ballot| ballot.is_valid) {
        let Some(participant) = participants.get(&ballot.participant_id) else {
            continue;
        };
        let votes = match ballot.votes() {
            Ok(votes) => votes,
            Err(err) => {
                tracing::warn!(ballot_id = %ballot.ballot_id, error = %err, "skipping unreadable ballot");
                continue;
            }
        };
        let Some(key) = votes
            .get(&matter.matter_id)
            .and_then(|vote| vote.choice_key())
        else {
            continue;
        };
        if let Some(choice) = choices.get_mut(key) {
            choice.count += 1;
            choice.units += participant.unit_ids.len() as u64;
            choice.weight += participant.units_part;
            choice.area += participant.units_area;
        }
    }

    let total_count: u64 = choices.values().map(|choice| choice.count).sum();
    let total_weight: f64 = choices.values().map(|choice| choice.weight).sum();
    for choice in choices.values_mut() {
        choice.count_percentage = round3(percentage(choice.count as f64, total_count as f64));
        choice.percent_of_cast = round3(percentage(choice.weight, total_weight));
    }

    MatterTally {
        gathering_id: matter.gathering_id.clone(),
        matter_id: matter.matter_id.clone(),
        choices,
        computed_at_ms: now_ms(),
    }
}

#[derive(Clone)]
pub struct TallyService {
    matters: Arc<dyn VotingMatterRepository>,
    ballots: Arc<dyn BallotRepository>,
    participants: Arc<dyn ParticipantRepository>,
    tallies: Arc<dyn TallyRepository>,
}

impl TallyService {
    pub fn new(
        matters: Arc<dyn VotingMatterRepository>,
        ballots: Arc<dyn BallotRepository>,
        participants: Arc<dyn ParticipantRepository>,
        tallies: Arc<dyn TallyRepository>,
    ) -> Self {
        Self {
            matters,
            ballots,
            participants,
            tallies,
        }
    }

    /// Recomputes every matter of the gathering from all valid ballots and replaces
    /// the stored tallies.
    pub async fn refresh(&self, gathering_id: &str) -> DomainResult<Vec<MatterTally>> {
        let matters = self.matters.list_by_gathering(gathering_id).await?;
        let ballots = self.ballots.list_by_gathering(gathering_id).await?;
        let participants: HashMap<String, Participant> = self
            .participants
            .list_by_gathering(gathering_id)
            .await?
            .into_iter()
            .map(|participant| (participant.participant_id.clone(), participant))
            .collect();

        let tallies: Vec<MatterTally> = matters
            .iter()
            .map(|matter| tally_matter(matter, &ballots, &participants))
            .collect();

        self.tallies.delete_by_gathering(gathering_id).await?;
        for tally in &tallies {
            self.tallies.upsert(tally).await?;
        }
        tracing::debug!(gathering_id, matters = tallies.len(), ballots = ballots.len(), "tallies refreshed");
        Ok(tallies)
    }

    pub async fn list(&self, gathering_id: &str) -> DomainResult<Vec<MatterTally>> {
        self.tallies.list_by_gathering(gathering_id).await
    }
}
