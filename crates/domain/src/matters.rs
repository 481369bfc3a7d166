use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::gathering::{GatheringGuard, GatheringStatus};
use crate::jobs::now_ms;
use crate::ports::matters::VotingMatterRepository;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatterType {
    YesNo,
    SingleChoice,
    MultipleChoice,
}

impl MatterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YesNo => "yes_no",
            Self::SingleChoice => "single_choice",
            Self::MultipleChoice => "multiple_choice",
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, Self::SingleChoice | Self::MultipleChoice)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MajorityRule {
    #[default]
    Simple,
    Qualified,
    Supermajority,
    Unanimous,
    Custom,
    Informative,
}

impl MajorityRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Qualified => "qualified",
            Self::Supermajority => "supermajority",
            Self::Unanimous => "unanimous",
            Self::Custom => "custom",
            Self::Informative => "informative",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteOption {
    pub id: String,
    pub text: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VotingConfig {
    #[serde(default)]
    pub options: Vec<VoteOption>,
    #[serde(default)]
    pub required_majority: MajorityRule,
    /// Threshold percentage for the custom rule.
    #[serde(default)]
    pub required_majority_value: Option<f64>,
    /// Per-matter participation floor in percent of qualified weight; zero disables it.
    #[serde(default)]
    pub quorum: f64,
    #[serde(default)]
    pub allow_abstention: bool,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub show_results_during_voting: bool,
}

impl VotingConfig {
    pub fn option_text(&self, option_id: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|option| option.id == option_id)
            .map(|option| option.text.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VotingMatter {
    pub matter_id: String,
    pub gathering_id: String,
    pub order_index: i32,
    pub title: String,
    pub description: Option<String>,
    pub matter_type: MatterType,
    pub voting_config: VotingConfig,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl VotingMatter {
    /// Human label for a tally key.
    pub fn choice_label(&self, key: &str) -> String {
        match self.voting_config.option_text(key) {
            Some(text) => text.to_string(),
            None => key.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VotingMatterInput {
    pub order_index: i32,
    pub title: String,
    pub description: Option<String>,
    pub matter_type: MatterType,
    pub voting_config: VotingConfig,
}

#[derive(Clone)]
pub struct VotingMatterService {
    matters: Arc<dyn VotingMatterRepository>,
    guard: GatheringGuard,
}

impl VotingMatterService {
    pub fn new(matters: Arc<dyn VotingMatterRepository>, guard: GatheringGuard) -> Self {
        Self { matters, guard }
    }

    pub async fn create(
        &self,
        association_id: i64,
        gathering_id: &str,
        input: VotingMatterInput,
    ) -> DomainResult<VotingMatter> {
        validate_matter_input(&input)?;
        self.require_draft(association_id, gathering_id).await?;
        let now = now_ms();
        let matter = VotingMatter {
            matter_id: crate::util::uuid_v7_without_dashes(),
            gathering_id: gathering_id.to_string(),
            order_index: input.order_index,
            title: input.title.trim().to_string(),
            description: input.description.filter(|value| !value.trim().is_empty()),
            matter_type: input.matter_type,
            voting_config: input.voting_config,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.matters.create(&matter).await
    }

    pub async fn update(
        &self,
        association_id: i64,
        gathering_id: &str,
        matter_id: &str,
        input: VotingMatterInput,
    ) -> DomainResult<VotingMatter> {
        validate_matter_input(&input)?;
        self.require_draft(association_id, gathering_id).await?;
        let existing = self
            .matters
            .get(gathering_id, matter_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let matter = VotingMatter {
            order_index: input.order_index,
            title: input.title.trim().to_string(),
            description: input.description.filter(|value| !value.trim().is_empty()),
            matter_type: input.matter_type,
            voting_config: input.voting_config,
            updated_at_ms: now_ms(),
            ..existing
        };
        self.matters.update(&matter).await
    }

    pub async fn delete(
        &self,
        association_id: i64,
        gathering_id: &str,
        matter_id: &str,
    ) -> DomainResult<()> {
        self.require_draft(association_id, gathering_id).await?;
        self.matters.delete(gathering_id, matter_id).await
    }

    pub async fn list(&self, gathering_id: &str) -> DomainResult<Vec<VotingMatter>> {
        self.matters.list_by_gathering(gathering_id).await
    }

    async fn require_draft(&self, association_id: i64, gathering_id: &str) -> DomainResult<()> {
        if self
            .guard
            .is_in_state(association_id, gathering_id, GatheringStatus::Draft)
            .await
        {
            Ok(())
        } else {
            Err(DomainError::StateConflict(
                "voting matters can only be changed while the gathering is a draft".into(),
            ))
        }
    }
}

fn validate_matter_input(input: &VotingMatterInput) -> DomainResult<()> {
    if input.title.trim().is_empty() {
        return Err(DomainError::Validation("title is required".into()));
    }
    let config = &input.voting_config;
    if input.matter_type.is_choice() {
        if config.options.len() < 2 {
            return Err(DomainError::Validation(
                "choice matters need at least two options".into(),
            ));
        }
        let mut seen = HashSet::new();
        for option in &config.options {
            let id = option.id.trim();
            if id.is_empty() {
                return Err(DomainError::Validation("option id is required".into()));
            }
            if option.text.trim().is_empty() {
                return Err(DomainError::Validation("option text is required".into()));
            }
            if id == crate::tally::ABSTAIN {
                return Err(DomainError::Validation(
                    "option id 'abstain' is reserved".into(),
                ));
            }
            if !seen.insert(id) {
                return Err(DomainError::Validation(format!(
                    "duplicate option id '{id}'"
                )));
            }
        }
    }
    if config.required_majority == MajorityRule::Custom {
        match config.required_majority_value {
            Some(value) if value > 0.0 && value <= 100.0 => {}
            _ => {
                return Err(DomainError::Validation(
                    "custom majority needs a value between 0 and 100".into(),
                ));
            }
        }
    }
    if !(0.0..=100.0).contains(&config.quorum) {
        return Err(DomainError::Validation(
            "quorum must be between 0 and 100".into(),
        ));
    }
    Ok(())
}
