use std::collections::HashMap;
use std::sync::Arc;

use crate::DomainResult;
use crate::ballots::Ballot;
use crate::error::DomainError;
use crate::gathering::{Gathering, UnitAggregate};
use crate::matters::{MajorityRule, VotingMatter};
use crate::participants::Participant;
use crate::ports::ballots::BallotRepository;
use crate::ports::gatherings::GatheringRepository;
use crate::ports::matters::VotingMatterRepository;
use crate::ports::participants::ParticipantRepository;
use crate::results::{MatterResult, ResultsService, VoteResults};
use crate::util::format_ms_short;

/// A rendered markdown document with a suggested download name.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkdownReport {
    pub filename: String,
    pub body: String,
}

fn slug(title: &str) -> String {
    let slug: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let parts: Vec<&str> = slug.split('-').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        "gathering".to_string()
    } else {
        parts.join("-")
    }
}

fn aggregate_row(label: &str, aggregate: &UnitAggregate) -> String {
    format!(
        "| **{label}** | {} | {:.4} | {:.2} |\n",
        aggregate.count, aggregate.weight, aggregate.area
    )
}

fn gathering_header(md: &mut String, heading: &str, gathering: &Gathering) {
    md.push_str(&format!("# {heading}: {}\n\n", gathering.title));
    md.push_str(&format!(
        "**Date:** {}\n\n",
        format_ms_short(gathering.gathering_date_ms)
    ));
}

fn matter_section(md: &mut String, matter: &MatterResult) {
    md.push_str(&format!("### {}. {}\n\n", matter.order_index, matter.title));
    md.push_str(&format!("**Type:** {}\n\n", matter.matter_type.as_str()));
    md.push_str(&format!(
        "**Required Majority:** {}\n\n",
        matter.voting_config.required_majority.as_str()
    ));
    md.push_str("| Option | Votes | % Votes | Weight | % Weight (of cast) | % Weight (of qualified) |\n");
    md.push_str("|--------|-------|---------|--------|--------------------|------------------------|\n");
    for choice in &matter.choices {
        md.push_str(&format!(
            "| {} | {} | {:.2}% | {:.4} | {:.2}% | {:.3}% |\n",
            choice.label,
            choice.count,
            choice.count_percentage,
            choice.weight,
            choice.percent_of_cast,
            choice.percent_of_qualified
        ));
    }
    md.push('\n');
    let status = if matter.voting_config.required_majority == MajorityRule::Informative {
        "INFORMATIVE"
    } else if matter.is_passed {
        "PASSED"
    } else {
        "FAILED"
    };
    md.push_str(&format!("**Status:** {status} ({})\n\n", matter.outcome));
    md.push_str("---\n\n");
}

pub fn render_results_report(gathering: &Gathering, results: &VoteResults) -> String {
    let mut md = String::new();
    gathering_header(&mut md, "Voting Results", gathering);
    md.push_str(&format!("**Location:** {}\n\n", gathering.location));
    md.push_str(&format!("**Status:** {}\n\n", gathering.status.as_str()));
    md.push_str(&format!(
        "**Voting Mode:** {}\n\n",
        gathering.voting_mode.display_name()
    ));

    let summary = &results.summary;
    md.push_str("## Participation Statistics\n\n");
    md.push_str("| Metric | Count | Weight | Area (m²) |\n");
    md.push_str("|--------|-------|--------|----------|\n");
    md.push_str(&aggregate_row("Qualified Units", &summary.qualified));
    md.push_str(&aggregate_row("Participating Units", &summary.participating));
    md.push_str(&aggregate_row("Voted Units", &summary.voted));
    md.push('\n');
    md.push_str(&format!(
        "**Participation Rate:** {:.2}% ({:.2}% by weight)\n\n",
        summary.participation_rate, summary.participation_rate_by_weight
    ));
    md.push_str(&format!(
        "**Voting Completion Rate:** {:.2}% ({:.2}% by weight)\n\n",
        summary.voting_completion_rate, summary.voting_completion_rate_by_weight
    ));

    let quorum = &results.quorum;
    md.push_str(&format!(
        "**Quorum:** {} (achieved {:.3} of required {:.3}, threshold {}%)\n\n",
        if quorum.met { "met" } else { "not met" },
        quorum.achieved,
        quorum.required,
        quorum.threshold_percentage
    ));

    md.push_str("## Voting Matters and Results\n\n");
    for matter in &results.matters {
        matter_section(&mut md, matter);
    }
    md.push_str(&format!(
        "*Report generated at: {}*\n",
        format_ms_short(results.computed_at_ms)
    ));
    md
}

fn vote_label(matter: &VotingMatter, key: &str) -> String {
    if matter.voting_config.is_anonymous {
        "(anonymous)".to_string()
    } else {
        matter.choice_label(key)
    }
}

pub fn render_ballots_report(
    gathering: &Gathering,
    ballots: &[Ballot],
    participants: &HashMap<String, Participant>,
    matters: &[VotingMatter],
    generated_at_ms: i64,
) -> String {
    let mut md = String::new();
    gathering_header(&mut md, "Voting Ballots", gathering);
    md.push_str(&format!("**Total Ballots:** {}\n\n", ballots.len()));

    for (index, ballot) in ballots.iter().enumerate() {
        let participant = participants.get(&ballot.participant_id);
        md.push_str(&format!("## Ballot #{}\n\n", index + 1));
        md.push_str(&format!(
            "**Participant:** {}\n\n",
            participant.map_or("unknown", |p| p.participant_name.as_str())
        ));
        md.push_str(&format!(
            "**Units Weight:** {:.4}\n\n",
            participant.map_or(0.0, |p| p.units_part)
        ));
        md.push_str(&format!(
            "**Units Area:** {:.2} m²\n\n",
            participant.map_or(0.0, |p| p.units_area)
        ));
        md.push_str(&format!(
            "**Submitted:** {}\n\n",
            format_ms_short(ballot.submitted_at_ms)
        ));
        md.push_str(&format!("**Ballot Hash:** `{}`\n\n", ballot.content_hash));
        md.push_str(&format!("**Valid:** {}\n\n", ballot.is_valid));
        if let Some(reason) = &ballot.invalidation_reason {
            md.push_str(&format!("**Invalidation Reason:** {reason}\n\n"));
        }

        match ballot.votes() {
            Ok(votes) => {
                md.push_str("**Votes:**\n\n");
                for matter in matters {
                    let Some(key) = votes.get(&matter.matter_id).and_then(|vote| vote.choice_key())
                    else {
                        continue;
                    };
                    md.push_str(&format!("- **{}:** {}\n", matter.title, vote_label(matter, key)));
                }
                md.push('\n');
            }
            Err(err) => {
                tracing::warn!(ballot_id = %ballot.ballot_id, error = %err, "ballot content unreadable in report");
            }
        }
        md.push_str("---\n\n");
    }
    md.push_str(&format!(
        "*Report generated at: {}*\n",
        format_ms_short(generated_at_ms)
    ));
    md
}

#[derive(Clone)]
pub struct ReportService {
    gatherings: Arc<dyn GatheringRepository>,
    matters: Arc<dyn VotingMatterRepository>,
    participants: Arc<dyn ParticipantRepository>,
    ballots: Arc<dyn BallotRepository>,
    results: ResultsService,
}

impl ReportService {
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        matters: Arc<dyn VotingMatterRepository>,
        participants: Arc<dyn ParticipantRepository>,
        ballots: Arc<dyn BallotRepository>,
        results: ResultsService,
    ) -> Self {
        Self {
            gatherings,
            matters,
            participants,
            ballots,
            results,
        }
    }

    async fn gathering(&self, association_id: i64, gathering_id: &str) -> DomainResult<Gathering> {
        self.gatherings
            .get(association_id, gathering_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    pub async fn results_report(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<MarkdownReport> {
        let gathering = self.gathering(association_id, gathering_id).await?;
        let results = self.results.get_or_compute(association_id, gathering_id).await?;
        Ok(MarkdownReport {
            filename: format!(
                "voting-results-{}-{}.md",
                slug(&gathering.title),
                gathering.gathering_id
            ),
            body: render_results_report(&gathering, &results),
        })
    }

    pub async fn ballots_report(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> DomainResult<MarkdownReport> {
        let gathering = self.gathering(association_id, gathering_id).await?;
        let matters = self.matters.list_by_gathering(gathering_id).await?;
        let participants: HashMap<String, Participant> = self
            .participants
            .list_by_gathering(gathering_id)
            .await?
            .into_iter()
            .map(|participant| (participant.participant_id.clone(), participant))
            .collect();
        let ballots = self.ballots.list_by_gathering(gathering_id).await?;
        Ok(MarkdownReport {
            filename: format!(
                "voting-ballots-{}-{}.md",
                slug(&gathering.title),
                gathering.gathering_id
            ),
            body: render_ballots_report(
                &gathering,
                &ballots,
                &participants,
                &matters,
                crate::jobs::now_ms(),
            ),
        })
    }
}
