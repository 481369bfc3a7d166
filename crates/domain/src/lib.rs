pub mod audit;
pub mod auth;
pub mod ballots;
pub mod eligibility;
pub mod error;
pub mod gathering;
pub mod identity;
pub mod jobs;
pub mod matters;
pub mod notifications;
pub mod participants;
pub mod ports;
pub mod qualification;
pub mod quorum;
pub mod recompute;
pub mod report;
pub mod results;
pub mod slots;
pub mod stats;
pub mod strategy;
pub mod tally;
pub mod units;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
