use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::gathering::GatheringType;
use crate::strategy::VotingMode;

use super::BoxFuture;

/// Stored results snapshot. `results_json` holds the serialized `VoteResults`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CachedResultsRow {
    pub gathering_id: String,
    pub results_json: String,
    pub voting_mode: VotingMode,
    pub gathering_type: GatheringType,
    pub total_possible_weight: f64,
    pub total_possible_count: u64,
    pub quorum_threshold_percentage: f64,
    pub quorum_met: bool,
    pub computed_at_ms: i64,
    /// Cache generation the snapshot was computed under.
    #[serde(default)]
    pub generation: u64,
}

/// Every `delete` bumps the gathering's generation. A snapshot is only stored
/// while its `generation` is still current, so a computation that started before
/// an invalidation cannot overwrite it.
pub trait ResultsCacheRepository: Send + Sync {
    /// Starts at 0 for a gathering that was never invalidated.
    fn generation(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<u64>>;
    /// Returns `false` without writing when the row's generation is stale.
    fn upsert(&self, row: &CachedResultsRow) -> BoxFuture<'_, DomainResult<bool>>;
    fn get(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Option<CachedResultsRow>>>;
    /// Drops the snapshot and bumps the generation. A missing row is not an error.
    fn delete(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<()>>;
}
