use crate::DomainResult;
use crate::ballots::Ballot;

use super::slots::StoredUnitStats;
use super::BoxFuture;

pub trait BallotRepository: Send + Sync {
    /// Must reject with `DomainError::Conflict` when the participant already holds a
    /// valid ballot in the gathering.
    fn create(&self, ballot: &Ballot) -> BoxFuture<'_, DomainResult<Ballot>>;
    fn get(&self, ballot_id: &str) -> BoxFuture<'_, DomainResult<Option<Ballot>>>;
    fn find_valid_by_participant(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Ballot>>>;
    /// Ordered by submission time, then id.
    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<Ballot>>>;
    fn invalidate(
        &self,
        ballot_id: &str,
        reason: &str,
        invalidated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Ballot>>;
    /// Count, part and area over the units of participants holding a valid ballot.
    fn voted_stats(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<StoredUnitStats>>;
}
