use crate::DomainResult;
use crate::participants::Participant;

use super::BoxFuture;

pub trait ParticipantRepository: Send + Sync {
    fn create(&self, participant: &Participant) -> BoxFuture<'_, DomainResult<Participant>>;
    fn get(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Participant>>>;
    fn list_by_gathering(&self, gathering_id: &str)
    -> BoxFuture<'_, DomainResult<Vec<Participant>>>;
    /// Sets the check-in time only if none is recorded yet.
    fn check_in(
        &self,
        gathering_id: &str,
        participant_id: &str,
        checked_in_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Participant>>;
}
