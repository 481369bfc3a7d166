use crate::DomainResult;
use crate::tally::MatterTally;

use super::BoxFuture;

pub trait TallyRepository: Send + Sync {
    /// Replaces any previous tally for the same matter.
    fn upsert(&self, tally: &MatterTally) -> BoxFuture<'_, DomainResult<()>>;
    fn list_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Vec<MatterTally>>>;
    fn delete_by_gathering(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<()>>;
}
