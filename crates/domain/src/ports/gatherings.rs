use crate::DomainResult;
use crate::gathering::{Gathering, GatheringStatus, UnitAggregate};

use super::BoxFuture;

#[allow(clippy::needless_pass_by_value)]
pub trait GatheringRepository: Send + Sync {
    fn create(&self, gathering: &Gathering) -> BoxFuture<'_, DomainResult<Gathering>>;
    fn get(
        &self,
        association_id: i64,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Gathering>>>;
    /// Lookup without the association scope, for background jobs.
    fn find_by_id(&self, gathering_id: &str) -> BoxFuture<'_, DomainResult<Option<Gathering>>>;
    fn list_by_association(&self, association_id: i64)
    -> BoxFuture<'_, DomainResult<Vec<Gathering>>>;
    fn update_status(
        &self,
        gathering_id: &str,
        status: GatheringStatus,
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Gathering>>;
    fn update_qualified_stats(
        &self,
        gathering_id: &str,
        aggregate: &UnitAggregate,
    ) -> BoxFuture<'_, DomainResult<()>>;
    fn update_participation_stats(
        &self,
        gathering_id: &str,
        aggregate: &UnitAggregate,
    ) -> BoxFuture<'_, DomainResult<()>>;
}
