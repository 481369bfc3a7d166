use crate::DomainResult;
use crate::matters::VotingMatter;

use super::BoxFuture;

pub trait VotingMatterRepository: Send + Sync {
    fn create(&self, matter: &VotingMatter) -> BoxFuture<'_, DomainResult<VotingMatter>>;
    fn update(&self, matter: &VotingMatter) -> BoxFuture<'_, DomainResult<VotingMatter>>;
    fn delete(&self, gathering_id: &str, matter_id: &str) -> BoxFuture<'_, DomainResult<()>>;
    fn get(
        &self,
        gathering_id: &str,
        matter_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<VotingMatter>>>;
    /// Ordered by `order_index`, then `matter_id`.
    fn list_by_gathering(&self, gathering_id: &str)
    -> BoxFuture<'_, DomainResult<Vec<VotingMatter>>>;
}
