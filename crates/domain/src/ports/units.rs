use crate::DomainResult;
use crate::gathering::QualificationRule;
use crate::units::{Owner, OwnerUnit, Unit};

use super::BoxFuture;

/// Read access to the association's building inventory.
pub trait UnitInventory: Send + Sync {
    /// Active units of the association matching every non-empty filter of `rule`.
    fn qualified_units(
        &self,
        association_id: i64,
        rule: &QualificationRule,
    ) -> BoxFuture<'_, DomainResult<Vec<Unit>>>;
    fn owner(&self, association_id: i64, owner_id: i64)
    -> BoxFuture<'_, DomainResult<Option<Owner>>>;
    fn owner_active_units(
        &self,
        association_id: i64,
        owner_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<Unit>>>;
    fn active_ownerships(&self, association_id: i64) -> BoxFuture<'_, DomainResult<Vec<OwnerUnit>>>;
}
