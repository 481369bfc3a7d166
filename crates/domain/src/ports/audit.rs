use crate::DomainResult;
use crate::audit::AuditEntry;

use super::BoxFuture;

pub trait AuditLogSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> BoxFuture<'_, DomainResult<()>>;
    /// Newest first.
    fn list_by_gathering(
        &self,
        gathering_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<AuditEntry>>>;
}
