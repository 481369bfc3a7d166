use crate::recompute::RecomputeJob;

/// Accepts background recomputation work. Scheduling never blocks and never fails
/// from the caller's point of view; implementations log their own failures.
pub trait RecomputeScheduler: Send + Sync {
    fn schedule(&self, job: RecomputeJob);
}
