use std::sync::Arc;

use apc_domain::audit::AuditTrail;
use apc_domain::ballots::BallotLedger;
use apc_domain::eligibility::EligibilityService;
use apc_domain::gathering::{GatheringGuard, GatheringService};
use apc_domain::jobs::JobDefaults;
use apc_domain::matters::VotingMatterService;
use apc_domain::notifications::NotificationService;
use apc_domain::participants::ParticipantRegistry;
use apc_domain::ports::recompute::RecomputeScheduler;
use apc_domain::report::ReportService;
use apc_domain::results::ResultsService;
use apc_domain::slots::SlotAllocator;
use apc_domain::tally::TallyService;
use apc_infra::config::AppConfig;
use apc_infra::jobs::RedisJobQueue;
use apc_infra::recompute::{InProcessRecomputeQueue, QueuedRecomputeScheduler};
use apc_infra::stores::Stores;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub stores: Stores,
    pub gatherings: GatheringService,
    pub matters: VotingMatterService,
    pub participants: ParticipantRegistry,
    pub ballots: BallotLedger,
    pub tallies: TallyService,
    pub results: ResultsService,
    pub eligibility: EligibilityService,
    pub notifications: NotificationService,
    pub reports: ReportService,
    pub audit: AuditTrail,
    /// Present when recompute jobs run inside this process.
    pub local_recompute: Option<InProcessRecomputeQueue>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let stores = Stores::from_config(&config).await?;
        if config.uses_redis_recompute() {
            let queue =
                RedisJobQueue::connect_with_prefix(&config.redis_url, config.worker_queue_prefix.clone())
                    .await?;
            let scheduler = QueuedRecomputeScheduler::new(
                queue,
                JobDefaults {
                    max_attempts: config.worker_max_attempts,
                },
                config.recompute_dedupe_ttl_ms,
            );
            tracing::info!(prefix = %config.worker_queue_prefix, "recompute jobs go to the worker queue");
            return Ok(Self::assemble(config, stores, Arc::new(scheduler), None));
        }
        Ok(Self::with_stores(config, stores))
    }

    /// Wires the services over `stores` with in-process recomputation.
    pub fn with_stores(config: AppConfig, stores: Stores) -> Self {
        let queue = InProcessRecomputeQueue::start(stores.recompute_runner());
        Self::assemble(config, stores, Arc::new(queue.clone()), Some(queue))
    }

    fn assemble(
        config: AppConfig,
        stores: Stores,
        scheduler: Arc<dyn RecomputeScheduler>,
        local_recompute: Option<InProcessRecomputeQueue>,
    ) -> Self {
        let audit = AuditTrail::new(stores.audit.clone());
        let guard = GatheringGuard::new(stores.gatherings.clone());
        let allocator = SlotAllocator::new(stores.slots.clone(), stores.resolver());
        let results = stores.results_service();

        Self {
            gatherings: GatheringService::new(
                stores.gatherings.clone(),
                stores.stats_service(),
                allocator.clone(),
                audit.clone(),
                scheduler.clone(),
            ),
            matters: VotingMatterService::new(stores.matters.clone(), guard.clone()),
            participants: ParticipantRegistry::new(
                stores.gatherings.clone(),
                guard.clone(),
                stores.resolver(),
                allocator,
                stores.participants.clone(),
                stores.ballots.clone(),
                audit.clone(),
                scheduler.clone(),
            ),
            ballots: BallotLedger::new(
                guard,
                stores.participants.clone(),
                stores.ballots.clone(),
                audit.clone(),
                scheduler,
            ),
            tallies: stores.tally_service(),
            eligibility: EligibilityService::new(
                stores.gatherings.clone(),
                stores.resolver(),
                stores.slots.clone(),
            ),
            notifications: NotificationService::new(
                stores.gatherings.clone(),
                stores.notifications.clone(),
            ),
            reports: ReportService::new(
                stores.gatherings.clone(),
                stores.matters.clone(),
                stores.participants.clone(),
                stores.ballots.clone(),
                results.clone(),
            ),
            results,
            audit,
            local_recompute,
            stores,
            config,
        }
    }
}
