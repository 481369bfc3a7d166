use std::sync::Arc;

use apc_domain::ports::audit::AuditLogSink;
use apc_domain::ports::ballots::BallotRepository;
use apc_domain::ports::db::DbAdapter;
use apc_domain::ports::gatherings::GatheringRepository;
use apc_domain::ports::matters::VotingMatterRepository;
use apc_domain::ports::notifications::NotificationSender;
use apc_domain::ports::participants::ParticipantRepository;
use apc_domain::ports::results::ResultsCacheRepository;
use apc_domain::ports::slots::UnitSlotRepository;
use apc_domain::ports::tallies::TallyRepository;
use apc_domain::ports::units::UnitInventory;
use apc_domain::qualification::QualificationResolver;
use apc_domain::recompute::RecomputeRunner;
use apc_domain::results::ResultsService;
use apc_domain::stats::StatsService;
use apc_domain::tally::TallyService;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

use crate::config::AppConfig;
use crate::db::{DbConfig, MemoryAdapter, SurrealAdapter};
use crate::repositories::{
    InMemoryAuditLog, InMemoryGatheringStore, InMemoryNotificationOutbox, InMemoryUnitInventory,
    SurrealAuditLog, SurrealGatheringStore, SurrealNotificationOutbox, SurrealUnitInventory,
    ensure_schema,
};

/// Every storage port the gathering services need, backed by one engine.
#[derive(Clone)]
pub struct Stores {
    pub gatherings: Arc<dyn GatheringRepository>,
    pub matters: Arc<dyn VotingMatterRepository>,
    pub slots: Arc<dyn UnitSlotRepository>,
    pub participants: Arc<dyn ParticipantRepository>,
    pub ballots: Arc<dyn BallotRepository>,
    pub tallies: Arc<dyn TallyRepository>,
    pub results: Arc<dyn ResultsCacheRepository>,
    pub inventory: Arc<dyn UnitInventory>,
    pub audit: Arc<dyn AuditLogSink>,
    pub notifications: Arc<dyn NotificationSender>,
    pub db: Arc<dyn DbAdapter>,
}

impl Stores {
    /// Picks the backend from `DATA_BACKEND`.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        if config.uses_surreal() {
            let db_config = DbConfig::from_app_config(config);
            let client = db_config.connect().await?;
            ensure_schema(&client).await?;
            tracing::info!(namespace = %config.surreal_ns, "surreal stores ready");
            Ok(Self::surreal(client, db_config))
        } else {
            tracing::info!("memory stores ready");
            Ok(Self::in_memory(InMemoryUnitInventory::new()))
        }
    }

    pub fn in_memory(inventory: InMemoryUnitInventory) -> Self {
        Self::in_memory_with(
            InMemoryGatheringStore::new(),
            inventory,
            InMemoryNotificationOutbox::new(),
        )
    }

    pub fn in_memory_with(
        store: InMemoryGatheringStore,
        inventory: InMemoryUnitInventory,
        outbox: InMemoryNotificationOutbox,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            gatherings: store.clone(),
            matters: store.clone(),
            slots: store.clone(),
            participants: store.clone(),
            ballots: store.clone(),
            tallies: store.clone(),
            results: store,
            inventory: Arc::new(inventory),
            audit: Arc::new(InMemoryAuditLog::new()),
            notifications: Arc::new(outbox),
            db: Arc::new(MemoryAdapter),
        }
    }

    pub fn surreal(client: Arc<Surreal<Client>>, db_config: DbConfig) -> Self {
        let store = Arc::new(SurrealGatheringStore::with_client(client.clone()));
        Self {
            gatherings: store.clone(),
            matters: store.clone(),
            slots: store.clone(),
            participants: store.clone(),
            ballots: store.clone(),
            tallies: store.clone(),
            results: store,
            inventory: Arc::new(SurrealUnitInventory::with_client(client.clone())),
            audit: Arc::new(SurrealAuditLog::with_client(client.clone())),
            notifications: Arc::new(SurrealNotificationOutbox::with_client(client)),
            db: Arc::new(SurrealAdapter::new(db_config)),
        }
    }

    pub fn resolver(&self) -> QualificationResolver {
        QualificationResolver::new(self.inventory.clone())
    }

    pub fn stats_service(&self) -> StatsService {
        StatsService::new(
            self.gatherings.clone(),
            self.resolver(),
            self.slots.clone(),
            self.ballots.clone(),
        )
    }

    pub fn tally_service(&self) -> TallyService {
        TallyService::new(
            self.matters.clone(),
            self.ballots.clone(),
            self.participants.clone(),
            self.tallies.clone(),
        )
    }

    pub fn results_service(&self) -> ResultsService {
        ResultsService::new(
            self.gatherings.clone(),
            self.matters.clone(),
            self.slots.clone(),
            self.stats_service(),
            self.tally_service(),
            self.results.clone(),
        )
    }

    pub fn recompute_runner(&self) -> RecomputeRunner {
        RecomputeRunner::new(
            self.gatherings.clone(),
            self.stats_service(),
            self.tally_service(),
            self.results_service(),
        )
    }
}
