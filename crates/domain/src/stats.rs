use std::sync::Arc;

use crate::DomainResult;
use crate::gathering::{Gathering, UnitAggregate};
use crate::ports::ballots::BallotRepository;
use crate::ports::gatherings::GatheringRepository;
use crate::ports::slots::UnitSlotRepository;
use crate::qualification::QualificationResolver;

/// Maintains the cached aggregates on a gathering. Every value written here can be
/// rebuilt from units, slots and ballots.
#[derive(Clone)]
pub struct StatsService {
    gatherings: Arc<dyn GatheringRepository>,
    resolver: QualificationResolver,
    slots: Arc<dyn UnitSlotRepository>,
    ballots: Arc<dyn BallotRepository>,
}

impl StatsService {
    pub fn new(
        gatherings: Arc<dyn GatheringRepository>,
        resolver: QualificationResolver,
        slots: Arc<dyn UnitSlotRepository>,
        ballots: Arc<dyn BallotRepository>,
    ) -> Self {
        Self {
            gatherings,
            resolver,
            slots,
            ballots,
        }
    }

    pub async fn refresh_qualified(&self, gathering: &Gathering) -> DomainResult<UnitAggregate> {
        let qualified = self
            .resolver
            .resolve(gathering.association_id, &gathering.qualification)
            .await?;
        let aggregate = qualified.aggregate();
        self.gatherings
            .update_qualified_stats(&gathering.gathering_id, &aggregate)
            .await?;
        tracing::debug!(
            gathering_id = %gathering.gathering_id,
            count = aggregate.count,
            weight = aggregate.weight,
            "qualified stats refreshed"
        );
        Ok(aggregate)
    }

    pub async fn refresh_participation(&self, gathering_id: &str) -> DomainResult<UnitAggregate> {
        let aggregate = self.participating(gathering_id).await?;
        self.gatherings
            .update_participation_stats(gathering_id, &aggregate)
            .await?;
        tracing::debug!(
            gathering_id,
            count = aggregate.count,
            weight = aggregate.weight,
            "participation stats refreshed"
        );
        Ok(aggregate)
    }

    pub async fn participating(&self, gathering_id: &str) -> DomainResult<UnitAggregate> {
        Ok(self
            .slots
            .participating_stats(gathering_id)
            .await?
            .into_aggregate())
    }

    pub async fn voted(&self, gathering_id: &str) -> DomainResult<UnitAggregate> {
        Ok(self.ballots.voted_stats(gathering_id).await?.into_aggregate())
    }
}
