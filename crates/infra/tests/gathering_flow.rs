use std::collections::BTreeMap;
use std::sync::Arc;

use apc_domain::DomainResult;
use apc_domain::audit::AuditTrail;
use apc_domain::ballots::{Ballot, BallotLedger, BallotVote, VoteMap};
use apc_domain::eligibility::EligibilityService;
use apc_domain::error::DomainError;
use apc_domain::gathering::{
    GatheringCreate, GatheringGuard, GatheringService, GatheringStatus, QualificationRule,
};
use apc_domain::identity::ActorIdentity;
use apc_domain::matters::{
    MajorityRule, MatterType, VotingConfig, VotingMatterInput, VotingMatterService,
};
use apc_domain::notifications::{NotificationChannel, NotificationService, NotificationType};
use apc_domain::participants::{
    Participant, ParticipantRegistration, ParticipantRegistry, ParticipantType,
};
use apc_domain::ports::BoxFuture;
use apc_domain::ports::ballots::BallotRepository;
use apc_domain::ports::participants::ParticipantRepository;
use apc_domain::ports::recompute::RecomputeScheduler;
use apc_domain::ports::results::ResultsCacheRepository;
use apc_domain::ports::slots::UnitSlotRepository;
use apc_domain::report::ReportService;
use apc_domain::slots::SlotAllocator;
use apc_domain::units::{Owner, Unit};
use apc_domain::util::content_hash;
use apc_infra::recompute::InProcessRecomputeQueue;
use apc_infra::repositories::{
    InMemoryGatheringStore, InMemoryNotificationOutbox, InMemoryUnitInventory,
};
use apc_infra::stores::Stores;

const ASSOCIATION: i64 = 1;

struct Harness {
    stores: Stores,
    inventory: InMemoryUnitInventory,
    queue: InProcessRecomputeQueue,
    scheduler: Arc<dyn RecomputeScheduler>,
    outbox: InMemoryNotificationOutbox,
    gatherings: GatheringService,
    matters: VotingMatterService,
    participants: ParticipantRegistry,
    ballots: BallotLedger,
}

fn unit(unit_id: i64, part: f64) -> Unit {
    Unit {
        unit_id,
        association_id: ASSOCIATION,
        building_id: 1,
        cadastral_number: format!("C-{unit_id}"),
        unit_number: format!("{unit_id}"),
        address: "Main street 1".to_string(),
        entrance: 1,
        floor: unit_id,
        unit_type: "flat".to_string(),
        area: 50.0,
        part,
        room_count: 2,
    }
}

fn owner(owner_id: i64, name: &str) -> Owner {
    Owner {
        owner_id,
        association_id: ASSOCIATION,
        name: name.to_string(),
        identification_number: format!("ID-{owner_id}"),
    }
}

fn actor() -> ActorIdentity {
    ActorIdentity::with_user_id("chair")
}

/// Units 1..=4 at 25% each. Owner 10 holds 1 and 2, owner 11 holds 3, owner 12 holds 4.
async fn harness() -> Harness {
    let inventory = InMemoryUnitInventory::new();
    for unit_id in 1..=4 {
        inventory.add_unit(unit(unit_id, 25.0)).await;
    }
    inventory.add_owner(owner(10, "Ana")).await;
    inventory.add_owner(owner(11, "Bruno")).await;
    inventory.add_owner(owner(12, "Carla")).await;
    inventory.link(10, 1).await;
    inventory.link(10, 2).await;
    inventory.link(11, 3).await;
    inventory.link(12, 4).await;

    let outbox = InMemoryNotificationOutbox::new();
    let stores = Stores::in_memory_with(
        InMemoryGatheringStore::new(),
        inventory.clone(),
        outbox.clone(),
    );
    let queue = InProcessRecomputeQueue::start(stores.recompute_runner());
    let scheduler: Arc<dyn RecomputeScheduler> = Arc::new(queue.clone());
    let audit = AuditTrail::new(stores.audit.clone());
    let guard = GatheringGuard::new(stores.gatherings.clone());
    let allocator = SlotAllocator::new(stores.slots.clone(), stores.resolver());

    Harness {
        gatherings: GatheringService::new(
            stores.gatherings.clone(),
            stores.stats_service(),
            allocator,
            audit.clone(),
            scheduler.clone(),
        ),
        matters: VotingMatterService::new(stores.matters.clone(), guard.clone()),
        participants: registry(&stores, stores.participants.clone(), scheduler.clone()),
        ballots: BallotLedger::new(
            guard,
            stores.participants.clone(),
            stores.ballots.clone(),
            audit,
            scheduler.clone(),
        ),
        stores,
        inventory,
        queue,
        scheduler,
        outbox,
    }
}

fn registry(
    stores: &Stores,
    participants: Arc<dyn ParticipantRepository>,
    scheduler: Arc<dyn RecomputeScheduler>,
) -> ParticipantRegistry {
    ParticipantRegistry::new(
        stores.gatherings.clone(),
        GatheringGuard::new(stores.gatherings.clone()),
        stores.resolver(),
        SlotAllocator::new(stores.slots.clone(), stores.resolver()),
        participants,
        stores.ballots.clone(),
        AuditTrail::new(stores.audit.clone()),
        scheduler,
    )
}

/// Participant store whose writes always fail.
struct UnwritableParticipants(Arc<dyn ParticipantRepository>);

impl ParticipantRepository for UnwritableParticipants {
    fn create(&self, _participant: &Participant) -> BoxFuture<'_, DomainResult<Participant>> {
        Box::pin(async { Err(DomainError::Collaborator("participant store offline".into())) })
    }

    fn get(
        &self,
        gathering_id: &str,
        participant_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Participant>>> {
        self.0.get(gathering_id, participant_id)
    }

    fn list_by_gathering(
        &self,
        gathering_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Participant>>> {
        self.0.list_by_gathering(gathering_id)
    }

    fn check_in(
        &self,
        gathering_id: &str,
        participant_id: &str,
        checked_in_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Participant>> {
        self.0.check_in(gathering_id, participant_id, checked_in_at_ms)
    }
}

async fn draft_gathering(harness: &Harness) -> String {
    let gathering = harness
        .gatherings
        .create(
            &actor(),
            ASSOCIATION,
            GatheringCreate {
                title: "Annual meeting".to_string(),
                description: None,
                intent: None,
                location: "Lobby".to_string(),
                gathering_date_ms: 1_700_000_000_000,
                gathering_type: "initial".to_string(),
                voting_mode: Some("by_weight".to_string()),
                qualification: QualificationRule::default(),
            },
        )
        .await
        .expect("create gathering");
    gathering.gathering_id
}

async fn add_yes_no(harness: &Harness, gathering_id: &str) -> String {
    harness
        .matters
        .create(
            ASSOCIATION,
            gathering_id,
            VotingMatterInput {
                order_index: 1,
                title: "Approve budget".to_string(),
                description: None,
                matter_type: MatterType::YesNo,
                voting_config: VotingConfig {
                    required_majority: MajorityRule::Simple,
                    allow_abstention: true,
                    ..VotingConfig::default()
                },
            },
        )
        .await
        .expect("create matter")
        .matter_id
}

async fn activate(harness: &Harness, gathering_id: &str) {
    harness
        .gatherings
        .transition_status(&actor(), ASSOCIATION, gathering_id, "active")
        .await
        .expect("activate");
}

fn owner_registration(owner_id: i64, unit_ids: Vec<i64>) -> ParticipantRegistration {
    ParticipantRegistration {
        participant_type: ParticipantType::Owner,
        owner_id: Some(owner_id),
        delegating_owner_id: None,
        delegate_name: None,
        delegation_document_ref: None,
        unit_ids,
    }
}

fn vote(matter_id: &str, value: &str) -> VoteMap {
    let mut votes = BTreeMap::new();
    votes.insert(
        matter_id.to_string(),
        BallotVote {
            matter_id: matter_id.to_string(),
            option_id: None,
            vote_value: Some(value.to_string()),
        },
    );
    votes
}

#[tokio::test]
async fn create_resolves_qualified_units_and_slots() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;

    let gathering = harness
        .gatherings
        .get(ASSOCIATION, &gathering_id)
        .await
        .expect("get");
    let qualified = gathering.qualified.expect("qualified aggregate");
    assert_eq!(qualified.count, 4);
    assert!((qualified.weight - 100.0).abs() < 1e-9);
    assert_eq!(gathering.status, GatheringStatus::Draft);

    let slots = harness
        .stores
        .slots
        .list_by_gathering(&gathering_id)
        .await
        .expect("slots");
    assert_eq!(slots.len(), 4);
    assert!(slots.iter().all(|slot| slot.participant_id.is_none()));
}

#[tokio::test]
async fn registration_requires_active_gathering() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;

    let err = harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1]))
        .await
        .expect_err("draft gathering");
    assert!(matches!(err, DomainError::StateConflict(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_for_one_unit_admit_a_single_participant() {
    let harness = Arc::new(harness().await);
    let gathering_id = draft_gathering(&harness).await;
    activate(&harness, &gathering_id).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = harness.clone();
        let gathering_id = gathering_id.clone();
        handles.push(tokio::spawn(async move {
            harness
                .participants
                .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1]))
                .await
        }));
    }
    let mut admitted = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(participant) => {
                admitted += 1;
                assert_eq!(participant.unit_ids, vec![1]);
            }
            Err(err) => assert!(matches!(err, DomainError::StateConflict(_))),
        }
    }
    assert_eq!(admitted, 1);

    let claimed: Vec<_> = harness
        .stores
        .slots
        .list_by_gathering(&gathering_id)
        .await
        .expect("slots")
        .into_iter()
        .filter(|slot| slot.participant_id.is_some())
        .collect();
    assert_eq!(claimed.len(), 1);
}

#[tokio::test]
async fn registration_skips_units_the_owner_does_not_hold() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    activate(&harness, &gathering_id).await;

    let participant = harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1, 2, 3]))
        .await
        .expect("register");
    assert_eq!(participant.unit_ids, vec![1, 2]);
    assert!((participant.units_part - 50.0).abs() < 1e-9);
    assert_eq!(participant.participant_name, "Ana");
}

#[tokio::test]
async fn second_valid_ballot_is_rejected_until_invalidated() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    let matter_id = add_yes_no(&harness, &gathering_id).await;
    activate(&harness, &gathering_id).await;
    let participant = harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1, 2]))
        .await
        .expect("register");

    let first = harness
        .ballots
        .submit(&actor(), ASSOCIATION, &gathering_id, &participant.participant_id, vote(&matter_id, "yes"))
        .await
        .expect("first ballot");
    let err = harness
        .ballots
        .submit(&actor(), ASSOCIATION, &gathering_id, &participant.participant_id, vote(&matter_id, "no"))
        .await
        .expect_err("duplicate ballot");
    assert!(matches!(err, DomainError::StateConflict(_)));

    let verification = harness
        .ballots
        .verify(&gathering_id, &first.ballot_id, &first.content_hash.to_uppercase())
        .await
        .expect("verify");
    assert!(verification.valid);
    let tampered = harness
        .ballots
        .verify(&gathering_id, &first.ballot_id, "00")
        .await
        .expect("verify");
    assert!(!tampered.valid);

    harness
        .ballots
        .invalidate(&actor(), &gathering_id, &first.ballot_id, "signature mismatch")
        .await
        .expect("invalidate");
    let again = harness
        .ballots
        .invalidate(&actor(), &gathering_id, &first.ballot_id, "again")
        .await
        .expect_err("already invalid");
    assert!(matches!(again, DomainError::StateConflict(_)));

    harness
        .ballots
        .submit(&actor(), ASSOCIATION, &gathering_id, &participant.participant_id, vote(&matter_id, "no"))
        .await
        .expect("resubmit after invalidation");
}

#[tokio::test]
async fn closing_a_gathering_finalizes_results() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    let matter_id = add_yes_no(&harness, &gathering_id).await;
    activate(&harness, &gathering_id).await;

    let ana = harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1, 2]))
        .await
        .expect("register ana");
    let bruno = harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(11, vec![3]))
        .await
        .expect("register bruno");
    harness
        .ballots
        .submit(&actor(), ASSOCIATION, &gathering_id, &ana.participant_id, vote(&matter_id, "yes"))
        .await
        .expect("ana votes");
    harness
        .ballots
        .submit(&actor(), ASSOCIATION, &gathering_id, &bruno.participant_id, vote(&matter_id, "no"))
        .await
        .expect("bruno votes");

    harness
        .gatherings
        .transition_status(&actor(), ASSOCIATION, &gathering_id, "closed")
        .await
        .expect("close");
    harness.queue.wait_idle().await;

    let gathering = harness
        .gatherings
        .get(ASSOCIATION, &gathering_id)
        .await
        .expect("get");
    let participating = gathering.participating.expect("participating");
    assert_eq!(participating.count, 3);
    assert!((participating.weight - 75.0).abs() < 1e-9);

    let cached = harness
        .stores
        .results
        .get(&gathering_id)
        .await
        .expect("cache lookup");
    assert!(cached.is_some(), "finalize stores a results snapshot");

    let results = harness
        .stores
        .results_service()
        .get_or_compute(ASSOCIATION, &gathering_id)
        .await
        .expect("results");
    assert!(results.quorum.met);
    let matter = &results.matters[0];
    assert_eq!(matter.leading_choice.as_deref(), Some("yes"));
    // Yes holds 50 of 100 qualified weight, which is not more than half.
    assert!(!matter.is_passed);
    assert_eq!(matter.outcome, "rejected");
    assert!((results.summary.participation_rate - 75.0).abs() < 1e-6);

    let report = ReportService::new(
        harness.stores.gatherings.clone(),
        harness.stores.matters.clone(),
        harness.stores.participants.clone(),
        harness.stores.ballots.clone(),
        harness.stores.results_service(),
    )
    .results_report(ASSOCIATION, &gathering_id)
    .await
    .expect("report");
    assert!(report.filename.ends_with(&format!("{gathering_id}.md")));
    assert!(report.body.contains("Approve budget"));
}

#[tokio::test]
async fn eligibility_tracks_claimed_units() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    activate(&harness, &gathering_id).await;
    harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1]))
        .await
        .expect("register");

    let eligibility = EligibilityService::new(
        harness.stores.gatherings.clone(),
        harness.stores.resolver(),
        harness.stores.slots.clone(),
    );
    let voters = eligibility
        .eligible_voters(ASSOCIATION, &gathering_id)
        .await
        .expect("voters");
    let ana = voters
        .iter()
        .find(|voter| voter.owner.owner_id == 10)
        .expect("ana listed");
    assert_eq!(ana.available_units_count, 1);
    assert!(ana.has_available_units);

    let absent = eligibility
        .non_participating_owners(ASSOCIATION, &gathering_id)
        .await
        .expect("absent owners");
    let mut absent_ids: Vec<i64> = absent.iter().map(|entry| entry.owner.owner_id).collect();
    absent_ids.sort_unstable();
    assert_eq!(absent_ids, vec![11, 12]);
}

#[tokio::test]
async fn notifications_skip_unreachable_owners() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    harness.outbox.mark_unreachable(11).await;

    let sent = NotificationService::new(
        harness.stores.gatherings.clone(),
        harness.stores.notifications.clone(),
    )
    .send(
        ASSOCIATION,
        &gathering_id,
        NotificationType::Invitation,
        NotificationChannel::Email,
        &[10, 11, 12],
    )
    .await
    .expect("send");
    assert_eq!(sent.len(), 2);
    assert_eq!(harness.outbox.sent().await.len(), 2);
}

async fn stored_ballot(harness: &Harness, gathering_id: &str) -> Ballot {
    let matter_id = add_yes_no(harness, gathering_id).await;
    activate(harness, gathering_id).await;
    let participant = harness
        .participants
        .register(&actor(), ASSOCIATION, gathering_id, owner_registration(10, vec![1, 2]))
        .await
        .expect("register");
    harness
        .ballots
        .submit(&actor(), ASSOCIATION, gathering_id, &participant.participant_id, vote(&matter_id, "yes"))
        .await
        .expect("ballot")
}

/// Stores a copy of `original` under a new id after applying `edit`.
async fn store_altered_copy(harness: &Harness, original: &Ballot, edit: impl FnOnce(&mut Ballot)) -> String {
    let mut copy = original.clone();
    copy.ballot_id = format!("{}-copy", original.ballot_id);
    copy.is_valid = false;
    edit(&mut copy);
    harness.stores.ballots.create(&copy).await.expect("store copy");
    copy.ballot_id
}

#[tokio::test]
async fn single_bit_change_in_stored_content_fails_verification() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    let original = stored_ballot(&harness, &gathering_id).await;

    let altered = store_altered_copy(&harness, &original, |ballot| {
        let mut bytes = ballot.content.clone().into_bytes();
        let index = bytes.iter().position(|byte| *byte == b'y').expect("vote value");
        bytes[index] ^= 0x01;
        ballot.content = String::from_utf8(bytes).expect("ascii content");
    })
    .await;

    let verification = harness
        .ballots
        .verify(&gathering_id, &altered, &original.content_hash)
        .await
        .expect("verify");
    assert!(!verification.valid);
}

#[tokio::test]
async fn rewritten_stored_hash_fails_verification() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    let original = stored_ballot(&harness, &gathering_id).await;
    let forged_hash = content_hash(b"forged");

    let altered = store_altered_copy(&harness, &original, |ballot| {
        ballot.content_hash = forged_hash.clone();
    })
    .await;

    for claimed in [&original.content_hash, &forged_hash] {
        let verification = harness
            .ballots
            .verify(&gathering_id, &altered, claimed)
            .await
            .expect("verify");
        assert!(!verification.valid);
    }
}

#[tokio::test]
async fn verification_only_sees_ballots_of_the_gathering() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    let ballot = stored_ballot(&harness, &gathering_id).await;
    let other_gathering = draft_gathering(&harness).await;

    let err = harness
        .ballots
        .verify(&other_gathering, &ballot.ballot_id, &ballot.content_hash)
        .await
        .expect_err("foreign ballot");
    assert!(matches!(err, DomainError::NotFound));
}

#[tokio::test]
async fn failed_participant_write_releases_claimed_slots() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    activate(&harness, &gathering_id).await;

    let failing = registry(
        &harness.stores,
        Arc::new(UnwritableParticipants(harness.stores.participants.clone())),
        harness.scheduler.clone(),
    );
    let err = failing
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1, 2]))
        .await
        .expect_err("write fails");
    assert!(matches!(err, DomainError::Collaborator(_)));

    let slots = harness
        .stores
        .slots
        .list_by_gathering(&gathering_id)
        .await
        .expect("slots");
    assert!(slots.iter().all(|slot| slot.participant_id.is_none()));

    let participant = harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(10, vec![1, 2]))
        .await
        .expect("retry");
    assert_eq!(participant.unit_ids, vec![1, 2]);
}

#[tokio::test]
async fn requalification_prunes_unclaimed_slots_only() {
    let harness = harness().await;
    let gathering_id = draft_gathering(&harness).await;
    activate(&harness, &gathering_id).await;
    harness
        .participants
        .register(&actor(), ASSOCIATION, &gathering_id, owner_registration(12, vec![4]))
        .await
        .expect("register carla");

    harness.inventory.deactivate_unit(3).await;
    harness.inventory.deactivate_unit(4).await;
    let qualified = harness
        .gatherings
        .refresh_qualification(ASSOCIATION, &gathering_id)
        .await
        .expect("refresh");
    assert_eq!(qualified.count, 2);

    let mut unit_ids: Vec<i64> = harness
        .stores
        .slots
        .list_by_gathering(&gathering_id)
        .await
        .expect("slots")
        .into_iter()
        .map(|slot| slot.unit_id)
        .collect();
    unit_ids.sort_unstable();
    assert_eq!(unit_ids, vec![1, 2, 4]);
}
