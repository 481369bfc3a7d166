use std::net::SocketAddr;

use apc_domain::{
    audit::AuditEntry,
    ballots::{BallotMetadata, BallotVerification, VoteMap},
    eligibility::{EligibleVoter, NonParticipatingOwner, QualifiedUnitView},
    error::DomainError,
    gathering::{Gathering, GatheringCreate, QualificationRule, UnitAggregate},
    identity::ActorIdentity,
    matters::{MatterType, VotingConfig, VotingMatter, VotingMatterInput},
    notifications::{Notification, NotificationChannel, NotificationType},
    participants::{Participant, ParticipantRegistration, ParticipantSummary, ParticipantType},
    report::MarkdownReport,
    results::VoteResults,
    tally::MatterTally,
};
use axum::extract::{ConnectInfo, Extension, Path, Query, State};
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::middleware::AuthContext;
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/associations/:association_id/gatherings",
            post(create_gathering).get(list_gatherings),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id",
            get(get_gathering),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/status",
            post(update_status),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/qualification/refresh",
            post(refresh_qualification),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/matters",
            post(create_matter).get(list_matters),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/matters/:matter_id",
            put(update_matter).delete(delete_matter),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/participants",
            post(register_participant).get(list_participants),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/participants/:participant_id/check-in",
            post(check_in_participant),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/ballots",
            post(submit_ballot).get(list_ballots),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/ballots/with-registration",
            post(register_and_vote),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/ballots/:ballot_id/verify",
            post(verify_ballot),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/ballots/:ballot_id/invalidate",
            post(invalidate_ballot),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/tallies",
            get(list_tallies),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/results",
            get(get_results).delete(invalidate_results),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/eligibility/units",
            get(list_qualified_units),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/eligibility/voters",
            get(list_eligible_voters),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/eligibility/non-participating",
            get(list_non_participating_owners),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/reports/results",
            get(results_report),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/reports/ballots",
            get(ballots_report),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/notifications",
            post(send_notifications),
        )
        .route(
            "/v1/associations/:association_id/gatherings/:gathering_id/audit",
            get(list_audit_entries),
        )
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        app = app.layer(app_middleware::rate_limit_layer());
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    data_backend: &'static str,
    database: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db = state.stores.db.clone();
    let database = match db.health_check().await {
        Ok(()) => "reachable",
        Err(err) => {
            tracing::warn!(backend = db.name(), error = %err, "database health check failed");
            "unreachable"
        }
    };
    Json(HealthResponse {
        status: if database == "reachable" { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        data_backend: db.name(),
        database,
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

type GatheringPath = Path<(i64, String)>;

#[derive(Debug, Deserialize, Validate)]
struct CreateGatheringRequest {
    #[validate(length(min = 1, max = 255))]
    title: String,
    description: Option<String>,
    intent: Option<String>,
    #[validate(length(min = 1, max = 255))]
    location: String,
    gathering_date_ms: i64,
    #[validate(length(min = 1, max = 32))]
    gathering_type: String,
    voting_mode: Option<String>,
    #[serde(default)]
    qualification: QualificationRule,
}

async fn create_gathering(
    State(state): State<AppState>,
    Path(association_id): Path<i64>,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<CreateGatheringRequest>,
) -> Result<(StatusCode, Json<Gathering>), ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    let actor = actor_identity(&auth, connect_info, &headers)?;
    let input = GatheringCreate {
        title: payload.title,
        description: payload.description,
        intent: payload.intent,
        location: payload.location,
        gathering_date_ms: payload.gathering_date_ms,
        gathering_type: payload.gathering_type,
        voting_mode: payload.voting_mode,
        qualification: payload.qualification,
    };
    let gathering = state
        .gatherings
        .create(&actor, association_id, input)
        .await
        .map_err(map_domain_error)?;
    Ok((StatusCode::CREATED, Json(gathering)))
}

async fn list_gatherings(
    State(state): State<AppState>,
    Path(association_id): Path<i64>,
) -> Result<Json<Vec<Gathering>>, ApiError> {
    let gatherings = state
        .gatherings
        .list(association_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(gatherings))
}

async fn get_gathering(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Gathering>, ApiError> {
    let gathering = scoped_gathering(&state, association_id, &gathering_id).await?;
    Ok(Json(gathering))
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateStatusRequest {
    #[validate(length(min = 1, max = 32))]
    status: String,
}

async fn update_status(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Gathering>, ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    let actor = actor_identity(&auth, connect_info, &headers)?;
    let gathering = state
        .gatherings
        .transition_status(&actor, association_id, &gathering_id, &payload.status)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(gathering))
}

async fn refresh_qualification(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<UnitAggregate>, ApiError> {
    auth.require_manager()?;
    let aggregate = state
        .gatherings
        .refresh_qualification(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(aggregate))
}

#[derive(Debug, Deserialize, Validate)]
struct MatterRequest {
    #[serde(default)]
    order_index: i32,
    #[validate(length(min = 1, max = 255))]
    title: String,
    description: Option<String>,
    matter_type: MatterType,
    #[serde(default)]
    voting_config: VotingConfig,
}

impl MatterRequest {
    fn into_input(self) -> VotingMatterInput {
        VotingMatterInput {
            order_index: self.order_index,
            title: self.title,
            description: self.description,
            matter_type: self.matter_type,
            voting_config: self.voting_config,
        }
    }
}

async fn create_matter(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<MatterRequest>,
) -> Result<(StatusCode, Json<VotingMatter>), ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let matter = state
        .matters
        .create(association_id, &gathering_id, payload.into_input())
        .await
        .map_err(map_domain_error)?;
    Ok((StatusCode::CREATED, Json(matter)))
}

async fn list_matters(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Vec<VotingMatter>>, ApiError> {
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let matters = state
        .matters
        .list(&gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(matters))
}

async fn update_matter(
    State(state): State<AppState>,
    Path((association_id, gathering_id, matter_id)): Path<(i64, String, String)>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<MatterRequest>,
) -> Result<Json<VotingMatter>, ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let matter = state
        .matters
        .update(association_id, &gathering_id, &matter_id, payload.into_input())
        .await
        .map_err(map_domain_error)?;
    Ok(Json(matter))
}

async fn delete_matter(
    State(state): State<AppState>,
    Path((association_id, gathering_id, matter_id)): Path<(i64, String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    auth.require_manager()?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    state
        .matters
        .delete(association_id, &gathering_id, &matter_id)
        .await
        .map_err(map_domain_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
struct RegisterParticipantRequest {
    participant_type: ParticipantType,
    owner_id: Option<i64>,
    delegating_owner_id: Option<i64>,
    #[validate(length(max = 255))]
    delegate_name: Option<String>,
    #[validate(length(max = 255))]
    delegation_document_ref: Option<String>,
    #[validate(length(min = 1, max = 500))]
    unit_ids: Vec<i64>,
}

impl From<RegisterParticipantRequest> for ParticipantRegistration {
    fn from(payload: RegisterParticipantRequest) -> Self {
        Self {
            participant_type: payload.participant_type,
            owner_id: payload.owner_id,
            delegating_owner_id: payload.delegating_owner_id,
            delegate_name: payload.delegate_name,
            delegation_document_ref: payload.delegation_document_ref,
            unit_ids: payload.unit_ids,
        }
    }
}

async fn register_participant(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<RegisterParticipantRequest>,
) -> Result<(StatusCode, Json<Participant>), ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    let actor = actor_identity(&auth, connect_info, &headers)?;
    let participant = state
        .participants
        .register(&actor, association_id, &gathering_id, payload.into())
        .await
        .map_err(map_domain_error)?;
    Ok((StatusCode::CREATED, Json(participant)))
}

async fn list_participants(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Vec<ParticipantSummary>>, ApiError> {
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let participants = state
        .participants
        .list(&gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(participants))
}

async fn check_in_participant(
    State(state): State<AppState>,
    Path((association_id, gathering_id, participant_id)): Path<(i64, String, String)>,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<Participant>, ApiError> {
    auth.require_manager()?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let actor = actor_identity(&auth, connect_info, &headers)?;
    let participant = state
        .participants
        .check_in(&actor, &gathering_id, &participant_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(participant))
}

#[derive(Debug, Deserialize, Validate)]
struct SubmitBallotRequest {
    #[validate(length(min = 1, max = 128))]
    participant_id: String,
    votes: VoteMap,
}

#[derive(Serialize)]
struct SubmitBallotResponse {
    ballot_id: String,
    content_hash: String,
    submitted_at_ms: i64,
}

async fn submit_ballot(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<SubmitBallotRequest>,
) -> Result<(StatusCode, Json<SubmitBallotResponse>), ApiError> {
    auth.require_voter()?;
    validation::validate(&payload)?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let participant = state
        .participants
        .get(&gathering_id, &payload.participant_id)
        .await
        .map_err(map_domain_error)?;
    auth.require_vote_for(participant.effective_owner_id)?;
    let actor = actor_identity(&auth, connect_info, &headers)?;
    let submitted = state
        .ballots
        .submit(
            &actor,
            association_id,
            &gathering_id,
            &payload.participant_id,
            payload.votes,
        )
        .await;
    let ballot = match submitted {
        Ok(ballot) => {
            observability::register_ballot_submission("accepted");
            ballot
        }
        Err(err) => {
            observability::register_ballot_submission("rejected");
            return Err(map_domain_error(err));
        }
    };
    Ok((
        StatusCode::CREATED,
        Json(SubmitBallotResponse {
            ballot_id: ballot.ballot_id,
            content_hash: ballot.content_hash,
            submitted_at_ms: ballot.submitted_at_ms,
        }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
struct RegisterAndVoteRequest {
    #[validate(nested)]
    registration: RegisterParticipantRequest,
    votes: VoteMap,
}

#[derive(Serialize)]
struct RegisterAndVoteResponse {
    participant: Participant,
    ballot: SubmitBallotResponse,
}

/// Registers the participant and stores its ballot in one request. A ballot the
/// ledger rejects leaves the registration in place so the voter can retry.
async fn register_and_vote(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<RegisterAndVoteRequest>,
) -> Result<(StatusCode, Json<RegisterAndVoteResponse>), ApiError> {
    auth.require_voter()?;
    validation::validate(&payload)?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let registration = ParticipantRegistration::from(payload.registration);
    let owner_id = registration
        .effective_owner_id()
        .map_err(map_domain_error)?;
    auth.require_vote_for(owner_id)?;
    let actor = actor_identity(&auth, connect_info, &headers)?;

    let participant = state
        .participants
        .register(&actor, association_id, &gathering_id, registration)
        .await
        .map_err(map_domain_error)?;
    let submitted = state
        .ballots
        .submit(
            &actor,
            association_id,
            &gathering_id,
            &participant.participant_id,
            payload.votes,
        )
        .await;
    let ballot = match submitted {
        Ok(ballot) => {
            observability::register_ballot_submission("accepted");
            ballot
        }
        Err(err) => {
            observability::register_ballot_submission("rejected");
            tracing::warn!(
                gathering_id = %gathering_id,
                participant_id = %participant.participant_id,
                error = %err,
                "ballot rejected after registration"
            );
            return Err(map_domain_error(err));
        }
    };
    Ok((
        StatusCode::CREATED,
        Json(RegisterAndVoteResponse {
            participant,
            ballot: SubmitBallotResponse {
                ballot_id: ballot.ballot_id,
                content_hash: ballot.content_hash,
                submitted_at_ms: ballot.submitted_at_ms,
            },
        }),
    ))
}

async fn list_ballots(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<BallotMetadata>>, ApiError> {
    auth.require_manager()?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let ballots = state
        .ballots
        .list_metadata(&gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(ballots))
}

#[derive(Debug, Deserialize, Validate)]
struct VerifyBallotRequest {
    #[validate(length(min = 1, max = 128))]
    hash: String,
}

async fn verify_ballot(
    State(state): State<AppState>,
    Path((association_id, gathering_id, ballot_id)): Path<(i64, String, String)>,
    Json(payload): Json<VerifyBallotRequest>,
) -> Result<Json<BallotVerification>, ApiError> {
    validation::validate(&payload)?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let verification = state
        .ballots
        .verify(&gathering_id, &ballot_id, &payload.hash)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(verification))
}

#[derive(Debug, Deserialize, Validate)]
struct InvalidateBallotRequest {
    #[validate(length(min = 1, max = 500))]
    reason: String,
}

#[derive(Serialize)]
struct InvalidateBallotResponse {
    ballot_id: String,
    is_valid: bool,
    invalidation_reason: Option<String>,
    invalidated_at_ms: Option<i64>,
}

async fn invalidate_ballot(
    State(state): State<AppState>,
    Path((association_id, gathering_id, ballot_id)): Path<(i64, String, String)>,
    Extension(auth): Extension<AuthContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<InvalidateBallotRequest>,
) -> Result<Json<InvalidateBallotResponse>, ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let actor = actor_identity(&auth, connect_info, &headers)?;
    let ballot = state
        .ballots
        .invalidate(&actor, &gathering_id, &ballot_id, &payload.reason)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(InvalidateBallotResponse {
        ballot_id: ballot.ballot_id,
        is_valid: ballot.is_valid,
        invalidation_reason: ballot.invalidation_reason,
        invalidated_at_ms: ballot.invalidated_at_ms,
    }))
}

async fn list_tallies(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Vec<MatterTally>>, ApiError> {
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let tallies = state
        .tallies
        .list(&gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(tallies))
}

async fn get_results(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<VoteResults>, ApiError> {
    let results = state
        .results
        .get_or_compute(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(results))
}

async fn invalidate_results(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    auth.require_manager()?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    state
        .results
        .invalidate(&gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_qualified_units(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Vec<QualifiedUnitView>>, ApiError> {
    let units = state
        .eligibility
        .qualified_units(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(units))
}

async fn list_eligible_voters(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Vec<EligibleVoter>>, ApiError> {
    let voters = state
        .eligibility
        .eligible_voters(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(voters))
}

async fn list_non_participating_owners(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Json<Vec<NonParticipatingOwner>>, ApiError> {
    let owners = state
        .eligibility
        .non_participating_owners(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(owners))
}

async fn results_report(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
) -> Result<Response, ApiError> {
    let report = state
        .reports
        .results_report(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(markdown_download(report))
}

async fn ballots_report(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    auth.require_manager()?;
    let report = state
        .reports
        .ballots_report(association_id, &gathering_id)
        .await
        .map_err(map_domain_error)?;
    Ok(markdown_download(report))
}

fn markdown_download(report: MarkdownReport) -> Response {
    (
        [
            (
                header::CONTENT_TYPE,
                "text/markdown; charset=utf-8".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", report.filename),
            ),
        ],
        report.body,
    )
        .into_response()
}

#[derive(Debug, Deserialize, Validate)]
struct SendNotificationsRequest {
    #[validate(length(min = 1, max = 32))]
    notification_type: String,
    #[serde(default)]
    channel: String,
    #[validate(length(min = 1, max = 1000))]
    owner_ids: Vec<i64>,
}

#[derive(Serialize)]
struct SendNotificationsResponse {
    sent: usize,
    notifications: Vec<Notification>,
}

async fn send_notifications(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SendNotificationsRequest>,
) -> Result<Json<SendNotificationsResponse>, ApiError> {
    auth.require_manager()?;
    validation::validate(&payload)?;
    let notification_type = payload
        .notification_type
        .trim()
        .parse::<NotificationType>()
        .map_err(map_domain_error)?;
    let channel = payload
        .channel
        .trim()
        .parse::<NotificationChannel>()
        .map_err(map_domain_error)?;
    let notifications = state
        .notifications
        .send(
            association_id,
            &gathering_id,
            notification_type,
            channel,
            &payload.owner_ids,
        )
        .await
        .map_err(map_domain_error)?;
    Ok(Json(SendNotificationsResponse {
        sent: notifications.len(),
        notifications,
    }))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

async fn list_audit_entries(
    State(state): State<AppState>,
    Path((association_id, gathering_id)): GatheringPath,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    auth.require_manager()?;
    scoped_gathering(&state, association_id, &gathering_id).await?;
    let entries = state
        .audit
        .list(&gathering_id, query.limit)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(entries))
}

/// Resolves the gathering inside the association named by the path so that
/// gathering-keyed services cannot leak across associations.
async fn scoped_gathering(
    state: &AppState,
    association_id: i64,
    gathering_id: &str,
) -> Result<Gathering, ApiError> {
    state
        .gatherings
        .get(association_id, gathering_id)
        .await
        .map_err(map_domain_error)
}

fn actor_identity(
    auth: &AuthContext,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> Result<ActorIdentity, ApiError> {
    let user_id = auth
        .user_id
        .as_ref()
        .filter(|user_id| !user_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    let origin_ip = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Ok(ActorIdentity::with_user_id(user_id.as_str()).with_origin(origin_ip, user_agent))
}

fn map_domain_error(err: DomainError) -> ApiError {
    match err {
        DomainError::Validation(message) => ApiError::Validation(message),
        DomainError::NotFound => ApiError::NotFound,
        DomainError::Conflict => ApiError::Conflict("resource already exists".into()),
        DomainError::StateConflict(message) => ApiError::Conflict(message),
        DomainError::Collaborator(message) => {
            tracing::error!(error = %message, "collaborator failure");
            ApiError::Internal
        }
    }
}
