//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{MaybeSession, Session};
use crate::credits;
use crate::db;
use crate::errors::{EarnError, Result};
use crate::listings::{self, Context, ListingParams};
use crate::models::{
    GrantApplicationRecord, ListingRecord, SubmissionLabel, SubmissionRecord, TrancheRecord,
};
use crate::notifications::{unique_recipients, Notification, NotificationQueue};
use crate::tranche::{self, Decision, TrancheRequest};

pub struct ApiState {
    pub pool: SqlitePool,
    pub notifications: NotificationQueue,
    pub jwt_key: DecodingKey,
    pub monthly_credit_allowance: i64,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/listings", get(get_listings))
        .route("/hackathon/:slug/listings", get(get_hackathon_listings))
        .route("/grant-application/request-tranche", post(request_tranche))
        .route("/submissions", post(create_submission))
        .route("/user/credits", get(get_credits))
        .route("/sponsor/listings/:id/publish", post(publish_listing))
        .route("/sponsor/listings/:id/announce", post(announce_winners))
        .route("/sponsor/submissions/:id/label", post(label_submission))
        .route("/sponsor/submissions/:id/winner", post(select_winner))
        .route(
            "/sponsor/grant-application/:id/decision",
            post(decide_application),
        )
        .route("/sponsor/grant-tranche/:id/decision", post(decide_tranche))
        .route("/sponsor/grant-tranche/:id/paid", post(mark_tranche_paid))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Queue notifications for a write that has already committed. Delivery
/// runs in a spawned task; broker failures are logged, not returned.
fn notify_all(queue: &NotificationQueue, notifications: Vec<Notification>) {
    let queue = queue.clone();
    tokio::spawn(async move {
        let mut batch = JoinSet::new();
        for notification in notifications {
            let queue = queue.clone();
            batch.spawn(async move {
                let kind = notification.kind();
                if let Err(e) = queue.enqueue(notification, None).await {
                    warn!(kind, "Notification dropped: {e}");
                }
            });
        }
        while let Some(joined) = batch.join_next().await {
            if let Err(e) = joined {
                warn!("Notification task failed: {e}");
            }
        }
    });
}

fn notify(queue: &NotificationQueue, notification: Notification) {
    notify_all(queue, vec![notification]);
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| EarnError::BadRequest(e.body_text()))
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTrancheBody {
    pub application_id: i64,
    pub help_wanted: Option<String>,
    pub project_update: Option<String>,
    pub wallet_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmissionBody {
    pub listing_id: i64,
    pub link: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub month: DateTime<Utc>,
    pub balance: i64,
    pub allowance: i64,
    pub usable: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceResponse {
    pub message: String,
    pub winners: usize,
}

#[derive(Debug, Deserialize)]
pub struct LabelBody {
    pub label: SubmissionLabel,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerBody {
    pub is_winner: bool,
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub decision: Decision,
    pub approved_amount: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn run_listing_query(
    state: &ApiState,
    session: Option<Session>,
    params: &ListingParams,
    max_take: i64,
) -> Result<Vec<ListingRecord>> {
    let profile = match session {
        Some(s) => db::get_user_profile(&state.pool, s.user_id).await?,
        None => None,
    };
    let query =
        listings::build_listing_query(params, profile.as_ref(), Utc::now().timestamp(), max_take);
    db::fetch_listings(&state.pool, &query).await
}

/// `GET /listings`
pub async fn get_listings(
    State(state): State<Arc<ApiState>>,
    MaybeSession(session): MaybeSession,
    params: std::result::Result<Query<ListingParams>, QueryRejection>,
) -> Result<Json<Vec<ListingRecord>>> {
    let Query(params) = params.map_err(|e| EarnError::BadRequest(e.body_text()))?;
    let rows = run_listing_query(&state, session, &params, listings::LISTINGS_MAX_TAKE).await?;
    Ok(Json(rows))
}

/// `GET /hackathon/:slug/listings`
pub async fn get_hackathon_listings(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    MaybeSession(session): MaybeSession,
    params: std::result::Result<Query<ListingParams>, QueryRejection>,
) -> Result<Json<Vec<ListingRecord>>> {
    let Query(mut params) = params.map_err(|e| EarnError::BadRequest(e.body_text()))?;
    params.context = Context::Hackathon;
    params.hackathon = Some(slug);
    let rows = run_listing_query(&state, session, &params, listings::HACKATHON_MAX_TAKE).await?;
    Ok(Json(rows))
}

/// `POST /grant-application/request-tranche`
///
/// Applicant asks for the next installment of an approved grant.
pub async fn request_tranche(
    State(state): State<Arc<ApiState>>,
    session: Session,
    payload: std::result::Result<Json<RequestTrancheBody>, JsonRejection>,
) -> Result<Json<MessageResponse>> {
    let req = body(payload)?;
    let wallet = req.wallet_address.trim();
    if wallet.is_empty() {
        return Err(EarnError::BadRequest("walletAddress is required".to_string()));
    }

    let app = db::get_application(&state.pool, req.application_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant application".to_string()))?;
    if app.user_id != session.user_id {
        return Err(EarnError::Forbidden(
            "grant application belongs to another user".to_string(),
        ));
    }

    let tranche = tranche::create_tranche(
        &state.pool,
        &TrancheRequest {
            application_id: app.id,
            help_wanted: req.help_wanted.as_deref(),
            update: req.project_update.as_deref(),
            is_first_tranche: false,
            wallet_address: Some(wallet),
        },
    )
    .await?;

    notify(
        &state.notifications,
        Notification::TrancheRequested {
            application_id: app.id,
            tranche_id: tranche.id,
        },
    );
    Ok(MessageResponse::new("Tranche requested successfully"))
}

/// `POST /submissions`
///
/// Spends one submission credit; refused once the month's credits are gone.
pub async fn create_submission(
    State(state): State<Arc<ApiState>>,
    session: Session,
    payload: std::result::Result<Json<CreateSubmissionBody>, JsonRejection>,
) -> Result<Json<SubmissionRecord>> {
    let req = body(payload)?;
    let listing = db::get_listing(&state.pool, req.listing_id)
        .await?
        .filter(|l| l.is_published)
        .ok_or_else(|| EarnError::NotFound("Listing".to_string()))?;

    let now = Utc::now();
    if listing.deadline <= now.timestamp() || listing.is_winner_announced {
        return Err(EarnError::invariant(
            "listing is no longer accepting submissions",
        ));
    }
    let usable = credits::usable_credits(
        &state.pool,
        session.user_id,
        state.monthly_credit_allowance,
        now,
    )
    .await?;
    if usable <= 0 {
        return Err(EarnError::invariant("no submission credits left this month"));
    }

    let submission =
        db::insert_submission(&state.pool, listing.id, session.user_id, &req.link).await?;
    credits::consume_credit(&state.pool, session.user_id, submission.id).await?;
    info!(
        listing_id = listing.id,
        submission_id = submission.id,
        "Submission created"
    );

    notify(
        &state.notifications,
        Notification::SubmissionReceived {
            listing_id: listing.id,
            submission_id: submission.id,
            user_id: session.user_id,
        },
    );
    Ok(Json(submission))
}

/// `GET /user/credits`
pub async fn get_credits(
    State(state): State<Arc<ApiState>>,
    session: Session,
) -> Result<Json<CreditsResponse>> {
    let now = Utc::now();
    let allowance = state.monthly_credit_allowance;
    Ok(Json(CreditsResponse {
        month: credits::month_start(now),
        balance: credits::credit_balance(&state.pool, session.user_id, now).await?,
        allowance,
        usable: credits::usable_credits(&state.pool, session.user_id, allowance, now).await?,
    }))
}

async fn sponsor_listing(state: &ApiState, session: &Session, listing_id: i64) -> Result<ListingRecord> {
    let listing = db::get_listing(&state.pool, listing_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Listing".to_string()))?;
    session.ensure_sponsor_of(listing.sponsor_id)?;
    Ok(listing)
}

/// `POST /sponsor/listings/:id/publish`
pub async fn publish_listing(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(listing_id): Path<i64>,
) -> Result<Json<MessageResponse>> {
    let listing = sponsor_listing(&state, &session, listing_id).await?;
    if listing.is_published {
        return Err(EarnError::invariant("listing is already published"));
    }
    db::publish_listing(&state.pool, listing.id).await?;
    info!(listing_id, "Listing published");

    notify(&state.notifications, Notification::ListingCreated { listing_id });
    Ok(MessageResponse::new("Listing published"))
}

/// `POST /sponsor/listings/:id/announce`
///
/// Announces winners: win bonuses for winners, penalties for spam, and one
/// notification per distinct submitter address.
pub async fn announce_winners(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(listing_id): Path<i64>,
) -> Result<Json<AnnounceResponse>> {
    let listing = sponsor_listing(&state, &session, listing_id).await?;
    if listing.is_winner_announced {
        return Err(EarnError::invariant("winners have already been announced"));
    }

    let winners: Vec<_> = db::submissions_for_listing(&state.pool, listing.id)
        .await?
        .into_iter()
        .filter(|s| s.is_winner)
        .collect();
    if winners.is_empty() {
        return Err(EarnError::invariant(
            "select at least one winner before announcing",
        ));
    }

    // Only the caller that flips the flag writes ledger entries.
    if !db::mark_winners_announced(&state.pool, listing.id).await? {
        return Err(EarnError::invariant("winners have already been announced"));
    }
    for winner in &winners {
        credits::add_win_bonus_credit(&state.pool, winner.user_id, winner.id).await?;
    }
    credits::add_spam_penalty_credit(&state.pool, listing.id).await?;
    info!(listing_id, winners = winners.len(), "Winners announced");

    let recipients = unique_recipients(db::submitter_emails(&state.pool, listing.id).await?);
    notify_all(
        &state.notifications,
        recipients
            .into_iter()
            .map(|email| Notification::WinnersAnnounced { listing_id, email })
            .collect(),
    );

    Ok(Json(AnnounceResponse {
        message: "Winners announced".to_string(),
        winners: winners.len(),
    }))
}

async fn sponsor_submission(
    state: &ApiState,
    session: &Session,
    submission_id: i64,
) -> Result<SubmissionRecord> {
    let submission = db::get_submission(&state.pool, submission_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Submission".to_string()))?;
    let listing = sponsor_listing(state, session, submission.listing_id).await?;
    if listing.is_winner_announced {
        return Err(EarnError::invariant(
            "submissions are final once winners are announced",
        ));
    }
    Ok(submission)
}

/// `POST /sponsor/submissions/:id/label`
pub async fn label_submission(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(submission_id): Path<i64>,
    payload: std::result::Result<Json<LabelBody>, JsonRejection>,
) -> Result<Json<SubmissionRecord>> {
    let req = body(payload)?;
    let submission = sponsor_submission(&state, &session, submission_id).await?;
    let updated = db::set_submission_label(&state.pool, submission.id, req.label).await?;
    Ok(Json(updated))
}

/// `POST /sponsor/submissions/:id/winner`
pub async fn select_winner(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(submission_id): Path<i64>,
    payload: std::result::Result<Json<WinnerBody>, JsonRejection>,
) -> Result<Json<SubmissionRecord>> {
    let req = body(payload)?;
    let submission = sponsor_submission(&state, &session, submission_id).await?;
    if req.is_winner && submission.label == SubmissionLabel::Spam {
        return Err(EarnError::invariant("a spam submission cannot win"));
    }
    let position = if req.is_winner { req.position } else { None };
    let updated =
        db::set_submission_winner(&state.pool, submission.id, req.is_winner, position).await?;
    Ok(Json(updated))
}

async fn sponsor_application(
    state: &ApiState,
    session: &Session,
    application_id: i64,
) -> Result<GrantApplicationRecord> {
    let app = db::get_application(&state.pool, application_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant application".to_string()))?;
    session.ensure_sponsor_of(app.sponsor_id)?;
    Ok(app)
}

/// `POST /sponsor/grant-application/:id/decision`
pub async fn decide_application(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(application_id): Path<i64>,
    payload: std::result::Result<Json<DecisionBody>, JsonRejection>,
) -> Result<Json<GrantApplicationRecord>> {
    let req = body(payload)?;
    sponsor_application(&state, &session, application_id).await?;

    let (app, _first_tranche) =
        tranche::decide_application(&state.pool, application_id, req.decision, req.approved_amount)
            .await?;

    let notification = match req.decision {
        Decision::Approved => Notification::GrantApplicationApproved {
            application_id,
            user_id: app.user_id,
        },
        Decision::Rejected => Notification::GrantApplicationRejected {
            application_id,
            user_id: app.user_id,
        },
    };
    notify(&state.notifications, notification);
    Ok(Json(app))
}

async fn sponsor_tranche(
    state: &ApiState,
    session: &Session,
    tranche_id: i64,
) -> Result<(TrancheRecord, GrantApplicationRecord)> {
    let tranche = db::get_tranche(&state.pool, tranche_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant tranche".to_string()))?;
    let app = sponsor_application(state, session, tranche.application_id).await?;
    Ok((tranche, app))
}

/// `POST /sponsor/grant-tranche/:id/decision`
pub async fn decide_tranche(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(tranche_id): Path<i64>,
    payload: std::result::Result<Json<DecisionBody>, JsonRejection>,
) -> Result<Json<TrancheRecord>> {
    let req = body(payload)?;
    let (_, app) = sponsor_tranche(&state, &session, tranche_id).await?;

    let updated =
        tranche::decide_tranche(&state.pool, tranche_id, req.decision, req.approved_amount)
            .await?;

    let notification = match req.decision {
        Decision::Approved => Notification::TrancheApproved {
            tranche_id,
            user_id: app.user_id,
        },
        Decision::Rejected => Notification::TrancheRejected {
            tranche_id,
            user_id: app.user_id,
        },
    };
    notify(&state.notifications, notification);
    Ok(Json(updated))
}

/// `POST /sponsor/grant-tranche/:id/paid`
pub async fn mark_tranche_paid(
    State(state): State<Arc<ApiState>>,
    session: Session,
    Path(tranche_id): Path<i64>,
) -> Result<Json<TrancheRecord>> {
    let (_, app) = sponsor_tranche(&state, &session, tranche_id).await?;
    let paid = tranche::mark_tranche_paid(&state.pool, tranche_id).await?;

    notify(
        &state.notifications,
        Notification::PaymentAdded {
            tranche_id,
            user_id: app.user_id,
        },
    );
    Ok(Json(paid))
}

// ─────────────────────────────────────────────────────────
// Route tests
// ─────────────────────────────────────────────────────────
