//! Grant tranche disbursement.
//!
//! An approved grant is paid out in installments ("tranches"). Small
//! grants (approved amount up to [`LARGE_GRANT_THRESHOLD`]) are split
//! 50/50; larger grants are split 30/30/40 so the biggest share is paid
//! after delivery.
//!
//! ## Ordering
//!
//! Tranches of one application form a strict sequence: the first is
//! created (already approved) when the sponsor approves the application,
//! every later one is requested by the applicant and only once the
//! previous tranche is `Paid`.
//!
//! ## Concurrency
//!
//! Creation is a conditional append. The next `sequence` is computed from
//! the rows read inside the same transaction, and the
//! `UNIQUE(application_id, sequence)` constraint rejects a second insert
//! for the same slot, so two racing requests cannot exceed the cap. Every
//! transaction that touches an application takes its write lock before
//! reading, so racing writers queue up and then see each other's rows.

use chrono::Utc;
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::db::{self, NewTranche};
use crate::errors::{EarnError, Result};
use crate::models::{ApplicationStatus, GrantApplicationRecord, TrancheRecord, TrancheStatus};

/// Approved amounts above this are paid in three tranches instead of two.
pub const LARGE_GRANT_THRESHOLD: i64 = 5000;

const SMALL_GRANT_SHARES: [i64; 2] = [50, 50];
const LARGE_GRANT_SHARES: [i64; 3] = [30, 30, 40];

fn shares(approved_amount: i64) -> &'static [i64] {
    if approved_amount > LARGE_GRANT_THRESHOLD {
        &LARGE_GRANT_SHARES
    } else {
        &SMALL_GRANT_SHARES
    }
}

/// Maximum number of tranches for an approved amount.
pub fn tranche_cap(approved_amount: i64) -> usize {
    shares(approved_amount).len()
}

/// Ask amount of the tranche at 1-based `sequence`.
///
/// Non-final tranches take the floor of their share; the final tranche
/// takes whatever is left so the schedule always sums to `approved_amount`.
pub fn tranche_amount(approved_amount: i64, sequence: usize) -> Option<i64> {
    let shares = shares(approved_amount);
    if sequence == 0 || sequence > shares.len() {
        return None;
    }
    if sequence == shares.len() {
        let before: i64 = shares[..sequence - 1]
            .iter()
            .map(|pct| approved_amount * pct / 100)
            .sum();
        Some(approved_amount - before)
    } else {
        Some(approved_amount * shares[sequence - 1] / 100)
    }
}

/// What the next tranche of an application will look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTranche {
    pub sequence: i64,
    pub ask_amount: i64,
    pub status: TrancheStatus,
}

/// Validate a tranche request against the application's existing tranches
/// (in creation order) and compute the next one.
pub fn plan_next_tranche(
    approved_amount: i64,
    existing: &[TrancheRecord],
    is_first_tranche: bool,
) -> Result<PlannedTranche> {
    let cap = tranche_cap(approved_amount);

    if existing.len() >= cap {
        return Err(EarnError::invariant("all tranches already created"));
    }
    if is_first_tranche && !existing.is_empty() {
        return Err(EarnError::invariant("first tranche has already been created"));
    }
    if !is_first_tranche && existing.is_empty() {
        return Err(EarnError::invariant(
            "first tranche must be created when the application is approved",
        ));
    }
    if let Some(last) = existing.last() {
        if last.status != TrancheStatus::Paid {
            return Err(EarnError::invariant(
                "previous tranche must be paid before requesting a new tranche",
            ));
        }
    }

    let sequence = existing.len() + 1;
    let ask_amount = tranche_amount(approved_amount, sequence)
        .ok_or_else(|| EarnError::invariant("all tranches already created"))?;

    Ok(PlannedTranche {
        sequence: sequence as i64,
        ask_amount,
        status: if is_first_tranche {
            TrancheStatus::Approved
        } else {
            TrancheStatus::Pending
        },
    })
}

fn approved_amount_of(app: &GrantApplicationRecord) -> Result<i64> {
    match (app.status, app.approved_amount) {
        (ApplicationStatus::Approved | ApplicationStatus::Completed, Some(amount)) => Ok(amount),
        _ => Err(EarnError::invariant("grant application has not been approved")),
    }
}

/// Tranche creation request.
#[derive(Debug, Clone, Default)]
pub struct TrancheRequest<'a> {
    pub application_id: i64,
    pub help_wanted: Option<&'a str>,
    pub update: Option<&'a str>,
    pub is_first_tranche: bool,
    /// Payout wallet stored on the applicant together with the tranche.
    pub wallet_address: Option<&'a str>,
}

/// Create the next tranche of an application.
///
/// Does not notify anyone; callers queue the relevant notification.
pub async fn create_tranche(pool: &SqlitePool, req: &TrancheRequest<'_>) -> Result<TrancheRecord> {
    let mut tx = pool.begin().await?;
    db::lock_application(&mut *tx, req.application_id).await?;
    let tranche = append_tranche(&mut tx, req).await?;
    tx.commit().await?;
    Ok(tranche)
}

/// Validate and insert the next tranche on a connection inside a
/// transaction that already holds the application's write lock.
async fn append_tranche(
    conn: &mut SqliteConnection,
    req: &TrancheRequest<'_>,
) -> Result<TrancheRecord> {
    let app = db::get_application(&mut *conn, req.application_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant application".to_string()))?;
    let approved_amount = approved_amount_of(&app)?;
    let existing = db::list_tranches(&mut *conn, app.id).await?;

    let plan = plan_next_tranche(approved_amount, &existing, req.is_first_tranche).map_err(|e| {
        warn!(application_id = app.id, existing = existing.len(), "Tranche rejected: {e}");
        e
    })?;

    let tranche = db::insert_tranche(
        &mut *conn,
        &NewTranche {
            application_id: app.id,
            sequence: plan.sequence,
            ask_amount: plan.ask_amount,
            approved_amount: (plan.status == TrancheStatus::Approved).then_some(plan.ask_amount),
            status: plan.status,
            update_note: req.update,
            help_wanted: req.help_wanted,
            created_at: Utc::now().timestamp(),
        },
    )
    .await?;
    if let Some(wallet) = req.wallet_address {
        db::set_wallet_address(&mut *conn, app.user_id, wallet).await?;
    }

    info!(
        application_id = app.id,
        tranche_id = tranche.id,
        sequence = tranche.sequence,
        amount = tranche.ask_amount,
        "Tranche created"
    );
    Ok(tranche)
}

/// Sponsor verdict on an application or tranche.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Decision {
    Approved,
    Rejected,
}

/// Approve or reject a pending application. Approval fixes the approved
/// amount (defaulting to the ask) and creates the first tranche in the
/// same transaction, so an approved application always has one.
pub async fn decide_application(
    pool: &SqlitePool,
    application_id: i64,
    decision: Decision,
    approved_amount: Option<i64>,
) -> Result<(GrantApplicationRecord, Option<TrancheRecord>)> {
    let mut tx = pool.begin().await?;
    db::lock_application(&mut *tx, application_id).await?;

    let app = db::get_application(&mut *tx, application_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant application".to_string()))?;
    if app.status != ApplicationStatus::Pending {
        return Err(EarnError::invariant("grant application has already been decided"));
    }

    let (status, amount) = match decision {
        Decision::Approved => {
            let amount = approved_amount.unwrap_or(app.ask);
            if amount <= 0 {
                return Err(EarnError::invariant("approved amount must be positive"));
            }
            (ApplicationStatus::Approved, Some(amount))
        }
        Decision::Rejected => (ApplicationStatus::Rejected, None),
    };
    if !db::decide_pending_application(&mut *tx, app.id, status, amount).await? {
        return Err(EarnError::invariant("grant application has already been decided"));
    }

    let first_tranche = match decision {
        Decision::Approved => Some(
            append_tranche(
                &mut tx,
                &TrancheRequest {
                    application_id: app.id,
                    is_first_tranche: true,
                    ..Default::default()
                },
            )
            .await?,
        ),
        Decision::Rejected => None,
    };

    let app = db::get_application(&mut *tx, application_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant application".to_string()))?;
    tx.commit().await?;

    info!(application_id, status = ?app.status, "Grant application decided");
    Ok((app, first_tranche))
}

/// Approve or reject a pending tranche. An approval may lower the amount
/// actually paid, never raise it.
pub async fn decide_tranche(
    pool: &SqlitePool,
    tranche_id: i64,
    decision: Decision,
    approved_amount: Option<i64>,
) -> Result<TrancheRecord> {
    let tranche = db::get_tranche(pool, tranche_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant tranche".to_string()))?;
    if tranche.status != TrancheStatus::Pending {
        return Err(EarnError::invariant("only pending tranches can be decided"));
    }

    let (to, amount) = match decision {
        Decision::Approved => {
            let amount = approved_amount.unwrap_or(tranche.ask_amount);
            if amount <= 0 || amount > tranche.ask_amount {
                return Err(EarnError::invariant(
                    "approved amount must be positive and at most the ask",
                ));
            }
            (TrancheStatus::Approved, Some(amount))
        }
        Decision::Rejected => (TrancheStatus::Rejected, None),
    };

    let updated = db::transition_tranche(pool, tranche_id, TrancheStatus::Pending, to, amount)
        .await?
        .ok_or_else(|| EarnError::invariant("tranche was decided concurrently"))?;
    info!(tranche_id, status = ?updated.status, "Tranche decided");
    Ok(updated)
}

/// Record payment of an approved tranche. Paying the last tranche of the
/// schedule completes the application.
pub async fn mark_tranche_paid(pool: &SqlitePool, tranche_id: i64) -> Result<TrancheRecord> {
    let tranche = db::get_tranche(pool, tranche_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant tranche".to_string()))?;
    if tranche.status != TrancheStatus::Approved {
        return Err(EarnError::invariant("only approved tranches can be marked paid"));
    }

    let paid = db::transition_tranche(
        pool,
        tranche_id,
        TrancheStatus::Approved,
        TrancheStatus::Paid,
        None,
    )
    .await?
    .ok_or_else(|| EarnError::invariant("tranche was updated concurrently"))?;

    let app = db::get_application(pool, paid.application_id)
        .await?
        .ok_or_else(|| EarnError::NotFound("Grant application".to_string()))?;
    let approved_amount = approved_amount_of(&app)?;
    if paid.sequence as usize == tranche_cap(approved_amount) {
        db::set_application_status(pool, app.id, ApplicationStatus::Completed, None).await?;
        info!(application_id = app.id, "Grant application completed");
    }

    info!(tranche_id, amount = ?paid.approved_amount, "Tranche paid");
    Ok(paid)
}
