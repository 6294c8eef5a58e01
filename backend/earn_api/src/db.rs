//! Database layer: migrations and all SQL used by the service.

use std::collections::BTreeSet;

use sqlx::{sqlite::SqlitePoolOptions, QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{EarnError, Result};
use crate::listings::ListingQuery;
use crate::models::{
    ApplicationStatus, CreditEntry, CreditEntryType, GrantApplicationRecord, ListingRecord, Skill,
    SubmissionLabel, SubmissionRecord, TrancheRecord, TrancheStatus, UserProfile, UserRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// True when `err` is a UNIQUE constraint failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

pub async fn get_user(pool: &SqlitePool, user_id: i64) -> Result<Option<UserRecord>> {
    let row = sqlx::query_as::<_, UserRecord>(
        "SELECT id, email, wallet_address, region, is_talent_filled FROM users WHERE id = ?1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Load the eligibility-relevant part of a talent profile.
pub async fn get_user_profile(pool: &SqlitePool, user_id: i64) -> Result<Option<UserProfile>> {
    let Some(user) = get_user(pool, user_id).await? else {
        return Ok(None);
    };

    let skills: Vec<Skill> =
        sqlx::query_scalar("SELECT skill FROM user_skills WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(pool)
            .await?;

    Ok(Some(UserProfile {
        id: user.id,
        region: user.region,
        skills: skills.into_iter().collect::<BTreeSet<_>>(),
        is_talent_filled: user.is_talent_filled,
    }))
}

pub async fn set_wallet_address<'e, E>(executor: E, user_id: i64, wallet: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE users SET wallet_address = ?1 WHERE id = ?2")
        .bind(wallet)
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Listings
// ─────────────────────────────────────────────────────────

const LISTING_COLUMNS: &str = r#"
    l.id, l.sponsor_id, l.slug, l.title, l.listing_type, l.hackathon_slug, l.region,
    l.compensation_type, l.reward_amount, l.min_reward_ask, l.max_reward_ask, l.deadline,
    l.is_published, l.is_winner_announced,
    (SELECT COUNT(*) FROM submissions s WHERE s.listing_id = l.id) AS submission_count
"#;

pub async fn get_listing(pool: &SqlitePool, listing_id: i64) -> Result<Option<ListingRecord>> {
    let sql = format!("SELECT {LISTING_COLUMNS} FROM listings l WHERE l.id = ?1");
    let row = sqlx::query_as::<_, ListingRecord>(&sql)
        .bind(listing_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Run a built listing query. Every filter value is bound, never spliced.
pub async fn fetch_listings(pool: &SqlitePool, query: &ListingQuery) -> Result<Vec<ListingRecord>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {LISTING_COLUMNS} FROM listings l WHERE "));
    query.push_sql(&mut qb);

    let rows = qb.build_query_as::<ListingRecord>().fetch_all(pool).await?;
    Ok(rows)
}

pub async fn publish_listing(pool: &SqlitePool, listing_id: i64) -> Result<()> {
    sqlx::query("UPDATE listings SET is_published = 1 WHERE id = ?1")
        .bind(listing_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flag winners as announced. Returns `false` when another caller got
/// there first; only the caller that flips the flag settles the listing.
pub async fn mark_winners_announced(pool: &SqlitePool, listing_id: i64) -> Result<bool> {
    let done = sqlx::query(
        "UPDATE listings SET is_winner_announced = 1 WHERE id = ?1 AND is_winner_announced = 0",
    )
    .bind(listing_id)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() > 0)
}

// ─────────────────────────────────────────────────────────
// Submissions
// ─────────────────────────────────────────────────────────

const SUBMISSION_COLUMNS: &str =
    "id, listing_id, user_id, link, label, is_winner, winner_position, created_at";

/// Insert a submission. A second submission by the same user to the same
/// listing is a rule violation, not a server error.
pub async fn insert_submission(
    pool: &SqlitePool,
    listing_id: i64,
    user_id: i64,
    link: &str,
) -> Result<SubmissionRecord> {
    let sql = format!(
        "INSERT INTO submissions (listing_id, user_id, link) VALUES (?1, ?2, ?3) \
         RETURNING {SUBMISSION_COLUMNS}"
    );
    sqlx::query_as::<_, SubmissionRecord>(&sql)
        .bind(listing_id)
        .bind(user_id)
        .bind(link)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EarnError::invariant("you have already submitted to this listing")
            } else {
                e.into()
            }
        })
}

pub async fn get_submission(
    pool: &SqlitePool,
    submission_id: i64,
) -> Result<Option<SubmissionRecord>> {
    let sql = format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?1");
    let row = sqlx::query_as::<_, SubmissionRecord>(&sql)
        .bind(submission_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn set_submission_label(
    pool: &SqlitePool,
    submission_id: i64,
    label: SubmissionLabel,
) -> Result<SubmissionRecord> {
    let sql = format!(
        "UPDATE submissions SET label = ?1 WHERE id = ?2 RETURNING {SUBMISSION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, SubmissionRecord>(&sql)
        .bind(label)
        .bind(submission_id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn set_submission_winner(
    pool: &SqlitePool,
    submission_id: i64,
    is_winner: bool,
    position: Option<i64>,
) -> Result<SubmissionRecord> {
    let sql = format!(
        "UPDATE submissions SET is_winner = ?1, winner_position = ?2 WHERE id = ?3 \
         RETURNING {SUBMISSION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, SubmissionRecord>(&sql)
        .bind(is_winner)
        .bind(position)
        .bind(submission_id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

/// All submissions of a listing, ordered by id ascending.
pub async fn submissions_for_listing(
    pool: &SqlitePool,
    listing_id: i64,
) -> Result<Vec<SubmissionRecord>> {
    let sql = format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE listing_id = ?1 ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, SubmissionRecord>(&sql)
        .bind(listing_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Email addresses of everyone who submitted to a listing, in submission order.
/// Addresses may repeat up to letter case.
pub async fn submitter_emails(pool: &SqlitePool, listing_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query_scalar(
        r#"
        SELECT u.email
        FROM   submissions s
        JOIN   users u ON u.id = s.user_id
        WHERE  s.listing_id = ?1
        ORDER  BY s.id ASC
        "#,
    )
    .bind(listing_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Grant applications & tranches
// ─────────────────────────────────────────────────────────

pub async fn get_application<'e, E>(
    executor: E,
    application_id: i64,
) -> Result<Option<GrantApplicationRecord>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, GrantApplicationRecord>(
        r#"
        SELECT a.id, a.grant_id, g.sponsor_id, a.user_id, a.ask, a.approved_amount,
               a.status, a.created_at
        FROM   grant_applications a
        JOIN   grants g ON g.id = a.grant_id
        WHERE  a.id = ?1
        "#,
    )
    .bind(application_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn set_application_status<'e, E>(
    executor: E,
    application_id: i64,
    status: ApplicationStatus,
    approved_amount: Option<i64>,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE grant_applications \
         SET status = ?1, approved_amount = COALESCE(approved_amount, ?2) WHERE id = ?3",
    )
    .bind(status)
    .bind(approved_amount)
    .bind(application_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Take the write lock before reading an application inside a transaction.
/// SQLite cannot upgrade a read transaction while another writer is
/// active, so writers that start with a read fail instead of queueing.
pub async fn lock_application<'e, E>(executor: E, application_id: i64) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE grant_applications SET id = id WHERE id = ?1")
        .bind(application_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Record the sponsor's decision on a still-pending application. Returns
/// `false` when the application was no longer `Pending`.
pub async fn decide_pending_application<'e, E>(
    executor: E,
    application_id: i64,
    status: ApplicationStatus,
    approved_amount: Option<i64>,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let done = sqlx::query(
        "UPDATE grant_applications \
         SET status = ?1, approved_amount = COALESCE(?2, approved_amount) \
         WHERE id = ?3 AND status = ?4",
    )
    .bind(status)
    .bind(approved_amount)
    .bind(application_id)
    .bind(ApplicationStatus::Pending)
    .execute(executor)
    .await?;
    Ok(done.rows_affected() > 0)
}

const TRANCHE_COLUMNS: &str = "id, application_id, sequence, ask_amount, approved_amount, status, \
     update_note, help_wanted, created_at";

/// Tranches of an application in creation order.
pub async fn list_tranches<'e, E>(executor: E, application_id: i64) -> Result<Vec<TrancheRecord>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {TRANCHE_COLUMNS} FROM grant_tranches WHERE application_id = ?1 \
         ORDER BY sequence ASC"
    );
    let rows = sqlx::query_as::<_, TrancheRecord>(&sql)
        .bind(application_id)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

/// A tranche row ready for insertion.
#[derive(Debug, Clone)]
pub struct NewTranche<'a> {
    pub application_id: i64,
    pub sequence: i64,
    pub ask_amount: i64,
    pub approved_amount: Option<i64>,
    pub status: TrancheStatus,
    pub update_note: Option<&'a str>,
    pub help_wanted: Option<&'a str>,
    pub created_at: i64,
}

pub async fn insert_tranche<'e, E>(executor: E, tranche: &NewTranche<'_>) -> Result<TrancheRecord>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        INSERT INTO grant_tranches
            (application_id, sequence, ask_amount, approved_amount, status,
             update_note, help_wanted, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING {TRANCHE_COLUMNS}
        "#
    );
    sqlx::query_as::<_, TrancheRecord>(&sql)
        .bind(tranche.application_id)
        .bind(tranche.sequence)
        .bind(tranche.ask_amount)
        .bind(tranche.approved_amount)
        .bind(tranche.status)
        .bind(tranche.update_note)
        .bind(tranche.help_wanted)
        .bind(tranche.created_at)
        .fetch_one(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EarnError::invariant("a tranche for this position was already requested")
            } else {
                e.into()
            }
        })
}

pub async fn get_tranche(pool: &SqlitePool, tranche_id: i64) -> Result<Option<TrancheRecord>> {
    let sql = format!("SELECT {TRANCHE_COLUMNS} FROM grant_tranches WHERE id = ?1");
    let row = sqlx::query_as::<_, TrancheRecord>(&sql)
        .bind(tranche_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Move a tranche from `from` to `to`. Returns `None` when the tranche was
/// not in `from` any more, so concurrent decisions cannot both apply.
pub async fn transition_tranche(
    pool: &SqlitePool,
    tranche_id: i64,
    from: TrancheStatus,
    to: TrancheStatus,
    approved_amount: Option<i64>,
) -> Result<Option<TrancheRecord>> {
    let sql = format!(
        "UPDATE grant_tranches \
         SET status = ?1, approved_amount = COALESCE(?2, approved_amount) \
         WHERE id = ?3 AND status = ?4 RETURNING {TRANCHE_COLUMNS}"
    );
    let row = sqlx::query_as::<_, TrancheRecord>(&sql)
        .bind(to)
        .bind(approved_amount)
        .bind(tranche_id)
        .bind(from)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Credit ledger
// ─────────────────────────────────────────────────────────

/// Append one ledger entry. There is deliberately no update or delete
/// counterpart to this function.
pub async fn insert_credit_entry(
    pool: &SqlitePool,
    user_id: i64,
    submission_id: Option<i64>,
    entry_type: CreditEntryType,
    effective_month: i64,
    created_at: i64,
) -> Result<CreditEntry> {
    let row = sqlx::query_as::<_, CreditEntry>(
        r#"
        INSERT INTO credit_ledger
            (user_id, submission_id, entry_type, change, effective_month, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING id, user_id, submission_id, entry_type, change, effective_month, created_at
        "#,
    )
    .bind(user_id)
    .bind(submission_id)
    .bind(entry_type)
    .bind(entry_type.change())
    .bind(effective_month)
    .bind(created_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Sum of all changes effective on or before `month_start`.
pub async fn credit_balance(pool: &SqlitePool, user_id: i64, month_start: i64) -> Result<i64> {
    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(change), 0) FROM credit_ledger \
         WHERE user_id = ?1 AND effective_month <= ?2",
    )
    .bind(user_id)
    .bind(month_start)
    .fetch_one(pool)
    .await?;
    Ok(balance)
}

/// Sum of the changes that take effect in exactly the month starting at
/// `month_start`.
pub async fn credit_change_in_month(
    pool: &SqlitePool,
    user_id: i64,
    month_start: i64,
) -> Result<i64> {
    let change: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(change), 0) FROM credit_ledger \
         WHERE user_id = ?1 AND effective_month = ?2",
    )
    .bind(user_id)
    .bind(month_start)
    .fetch_one(pool)
    .await?;
    Ok(change)
}

// ─────────────────────────────────────────────────────────
// Test fixtures
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::models::{CompensationType, ListingType};

    /// Fresh in-memory database with migrations applied. A single, never
    /// recycled connection keeps the in-memory database alive for the test.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    /// Fresh file-backed database with several connections, for tests that
    /// need writers to really run side by side.
    pub async fn file_pool(name: &str) -> SqlitePool {
        let path = std::env::temp_dir().join(format!(
            "earn-api-{name}-{}-{}.db",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    pub async fn credit_entries_for_user(pool: &SqlitePool, user_id: i64) -> Vec<CreditEntry> {
        sqlx::query_as::<_, CreditEntry>(
            r#"
            SELECT id, user_id, submission_id, entry_type, change, effective_month, created_at
            FROM   credit_ledger
            WHERE  user_id = ?1
            ORDER  BY id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .unwrap()
    }

    pub async fn insert_user(
        pool: &SqlitePool,
        email: &str,
        region: Option<&str>,
        skills: &[Skill],
    ) -> i64 {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (email, region, is_talent_filled) VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(email)
        .bind(region)
        .bind(!skills.is_empty())
        .fetch_one(pool)
        .await
        .unwrap();
        for skill in skills {
            sqlx::query("INSERT INTO user_skills (user_id, skill) VALUES (?1, ?2)")
                .bind(id)
                .bind(skill)
                .execute(pool)
                .await
                .unwrap();
        }
        id
    }

    pub async fn insert_sponsor(pool: &SqlitePool, slug: &str) -> i64 {
        sqlx::query_scalar("INSERT INTO sponsors (name, slug) VALUES (?1, ?1) RETURNING id")
            .bind(slug)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    pub struct NewListing<'a> {
        pub sponsor_id: i64,
        pub slug: &'a str,
        pub listing_type: ListingType,
        pub hackathon_slug: Option<&'a str>,
        pub region: &'a str,
        pub compensation_type: CompensationType,
        pub reward_amount: Option<i64>,
        pub max_reward_ask: Option<i64>,
        pub deadline: i64,
        pub is_published: bool,
        pub is_private: bool,
        pub is_winner_announced: bool,
        pub skills: &'a [Skill],
    }

    impl<'a> NewListing<'a> {
        pub fn bounty(sponsor_id: i64, slug: &'a str, deadline: i64) -> Self {
            Self {
                sponsor_id,
                slug,
                listing_type: ListingType::Bounty,
                hackathon_slug: None,
                region: "Global",
                compensation_type: CompensationType::Fixed,
                reward_amount: Some(1000),
                max_reward_ask: None,
                deadline,
                is_published: true,
                is_private: false,
                is_winner_announced: false,
                skills: &[],
            }
        }
    }

    pub async fn insert_listing(pool: &SqlitePool, listing: NewListing<'_>) -> i64 {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO listings
                (sponsor_id, slug, title, listing_type, hackathon_slug, region,
                 compensation_type, reward_amount, max_reward_ask, deadline,
                 is_published, is_private, is_winner_announced)
            VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            RETURNING id
            "#,
        )
        .bind(listing.sponsor_id)
        .bind(listing.slug)
        .bind(listing.listing_type)
        .bind(listing.hackathon_slug)
        .bind(listing.region)
        .bind(listing.compensation_type)
        .bind(listing.reward_amount)
        .bind(listing.max_reward_ask)
        .bind(listing.deadline)
        .bind(listing.is_published)
        .bind(listing.is_private)
        .bind(listing.is_winner_announced)
        .fetch_one(pool)
        .await
        .unwrap();
        for skill in listing.skills {
            sqlx::query("INSERT INTO listing_skills (listing_id, skill) VALUES (?1, ?2)")
                .bind(id)
                .bind(skill)
                .execute(pool)
                .await
                .unwrap();
        }
        id
    }

    pub async fn insert_grant(pool: &SqlitePool, sponsor_id: i64) -> i64 {
        sqlx::query_scalar("INSERT INTO grants (sponsor_id, title) VALUES (?1, 'grant') RETURNING id")
            .bind(sponsor_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    pub async fn insert_application(
        pool: &SqlitePool,
        grant_id: i64,
        user_id: i64,
        ask: i64,
        approved_amount: Option<i64>,
        status: ApplicationStatus,
    ) -> i64 {
        sqlx::query_scalar(
            r#"
            INSERT INTO grant_applications (grant_id, user_id, ask, approved_amount, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(grant_id)
        .bind(user_id)
        .bind(ask)
        .bind(approved_amount)
        .bind(status)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    pub async fn set_tranche_status(pool: &SqlitePool, tranche_id: i64, status: TrancheStatus) {
        sqlx::query("UPDATE grant_tranches SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(tranche_id)
            .execute(pool)
            .await
            .unwrap();
    }
}
