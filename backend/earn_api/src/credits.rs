//! Submission credit ledger.
//!
//! Credits are an append-only history of signed events. Each event counts
//! from its *effective month* onward:
//!
//! * a submission spends a credit in the month it is made,
//! * a win bonus and a spam penalty only take effect from the following
//!   month, so winning cannot unlock extra submissions in the same month.
//!
//! Nothing here reads the balance before writing; overdraft prevention is
//! the submitting caller's job (see [`usable_credits`]).
//!
//! Two reads exist. [`credit_balance`] is the running total of everything
//! effective up to a month. [`usable_credits`] is what can be spent in one
//! month: a fresh allowance plus only the changes effective in that month,
//! so last month's spending never eats into this month's allowance.

use chrono::{DateTime, Datelike, Days, Months, NaiveTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::info;

use crate::db;
use crate::errors::Result;
use crate::models::{CreditEntry, CreditEntryType, SubmissionLabel};

/// First instant (UTC) of the month containing `at`.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let first = at.date_naive() - Days::new(u64::from(at.day0()));
    first.and_time(NaiveTime::MIN).and_utc()
}

/// First instant (UTC) of the month after the one containing `at`.
pub fn next_month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let first = month_start(at).date_naive() + Months::new(1);
    first.and_time(NaiveTime::MIN).and_utc()
}

pub async fn consume_credit(
    pool: &SqlitePool,
    user_id: i64,
    submission_id: i64,
) -> Result<CreditEntry> {
    consume_credit_at(pool, user_id, submission_id, Utc::now()).await
}

pub async fn consume_credit_at(
    pool: &SqlitePool,
    user_id: i64,
    submission_id: i64,
    now: DateTime<Utc>,
) -> Result<CreditEntry> {
    let entry = db::insert_credit_entry(
        pool,
        user_id,
        Some(submission_id),
        CreditEntryType::Submission,
        month_start(now).timestamp(),
        now.timestamp(),
    )
    .await?;
    info!(user_id, submission_id, "Submission credit consumed");
    Ok(entry)
}

pub async fn add_win_bonus_credit(
    pool: &SqlitePool,
    user_id: i64,
    submission_id: i64,
) -> Result<CreditEntry> {
    add_win_bonus_credit_at(pool, user_id, submission_id, Utc::now()).await
}

pub async fn add_win_bonus_credit_at(
    pool: &SqlitePool,
    user_id: i64,
    submission_id: i64,
    now: DateTime<Utc>,
) -> Result<CreditEntry> {
    let entry = db::insert_credit_entry(
        pool,
        user_id,
        Some(submission_id),
        CreditEntryType::WinBonus,
        next_month_start(now).timestamp(),
        now.timestamp(),
    )
    .await?;
    info!(user_id, submission_id, "Win bonus credit added");
    Ok(entry)
}

pub async fn add_spam_penalty_credit(pool: &SqlitePool, listing_id: i64) -> Result<Vec<CreditEntry>> {
    add_spam_penalty_credit_at(pool, listing_id, Utc::now()).await
}

/// Penalise every spam-labelled submission of a listing. Entries are
/// independent, so they are written concurrently and returned in no
/// particular order.
pub async fn add_spam_penalty_credit_at(
    pool: &SqlitePool,
    listing_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<CreditEntry>> {
    let spam: Vec<_> = db::submissions_for_listing(pool, listing_id)
        .await?
        .into_iter()
        .filter(|s| s.label == SubmissionLabel::Spam)
        .collect();

    let effective = next_month_start(now).timestamp();
    let mut batch = JoinSet::new();
    for submission in spam {
        let pool = pool.clone();
        batch.spawn(async move {
            db::insert_credit_entry(
                &pool,
                submission.user_id,
                Some(submission.id),
                CreditEntryType::SpamPenalty,
                effective,
                now.timestamp(),
            )
            .await
        });
    }

    let mut entries = Vec::with_capacity(batch.len());
    while let Some(joined) = batch.join_next().await {
        entries.push(joined??);
    }

    info!(listing_id, penalties = entries.len(), "Spam penalty credits added");
    Ok(entries)
}

/// Running ledger balance as of the month containing `at`.
pub async fn credit_balance(pool: &SqlitePool, user_id: i64, at: DateTime<Utc>) -> Result<i64> {
    db::credit_balance(pool, user_id, month_start(at).timestamp()).await
}

/// Credits a user may still spend in the month containing `at`: the
/// monthly allowance plus the changes that take effect in that month.
pub async fn usable_credits(
    pool: &SqlitePool,
    user_id: i64,
    allowance: i64,
    at: DateTime<Utc>,
) -> Result<i64> {
    let change = db::credit_change_in_month(pool, user_id, month_start(at).timestamp()).await?;
    Ok(allowance + change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 15).unwrap()
    }

    #[test]
    fn month_boundaries() {
        assert_eq!(
            month_start(utc(2024, 3, 17, 9)),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            next_month_start(utc(2024, 12, 31, 23)),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            next_month_start(utc(2024, 1, 31, 12)),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            month_start(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    async fn seeded() -> (SqlitePool, i64, i64, i64) {
        let pool = memory_pool().await;
        let sponsor = insert_sponsor(&pool, "acme").await;
        let user = insert_user(&pool, "a@x.io", None, &[]).await;
        let listing = insert_listing(&pool, NewListing::bounty(sponsor, "b1", i64::MAX)).await;
        let submission = db::insert_submission(&pool, listing, user, "https://x")
            .await
            .unwrap();
        (pool, user, listing, submission.id)
    }

    #[tokio::test]
    async fn consume_counts_in_current_month() {
        let (pool, user, _, submission) = seeded().await;
        let now = utc(2024, 6, 20, 8);

        let entry = consume_credit_at(&pool, user, submission, now).await.unwrap();
        assert_eq!(entry.change, -1);
        assert_eq!(entry.entry_type, CreditEntryType::Submission);
        assert_eq!(entry.effective_month, month_start(now).timestamp());
        assert_eq!(credit_balance(&pool, user, now).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn win_bonus_applies_from_next_month() {
        let (pool, user, _, submission) = seeded().await;
        let now = utc(2024, 6, 20, 8);

        let entry = add_win_bonus_credit_at(&pool, user, submission, now)
            .await
            .unwrap();
        assert_eq!(entry.change, 1);
        assert_eq!(
            entry.effective_month,
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap().timestamp()
        );
        assert_eq!(credit_balance(&pool, user, now).await.unwrap(), 0);
        assert_eq!(
            credit_balance(&pool, user, utc(2024, 7, 2, 0)).await.unwrap(),
            1
        );
        assert_eq!(usable_credits(&pool, user, 3, now).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn spam_penalty_hits_only_spam_submissions() {
        let (pool, user, listing, submission) = seeded().await;
        let other = insert_user(&pool, "b@x.io", None, &[]).await;
        db::insert_submission(&pool, listing, other, "https://y")
            .await
            .unwrap();
        db::set_submission_label(&pool, submission, SubmissionLabel::Spam)
            .await
            .unwrap();
        let now = utc(2024, 12, 5, 10);

        let entries = add_spam_penalty_credit_at(&pool, listing, now).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, user);
        assert_eq!(entries[0].entry_type, CreditEntryType::SpamPenalty);
        assert_eq!(
            entries[0].effective_month,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap().timestamp()
        );
        assert!(credit_entries_for_user(&pool, other).await.is_empty());
    }

    #[tokio::test]
    async fn spam_penalty_without_spam_is_a_no_op() {
        let (pool, _, listing, _) = seeded().await;
        let entries = add_spam_penalty_credit(&pool, listing).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn allowance_refreshes_every_month() {
        let (pool, user, listing, submission) = seeded().await;
        let june = utc(2024, 6, 3, 9);
        for _ in 0..3 {
            consume_credit_at(&pool, user, submission, june).await.unwrap();
        }
        assert_eq!(usable_credits(&pool, user, 3, june).await.unwrap(), 0);

        let july = utc(2024, 7, 1, 0);
        assert_eq!(usable_credits(&pool, user, 3, july).await.unwrap(), 3);
        assert_eq!(
            usable_credits(&pool, user, 3, utc(2024, 12, 15, 12)).await.unwrap(),
            3
        );
        // The running balance still carries June's spending.
        assert_eq!(credit_balance(&pool, user, july).await.unwrap(), -3);

        // A June win adds to July only; June spam costs July only.
        add_win_bonus_credit_at(&pool, user, submission, june).await.unwrap();
        assert_eq!(usable_credits(&pool, user, 3, june).await.unwrap(), 0);
        assert_eq!(usable_credits(&pool, user, 3, july).await.unwrap(), 4);

        db::set_submission_label(&pool, submission, SubmissionLabel::Spam)
            .await
            .unwrap();
        add_spam_penalty_credit_at(&pool, listing, june).await.unwrap();
        assert_eq!(usable_credits(&pool, user, 3, july).await.unwrap(), 3);
        assert_eq!(
            usable_credits(&pool, user, 3, utc(2024, 8, 2, 0)).await.unwrap(),
            3
        );
    }
}
