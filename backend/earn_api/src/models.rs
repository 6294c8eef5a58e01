//! Marketplace records and the closed enums stored alongside them.
//!
//! Enums are persisted as TEXT through `sqlx::Type`; the serde and sqlx
//! spellings of every variant are kept identical so a value read from the
//! database round-trips unchanged through the JSON API.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Skill tags attached to listings and talent profiles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
pub enum Skill {
    Frontend,
    Backend,
    Blockchain,
    Mobile,
    Design,
    Content,
    Growth,
    Community,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ListingType {
    Bounty,
    Project,
    Hackathon,
}

/// Reward shape of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CompensationType {
    Fixed,
    Range,
    Variable,
}

/// Sponsor-assigned review label of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SubmissionLabel {
    Unreviewed,
    Reviewed,
    Shortlisted,
    Spam,
}

/// Lifecycle of a grant application.
///
/// ```text
/// Pending ──► Approved ──► Completed
///    └──► Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Completed,
    Rejected,
}

/// Lifecycle of one disbursement installment.
///
/// ```text
/// Pending ──► Approved ──► Paid
///    └──────────┴──► Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum TrancheStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
}

/// Kind of a credit ledger entry. Each kind carries a fixed signed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditEntryType {
    Submission,
    WinBonus,
    SpamPenalty,
}

impl CreditEntryType {
    pub fn change(self) -> i64 {
        match self {
            Self::Submission => -1,
            Self::WinBonus => 1,
            Self::SpamPenalty => -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub wallet_address: Option<String>,
    pub region: Option<String>,
    pub is_talent_filled: bool,
}

/// The slice of a talent profile that drives listing eligibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub region: Option<String>,
    pub skills: BTreeSet<Skill>,
    pub is_talent_filled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ListingRecord {
    pub id: i64,
    pub sponsor_id: i64,
    pub slug: String,
    pub title: String,
    pub listing_type: ListingType,
    pub hackathon_slug: Option<String>,
    pub region: String,
    pub compensation_type: CompensationType,
    pub reward_amount: Option<i64>,
    pub min_reward_ask: Option<i64>,
    pub max_reward_ask: Option<i64>,
    pub deadline: i64,
    pub is_published: bool,
    pub is_winner_announced: bool,
    pub submission_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub id: i64,
    pub listing_id: i64,
    pub user_id: i64,
    pub link: String,
    pub label: SubmissionLabel,
    pub is_winner: bool,
    pub winner_position: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GrantApplicationRecord {
    pub id: i64,
    pub grant_id: i64,
    /// Sponsor owning the grant program, joined in for ownership checks.
    pub sponsor_id: i64,
    pub user_id: i64,
    pub ask: i64,
    pub approved_amount: Option<i64>,
    pub status: ApplicationStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrancheRecord {
    pub id: i64,
    pub application_id: i64,
    /// 1-based position within the application's disbursement schedule.
    pub sequence: i64,
    pub ask_amount: i64,
    pub approved_amount: Option<i64>,
    pub status: TrancheStatus,
    pub update_note: Option<String>,
    pub help_wanted: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CreditEntry {
    pub id: i64,
    pub user_id: i64,
    pub submission_id: Option<i64>,
    pub entry_type: CreditEntryType,
    pub change: i64,
    /// Unix seconds of the first instant of the month the entry counts toward.
    pub effective_month: i64,
    pub created_at: i64,
}
