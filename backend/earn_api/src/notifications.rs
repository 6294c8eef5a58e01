//! Notification dispatcher: typed jobs pushed to an external broker.
//!
//! ## Resilience
//!
//! * Handing a job to the broker is retried up to [`MAX_ENQUEUE_ATTEMPTS`]
//!   times with exponential back-off starting at [`INITIAL_BACKOFF`].
//! * Every job also carries broker-side options: the same retry policy for
//!   delivery, no retention on success and the most recent
//!   [`FAILED_JOBS_KEPT`] failures kept for inspection.
//!
//! Recipients are never de-duplicated here; callers fanning out to many
//! addresses run them through [`unique_recipients`] first.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::errors::{EarnError, Result};

pub const MAX_ENQUEUE_ATTEMPTS: u32 = 3;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const FAILED_JOBS_KEPT: u32 = 500;

const QUEUE_NAME: &str = "notifications";

/// Every notification kind with its own payload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    ListingCreated { listing_id: i64 },
    SubmissionReceived { listing_id: i64, submission_id: i64, user_id: i64 },
    WinnersAnnounced { listing_id: i64, email: String },
    GrantApplicationApproved { application_id: i64, user_id: i64 },
    GrantApplicationRejected { application_id: i64, user_id: i64 },
    TrancheRequested { application_id: i64, tranche_id: i64 },
    TrancheApproved { tranche_id: i64, user_id: i64 },
    TrancheRejected { tranche_id: i64, user_id: i64 },
    PaymentAdded { tranche_id: i64, user_id: i64 },
}

impl Notification {
    /// Job name as seen by broker workers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListingCreated { .. } => "listingCreated",
            Self::SubmissionReceived { .. } => "submissionReceived",
            Self::WinnersAnnounced { .. } => "winnersAnnounced",
            Self::GrantApplicationApproved { .. } => "grantApplicationApproved",
            Self::GrantApplicationRejected { .. } => "grantApplicationRejected",
            Self::TrancheRequested { .. } => "trancheRequested",
            Self::TrancheApproved { .. } => "trancheApproved",
            Self::TrancheRejected { .. } => "trancheRejected",
            Self::PaymentAdded { .. } => "paymentAdded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Milliseconds before the first retry; doubled on every further retry.
    pub delay: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
    /// Number of failed jobs the broker keeps.
    pub remove_on_fail: u32,
    /// Milliseconds to hold the job before it becomes runnable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

/// One job as submitted to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub queue: &'static str,
    pub name: &'static str,
    pub data: Notification,
    pub opts: JobOptions,
}

impl NotificationJob {
    pub fn new(data: Notification, delay: Option<Duration>) -> Self {
        Self {
            queue: QUEUE_NAME,
            name: data.kind(),
            data,
            opts: JobOptions {
                attempts: MAX_ENQUEUE_ATTEMPTS,
                backoff: Backoff {
                    kind: "exponential",
                    delay: INITIAL_BACKOFF.as_millis() as u64,
                },
                remove_on_complete: true,
                remove_on_fail: FAILED_JOBS_KEPT,
                delay: delay.map(|d| d.as_millis() as u64),
            },
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection to a job broker. Returns the broker-assigned job id.
pub trait JobBroker: Send + Sync {
    fn enqueue<'a>(&'a self, job: &'a NotificationJob) -> BoxFuture<'a, Result<String>>;
}

/// Broker reachable over HTTP: jobs are POSTed as JSON, the reply carries
/// the job id.
pub struct HttpBroker {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct EnqueueResponse {
    id: String,
}

impl HttpBroker {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn post(&self, job: &NotificationJob) -> Result<String> {
        let resp = self.client.post(&self.url).json(job).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EarnError::Broker(format!("broker answered {status}")));
        }
        let body: EnqueueResponse = resp.json().await?;
        Ok(body.id)
    }
}

impl JobBroker for HttpBroker {
    fn enqueue<'a>(&'a self, job: &'a NotificationJob) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.post(job))
    }
}

/// Handle to the notification queue, built once at start-up and shared.
#[derive(Clone)]
pub struct NotificationQueue {
    broker: Arc<dyn JobBroker>,
}

impl NotificationQueue {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    /// Queue `notification`, optionally held back by `delay`.
    pub async fn enqueue(&self, notification: Notification, delay: Option<Duration>) -> Result<String> {
        let job = NotificationJob::new(notification, delay);
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;

        loop {
            match self.broker.enqueue(&job).await {
                Ok(id) => {
                    debug!(job = job.name, id = %id, attempt, "Notification queued");
                    return Ok(id);
                }
                Err(e) if attempt < MAX_ENQUEUE_ATTEMPTS => {
                    warn!(
                        job = job.name,
                        attempt,
                        "Enqueue failed (will retry in {}s): {e}",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!(job = job.name, attempt, "Enqueue failed, giving up: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Drop repeated addresses (case-insensitively), keeping first-seen order.
pub fn unique_recipients<I>(emails: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    emails
        .into_iter()
        .filter(|email| seen.insert(email.trim().to_lowercase()))
        .collect()
}
