//! Database models

use chrono::{DateTime, Utc};
use mailcast_common::types::{CampaignId, JobId, NotificationId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Custom-args key carrying the campaign id through the mail provider
pub const CAMPAIGN_ID_ARG: &str = "campaignId";

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Ongoing,
    Sending,
    Sent,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub const ALL: [CampaignStatus; 7] = [
        CampaignStatus::Draft,
        CampaignStatus::Ongoing,
        CampaignStatus::Sending,
        CampaignStatus::Sent,
        CampaignStatus::Completed,
        CampaignStatus::Failed,
        CampaignStatus::Cancelled,
    ];

    /// Statuses in which engagement metrics no longer change
    pub fn metrics_frozen(self) -> bool {
        matches!(
            self,
            CampaignStatus::Draft
                | CampaignStatus::Cancelled
                | CampaignStatus::Failed
                | CampaignStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Ongoing => "ongoing",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "ongoing" => Ok(CampaignStatus::Ongoing),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" | "canceled" => Ok(CampaignStatus::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Engagement counter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Opens,
    Clicks,
    Bounces,
    Unsubscribes,
}

impl MetricKind {
    /// Column holding this counter in the `campaigns` table
    pub fn column(self) -> &'static str {
        match self {
            MetricKind::Opens => "opens",
            MetricKind::Clicks => "clicks",
            MetricKind::Bounces => "bounces",
            MetricKind::Unsubscribes => "unsubscribes",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// Campaign engagement counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CampaignMetrics {
    pub opens: i64,
    pub clicks: i64,
    pub bounces: i64,
    pub unsubscribes: i64,
}

impl CampaignMetrics {
    #[cfg(test)]
    pub fn get(&self, kind: MetricKind) -> i64 {
        match kind {
            MetricKind::Opens => self.opens,
            MetricKind::Clicks => self.clicks,
            MetricKind::Bounces => self.bounces,
            MetricKind::Unsubscribes => self.unsubscribes,
        }
    }

    pub fn increment(&mut self, kind: MetricKind) {
        match kind {
            MetricKind::Opens => self.opens += 1,
            MetricKind::Clicks => self.clicks += 1,
            MetricKind::Bounces => self.bounces += 1,
            MetricKind::Unsubscribes => self.unsubscribes += 1,
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    pub subject: String,
    pub from_address: String,
    pub segment_id: Option<String>,
    pub segment_name: Option<String>,
    pub recipient_count: i32,
    pub text_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<String>,
    pub status: String,
    #[sqlx(flatten)]
    pub metrics: CampaignMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Whether the campaign currently has the given status
    pub fn is(&self, status: CampaignStatus) -> bool {
        self.status_enum() == Some(status)
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub user_id: UserId,
    pub name: String,
    pub subject: String,
    pub from_address: String,
    pub segment_id: Option<String>,
    pub segment_name: Option<String>,
    pub recipient_count: i32,
    pub text_body: String,
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub status: Option<CampaignStatus>,
}

/// Result of a successful status compare-and-set
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: CampaignStatus,
    pub campaign: Campaign,
}

/// Attachment content ready for the mail provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedAttachment {
    /// Base64-encoded file content
    pub content: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub disposition: String,
}

/// One recipient's send within a campaign.
///
/// Message content is copied from the campaign when the job is created so
/// that later campaign edits never change an in-flight send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: JobId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub to_address: String,
    pub from_address: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<PreparedAttachment>,
    /// Provider custom metadata, always carrying [`CAMPAIGN_ID_ARG`]
    #[serde(default)]
    pub custom_args: BTreeMap<String, String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmailJob {
    /// Attempt number of the next send (1-based)
    pub fn next_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Campaign id as echoed back by the provider
    pub fn tracked_campaign_id(&self) -> Option<&str> {
        self.custom_args.get(CAMPAIGN_ID_ARG).map(String::as_str)
    }
}

/// Notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Campaign,
    System,
    Alert,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Campaign => write!(f, "campaign"),
            NotificationKind::System => write!(f, "system"),
            NotificationKind::Alert => write!(f, "alert"),
        }
    }
}

/// User-facing notification
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub link: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Create notification input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub link: Option<String>,
}
