//! Persisted records: work items, their lifecycle status, and resolved results.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

/// Lifecycle status of a work item.
///
/// `Queued -> Processing -> {Completed | Error | RateLimited}`; terminal rows go back to
/// `Queued` only through an administrative reset or once a rate-limit cooldown elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Queued,
    Processing,
    Completed,
    Error,
    RateLimited,
}

impl WorkStatus {
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Processing,
        Self::Completed,
        Self::Error,
        Self::RateLimited,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Queued and Processing rows block a new enqueue of the same key.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::RateLimited)
    }
}

impl Display for WorkStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown work status `{value}`")]
pub struct UnknownStatus {
    pub value: String,
}

impl FromStr for WorkStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "rate_limited" | "ratelimited" => Ok(Self::RateLimited),
            other => Err(UnknownStatus {
                value: other.to_owned(),
            }),
        }
    }
}

/// One unit of work for a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub external_key: String,
    pub status: WorkStatus,
    pub error_message: Option<String>,
    /// Whether the most recent failed attempt was a provider quota rejection.
    pub last_error_rate_limited: bool,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub retry_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Company fields extracted from a provider payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub company_name: Option<String>,
    pub trade_name: Option<String>,
    pub registration_status: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub simples_optant: Option<bool>,
    pub simples_since: Option<String>,
}

/// Resolved record ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResult {
    pub external_key: String,
    pub provider: String,
    pub raw_payload: Value,
    pub fields: ExtractedFields,
}

/// Persisted result; one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub external_key: String,
    pub provider: String,
    pub raw_payload: Value,
    pub fields: ExtractedFields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Terminal outcome written when a worker finishes an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Error {
        message: String,
    },
    RateLimited {
        message: String,
        retry_after: OffsetDateTime,
    },
}

impl Outcome {
    pub const fn status(&self) -> WorkStatus {
        match self {
            Self::Completed => WorkStatus::Completed,
            Self::Error { .. } => WorkStatus::Error,
            Self::RateLimited { .. } => WorkStatus::RateLimited,
        }
    }
}

/// Result of an enqueue request for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A Queued row now exists and should be pushed to the pending channel.
    Queued(WorkItem),
    /// A Queued or Processing row already exists.
    AlreadyActive(WorkItem),
    /// Completed inside the retention window.
    RecentlyCompleted(WorkItem),
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub error: u64,
    pub rate_limited: u64,
}

impl StatusCounts {
    pub fn get(&self, status: WorkStatus) -> u64 {
        match status {
            WorkStatus::Queued => self.queued,
            WorkStatus::Processing => self.processing,
            WorkStatus::Completed => self.completed,
            WorkStatus::Error => self.error,
            WorkStatus::RateLimited => self.rate_limited,
        }
    }

    pub fn add(&mut self, status: WorkStatus, count: u64) {
        let slot = match status {
            WorkStatus::Queued => &mut self.queued,
            WorkStatus::Processing => &mut self.processing,
            WorkStatus::Completed => &mut self.completed,
            WorkStatus::Error => &mut self.error,
            WorkStatus::RateLimited => &mut self.rate_limited,
        };
        *slot = slot.saturating_add(count);
    }

    pub fn total(&self) -> u64 {
        WorkStatus::ALL.iter().map(|status| self.get(*status)).sum()
    }
}

/// Rows moved out of Processing by a stuck sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StuckReport {
    pub errored: u64,
    pub rate_limited: u64,
}

impl StuckReport {
    pub const fn total(&self) -> u64 {
        self.errored + self.rate_limited
    }
}
