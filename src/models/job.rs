use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::receipt::{ReceiptResult, ServiceId};

/// Number of AI attempts before a job falls back to offline OCR.
pub const MAX_RETRIES: u32 = 3;

/// Status of a receipt job in the processing queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Scheduling rank. Lower rank is drawn first; retried jobs lose priority
/// to fresh and immediate work but keep arrival order among themselves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Immediate,
    Normal,
    Retry,
}

impl JobPriority {
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::Immediate => 0,
            JobPriority::Normal => 1,
            JobPriority::Retry => 2,
        }
    }
}

/// One unit of work: a single receipt image awaiting extraction.
///
/// A job is owned by the scheduler for its lifetime and mutated only by the
/// task currently processing it. Invariants: `Completed` implies `result`
/// set and `error` unset, `Failed` implies `error` set, and `retry_count`
/// never exceeds `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub image_uri: String,
    pub service_id: ServiceId,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_processing_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReceiptResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_extended: bool,
    #[serde(default)]
    pub switch_to_offline: bool,
}

impl QueueItem {
    pub fn new(image_uri: impl Into<String>, service_id: ServiceId, priority: JobPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_uri: image_uri.into(),
            service_id,
            status: JobStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_processing_at: None,
            processed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: MAX_RETRIES,
            timeout_extended: false,
            switch_to_offline: false,
        }
    }

    /// A pending job with attempts left is eligible for the scheduling loop.
    pub fn is_eligible(&self) -> bool {
        self.status == JobStatus::Pending && self.retry_count < self.max_retries
    }
}
