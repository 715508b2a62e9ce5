//! Redis bridge between the external HTTP layer and the worker's job pool.
//!
//! The HTTP layer pushes submissions onto a list; the worker moves them to a
//! processing list while accepting them, and mirrors job snapshots back under
//! per-job keys so `getJobState` can be answered from Redis.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobPayload, JobSnapshot};

const QUEUE_KEY: &str = "voucher_ocr:submissions";
const PROCESSING_KEY: &str = "voucher_ocr:processing";
const STATE_KEY_PREFIX: &str = "voucher_ocr:job:";

/// Snapshots are kept for a day after their last update.
pub const STATE_TTL_SECS: u64 = 24 * 60 * 60;

/// Submission serialized into Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl Submission {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            payload,
        }
    }
}

/// A submission taken off the queue, with the exact bytes needed to
/// acknowledge it.
#[derive(Debug, Clone)]
pub struct ClaimedSubmission {
    pub submission: Submission,
    raw: String,
}

pub struct RedisIntake {
    client: redis::Client,
}

impl RedisIntake {
    pub fn new(redis_url: &str) -> Result<Self, IntakeError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, IntakeError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Push a submission (used by the HTTP layer and tests).
    pub async fn submit(&self, submission: &Submission) -> Result<(), IntakeError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(submission)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    /// Move the oldest submission to the processing list and return it.
    pub async fn next_submission(&self) -> Result<Option<ClaimedSubmission>, IntakeError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<Submission>(&raw) {
            Ok(submission) => Ok(Some(ClaimedSubmission { submission, raw })),
            Err(e) => {
                // Unparseable entries would otherwise sit in the processing list forever.
                conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &raw).await?;
                Err(IntakeError::Serialize(e))
            }
        }
    }

    /// Remove a claimed submission from the processing list.
    pub async fn acknowledge(&self, claimed: &ClaimedSubmission) -> Result<(), IntakeError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &claimed.raw).await?;
        Ok(())
    }

    /// Put submissions left in the processing list by a crashed worker back on
    /// the queue. Returns how many were moved.
    pub async fn requeue_orphaned(&self) -> Result<u64, IntakeError> {
        let mut conn = self.connection().await?;
        let mut moved = 0;
        loop {
            let item: Option<String> = conn.rpoplpush(PROCESSING_KEY, QUEUE_KEY).await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    pub async fn publish_state(&self, snapshot: &JobSnapshot) -> Result<(), IntakeError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(snapshot)?;
        conn.set_ex::<_, _, ()>(state_key(snapshot.id), payload, STATE_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn job_state(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, IntakeError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(state_key(job_id)).await?;
        raw.map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(IntakeError::Serialize)
    }

    /// Number of submissions not yet claimed.
    pub async fn queue_depth(&self) -> Result<u64, IntakeError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), IntakeError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn state_key(job_id: Uuid) -> String {
    format!("{STATE_KEY_PREFIX}{job_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
