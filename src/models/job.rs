use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::voucher::VoucherCode;

/// Status of an extraction job in the worker pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Raw submission as produced by the HTTP layer: exactly one of the two
/// fields must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl JobPayload {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            image_path: Some(path.into()),
            image_url: None,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            image_path: None,
            image_url: Some(url.into()),
        }
    }
}

/// Validated job input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum JobInput {
    Path(String),
    Url(String),
}

impl JobInput {
    /// The reference handed to image acquisition.
    pub fn as_ref_str(&self) -> &str {
        match self {
            JobInput::Path(p) => p,
            JobInput::Url(u) => u,
        }
    }
}

impl TryFrom<JobPayload> for JobInput {
    type Error = ValidationError;

    fn try_from(payload: JobPayload) -> Result<Self, Self::Error> {
        let path = payload.image_path.filter(|p| !p.trim().is_empty());
        let url = payload.image_url.filter(|u| !u.trim().is_empty());

        match (path, url) {
            (Some(path), None) => Ok(JobInput::Path(path)),
            (None, Some(url)) => {
                let lower = url.trim().to_ascii_lowercase();
                if lower.starts_with("http://") || lower.starts_with("https://") {
                    Ok(JobInput::Url(url.trim().to_string()))
                } else {
                    Err(ValidationError::UnsupportedUrl(url))
                }
            }
            (Some(_), Some(_)) => Err(ValidationError::Ambiguous),
            (None, None) => Err(ValidationError::MissingInput),
        }
    }
}

/// Completed value of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    /// Unique trimmed OCR lines joined with `\n`.
    pub text: String,
    pub vouchers: Vec<VoucherCode>,
    /// Engine debug images kept for this job, when enabled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debug_images: Vec<PathBuf>,
}

/// Point-in-time view of a job, as returned by `get_job_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub input: JobInput,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub result: Option<JobOutcome>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle notifications broadcast by the job queue.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Waiting(Uuid),
    Active(Uuid),
    Progress(Uuid, u8),
    Stalled { id: Uuid, attempts: u32 },
    Completed(Uuid),
    Failed { id: Uuid, reason: String },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Waiting(id)
            | JobEvent::Active(id)
            | JobEvent::Progress(id, _)
            | JobEvent::Completed(id) => *id,
            JobEvent::Stalled { id, .. } | JobEvent::Failed { id, .. } => *id,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("job payload must contain imagePath or imageUrl")]
    MissingInput,

    #[error("job payload must not contain both imagePath and imageUrl")]
    Ambiguous,

    #[error("imageUrl must be an http(s) URL: {0}")]
    UnsupportedUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_payload_with_path() {
        let input = JobInput::try_from(JobPayload::from_path("uploads/a.jpg")).unwrap();
        assert_eq!(input, JobInput::Path("uploads/a.jpg".to_string()));
    }

    #[test]
    fn test_payload_with_url() {
        let input = JobInput::try_from(JobPayload::from_url(" https://x.test/a.png ")).unwrap();
        assert_eq!(input, JobInput::Url("https://x.test/a.png".to_string()));
    }

    #[test]
    fn test_payload_rejects_empty_and_both() {
        assert_eq!(
            JobInput::try_from(JobPayload::default()),
            Err(ValidationError::MissingInput)
        );
        let both = JobPayload {
            image_path: Some("a.png".into()),
            image_url: Some("https://x.test/a.png".into()),
        };
        assert_eq!(JobInput::try_from(both), Err(ValidationError::Ambiguous));
        assert!(matches!(
            JobInput::try_from(JobPayload::from_url("ftp://x.test/a.png")),
            Err(ValidationError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_payload_camel_case_wire_format() {
        let payload: JobPayload = serde_json::from_str(r#"{"imageUrl":"https://x.test/v.jpg"}"#).unwrap();
        assert_eq!(payload.image_url.as_deref(), Some("https://x.test/v.jpg"));
        assert!(payload.image_path.is_none());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Waiting.to_string(), "waiting");
        assert_eq!(JobStatus::from_str("failed").unwrap(), JobStatus::Failed);
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }
}
