//! The last import attempt and how an importer exit code is interpreted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The single durable record of the most recent import attempt.
///
/// Only one exists per installation; writing a new one replaces it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImportAttemptRecord {
    /// Filename the administrator uploaded, kept for display only.
    pub original_filename: String,

    /// When the attempt finished and was recorded.
    pub created_at: DateTime<Utc>,

    /// Combined importer output, one entry per line, in output order.
    pub console_output: Vec<String>,
}

/// Exit code the importer reports for a clean run.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a run that completed with warnings.
pub const EXIT_WARNINGS: i32 = 1;
/// Exit code for a failed run. Also persisted when the importer never ran to completion.
pub const EXIT_FAILURE: i32 = 2;

/// Interpreted outcome of one importer run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportExitStatus {
    Success,
    SuccessWithWarnings,
    Failure,
    UnknownError,
}

impl ImportExitStatus {
    /// Map a raw importer exit code onto the closed outcome set.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            EXIT_SUCCESS => Self::Success,
            EXIT_WARNINGS => Self::SuccessWithWarnings,
            EXIT_FAILURE => Self::Failure,
            _ => Self::UnknownError,
        }
    }

    /// Coarse status reported to the caller.
    pub fn reply_status(self) -> ReplyStatus {
        match self {
            Self::Success => ReplyStatus::Success,
            Self::SuccessWithWarnings => ReplyStatus::Warning,
            Self::Failure | Self::UnknownError => ReplyStatus::Error,
        }
    }

    /// Whether a message for this status points the operator at the log.
    pub fn references_log(self) -> bool {
        matches!(self, Self::SuccessWithWarnings | Self::Failure)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Warning,
    Error,
}

/// What a completed import reports back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOutcome {
    pub status: ImportExitStatus,
    pub message: String,
    /// Set only when `message` refers to the importer log.
    pub log_path: Option<PathBuf>,
    /// Exit code persisted as the last known status.
    pub recorded_exit_code: i32,
}

impl ImportOutcome {
    pub fn new(status: ImportExitStatus, recorded_exit_code: i32, log_path: PathBuf) -> Self {
        let log_path = status.references_log().then_some(log_path);
        let message = match (status, &log_path) {
            (ImportExitStatus::Success, _) => "Legacy client data imported successfully".to_string(),
            (ImportExitStatus::SuccessWithWarnings, Some(path)) => format!(
                "Legacy client data imported with warnings, see log at {} for details",
                path.display()
            ),
            (ImportExitStatus::Failure, Some(path)) => format!(
                "Importing legacy client data failed, see log at {} for details",
                path.display()
            ),
            _ => "Importing legacy client data failed with an unknown error".to_string(),
        };

        Self {
            status,
            message,
            log_path,
            recorded_exit_code,
        }
    }
}
