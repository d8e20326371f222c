//! Response bodies for the import status endpoints.

use serde::{Deserialize, Serialize};

/// Status widget contents for the last import.
///
/// `file_name` and `exit_status` are `None` until something has been imported.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImportSummary {
    pub file_type: String,
    pub file_info: String,
    pub file_name: Option<String>,
    pub exit_status: Option<i32>,
}

/// Transcript of the last attempt, empty when nothing was imported yet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub console: Vec<String>,
}

/// Reply to an import submission.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImportReply {
    pub status: super::import::ReplyStatus,
    pub message: String,
    /// Importer log the message refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}
