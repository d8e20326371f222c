//! HTTP handlers for the legacy data import.
//! Authorization is expected to have happened upstream; these handlers only
//! translate between HTTP and `ImportService`.

use crate::{
    errors::AppError,
    models::{
        import::ReplyStatus,
        summary::{ConsoleOutput, ImportReply, ImportSummary},
    },
    services::{import_service::ImportService, upload_validator::UploadedArtifact},
};
use axum::{
    Json,
    extract::{Multipart, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;

/// Multipart field carrying the data file.
pub const FILE_FIELD: &str = "file_upload";

/// `POST /import`: validate, stage and import an uploaded data file.
pub async fn submit_import(
    State(service): State<ImportService>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let artifact = read_upload(&mut multipart).await?;
    let outcome = service.submit_import(artifact).await?;

    let status = outcome.status.reply_status();
    let code = match status {
        ReplyStatus::Success | ReplyStatus::Warning => StatusCode::OK,
        ReplyStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Ok((
        code,
        Json(ImportReply {
            status,
            message: outcome.message,
            log_path: outcome.log_path.map(|p| p.display().to_string()),
        }),
    ))
}

/// `GET /import/summary`: what was imported last, and when.
pub async fn import_summary(
    State(service): State<ImportService>,
) -> Result<Json<ImportSummary>, AppError> {
    Ok(Json(service.last_import_summary().await?))
}

/// `GET /import/console`: console transcript of the last attempt.
pub async fn import_console(
    State(service): State<ImportService>,
) -> Result<Json<ConsoleOutput>, AppError> {
    Ok(Json(service.last_console_output().await?))
}

/// Pull the `file_upload` field out of the form; other fields are skipped.
/// A form without it yields an artifact that fails validation as missing.
async fn read_upload(multipart: &mut Multipart) -> Result<UploadedArtifact, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let declared_length = field
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let bytes = field.bytes().await?;

        let mut artifact = UploadedArtifact::new(file_name, bytes);
        if let Some(length) = declared_length {
            artifact = artifact.with_declared_length(length);
        }
        return Ok(artifact);
    }
    Ok(UploadedArtifact::new(None, Bytes::new()))
}
