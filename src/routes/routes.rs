//! Defines routes for the legacy data import.
//!
//! ## Structure
//! - **Import endpoints**
//!   - `POST /import`: upload a data file and run the importer
//!   - `GET  /import/summary`: last imported file and its exit status
//!   - `GET  /import/console`: console transcript of the last attempt
//!
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        import_handlers::{import_console, import_summary, submit_import},
    },
    services::import_service::ImportService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Build and return the router. The request body limit follows the upload
/// size limit so oversized uploads are cut off before they are buffered.
pub fn routes(max_upload_bytes: u64) -> Router<ImportService> {
    let body_limit = usize::try_from(max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES))
        .unwrap_or(usize::MAX);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // import endpoints
        .route(
            "/import",
            post(submit_import).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/import/summary", get(import_summary))
        .route("/import/console", get(import_console))
}
