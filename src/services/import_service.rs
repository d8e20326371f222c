//! ImportService: one-shot migration of legacy client data.
//!
//! Drives a single import: validate the upload, stage it to the fixed path,
//! run the importer, persist the attempt and report the interpreted outcome.
//! The whole pipeline runs under one installation-wide lock, so concurrent
//! submissions are served one after another instead of racing on the staged
//! file and the status record.

use crate::{
    config::AppConfig,
    models::{
        import::{ImportExitStatus, ImportOutcome},
        summary::{ConsoleOutput, ImportSummary},
    },
    services::{
        file_stager::FileStager,
        importer::ImporterInvoker,
        status_store::{StatusStore, StatusStoreError},
        upload_validator::{self, UploadRestrictions, UploadedArtifact, ValidationError},
    },
};
use chrono::Local;
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FILE_TYPE_LABEL: &str = "Legacy client data";
const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reasons an import is rejected before or after the importer runs.
///
/// Importer outcomes, including failures, are not errors; they come back
/// as an [`ImportOutcome`].
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("staging failed: {0}")]
    Staging(#[source] io::Error),
    #[error(transparent)]
    Store(#[from] StatusStoreError),
    #[error("{0}")]
    Aborted(String),
}

pub type ImportResult<T> = Result<T, ImportError>;

#[derive(Clone)]
pub struct ImportService {
    restrictions: UploadRestrictions,
    stager: FileStager,
    invoker: ImporterInvoker,
    pub store: StatusStore,
    log_path: PathBuf,
    lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl ImportService {
    pub fn new(
        restrictions: UploadRestrictions,
        stager: FileStager,
        invoker: ImporterInvoker,
        store: StatusStore,
        log_path: impl Into<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            restrictions,
            stager,
            invoker,
            store,
            log_path: log_path.into(),
            lock: Arc::new(Mutex::new(())),
            shutdown,
        }
    }

    /// Wire the service from application configuration.
    pub fn from_config(cfg: &AppConfig, store: StatusStore, shutdown: CancellationToken) -> Self {
        Self::new(
            UploadRestrictions {
                max_size_bytes: cfg.max_upload_bytes,
                max_unpacked_bytes: cfg.max_unpacked_bytes,
                allowed_extensions: cfg.allowed_extensions.clone(),
            },
            FileStager::new(cfg.staged_file_path()),
            ImporterInvoker::new(
                cfg.importer_binary.clone(),
                cfg.target_db.clone(),
                cfg.credential_passing,
                cfg.importer_timeout,
            ),
            store,
            cfg.last_attempt_log_path(),
            shutdown,
        )
    }

    pub fn stager(&self) -> &FileStager {
        &self.stager
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.restrictions.max_size_bytes
    }

    /// Run the full import pipeline for one upload.
    ///
    /// Validation and staging failures return an error and leave all
    /// persisted state untouched. Once the importer has been started the
    /// attempt is always recorded, whatever the outcome.
    pub async fn submit_import(&self, artifact: UploadedArtifact) -> ImportResult<ImportOutcome> {
        let _guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("another import is running, waiting for it to finish");
                self.lock.lock().await
            }
        };

        let restrictions = self.restrictions.clone();
        let (original_filename, artifact) = tokio::task::spawn_blocking(move || {
            upload_validator::validate(&artifact, &restrictions).map(|name| (name, artifact))
        })
        .await
        .map_err(|err| ImportError::Aborted(format!("upload validation aborted: {}", err)))?
        .inspect_err(|err| warn!("rejected upload: {}", err))?;

        let data_file = self.stager.stage(&artifact.bytes).await.map_err(|err| {
            error!(
                "could not stage upload to {}: {}",
                self.stager.target().display(),
                err
            );
            ImportError::Staging(err)
        })?;
        drop(artifact);

        info!("Executing legacy clients import of '{}'", original_filename);
        let invocation = self.invoker.run(&data_file, &self.shutdown).await;
        let outcome = ImportOutcome::new(
            invocation.termination.status(),
            invocation.termination.recorded_exit_code(),
            self.log_path.clone(),
        );

        self.store
            .write(
                &original_filename,
                &invocation.transcript,
                outcome.recorded_exit_code,
            )
            .await
            .inspect_err(|err| error!("could not record import attempt: {}", err))?;

        match outcome.status {
            ImportExitStatus::Success | ImportExitStatus::SuccessWithWarnings => {
                info!("{}", outcome.message)
            }
            ImportExitStatus::Failure | ImportExitStatus::UnknownError => {
                warn!("{} (importer {})", outcome.message, invocation.termination)
            }
        }
        Ok(outcome)
    }

    /// Status widget contents for the last import.
    pub async fn last_import_summary(&self) -> ImportResult<ImportSummary> {
        let record = self.store.read().await?;
        let exit_status = self.store.read_exit_status().await?;

        let summary = match record {
            Some(record) => ImportSummary {
                file_type: FILE_TYPE_LABEL.into(),
                file_info: format!(
                    "File '{}' imported at {}",
                    record.original_filename,
                    record
                        .created_at
                        .with_timezone(&Local)
                        .format(DISPLAY_TIME_FORMAT)
                ),
                file_name: Some(record.original_filename),
                exit_status,
            },
            None => ImportSummary {
                file_type: FILE_TYPE_LABEL.into(),
                file_info: "No file imported".into(),
                file_name: None,
                exit_status,
            },
        };
        Ok(summary)
    }

    /// Transcript of the last attempt, empty when nothing was imported yet.
    pub async fn last_console_output(&self) -> ImportResult<ConsoleOutput> {
        let console = self
            .store
            .read()
            .await?
            .map(|record| record.console_output)
            .unwrap_or_default();
        Ok(ConsoleOutput { console })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::CredentialPassing,
        models::import::ReplyStatus,
        services::{
            importer::tests::target_db, status_store::tests::memory_store,
            upload_validator::tests::gzip,
        },
    };
    use bytes::Bytes;
    use std::path::Path;

    pub(crate) async fn service_with_importer(dir: &Path, binary: PathBuf) -> ImportService {
        ImportService::new(
            UploadRestrictions {
                max_size_bytes: 1024 * 1024,
                max_unpacked_bytes: 16 * 1024 * 1024,
                allowed_extensions: vec!["gz".into()],
            },
            FileStager::new(dir.join("staging").join("xtee55_clients_importer_last")),
            ImporterInvoker::new(binary, target_db(), CredentialPassing::Environment, None),
            memory_store().await,
            dir.join("log").join("xtee55_clients_importer-LAST.log"),
            CancellationToken::new(),
        )
    }

    fn upload(name: &str, payload: &[u8]) -> UploadedArtifact {
        UploadedArtifact::new(Some(name.into()), gzip(payload))
    }

    #[tokio::test]
    async fn nothing_imported_yet() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_importer(dir.path(), "/nonexistent".into()).await;

        let summary = service.last_import_summary().await.unwrap();
        assert_eq!(summary.file_name, None);
        assert_eq!(summary.exit_status, None);
        assert_eq!(summary.file_info, "No file imported");

        let console = service.last_console_output().await.unwrap();
        assert!(console.console.is_empty());
    }

    #[tokio::test]
    async fn invalid_upload_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_importer(dir.path(), "/nonexistent".into()).await;
        service
            .store
            .write("earlier.gz", &["kept".to_string()], 0)
            .await
            .unwrap();
        std::fs::create_dir_all(service.stager().staging_dir()).unwrap();
        std::fs::write(service.stager().target(), b"previous").unwrap();

        let bad = UploadedArtifact::new(Some("data.gz".into()), Bytes::from_static(b"nope"));
        let err = service.submit_import(bad).await.unwrap_err();
        assert!(matches!(
            err,
            ImportError::Validation(ValidationError::NotGzip { .. })
        ));

        let missing = UploadedArtifact::new(None, gzip(b"x"));
        assert!(matches!(
            service.submit_import(missing).await,
            Err(ImportError::Validation(ValidationError::MissingFile))
        ));

        let record = service.store.read().await.unwrap().unwrap();
        assert_eq!(record.original_filename, "earlier.gz");
        assert_eq!(record.console_output, vec!["kept".to_string()]);
        assert_eq!(service.store.read_exit_status().await.unwrap(), Some(0));
        assert_eq!(
            std::fs::read(service.stager().target()).unwrap(),
            b"previous"
        );
    }

    #[tokio::test]
    async fn launch_failure_is_recorded_as_failure_with_generic_message() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_importer(dir.path(), dir.path().join("missing-importer")).await;

        let outcome = service.submit_import(upload("data.gz", b"x")).await.unwrap();

        assert_eq!(outcome.status, ImportExitStatus::UnknownError);
        assert_eq!(outcome.status.reply_status(), ReplyStatus::Error);
        assert_eq!(outcome.log_path, None);
        assert_eq!(service.store.read_exit_status().await.unwrap(), Some(2));
        let record = service.store.read().await.unwrap().unwrap();
        assert_eq!(record.original_filename, "data.gz");
    }

    #[cfg(unix)]
    mod with_fake_importer {
        use super::*;
        use crate::services::importer::tests::fake_importer;

        async fn run_with_exit(code: i32) -> (tempfile::TempDir, ImportService, ImportOutcome) {
            let dir = tempfile::tempdir().unwrap();
            let script = fake_importer(
                dir.path(),
                &format!("echo \"importing $2\"\necho 'done' 1>&2\nexit {}", code),
            );
            let service = service_with_importer(dir.path(), script).await;
            let outcome = service
                .submit_import(upload("clients.gz", b"legacy clients"))
                .await
                .unwrap();
            (dir, service, outcome)
        }

        #[tokio::test]
        async fn exit_zero_reports_success_and_records_transcript() {
            let (_dir, service, outcome) = run_with_exit(0).await;

            assert_eq!(outcome.status.reply_status(), ReplyStatus::Success);
            assert_eq!(outcome.log_path, None);

            let staged = std::fs::canonicalize(service.stager().target()).unwrap();
            let console = service.last_console_output().await.unwrap().console;
            assert_eq!(
                console,
                vec![format!("importing {}", staged.display()), "done".to_string()]
            );

            let summary = service.last_import_summary().await.unwrap();
            assert_eq!(summary.file_name.as_deref(), Some("clients.gz"));
            assert_eq!(summary.exit_status, Some(0));
            assert!(summary.file_info.starts_with("File 'clients.gz' imported at "));
        }

        #[tokio::test]
        async fn staged_file_holds_uploaded_bytes() {
            let (_dir, service, _outcome) = run_with_exit(0).await;
            let staged = std::fs::read(service.stager().target()).unwrap();
            assert_eq!(Bytes::from(staged), gzip(b"legacy clients"));
        }

        #[tokio::test]
        async fn exit_one_reports_warning_with_log_path() {
            let (dir, service, outcome) = run_with_exit(1).await;

            assert_eq!(outcome.status.reply_status(), ReplyStatus::Warning);
            let log = dir.path().join("log").join("xtee55_clients_importer-LAST.log");
            assert_eq!(outcome.log_path.as_deref(), Some(log.as_path()));
            assert!(outcome.message.contains(&log.display().to_string()));
            assert_eq!(service.store.read_exit_status().await.unwrap(), Some(1));
        }

        #[tokio::test]
        async fn exit_two_reports_error_with_log_path_and_keeps_transcript() {
            let (_dir, service, outcome) = run_with_exit(2).await;

            assert_eq!(outcome.status, ImportExitStatus::Failure);
            assert_eq!(outcome.status.reply_status(), ReplyStatus::Error);
            assert!(outcome.log_path.is_some());
            let console = service.last_console_output().await.unwrap().console;
            assert_eq!(console.len(), 2);
            assert_eq!(service.store.read_exit_status().await.unwrap(), Some(2));
        }

        #[tokio::test]
        async fn unmapped_exit_reports_generic_error() {
            let (_dir, service, outcome) = run_with_exit(99).await;

            assert_eq!(outcome.status, ImportExitStatus::UnknownError);
            assert_eq!(outcome.log_path, None);
            assert!(!outcome.message.contains("LAST.log"));
            assert_eq!(service.store.read_exit_status().await.unwrap(), Some(99));
            assert!(service.store.read().await.unwrap().is_some());
        }

        #[tokio::test]
        async fn second_import_replaces_first() {
            let dir = tempfile::tempdir().unwrap();
            let script = fake_importer(dir.path(), "echo \"run for $2\"");
            let service = service_with_importer(dir.path(), script).await;

            service.submit_import(upload("first.gz", b"1")).await.unwrap();
            service.submit_import(upload("second.gz", b"2")).await.unwrap();

            let record = service.store.read().await.unwrap().unwrap();
            assert_eq!(record.original_filename, "second.gz");
            assert_eq!(record.console_output.len(), 1);
        }

        #[tokio::test]
        async fn concurrent_imports_are_serialized() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("running");
            let script = fake_importer(
                dir.path(),
                &format!(
                    "if [ -e '{m}' ]; then echo overlap; exit 3; fi\ntouch '{m}'\nsleep 1\nrm '{m}'\necho ok",
                    m = marker.display()
                ),
            );
            let service = service_with_importer(dir.path(), script).await;

            let (a, b) = tokio::join!(
                service.submit_import(upload("a.gz", b"a")),
                service.submit_import(upload("b.gz", b"b")),
            );

            assert_eq!(a.unwrap().status, ImportExitStatus::Success);
            assert_eq!(b.unwrap().status, ImportExitStatus::Success);
        }
    }
}
