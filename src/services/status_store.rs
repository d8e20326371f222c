//! Durable "last import" state backed by SQLite.
//!
//! Two single-row tables: `import_attempts` holds the last attempt's filename,
//! timestamp and transcript; `import_exit_status` holds its raw exit code.
//! Each write is an upsert, so a failed write leaves the previous row intact.

use crate::models::import::ImportAttemptRecord;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("stored console output is corrupt: {0}")]
    Transcript(#[from] serde_json::Error),
}

pub type StatusStoreResult<T> = Result<T, StatusStoreError>;

#[derive(FromRow)]
struct ImportAttemptRow {
    original_filename: String,
    created_at: DateTime<Utc>,
    console_output: String,
}

impl TryFrom<ImportAttemptRow> for ImportAttemptRecord {
    type Error = StatusStoreError;

    fn try_from(row: ImportAttemptRow) -> StatusStoreResult<Self> {
        Ok(Self {
            original_filename: row.original_filename,
            created_at: row.created_at,
            console_output: serde_json::from_str(&row.console_output)?,
        })
    }
}

#[derive(Clone)]
pub struct StatusStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl StatusStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Replace the last-attempt record and the last exit status, stamped now.
    ///
    /// Both rows change in one transaction; if it fails the previous
    /// record and status are left as they were.
    pub async fn write(
        &self,
        original_filename: &str,
        console_lines: &[String],
        exit_code: i32,
    ) -> StatusStoreResult<ImportAttemptRecord> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let record = upsert_attempt(&mut *tx, original_filename, console_lines, now).await?;
        upsert_exit_status(&mut *tx, exit_code, now).await?;
        tx.commit().await?;

        debug!(
            "recorded import of '{}' with exit status {} ({} console lines)",
            original_filename,
            exit_code,
            console_lines.len()
        );
        Ok(record)
    }

    /// The last-attempt record, or `None` when nothing was ever imported.
    pub async fn read(&self) -> StatusStoreResult<Option<ImportAttemptRecord>> {
        let row = sqlx::query_as::<_, ImportAttemptRow>(
            "SELECT original_filename, created_at, console_output
             FROM import_attempts WHERE id = 1",
        )
        .fetch_optional(&*self.db)
        .await?;

        row.map(ImportAttemptRecord::try_from).transpose()
    }

    /// Exit code of the last attempt, or `None` when nothing was ever imported.
    pub async fn read_exit_status(&self) -> StatusStoreResult<Option<i32>> {
        let code = sqlx::query_scalar::<_, i32>(
            "SELECT exit_code FROM import_exit_status WHERE id = 1",
        )
        .fetch_optional(&*self.db)
        .await?;
        Ok(code)
    }
}

async fn upsert_attempt(
    conn: &mut sqlx::SqliteConnection,
    original_filename: &str,
    console_lines: &[String],
    created_at: DateTime<Utc>,
) -> StatusStoreResult<ImportAttemptRecord> {
    let console_output = serde_json::to_string(console_lines)?;

    sqlx::query(
        r#"
        INSERT INTO import_attempts (id, original_filename, created_at, console_output)
        VALUES (1, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            original_filename = excluded.original_filename,
            created_at = excluded.created_at,
            console_output = excluded.console_output
        "#,
    )
    .bind(original_filename)
    .bind(created_at)
    .bind(&console_output)
    .execute(&mut *conn)
    .await?;

    Ok(ImportAttemptRecord {
        original_filename: original_filename.to_string(),
        created_at,
        console_output: console_lines.to_vec(),
    })
}

async fn upsert_exit_status(
    conn: &mut sqlx::SqliteConnection,
    exit_code: i32,
    recorded_at: DateTime<Utc>,
) -> StatusStoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO import_exit_status (id, exit_code, recorded_at)
        VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            exit_code = excluded.exit_code,
            recorded_at = excluded.recorded_at
        "#,
    )
    .bind(exit_code)
    .bind(recorded_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Apply the embedded schema, one statement at a time.
/// Open the status database, creating the file if needed, and make sure the
/// schema is in place before anything reads from it.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn memory_store() -> StatusStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        StatusStore::new(Arc::new(pool))
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    #[tokio::test]
    async fn read_before_any_import_is_none() {
        let store = memory_store().await;
        assert_eq!(store.read().await.unwrap(), None);
        assert_eq!(store.read_exit_status().await.unwrap(), None);
    }

    #[tokio::test]
    async fn transcript_round_trips_exactly() {
        let store = memory_store().await;
        let transcript = lines(&["", "  leading and trailing  ", "tab\there", "", "last", ""]);

        store.write("clients.gz", &transcript, 0).await.unwrap();
        let record = store.read().await.unwrap().unwrap();

        assert_eq!(record.original_filename, "clients.gz");
        assert_eq!(record.console_output, transcript);
    }

    #[tokio::test]
    async fn empty_transcript_round_trips_as_no_lines() {
        let store = memory_store().await;
        store.write("clients.gz", &[], 0).await.unwrap();

        let record = store.read().await.unwrap().unwrap();
        assert!(record.console_output.is_empty());
    }

    #[tokio::test]
    async fn second_write_fully_replaces_first() {
        let store = memory_store().await;
        let first = store
            .write("first.gz", &lines(&["one", "two"]), 0)
            .await
            .unwrap();
        store
            .write("second.gz", &lines(&["three"]), 2)
            .await
            .unwrap();

        let record = store.read().await.unwrap().unwrap();
        assert_eq!(record.original_filename, "second.gz");
        assert_eq!(record.console_output, lines(&["three"]));
        assert!(record.created_at >= first.created_at);
        assert_eq!(store.read_exit_status().await.unwrap(), Some(2));

        let rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM import_attempts")
            .fetch_one(&*store.db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn exit_status_is_stored_alongside_record() {
        let store = memory_store().await;
        store.write("clients.gz", &lines(&["x"]), 99).await.unwrap();

        assert_eq!(store.read_exit_status().await.unwrap(), Some(99));
        assert!(store.read().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = memory_store().await;
        store.write("clients.gz", &lines(&["kept"]), 1).await.unwrap();

        run_migrations(&store.db).await.unwrap();

        let record = store.read().await.unwrap().unwrap();
        assert_eq!(record.console_output, lines(&["kept"]));
    }

    #[tokio::test]
    async fn fresh_database_file_is_ready_after_connect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("status.db").display());

        let store = StatusStore::new(Arc::new(connect(&url, 1).await.unwrap()));
        assert_eq!(store.read().await.unwrap(), None);
        store.write("clients.gz", &lines(&["kept"]), 0).await.unwrap();
        store.db.close().await;

        let reopened = StatusStore::new(Arc::new(connect(&url, 1).await.unwrap()));
        let record = reopened.read().await.unwrap().unwrap();
        assert_eq!(record.original_filename, "clients.gz");
        assert_eq!(reopened.read_exit_status().await.unwrap(), Some(0));
    }
}
