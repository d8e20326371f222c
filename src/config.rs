use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// File name the uploaded data is staged under; every import overwrites it.
pub const STAGED_FILE_NAME: &str = "xtee55_clients_importer_last";

/// Log file the importer writes for the most recent attempt.
pub const LAST_ATTEMPT_LOG_NAME: &str = "xtee55_clients_importer-LAST.log";

const ENV_PREFIX: &str = "LEGACY_IMPORT_";

/// How the target database password is handed to the importer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CredentialPassing {
    /// `IMPORTER_DB_PASSWORD` in the child environment, no `-p` flag.
    Environment,
    /// Legacy `-p <password>` on the command line.
    Argument,
}

impl FromStr for CredentialPassing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(s, true)
            .map_err(|_| anyhow::anyhow!("expected `environment` or `argument`, got `{}`", s))
    }
}

/// Connection parameters of the system being imported into.
#[derive(Clone)]
pub struct TargetDatabase {
    pub adapter: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for TargetDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDatabase")
            .field("adapter", &self.adapter)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub importer_binary: PathBuf,
    pub staging_dir: PathBuf,
    pub log_dir: PathBuf,
    pub target_db: TargetDatabase,
    pub credential_passing: CredentialPassing,
    pub max_upload_bytes: u64,
    pub max_unpacked_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub importer_timeout: Option<Duration>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Legacy client data import controller")]
pub struct Args {
    /// Host to bind to (overrides LEGACY_IMPORT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides LEGACY_IMPORT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Status database URL (overrides LEGACY_IMPORT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Absolute path of the external importer (overrides LEGACY_IMPORT_IMPORTER_BINARY)
    #[arg(long)]
    pub importer_binary: Option<PathBuf>,

    /// Directory the uploaded data file is staged in (overrides LEGACY_IMPORT_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Directory holding the importer log (overrides LEGACY_IMPORT_LOG_DIR)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Target database adapter, e.g. postgresql (overrides LEGACY_IMPORT_TARGET_DB_ADAPTER)
    #[arg(long)]
    pub target_db_adapter: Option<String>,

    /// Target database name (overrides LEGACY_IMPORT_TARGET_DB_NAME)
    #[arg(long)]
    pub target_db_name: Option<String>,

    /// Target database user (overrides LEGACY_IMPORT_TARGET_DB_USER)
    #[arg(long)]
    pub target_db_user: Option<String>,

    /// How the password reaches the importer (overrides LEGACY_IMPORT_CREDENTIAL_PASSING)
    #[arg(long, value_enum)]
    pub credential_passing: Option<CredentialPassing>,

    /// Largest accepted upload in bytes (overrides LEGACY_IMPORT_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Largest accepted decompressed size of an upload in bytes (overrides LEGACY_IMPORT_MAX_UNPACKED_BYTES)
    #[arg(long)]
    pub max_unpacked_bytes: Option<u64>,

    /// Comma separated list of accepted file extensions (overrides LEGACY_IMPORT_ALLOWED_EXTENSIONS)
    #[arg(long, value_delimiter = ',')]
    pub allowed_extensions: Option<Vec<String>>,

    /// Kill the importer after this many seconds (overrides LEGACY_IMPORT_IMPORTER_TIMEOUT_SECS)
    #[arg(long)]
    pub importer_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_args(args)
    }

    fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env_string("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_parsed::<u16>("PORT")?.unwrap_or(3000);
        let env_db = env_string("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/legacy_import.db".into());
        let env_binary = env_string("IMPORTER_BINARY")
            .unwrap_or_else(|| "/usr/share/xroad/bin/xtee55_clients_importer".into());
        let env_staging = env_string("STAGING_DIR").unwrap_or_else(|| "./data/v5_import".into());
        let env_log = env_string("LOG_DIR").unwrap_or_else(|| "./data/log".into());
        let env_adapter = env_string("TARGET_DB_ADAPTER").unwrap_or_else(|| "postgresql".into());
        let env_name =
            env_string("TARGET_DB_NAME").unwrap_or_else(|| "centerui_production".into());
        let env_user = env_string("TARGET_DB_USER").unwrap_or_else(|| "centerui".into());
        let env_password = env_string("TARGET_DB_PASSWORD").unwrap_or_default();
        let env_passing =
            env_parsed::<CredentialPassing>("CREDENTIAL_PASSING")?
                .unwrap_or(CredentialPassing::Environment);
        let env_max_upload = env_parsed::<u64>("MAX_UPLOAD_BYTES")?.unwrap_or(100 * 1024 * 1024);
        let env_max_unpacked =
            env_parsed::<u64>("MAX_UNPACKED_BYTES")?.unwrap_or(1024 * 1024 * 1024);
        let env_extensions = env_string("ALLOWED_EXTENSIONS")
            .map(|v| v.split(',').map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_else(|| vec!["gz".into(), "tgz".into()]);
        let env_timeout = env_parsed::<u64>("IMPORTER_TIMEOUT_SECS")?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            importer_binary: args.importer_binary.unwrap_or_else(|| env_binary.into()),
            staging_dir: args.staging_dir.unwrap_or_else(|| env_staging.into()),
            log_dir: args.log_dir.unwrap_or_else(|| env_log.into()),
            target_db: TargetDatabase {
                adapter: args.target_db_adapter.unwrap_or(env_adapter),
                database: args.target_db_name.unwrap_or(env_name),
                username: args.target_db_user.unwrap_or(env_user),
                password: env_password,
            },
            credential_passing: args.credential_passing.unwrap_or(env_passing),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            max_unpacked_bytes: args.max_unpacked_bytes.unwrap_or(env_max_unpacked),
            allowed_extensions: normalize_extensions(
                args.allowed_extensions.unwrap_or(env_extensions),
            ),
            importer_timeout: args
                .importer_timeout_secs
                .or(env_timeout)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The single fixed path every upload is staged to.
    pub fn staged_file_path(&self) -> PathBuf {
        self.staging_dir.join(STAGED_FILE_NAME)
    }

    /// The log file referenced by warning and failure messages.
    pub fn last_attempt_log_path(&self) -> PathBuf {
        self.log_dir.join(LAST_ATTEMPT_LOG_NAME)
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let var = format!("{}{}", ENV_PREFIX, name);
    match env::var(&var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

/// Lowercase, strip leading dots and drop blanks so `.GZ, tgz` becomes `gz,tgz`.
fn normalize_extensions(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_normalized() {
        let normalized = normalize_extensions(vec![".GZ".into(), " tgz ".into(), "".into()]);
        assert_eq!(normalized, vec!["gz".to_string(), "tgz".to_string()]);
    }

    #[test]
    fn cli_flags_override_defaults_and_derive_fixed_paths() {
        let args = Args::parse_from([
            "legacy-import",
            "--staging-dir",
            "/var/lib/import",
            "--log-dir",
            "/var/log/import",
            "--credential-passing",
            "argument",
            "--allowed-extensions",
            "gz,.DAT",
            "--importer-timeout-secs",
            "30",
        ]);
        let (cfg, migrate) = AppConfig::from_args(args).unwrap();

        assert!(!migrate);
        assert_eq!(
            cfg.staged_file_path(),
            PathBuf::from("/var/lib/import/xtee55_clients_importer_last")
        );
        assert_eq!(
            cfg.last_attempt_log_path(),
            PathBuf::from("/var/log/import/xtee55_clients_importer-LAST.log")
        );
        assert_eq!(cfg.credential_passing, CredentialPassing::Argument);
        assert_eq!(cfg.allowed_extensions, vec!["gz".to_string(), "dat".to_string()]);
        assert_eq!(cfg.importer_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn debug_output_redacts_password() {
        let db = TargetDatabase {
            adapter: "postgresql".into(),
            database: "centerui".into(),
            username: "centerui".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{:?}", db);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
