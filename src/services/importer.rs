//! Runs the external legacy clients importer against a staged data file.
//!
//! The importer is invoked as
//! `<binary> -d <data file> -t <adapter> -b <database> -u <user> [-p <password>]`.
//! Its stdout and stderr share one pipe, so the transcript keeps lines in the
//! order the importer wrote them. The run can be bounded by a timeout and aborted through a
//! [`CancellationToken`]; either way the child is killed and whatever it
//! printed so far is kept.

use crate::{
    config::{CredentialPassing, TargetDatabase},
    models::import::{EXIT_FAILURE, ImportExitStatus},
};
use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable carrying the password in `environment` mode.
pub const PASSWORD_ENV: &str = "IMPORTER_DB_PASSWORD";

/// How long to keep collecting output after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How an importer run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process was terminated by a signal.
    Signaled,
    /// The process could not be started.
    LaunchFailed(String),
    /// Waiting on the process failed.
    WaitFailed(String),
    /// The configured timeout elapsed and the process was killed.
    TimedOut,
    /// The run was cancelled and the process was killed.
    Cancelled,
}

impl Termination {
    /// Caller-facing interpretation of the run.
    pub fn status(&self) -> ImportExitStatus {
        match self {
            Self::Exited(code) => ImportExitStatus::from_exit_code(*code),
            _ => ImportExitStatus::UnknownError,
        }
    }

    /// Exit code persisted as the last known status. A run that never
    /// completed is recorded as a failure.
    pub fn recorded_exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            _ => EXIT_FAILURE,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {}", code),
            Self::Signaled => write!(f, "terminated by a signal"),
            Self::LaunchFailed(reason) => write!(f, "could not be started: {}", reason),
            Self::WaitFailed(reason) => write!(f, "could not be waited on: {}", reason),
            Self::TimedOut => write!(f, "timed out and was killed"),
            Self::Cancelled => write!(f, "was cancelled and killed"),
        }
    }
}

/// Transcript and termination of one importer run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub transcript: Vec<String>,
    pub termination: Termination,
}

#[derive(Clone, Debug)]
pub struct ImporterInvoker {
    binary: PathBuf,
    target_db: TargetDatabase,
    credential_passing: CredentialPassing,
    timeout: Option<Duration>,
}

impl ImporterInvoker {
    pub fn new(
        binary: impl Into<PathBuf>,
        target_db: TargetDatabase,
        credential_passing: CredentialPassing,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            binary: binary.into(),
            target_db,
            credential_passing,
            timeout,
        }
    }

    fn arguments(&self, data_file: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-d".into(),
            data_file.into(),
            "-t".into(),
            self.target_db.adapter.clone().into(),
            "-b".into(),
            self.target_db.database.clone().into(),
            "-u".into(),
            self.target_db.username.clone().into(),
        ];
        if self.credential_passing == CredentialPassing::Argument {
            args.push("-p".into());
            args.push(self.target_db.password.clone().into());
        }
        args
    }

    /// Command line as it may appear in logs.
    fn redacted_command_line(&self, data_file: &Path) -> String {
        let mut rendered = vec![self.binary.display().to_string()];
        let mut redact_next = false;
        for arg in self.arguments(data_file) {
            if redact_next {
                rendered.push("***".into());
                redact_next = false;
                continue;
            }
            redact_next = arg == "-p";
            rendered.push(arg.to_string_lossy().into_owned());
        }
        rendered.join(" ")
    }

    /// Run the importer to completion, timeout or cancellation.
    ///
    /// Never fails: launch and wait errors become a [`Termination`] so the
    /// caller can still record the attempt.
    pub async fn run(&self, data_file: &Path, cancel: &CancellationToken) -> Invocation {
        debug!(
            "Executing legacy clients import: {}",
            self.redacted_command_line(data_file)
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut child = match self.spawn(data_file, tx) {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    "could not start importer {}: {}",
                    self.binary.display(),
                    err
                );
                return Invocation {
                    transcript: Vec::new(),
                    termination: Termination::LaunchFailed(err.to_string()),
                };
            }
        };

        let termination = self.wait(&mut child, cancel).await;

        let mut transcript = Vec::new();
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(line) = rx.recv().await {
                transcript.push(line);
            }
        })
        .await;
        if drained.is_err() {
            warn!("importer output still open after exit, transcript may be incomplete");
        }

        info!("Importer {}", termination);
        Invocation {
            transcript,
            termination,
        }
    }

    /// Start the importer with stdout and stderr on the same pipe and forward
    /// its lines to `tx`.
    ///
    /// The command, and with it the parent's copies of the write end, is
    /// dropped before returning so the reader sees EOF once the child exits.
    #[cfg(unix)]
    fn spawn(&self, data_file: &Path, tx: mpsc::UnboundedSender<String>) -> io::Result<Child> {
        let (writer, reader) = pipe::pipe()?;
        let stdout = writer.into_blocking_fd()?;
        let stderr = stdout.try_clone()?;

        let child = {
            let mut command = self.command(data_file);
            command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            command.spawn()?
        };
        tokio::spawn(pump_lines(reader, tx));
        Ok(child)
    }

    /// Without unix pipes the streams are read separately and only keep
    /// their order within each stream.
    #[cfg(not(unix))]
    fn spawn(&self, data_file: &Path, tx: mpsc::UnboundedSender<String>) -> io::Result<Child> {
        let mut child = {
            let mut command = self.command(data_file);
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            command.spawn()?
        };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx));
        }
        Ok(child)
    }

    fn command(&self, data_file: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(self.arguments(data_file))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.credential_passing == CredentialPassing::Environment {
            command.env(PASSWORD_ENV, &self.target_db.password);
        }
        command
    }

    async fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Termination {
        enum Stop {
            Exited(io::Result<ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let deadline = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status),
            _ = deadline => Stop::TimedOut,
            _ = cancel.cancelled() => Stop::Cancelled,
        };

        match stop {
            Stop::Exited(Ok(status)) => match status.code() {
                Some(code) => Termination::Exited(code),
                None => Termination::Signaled,
            },
            Stop::Exited(Err(err)) => Termination::WaitFailed(err.to_string()),
            Stop::TimedOut => {
                warn!("importer exceeded {:?}, killing it", self.timeout);
                kill(child).await;
                Termination::TimedOut
            }
            Stop::Cancelled => {
                warn!("import cancelled, killing importer");
                kill(child).await;
                Termination::Cancelled
            }
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!("failed to kill importer: {}", err);
    }
}

/// Forward each line of `reader` to `tx` until EOF. Invalid UTF-8 is replaced.
async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(decode_line(&buf)).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!("stopped reading importer output: {}", err);
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
