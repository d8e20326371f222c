//! Writes a validated upload to the single fixed staging path.
//!
//! Bytes go to a uniquely named temp file beside the target, are fsynced and
//! then renamed over the target, so readers see either the previous file or
//! the complete new one.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct FileStager {
    target: PathBuf,
}

impl FileStager {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// The fixed path every upload lands on.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Directory the staged file lives in.
    pub fn staging_dir(&self) -> &Path {
        self.target.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Replace the staged file with `bytes` and return its absolute path.
    ///
    /// On failure the temp file is removed and the previous staged file,
    /// if any, is left untouched.
    pub async fn stage(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let parent = self.target.parent().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "staging path has no parent directory")
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &self.target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                let replaced = match fs::remove_file(&self.target).await {
                    Ok(()) => fs::rename(&tmp_path, &self.target).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = replaced {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }

        let staged = fs::canonicalize(&self.target).await?;
        debug!("importable data file saved to '{}'", staged.display());
        Ok(staged)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
