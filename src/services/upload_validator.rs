//! Checks an uploaded legacy data file before anything touches the disk.
//!
//! An upload must be present, non-empty, within the size limit, carry an
//! accepted extension, match its declared length and decompress cleanly as
//! gzip within the unpacked size limit. Validation is pure: it never writes
//! anything.

use bytes::Bytes;
use flate2::bufread::GzDecoder;
use std::io::{self, Read};
use thiserror::Error;

/// An upload as received from the HTTP layer. Lives for one request only.
#[derive(Debug, Clone)]
pub struct UploadedArtifact {
    pub original_filename: Option<String>,
    pub declared_length: Option<u64>,
    pub bytes: Bytes,
}

impl UploadedArtifact {
    pub fn new(original_filename: Option<String>, bytes: Bytes) -> Self {
        Self {
            original_filename,
            declared_length: None,
            bytes,
        }
    }

    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no file was uploaded")]
    MissingFile,
    #[error("uploaded file `{0}` is empty")]
    EmptyFile(String),
    #[error("uploaded file `{name}` is {size} bytes, the limit is {limit} bytes")]
    TooLarge { name: String, size: u64, limit: u64 },
    #[error("uploaded file `{name}` must have one of the extensions: {allowed}")]
    DisallowedExtension { name: String, allowed: String },
    #[error("uploaded file `{name}` declared {declared} bytes but {actual} were received")]
    LengthMismatch {
        name: String,
        declared: u64,
        actual: u64,
    },
    #[error("uploaded file `{name}` unpacks to more than {limit} bytes")]
    UnpackedTooLarge { name: String, limit: u64 },
    #[error("uploaded file `{name}` is not a valid gzip file: {reason}")]
    NotGzip { name: String, reason: String },
}

/// Limits applied to every upload.
#[derive(Debug, Clone)]
pub struct UploadRestrictions {
    pub max_size_bytes: u64,
    /// Upper bound on the decompressed size of all gzip members together.
    pub max_unpacked_bytes: u64,
    /// Lowercase extensions without the leading dot. Empty accepts any name.
    pub allowed_extensions: Vec<String>,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Validate `artifact` and hand back the filename it will be recorded under.
pub fn validate(
    artifact: &UploadedArtifact,
    restrictions: &UploadRestrictions,
) -> Result<String, ValidationError> {
    let name = match artifact.original_filename.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Err(ValidationError::MissingFile),
    };

    let size = artifact.bytes.len() as u64;
    if size == 0 {
        return Err(ValidationError::EmptyFile(name));
    }
    if size > restrictions.max_size_bytes {
        return Err(ValidationError::TooLarge {
            name,
            size,
            limit: restrictions.max_size_bytes,
        });
    }
    if let Some(declared) = artifact.declared_length {
        if declared != size {
            return Err(ValidationError::LengthMismatch {
                name,
                declared,
                actual: size,
            });
        }
    }

    ensure_extension_allowed(&name, &restrictions.allowed_extensions)?;
    ensure_gzip(&name, &artifact.bytes, restrictions.max_unpacked_bytes)?;

    Ok(name)
}

fn ensure_extension_allowed(name: &str, allowed: &[String]) -> Result<(), ValidationError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if allowed.iter().any(|candidate| *candidate == extension) {
        Ok(())
    } else {
        Err(ValidationError::DisallowedExtension {
            name: name.to_string(),
            allowed: allowed.join(", "),
        })
    }
}

/// Decompress every member into a sink, stopping once more than
/// `max_unpacked` bytes come out. Truncated or corrupt members and trailing
/// bytes other than NUL padding all fail.
fn ensure_gzip(name: &str, bytes: &[u8], max_unpacked: u64) -> Result<(), ValidationError> {
    let not_gzip = |reason: String| ValidationError::NotGzip {
        name: name.to_string(),
        reason,
    };

    if !bytes.starts_with(&GZIP_MAGIC) {
        return Err(not_gzip("missing gzip header".into()));
    }

    let mut rest = bytes;
    let mut unpacked: u64 = 0;
    loop {
        let mut member = GzDecoder::new(rest);
        let budget = max_unpacked - unpacked;
        let copied = io::copy(
            &mut (&mut member).take(budget.saturating_add(1)),
            &mut io::sink(),
        )
        .map_err(|err| not_gzip(err.to_string()))?;
        if copied > budget {
            return Err(ValidationError::UnpackedTooLarge {
                name: name.to_string(),
                limit: max_unpacked,
            });
        }
        unpacked += copied;

        rest = member.into_inner();
        if rest.iter().all(|byte| *byte == 0) {
            return Ok(());
        }
        if !rest.starts_with(&GZIP_MAGIC) {
            return Err(not_gzip("trailing data after gzip stream".into()));
        }
    }
}
