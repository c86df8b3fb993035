//! Source ingestion: validate, decode, and stage user files.
//!
//! One ingestion envelope carries every source file for a request. Each
//! entry is validated (name shape, hash length, decoded-size budget,
//! MD5), then materialized under the staging directory. The decoded
//! texts are kept alongside the staged paths because init-test checks
//! run against them before any stage starts.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use tokio::io::AsyncWriteExt as _;

use crucible_core::protocol::SourceFile;

use crate::config::WorkerConfig;

/// Longest accepted source file name.
pub const MAX_NAME_LEN: usize = 64;

/// Hex length of an MD5 digest.
const MD5_HEX_LEN: usize = 32;

/// File mode for staged sources; the sandboxed stages run under a
/// different uid and need group access.
const STAGED_FILE_MODE: u32 = 0o660;

/// Result of a successful ingestion.
#[derive(Debug)]
pub struct StagedSources {
    /// Absolute staged paths, in envelope order.
    pub paths: Vec<String>,
    /// Decoded file contents, lossily UTF-8, for init-test checks.
    pub texts: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("no source files in the message")]
    NoSources,

    #[error("source file name length {len} is out of range 1..={MAX_NAME_LEN}")]
    NameLength { len: usize },

    #[error("wrong source file name {name:?}: may not start or end with a dot")]
    NameDot { name: String },

    #[error("forbidden character in source file name {name:?} at index {index}")]
    NameChar { name: String, index: usize },

    #[error("wrong hash length ({len}), must be {MD5_HEX_LEN} for hex MD5")]
    HashLength { len: usize },

    #[error("failed to decode base64 text of {name:?}: {source}")]
    BadEncoding {
        name: String,
        source: base64::DecodeError,
    },

    #[error("reached source code size limit: {limit}")]
    SizeLimit { limit: u64 },

    #[error("hash for {name:?} doesn't match the source code")]
    HashMismatch { name: String },

    #[error("failed to write staged file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Check a source file name against the staging rules: 1–64 chars from
/// `[A-Za-z0-9_.]`, no leading or trailing dot. The charset excludes
/// path separators, so a valid name can't escape the staging directory.
pub fn validate_name(name: &str) -> Result<(), IngestError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(IngestError::NameLength { len: name.len() });
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(IngestError::NameDot {
            name: name.to_owned(),
        });
    }
    if let Some(index) = name
        .bytes()
        .position(|b| !(b.is_ascii_alphanumeric() || b == b'_' || b == b'.'))
    {
        return Err(IngestError::NameChar {
            name: name.to_owned(),
            index,
        });
    }
    Ok(())
}

/// Validate and decode every source file, then write them to the
/// staging directory with mode `0660`.
///
/// Checks run in envelope order: name shape, hash length, base64
/// decode, cumulative size budget, MD5 match. Nothing is written until
/// every file has passed.
///
/// # Errors
///
/// Returns the first [`IngestError`] encountered; on error no staged
/// file from earlier batches is cleaned up (staging-directory hygiene
/// is the operator's responsibility).
pub async fn stage_sources(
    files: &[SourceFile],
    config: &WorkerConfig,
) -> Result<StagedSources, IngestError> {
    if files.is_empty() {
        return Err(IngestError::NoSources);
    }

    let mut decoded: Vec<Vec<u8>> = Vec::with_capacity(files.len());
    let mut total_size: u64 = 0;

    for file in files {
        validate_name(&file.name)?;
        if file.hash.len() != MD5_HEX_LEN {
            return Err(IngestError::HashLength {
                len: file.hash.len(),
            });
        }

        let bytes = BASE64
            .decode(&file.text)
            .map_err(|source| IngestError::BadEncoding {
                name: file.name.clone(),
                source,
            })?;

        total_size += bytes.len() as u64;
        if total_size > config.sources_size_limit_bytes {
            return Err(IngestError::SizeLimit {
                limit: config.sources_size_limit_bytes,
            });
        }

        let computed = format!("{:x}", Md5::digest(&bytes));
        if computed != file.hash {
            return Err(IngestError::HashMismatch {
                name: file.name.clone(),
            });
        }

        decoded.push(bytes);
    }

    let mut paths = Vec::with_capacity(files.len());
    let mut texts = Vec::with_capacity(files.len());

    for (file, bytes) in files.iter().zip(&decoded) {
        let path = config.sources_dir.join(&file.name);
        let path_str = path.to_string_lossy().into_owned();
        write_staged(&path_str, bytes)
            .await
            .map_err(|source| IngestError::Write {
                path: path_str.clone(),
                source,
            })?;
        texts.push(String::from_utf8_lossy(bytes).into_owned());
        paths.push(path_str);
    }

    Ok(StagedSources { paths, texts })
}

async fn write_staged(path: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(STAGED_FILE_MODE)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}
