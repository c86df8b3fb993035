//! Worker configuration and startup checks.

use std::path::PathBuf;

use tracing::warn;

/// Settings shared by every request on this worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory where ingested source files are staged.
    pub sources_dir: PathBuf,
    /// Combined decoded size budget for one request's sources, in bytes.
    pub sources_size_limit_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to stat sources dir {path}: {source}")]
    SourcesDirStat {
        path: String,
        source: std::io::Error,
    },

    #[error("sources dir is not a directory: {path}")]
    SourcesDirNotADirectory { path: String },

    #[error("sources dir {path} has unsuitable permissions {mode:o}, needs group/world rw")]
    SourcesDirPermissions { path: String, mode: u32 },

    #[error("sources size limit can't be zero")]
    ZeroSizeLimit,
}

impl WorkerConfig {
    /// Verify the staging directory and size budget at startup.
    ///
    /// The directory must exist, be a directory, and be readable and
    /// writable by group and others, since the sandboxed stages run
    /// under a different uid. Suspicious but legal size budgets only
    /// log a warning.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first failed check.
    pub fn check(&self) -> Result<(), ConfigError> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.sources_dir.display().to_string();
        let metadata =
            std::fs::metadata(&self.sources_dir).map_err(|source| ConfigError::SourcesDirStat {
                path: path.clone(),
                source,
            })?;
        if !metadata.is_dir() {
            return Err(ConfigError::SourcesDirNotADirectory { path });
        }
        let mode = metadata.permissions().mode();
        if mode & 0o666 != 0o666 {
            return Err(ConfigError::SourcesDirPermissions { path, mode });
        }

        if self.sources_size_limit_bytes == 0 {
            return Err(ConfigError::ZeroSizeLimit);
        } else if self.sources_size_limit_bytes < 1024 {
            warn!(
                "sources size limit {} bytes seems very low",
                self.sources_size_limit_bytes
            );
        } else if self.sources_size_limit_bytes > 10 * 1024 * 1024 {
            warn!(
                "sources size limit {} bytes seems too high",
                self.sources_size_limit_bytes
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writable_dir() -> tempfile::TempDir {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).unwrap();
        dir
    }

    #[test]
    fn accepts_a_writable_directory() {
        let dir = writable_dir();
        let config = WorkerConfig {
            sources_dir: dir.path().to_path_buf(),
            sources_size_limit_bytes: 8000,
        };
        config.check().unwrap();
    }

    #[test]
    fn rejects_a_missing_directory() {
        let config = WorkerConfig {
            sources_dir: PathBuf::from("/nonexistent/sources"),
            sources_size_limit_bytes: 8000,
        };
        assert!(matches!(
            config.check(),
            Err(ConfigError::SourcesDirStat { .. })
        ));
    }

    #[test]
    fn rejects_a_group_unwritable_directory() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700)).unwrap();
        let config = WorkerConfig {
            sources_dir: dir.path().to_path_buf(),
            sources_size_limit_bytes: 8000,
        };
        assert!(matches!(
            config.check(),
            Err(ConfigError::SourcesDirPermissions { .. })
        ));
    }

    #[test]
    fn rejects_a_zero_size_limit() {
        let dir = writable_dir();
        let config = WorkerConfig {
            sources_dir: dir.path().to_path_buf(),
            sources_size_limit_bytes: 0,
        };
        assert!(matches!(config.check(), Err(ConfigError::ZeroSizeLimit)));
    }
}
