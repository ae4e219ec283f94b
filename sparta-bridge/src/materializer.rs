//! Worker binary materialization.
//!
//! The deployment package is read-only, so the worker binary is copied to a
//! writable location and marked executable before the first spawn.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("failed to copy {} to {}: {error}", source_path.display(), target.display())]
    Copy {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to mark {} executable: {error}", target.display())]
    Permissions {
        target: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct BinaryMaterializer {
    source: PathBuf,
    target: PathBuf,
}

impl BinaryMaterializer {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Make sure the binary exists at the target path.
    ///
    /// An existing target is used as-is.
    pub async fn ensure(&self) -> Result<PathBuf, MaterializeError> {
        if tokio::fs::metadata(&self.target).await.is_ok() {
            tracing::trace!(target_path = %self.target.display(), "Worker binary already present");
            return Ok(self.target.clone());
        }

        tracing::info!(
            source_path = %self.source.display(),
            target_path = %self.target.display(),
            "Copying worker binary"
        );

        tokio::fs::copy(&self.source, &self.target)
            .await
            .map_err(|error| MaterializeError::Copy {
                source_path: self.source.clone(),
                target: self.target.clone(),
                error,
            })?;

        set_executable(&self.target)
            .await
            .map_err(|error| MaterializeError::Permissions {
                target: self.target.clone(),
                error,
            })?;

        Ok(self.target.clone())
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
