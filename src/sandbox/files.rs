//! File primitives. All paths are relative to the sandbox directory.

use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use super::Sandbox;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Converts CRLF line endings to LF.
pub fn normalize_line_endings(content: &str) -> Cow<'_, str> {
    if content.contains("\r\n") {
        Cow::Owned(content.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(content)
    }
}

impl Sandbox {
    /// Writes `content` with normalized line endings, creating parent
    /// directories as needed.
    ///
    /// The path is recorded for `reset` only if it did not exist before.
    pub async fn write(&mut self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        let relative = path.as_ref();
        let absolute = self.resolve(relative)?;
        let existed = tokio::fs::try_exists(&absolute)
            .await
            .map_err(|e| Error::io(relative, e))?;

        if let Some(parent) = absolute.parent() {
            self.config
                .retry
                .run("create parent directories", move || tokio::fs::create_dir_all(parent))
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        tokio::time::sleep(self.config.settle_delay).await;

        let normalized = normalize_line_endings(content);
        let target = absolute.as_path();
        let bytes = normalized.as_bytes();
        self.config
            .retry
            .run("write file", move || tokio::fs::write(target, bytes))
            .await
            .map_err(|e| Error::io(relative, e))?;

        if !existed && !self.created_files.iter().any(|p| p == relative) {
            self.created_files.push(relative.to_path_buf());
        }
        tracing::debug!(sandbox = %self.id, path = ?relative, created = !existed, "wrote file");
        Ok(())
    }

    /// Reads a file with normalized line endings.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<String> {
        let relative = path.as_ref();
        let absolute = self.resolve(relative)?;

        let content = tokio::fs::read_to_string(&absolute)
            .await
            .map_err(|e| Error::io(relative, e))?;
        Ok(normalize_line_endings(&content).into_owned())
    }

    /// Returns true if the path exists. Errors other than "not found", such
    /// as a file standing in for a parent directory, are returned.
    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        let relative = path.as_ref();
        let absolute = self.resolve(relative)?;

        tokio::fs::try_exists(&absolute)
            .await
            .map_err(|e| Error::io(relative, e))
    }

    /// Deletes a file or directory tree. Missing paths are not an error.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let relative = path.as_ref();
        let absolute = self.resolve(relative)?;

        remove_path(&absolute, self.config.retry, self.config.settle_delay).await?;
        tracing::debug!(sandbox = %self.id, path = ?relative, "removed path");
        Ok(())
    }

    /// Replaces the first occurrence of `search` with `replacement`.
    ///
    /// Fails with [`Error::PatternNotFound`] and leaves the file untouched if
    /// `search` does not occur.
    pub async fn patch(&mut self, path: impl AsRef<Path>, search: &str, replacement: &str) -> Result<()> {
        let relative = path.as_ref();
        let content = self.read(relative).await?;

        if !content.contains(search) {
            return Err(Error::PatternNotFound {
                path: relative.to_path_buf(),
                search: search.to_string(),
                content,
            });
        }

        let patched = content.replacen(search, replacement, 1);
        self.write(relative, &patched).await
    }
}

/// Removes a file or directory tree after the settle delay, with retries.
pub(super) async fn remove_path(path: &Path, retry: RetryPolicy, settle: Duration) -> Result<()> {
    tokio::time::sleep(settle).await;

    retry
        .run("remove path", move || async move {
            let removed = match tokio::fs::symlink_metadata(path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
                Ok(_) => tokio::fs::remove_file(path).await,
                Err(e) => Err(e),
            };
            match removed {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await
        .map_err(|e| Error::io(path, e))
}
