//! Startup check for the packaged build of the project under test.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default location of the distributable, relative to the codebase root.
pub const DEFAULT_DISTRIBUTABLE: &str = "dist/package.tgz";

/// Returns the absolute path of the distributable package.
///
/// Scenarios install the project from this artifact, so a missing one is
/// fatal before any sandbox is created.
pub fn require_distributable(root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf> {
    let path = root.join(relative);

    if path.is_file() {
        tracing::debug!(path = ?path, "found distributable package");
        Ok(path)
    } else {
        Err(Error::MissingDistributable { path })
    }
}
