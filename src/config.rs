//! Sandbox configuration.
//!
//! Defaults suit real filesystems; tests and the CLI override them through
//! the builder methods or `SANDBOX_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::e2e::PackageManager;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Pause that lets filesystem change notifications propagate before and
/// after sandbox writes, so watchers in the build tool under test observe
/// them in order.
pub const FILESYSTEM_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Environment variable names read by [`SandboxConfig::from_env`].
pub const ENV_RETRY_ATTEMPTS: &str = "SANDBOX_RETRY_ATTEMPTS";
pub const ENV_RETRY_DELAY_MS: &str = "SANDBOX_RETRY_DELAY_MS";
pub const ENV_SETTLE_DELAY_MS: &str = "SANDBOX_SETTLE_DELAY_MS";
pub const ENV_TMPDIR: &str = "SANDBOX_TMPDIR";
pub const ENV_QUIET: &str = "SANDBOX_QUIET";
pub const ENV_INSTALLER: &str = "SANDBOX_INSTALLER";

/// Configuration for a [`Sandbox`](crate::Sandbox).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Retry policy for filesystem and signal operations.
    pub retry: RetryPolicy,
    /// Settle delay around writes and removals.
    pub settle_delay: Duration,
    /// Directory in which sandbox directories are created. System temp dir if None.
    pub temp_root: Option<PathBuf>,
    /// Whether process output is echoed to the terminal.
    pub stream_output: bool,
    /// Installer used by `load`. None installs nothing.
    pub installer: Option<PackageManager>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            settle_delay: FILESYSTEM_SETTLE_DELAY,
            temp_root: None,
            stream_output: true,
            installer: Some(PackageManager::default()),
        }
    }
}

impl SandboxConfig {
    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the directory sandboxes are created in.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// Enables or disables echoing process output.
    pub fn with_stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }

    /// Sets the installer used by `load`.
    pub fn with_installer(mut self, installer: Option<PackageManager>) -> Self {
        self.installer = installer;
        self
    }

    /// Builds a configuration from `SANDBOX_*` environment variables,
    /// falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_RETRY_ATTEMPTS) {
            config.retry.attempts = parse_number(ENV_RETRY_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_DELAY_MS) {
            config.retry.delay = Duration::from_millis(parse_number(ENV_RETRY_DELAY_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_SETTLE_DELAY_MS) {
            config.settle_delay =
                Duration::from_millis(parse_number(ENV_SETTLE_DELAY_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_TMPDIR) {
            config.temp_root = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_QUIET) {
            config.stream_output = !matches!(value.to_lowercase().as_str(), "1" | "true");
        }
        if let Some(value) = lookup(ENV_INSTALLER) {
            config.installer = match value.to_lowercase().as_str() {
                "none" => None,
                other => Some(other.parse()?),
            };
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

/// Problems found in a [`SandboxConfig`].
///
/// `errors` make the configuration unusable; `warnings` are reported and
/// otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the warnings, or a [`Error::Config`] joining every error.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Checks a configuration before a sandbox is built from it.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.retry.attempts == 0 {
            result.errors.push("retry attempts must be at least 1".to_string());
        }

        if let Some(root) = &self.temp_root {
            if !root.is_dir() {
                result
                    .errors
                    .push(format!("temp root {} is not a directory", root.display()));
            }
        }

        if self.settle_delay.is_zero() {
            result.warnings.push(
                "zero settle delay may let file watchers observe writes out of order".to_string(),
            );
        }

        if self.retry.delay > Duration::from_secs(10) {
            result
                .warnings
                .push("retry delay over 10 seconds slows every failing operation".to_string());
        }

        result
    }
}
