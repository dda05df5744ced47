//! Scenario Sandbox - disposable project directories for end-to-end tests
//!
//! This library creates isolated temporary directories, writes project
//! fixtures into them, runs commands and long-lived processes there, and
//! reverts or destroys everything it created. Filesystem and signal
//! operations go through a bounded [`RetryPolicy`].
//!
//! The crate targets Unix: process trees are managed through process groups.

pub mod config;
pub mod e2e;
pub mod error;
pub mod retry;
pub mod sandbox;

pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use sandbox::{normalize_line_endings, KillOutcome, ProcessHandle, Sandbox, KILL_GRACE_PERIOD};

pub use config::{SandboxConfig, Validate, ValidationResult, FILESYSTEM_SETTLE_DELAY};
pub use e2e::{
    flatten, require_distributable, Fixture, Installer, NoInstall, PackageManager,
    DEFAULT_DISTRIBUTABLE,
};
