//! Scenario inputs: fixtures, installers and the packaged artifact check.

pub mod artifact;
pub mod fixture;
pub mod installer;

pub use artifact::{require_distributable, DEFAULT_DISTRIBUTABLE};
pub use fixture::{flatten, Fixture};
pub use installer::{Installer, NoInstall, PackageManager};
