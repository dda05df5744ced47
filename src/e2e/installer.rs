//! Dependency installers run by `Sandbox::load`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::Sandbox;

/// Populates a freshly loaded sandbox with its dependencies.
///
/// Implementations drive the sandbox through [`Sandbox::exec`]; whatever they
/// leave on disk becomes part of the baseline that `reset` preserves.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Installs dependencies into the sandbox.
    async fn install(&self, sandbox: &Sandbox) -> Result<()>;
}

/// Installer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInstall;

#[async_trait]
impl Installer for NoInstall {
    async fn install(&self, _sandbox: &Sandbox) -> Result<()> {
        Ok(())
    }
}

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Returns the executable name.
    pub fn name(&self) -> &'static str {
        match self {
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }

    /// Returns the install command line.
    pub fn install_command(&self) -> &'static str {
        match self {
            PackageManager::Yarn => "yarn install",
            PackageManager::Pnpm => "pnpm install",
        }
    }

    /// Environment variable pointing the manager at its package cache.
    pub fn cache_env_var(&self) -> &'static str {
        match self {
            PackageManager::Yarn => "YARN_CACHE_FOLDER",
            PackageManager::Pnpm => "npm_config_store_dir",
        }
    }

    /// Cache directory shared by every sandbox in this process, so repeated
    /// installs hit the network once.
    pub fn shared_cache_dir(&self) -> PathBuf {
        std::env::temp_dir()
            .join("scenario-sandbox-cache")
            .join(self.name())
    }

    fn install_env(&self) -> HashMap<String, String> {
        HashMap::from([(
            self.cache_env_var().to_string(),
            self.shared_cache_dir().to_string_lossy().into_owned(),
        )])
    }
}

impl FromStr for PackageManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yarn" => Ok(PackageManager::Yarn),
            "pnpm" => Ok(PackageManager::Pnpm),
            other => Err(Error::Config(format!(
                "unknown package manager '{}', expected yarn or pnpm",
                other
            ))),
        }
    }
}

#[async_trait]
impl Installer for PackageManager {
    async fn install(&self, sandbox: &Sandbox) -> Result<()> {
        let command = self.install_command();
        let env = &self.install_env();

        tracing::info!(sandbox = %sandbox.id(), command, "installing dependencies");

        sandbox
            .retry_policy()
            .run(command, move || sandbox.exec_with_env(command, env))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn package_manager_parses_from_name() {
        assert_eq!("yarn".parse::<PackageManager>().unwrap(), PackageManager::Yarn);
        assert_eq!("pnpm".parse::<PackageManager>().unwrap(), PackageManager::Pnpm);
        assert!("npm".parse::<PackageManager>().is_err());
    }

    #[test]
    fn package_manager_serializes_to_lowercase() {
        assert_eq!(serde_json::to_string(&PackageManager::Yarn).unwrap(), "\"yarn\"");
        assert_eq!(serde_json::to_string(&PackageManager::Pnpm).unwrap(), "\"pnpm\"");
    }

    #[test]
    fn each_manager_has_its_own_cache() {
        let yarn = PackageManager::Yarn.install_env();
        let pnpm = PackageManager::Pnpm.install_env();

        assert!(yarn["YARN_CACHE_FOLDER"].ends_with("yarn"));
        assert!(pnpm["npm_config_store_dir"].ends_with("pnpm"));
        assert_ne!(
            PackageManager::Yarn.shared_cache_dir(),
            PackageManager::Pnpm.shared_cache_dir()
        );
    }

    #[tokio::test]
    async fn no_install_leaves_sandbox_untouched() {
        let config = SandboxConfig::default()
            .with_retry(RetryPolicy::new(1, Duration::ZERO))
            .with_stream_output(false);
        let sandbox = Sandbox::with_config(config).unwrap();

        NoInstall.install(&sandbox).await.unwrap();

        let entries = std::fs::read_dir(sandbox.path()).unwrap().count();
        assert_eq!(entries, 0);
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires yarn and network access
    async fn yarn_installs_minimal_project() {
        let config = SandboxConfig::default().with_stream_output(false);
        let sandbox = Sandbox::with_config(config).unwrap();
        std::fs::write(
            sandbox.path().join("package.json"),
            r#"{"name":"demo","version":"1.0.0","private":true}"#,
        )
        .unwrap();

        PackageManager::Yarn.install(&sandbox).await.unwrap();

        assert!(sandbox.exists("yarn.lock").await.unwrap());
        sandbox.cleanup().await.unwrap();
    }
}
