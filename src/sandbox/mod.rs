//! Disposable sandbox directories for end-to-end scenarios.
//!
//! A [`Sandbox`] owns one temporary directory, remembers which files it
//! created there and which processes it started from it, and can revert
//! ([`Sandbox::reset`]) or destroy ([`Sandbox::cleanup`]) both.

mod files;
mod process;

pub use files::normalize_line_endings;
pub use process::{KillOutcome, ProcessHandle, KILL_GRACE_PERIOD};

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::process::Command;
use tokio::task::JoinSet;

use crate::config::SandboxConfig;
use crate::e2e::fixture::{self, Fixture};
use crate::e2e::installer::{Installer, NoInstall};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// An isolated working directory plus the files and processes created in it.
///
/// Calls are expected to be awaited one at a time. Dropping a sandbox that was
/// never cleaned up kills its processes and removes its directory on a best
/// effort basis.
pub struct Sandbox {
    /// Short random id, used in the directory name and in logs.
    id: String,
    /// Absolute path of the sandbox directory.
    context: PathBuf,
    config: SandboxConfig,
    /// Relative paths first created since the last load or reset, in order.
    created_files: Vec<PathBuf>,
    /// Processes started from `context` that may still be running.
    processes: Mutex<HashMap<u64, ProcessHandle>>,
    next_process_id: AtomicU64,
    cleaned_up: bool,
}

impl Sandbox {
    /// Creates a sandbox with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(SandboxConfig::default())
    }

    /// Creates a sandbox in a fresh, uniquely named temporary directory.
    pub fn with_config(config: SandboxConfig) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let prefix = format!("scenario-sandbox-{}-", id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &config.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| Error::SandboxCreation(e.to_string()))?;
        let context = dir.keep();

        tracing::info!(sandbox = %id, path = ?context, "created sandbox");

        Ok(Self {
            id,
            context,
            config,
            created_files: Vec::new(),
            processes: Mutex::new(HashMap::new()),
            next_process_id: AtomicU64::new(0),
            cleaned_up: false,
        })
    }

    /// Returns the sandbox id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the sandbox directory.
    pub fn path(&self) -> &Path {
        &self.context
    }

    /// Returns the configuration the sandbox was created with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Returns the retry policy used for filesystem and signal operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    /// Files that `reset` would delete, in creation order.
    pub fn created_files(&self) -> &[PathBuf] {
        &self.created_files
    }

    /// Writes fixtures and runs the configured installer.
    pub async fn load(&mut self, fixtures: &[Fixture]) -> Result<()> {
        match self.config.installer {
            Some(manager) => self.load_with(fixtures, &manager).await,
            None => self.load_with(fixtures, &NoInstall).await,
        }
    }

    /// Writes fixtures in order, then runs `installer`.
    ///
    /// Everything on disk afterwards, fixture files and installer output
    /// alike, is the baseline that `reset` returns to. A failure leaves the
    /// sandbox as it is; call `cleanup` to discard it.
    pub async fn load_with(&mut self, fixtures: &[Fixture], installer: &dyn Installer) -> Result<()> {
        let files = fixture::flatten(fixtures);
        tracing::info!(
            sandbox = %self.id,
            fixtures = ?fixtures.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            files = files.len(),
            "loading fixtures"
        );

        for (path, content) in files {
            self.write(path, content).await?;
        }
        tokio::time::sleep(self.config.settle_delay).await;

        installer.install(self).await?;
        self.created_files.clear();
        Ok(())
    }

    /// Kills running processes and deletes files created since the last
    /// load or reset. The sandbox directory stays.
    ///
    /// Paths that could not be deleted stay tracked and the first error is
    /// returned.
    pub async fn reset(&mut self) -> Result<()> {
        self.kill_all().await;

        let paths = std::mem::take(&mut self.created_files);
        tracing::info!(sandbox = %self.id, files = paths.len(), "resetting sandbox");

        let mut removals = JoinSet::new();
        for path in paths {
            let absolute = self.context.join(&path);
            let retry = self.config.retry;
            let settle = self.config.settle_delay;
            removals.spawn(async move {
                let result = files::remove_path(&absolute, retry, settle).await;
                (path, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = removals.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((path, Err(e))) => {
                    tracing::warn!(path = ?path, error = %e, "failed to remove created file");
                    self.created_files.push(path);
                    first_error.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "file removal task failed"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Kills running processes and deletes the sandbox directory.
    pub async fn cleanup(mut self) -> Result<()> {
        self.kill_all().await;

        let context = self.context.clone();
        let target = context.as_path();
        self.config
            .retry
            .run("remove sandbox", move || async move {
                match tokio::fs::remove_dir_all(target).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            })
            .await
            .map_err(|e| Error::io(&context, e))?;

        self.cleaned_up = true;
        tracing::info!(sandbox = %self.id, "cleaned up sandbox");
        Ok(())
    }

    /// Runs `command` through `sh -c` in the sandbox directory.
    ///
    /// Returns stdout followed by stderr. A non-zero exit is
    /// [`Error::CommandFailed`] carrying the same output.
    pub async fn exec(&self, command: &str) -> Result<String> {
        self.exec_with_env(command, &HashMap::new()).await
    }

    /// Like [`exec`](Self::exec), with extra environment variables that
    /// override inherited ones.
    pub async fn exec_with_env(&self, command: &str, env: &HashMap<String, String>) -> Result<String> {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command);

        let handle = self.start(shell, command, env)?;
        let status = handle.wait().await;
        self.untrack(&handle);

        let status = status?;
        let output = handle.output();
        if status.success() {
            Ok(output)
        } else {
            Err(Error::CommandFailed {
                command: command.to_string(),
                code: status.code(),
                output,
            })
        }
    }

    /// Starts `command` without waiting for it.
    ///
    /// The command is split on whitespace; quoted arguments are not
    /// supported. Use [`exec`](Self::exec) when a shell is needed.
    pub fn spawn(&self, command: &str) -> Result<ProcessHandle> {
        self.spawn_with_env(command, &HashMap::new())
    }

    /// Like [`spawn`](Self::spawn), with extra environment variables.
    pub fn spawn_with_env(&self, command: &str, env: &HashMap<String, String>) -> Result<ProcessHandle> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("cannot spawn an empty command".to_string()))?;

        let mut child = Command::new(program);
        child.args(parts);
        self.start(child, command, env)
    }

    /// Terminates the handle's whole process tree and stops tracking it.
    ///
    /// Never fails: signalling errors are logged and reported through
    /// [`KillOutcome::Failed`].
    pub async fn kill(&self, handle: &ProcessHandle) -> KillOutcome {
        let outcome = process::terminate_tree(handle, self.config.retry).await;
        self.untrack(handle);
        tracing::debug!(sandbox = %self.id, id = handle.id(), outcome = ?outcome, "killed process");
        outcome
    }

    /// Tracked processes that are still running. Exited ones are dropped
    /// from tracking.
    pub fn running_processes(&self) -> Vec<ProcessHandle> {
        let mut processes = self.processes();
        processes.retain(|_, handle| handle.is_running());
        processes.values().cloned().collect()
    }

    async fn kill_all(&self) {
        let handles: Vec<ProcessHandle> = self.processes().values().cloned().collect();
        for handle in handles {
            self.kill(&handle).await;
        }
    }

    fn start(&self, mut command: Command, label: &str, env: &HashMap<String, String>) -> Result<ProcessHandle> {
        command.current_dir(&self.context).envs(env);

        let id = self.next_process_id.fetch_add(1, Ordering::Relaxed);
        let handle = process::start(command, label, id, self.config.stream_output)?;
        tracing::debug!(sandbox = %self.id, id, pid = ?handle.pid(), command = %label, "started process");

        self.processes().insert(id, handle.clone());
        Ok(handle)
    }

    fn untrack(&self, handle: &ProcessHandle) {
        self.processes().remove(&handle.id());
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<u64, ProcessHandle>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a sandbox-relative path, rejecting anything that could
    /// escape the sandbox directory.
    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || path.as_os_str().is_empty() {
            return Err(Error::InvalidPath(path.to_path_buf()));
        }
        Ok(self.context.join(path))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }

        let processes = self.processes.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in processes.values() {
            process::kill_group_now(handle);
        }

        match std::fs::remove_dir_all(&self.context) {
            Ok(()) => tracing::debug!(sandbox = %self.id, "removed sandbox on drop"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(error = %e, path = ?self.context, "failed to cleanup sandbox on drop")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> SandboxConfig {
        SandboxConfig::default()
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10)))
            .with_settle_delay(Duration::from_millis(5))
            .with_stream_output(false)
            .with_installer(None)
    }

    #[tokio::test]
    async fn sandboxes_get_distinct_directories() {
        let a = Sandbox::with_config(fast_config()).unwrap();
        let b = Sandbox::with_config(fast_config()).unwrap();

        assert_ne!(a.path(), b.path());
        assert_ne!(a.id(), b.id());
        assert!(a.path().is_dir());
        assert!(a.path().is_absolute());

        a.cleanup().await.unwrap();
        b.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn creation_in_missing_root_fails() {
        let config = fast_config().with_temp_root("/definitely/not/here");
        let err = Sandbox::with_config(config).err().unwrap();
        assert!(matches!(err, Error::SandboxCreation(_)));
    }

    #[tokio::test]
    async fn cleanup_removes_directory() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();
        let path = sandbox.path().to_path_buf();

        sandbox.cleanup().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_without_cleanup_removes_directory() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();
        let path = sandbox.path().to_path_buf();

        drop(sandbox);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn reset_twice_is_noop() {
        let mut sandbox = Sandbox::with_config(fast_config()).unwrap();
        sandbox.write("a.txt", "a").await.unwrap();

        sandbox.reset().await.unwrap();
        sandbox.reset().await.unwrap();

        assert!(sandbox.created_files().is_empty());
        assert!(sandbox.running_processes().is_empty());
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn resolve_rejects_escaping_paths() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();

        assert!(sandbox.resolve(Path::new("src/index.js")).is_ok());
        assert!(sandbox.resolve(Path::new("./src/index.js")).is_ok());
        assert!(sandbox.resolve(Path::new("../outside.txt")).is_err());
        assert!(sandbox.resolve(Path::new("/etc/passwd")).is_err());
        assert!(sandbox.resolve(Path::new("")).is_err());

        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn exec_success_and_failure_carry_combined_output() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();

        assert_eq!(sandbox.exec("exit 0").await.unwrap(), "");
        assert_eq!(
            sandbox.exec("printf out; printf err >&2").await.unwrap(),
            "outerr"
        );

        let err = sandbox
            .exec("printf out; printf err >&2; exit 1")
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { code, output, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(output, "outerr");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(sandbox.running_processes().is_empty());
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn exec_runs_in_sandbox_with_env_overrides() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();

        let cwd = sandbox.exec("pwd -P").await.unwrap();
        let expected = sandbox.path().canonicalize().unwrap();
        assert_eq!(cwd.trim(), expected.to_string_lossy());

        let env = HashMap::from([("HOME".to_string(), "/sandbox-home".to_string())]);
        let home = sandbox.exec_with_env("printf %s \"$HOME\"", &env).await.unwrap();
        assert_eq!(home, "/sandbox-home");

        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_returns_immediately_and_is_tracked() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();

        let handle = sandbox.spawn("sleep 30").unwrap();
        assert!(handle.is_running());
        assert_eq!(sandbox.running_processes().len(), 1);

        assert_eq!(sandbox.kill(&handle).await, KillOutcome::Terminated);
        assert!(sandbox.running_processes().is_empty());
        assert_eq!(sandbox.kill(&handle).await, KillOutcome::AlreadyExited);

        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_rejects_empty_command() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();
        assert!(matches!(sandbox.spawn("   "), Err(Error::Config(_))));
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn exited_spawns_are_pruned() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();

        let handle = sandbox.spawn("true").unwrap();
        handle.wait().await.unwrap();

        assert!(sandbox.running_processes().is_empty());
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn reset_kills_running_processes() {
        let mut sandbox = Sandbox::with_config(fast_config()).unwrap();
        let handle = sandbox.spawn("sleep 30").unwrap();

        sandbox.reset().await.unwrap();

        assert!(!handle.is_running());
        assert!(sandbox.running_processes().is_empty());
        assert!(sandbox.path().is_dir());
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_kills_running_processes() {
        let sandbox = Sandbox::with_config(fast_config()).unwrap();
        let handle = sandbox.spawn("sleep 30").unwrap();

        sandbox.cleanup().await.unwrap();
        assert!(!handle.is_running());
    }
}
