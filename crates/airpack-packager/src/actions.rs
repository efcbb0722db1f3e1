//! Component lifecycle actions
//!
//! Each action is a shell command. Settings on the action override the
//! defaults of its action set; retries and the total time limit apply per
//! action.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use airpack_core::{Action, ActionDefaults};

use crate::error::{PackagerError, Result};

const DEFAULT_SHELL: &str = "sh";

/// Effective settings of one action
#[derive(Debug, Clone, PartialEq)]
struct ResolvedAction {
    cmd: String,
    description: Option<String>,
    mute: bool,
    max_total_seconds: Option<u64>,
    max_retries: u32,
    dir: Option<String>,
    env: Vec<String>,
    shell: String,
}

impl ResolvedAction {
    fn new(defaults: &ActionDefaults, action: &Action) -> Self {
        let mut env = defaults.env.clone();
        env.extend(action.env.iter().cloned());
        Self {
            cmd: action.cmd.clone(),
            description: action.description.clone(),
            mute: action.mute.unwrap_or(defaults.mute),
            max_total_seconds: action.max_total_seconds.or(defaults.max_total_seconds),
            max_retries: action.max_retries.or(defaults.max_retries).unwrap_or(0),
            dir: action.dir.clone().or_else(|| defaults.dir.clone()),
            env,
            shell: action
                .shell
                .clone()
                .or_else(|| defaults.shell.clone())
                .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
        }
    }

    fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.cmd)
    }
}

/// Runs action lists relative to a package directory
#[derive(Debug, Clone)]
pub struct ActionRunner {
    base: PathBuf,
}

impl ActionRunner {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Run actions in order, stopping at the first failure
    pub async fn run(&self, defaults: &ActionDefaults, actions: &[Action]) -> Result<()> {
        for action in actions {
            let resolved = ResolvedAction::new(defaults, action);
            self.run_one(&resolved).await?;
        }
        Ok(())
    }

    /// Run failure-path actions
    ///
    /// Their errors are logged and dropped so they never replace the error
    /// that triggered them.
    pub async fn run_best_effort(&self, defaults: &ActionDefaults, actions: &[Action]) {
        if let Err(e) = self.run(defaults, actions).await {
            tracing::warn!(error = %e, "failure action did not complete");
        }
    }

    async fn run_one(&self, action: &ResolvedAction) -> Result<()> {
        tracing::info!(action = %action.label(), "running action");

        let attempts = async {
            let mut last_error = None;
            for attempt in 0..=action.max_retries {
                if attempt > 0 {
                    tracing::warn!(
                        action = %action.label(),
                        attempt = attempt + 1,
                        "retrying action"
                    );
                }
                match self.execute(action).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = Some(e),
                }
            }
            Err(last_error.unwrap_or_else(|| PackagerError::ActionFailed {
                command: action.cmd.clone(),
                message: "action did not run".to_string(),
            }))
        };

        match action.max_total_seconds {
            Some(secs) if secs > 0 => tokio::time::timeout(Duration::from_secs(secs), attempts)
                .await
                .map_err(|_| PackagerError::ActionFailed {
                    command: action.cmd.clone(),
                    message: format!("timed out after {}s", secs),
                })?,
            _ => attempts.await,
        }
    }

    async fn execute(&self, action: &ResolvedAction) -> Result<()> {
        let mut command = Command::new(&action.shell);
        command
            .arg(shell_flag(&action.shell))
            .arg(&action.cmd)
            .current_dir(self.working_dir(action.dir.as_deref()))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for pair in &action.env {
            match pair.split_once('=') {
                Some((key, value)) => {
                    command.env(key, value);
                }
                None => tracing::debug!(env = %pair, "ignoring malformed env entry"),
            }
        }

        let output = command
            .output()
            .await
            .map_err(|e| PackagerError::ActionFailed {
                command: action.cmd.clone(),
                message: format!("failed to start {}: {}", action.shell, e),
            })?;

        if !action.mute {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                tracing::info!(target: "airpack::action", "{}", line);
            }
        }

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match output.status.code() {
            Some(code) => format!("exit status {}: {}", code, stderr.trim()),
            None => format!("terminated by signal: {}", stderr.trim()),
        };
        Err(PackagerError::ActionFailed {
            command: action.cmd.clone(),
            message,
        })
    }

    fn working_dir(&self, dir: Option<&str>) -> PathBuf {
        match dir {
            Some(d) if Path::new(d).is_absolute() => PathBuf::from(d),
            Some(d) => self.base.join(d),
            None => self.base.clone(),
        }
    }
}

fn shell_flag(shell: &str) -> &'static str {
    let name = Path::new(shell)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.starts_with("pwsh") || name.starts_with("powershell") {
        "-Command"
    } else {
        "-c"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn action(cmd: &str) -> Action {
        Action {
            cmd: cmd.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_action_overrides_defaults() {
        let defaults = ActionDefaults {
            mute: true,
            max_retries: Some(2),
            dir: Some("scripts".to_string()),
            env: vec!["A=1".to_string()],
            ..Default::default()
        };
        let mut a = action("true");
        a.mute = Some(false);
        a.env = vec!["B=2".to_string()];

        let resolved = ResolvedAction::new(&defaults, &a);
        assert!(!resolved.mute);
        assert_eq!(resolved.max_retries, 2);
        assert_eq!(resolved.dir.as_deref(), Some("scripts"));
        assert_eq!(resolved.env, vec!["A=1", "B=2"]);
        assert_eq!(resolved.shell, "sh");
    }

    #[tokio::test]
    async fn test_run_in_base_dir_with_env() {
        let dir = TempDir::new().unwrap();
        let runner = ActionRunner::new(dir.path());
        let mut a = action("echo \"$GREETING\" > out.txt");
        a.env = vec!["GREETING=hello".to_string()];

        runner.run(&ActionDefaults::default(), &[a]).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn test_failure_stops_sequence() {
        let dir = TempDir::new().unwrap();
        let runner = ActionRunner::new(dir.path());
        let err = runner
            .run(
                &ActionDefaults::default(),
                &[action("echo boom >&2; exit 3"), action("touch never")],
            )
            .await
            .unwrap_err();

        match err {
            PackagerError::ActionFailed { command, message } => {
                assert!(command.contains("exit 3"));
                assert!(message.contains("exit status 3"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dir = TempDir::new().unwrap();
        let runner = ActionRunner::new(dir.path());
        let mut a = action("echo x >> count; [ $(wc -l < count) -ge 2 ]");
        a.max_retries = Some(1);

        runner.run(&ActionDefaults::default(), &[a]).await.unwrap();
        let count = std::fs::read_to_string(dir.path().join("count")).unwrap();
        assert_eq!(count.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let runner = ActionRunner::new(dir.path());
        let mut a = action("sleep 5");
        a.max_total_seconds = Some(1);

        let err = runner
            .run(&ActionDefaults::default(), &[a])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let dir = TempDir::new().unwrap();
        ActionRunner::new(dir.path())
            .run_best_effort(&ActionDefaults::default(), &[action("exit 1")])
            .await;
    }

    #[test]
    fn test_shell_flag() {
        assert_eq!(shell_flag("sh"), "-c");
        assert_eq!(shell_flag("/usr/bin/pwsh"), "-Command");
    }
}
