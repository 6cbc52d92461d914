//! Sandbox command runner
//!
//! Executes one shell command at a time inside the named sandbox container.
//! The Docker handle is process-wide and initialized exactly once behind a
//! double-checked cell to avoid concurrent handshake races; per-exec state
//! is local. Failures to reach the sandbox are returned as `Error:` sentinel
//! strings, never as errors, and callers treat them as leaf output.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::limits::{limits, metrics};

/// Result of one sandbox command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Combined stdout+stderr, possibly with synthetic system banners
    pub output: String,
    /// A missing tool was auto-installed during this command
    pub tool_installed: bool,
}

impl ExecOutcome {
    pub fn plain(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tool_installed: false,
        }
    }
}

/// Seam for command execution: the executor loop drives this trait so tests
/// can substitute a scripted shell.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute one shell command and return its combined output
    async fn run(&self, cmd: &str) -> ExecOutcome;
}

/// Runs commands in the shared sandbox container via the Docker API
pub struct ContainerRunner {
    container_name: String,
    install_command: String,
    install_log: PathBuf,
    docker: OnceCell<Docker>,
}

impl ContainerRunner {
    pub fn new(container_name: impl Into<String>, install_command: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            container_name: container_name.into(),
            install_command: install_command.into(),
            install_log: log_dir.into().join("install.log"),
            docker: OnceCell::new(),
        }
    }

    /// Shared Docker handle, initialized on first use
    async fn docker(&self) -> Result<&Docker, String> {
        self.docker
            .get_or_try_init(|| async {
                Docker::connect_with_local_defaults().map_err(|e| format!("Failed to connect to container runtime: {e}"))
            })
            .await
    }

    /// One exec round-trip: create, start, stream output under the
    /// wall-clock budget, then fetch the exit code.
    async fn exec_with_exit(&self, cmd: &str) -> Result<(String, Option<i64>), String> {
        let docker = self.docker().await?;
        let l = limits();
        let budget = l.docker_exec_timeout();

        // The Docker API cannot stop a running exec, so the kill flag wraps
        // the command in coreutils timeout instead.
        let shell_cmd = if l.docker_kill_on_timeout {
            vec![
                "timeout".to_string(),
                format!("{}s", budget.as_secs()),
                "/bin/bash".to_string(),
                "-c".to_string(),
                cmd.to_string(),
            ]
        } else {
            vec!["/bin/bash".to_string(), "-c".to_string(), cmd.to_string()]
        };

        let exec = docker
            .create_exec(
                &self.container_name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(shell_cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| format!("Container '{}' unavailable: {e}", self.container_name))?;

        let started = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| format!("Failed to start command: {e}"))?;

        let start = Instant::now();
        let mut collected = String::new();
        let mut timed_out = false;
        let mut slow_logged = false;

        if let StartExecResults::Attached { mut output, .. } = started {
            loop {
                let Some(remaining) = budget.checked_sub(start.elapsed()) else {
                    timed_out = true;
                    break;
                };

                match tokio::time::timeout(remaining, output.next()).await {
                    Ok(Some(Ok(log))) => {
                        let bytes = match log {
                            LogOutput::StdOut { message }
                            | LogOutput::StdErr { message }
                            | LogOutput::StdIn { message }
                            | LogOutput::Console { message } => message,
                        };
                        collected.push_str(&String::from_utf8_lossy(&bytes));

                        if l.log_slow_commands && !slow_logged && start.elapsed() > budget / 2 {
                            metrics().increment("docker_slow_commands");
                            warn!(
                                cmd = %cmd.chars().take(100).collect::<String>(),
                                elapsed_secs = start.elapsed().as_secs(),
                                "slow command"
                            );
                            slow_logged = true;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        collected.push_str(&format!("\n[stream error: {e}]\n"));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        if timed_out {
            metrics().increment("docker_timeouts");
            collected.push_str(&format!(
                "\n[TIMEOUT] Command exceeded {}s limit and was interrupted.\n",
                budget.as_secs()
            ));
            // The exec may still be running server-side; don't block on it.
            return Ok((collected, None));
        }

        let exit_code = docker.inspect_exec(&exec.id).await.ok().and_then(|i| i.exit_code);
        Ok((collected, exit_code))
    }

    /// Install a missing tool once, then re-run the original command
    async fn install_and_rerun(&self, tool: &str, cmd: &str, original_output: String) -> ExecOutcome {
        info!(tool, "auto-installing missing tool");
        let install_cmd = format!("{} {}", self.install_command, tool);

        match self.exec_with_exit(&install_cmd).await {
            Ok((_, Some(0))) => {
                self.log_install(tool);
                let rerun = self.exec_with_exit(cmd).await.map(|(out, _)| out).unwrap_or_default();
                ExecOutcome {
                    output: format!(
                        "[System] Tool '{tool}' was not found. Automatically installed it.\n\n{rerun}"
                    ),
                    tool_installed: true,
                }
            }
            Ok((_, _)) => ExecOutcome::plain(format!(
                "[System] Tool '{tool}' was not found and could not be installed automatically.\n\n{original_output}"
            )),
            Err(e) => ExecOutcome::plain(format!(
                "[System] Tool '{tool}' was not found. Installation failed: {e}\n\n{original_output}"
            )),
        }
    }

    fn log_install(&self, tool: &str) {
        if let Some(parent) = self.install_log.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = format!("[{}] Installed: {tool}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(e) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.install_log)
            .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()))
        {
            debug!(error = %e, "failed to write install log");
        }
    }

    /// Connection self-test: inspect the sandbox container
    pub async fn probe(&self) -> Result<String, String> {
        let docker = self.docker().await?;
        let inspection = docker
            .inspect_container(
                &self.container_name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(|e| format!("Container '{}' not found: {e}", self.container_name))?;

        let status = inspection
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let image = inspection.image.unwrap_or_else(|| "unknown".to_string());

        Ok(format!(
            "container '{}': status={status}, image={image}",
            self.container_name
        ))
    }
}

#[async_trait]
impl CommandRunner for ContainerRunner {
    async fn run(&self, cmd: &str) -> ExecOutcome {
        debug!(cmd = %cmd.chars().take(200).collect::<String>(), "run: executing in sandbox");

        let output = match self.exec_with_exit(cmd).await {
            Ok((output, _)) => output,
            Err(e) => return ExecOutcome::plain(format!("Error: {e}")),
        };

        if output.contains("command not found")
            && let Some(tool) = missing_tool(&output)
        {
            return self.install_and_rerun(&tool, cmd, output).await;
        }

        ExecOutcome::plain(output)
    }
}

/// Extract the first missing tool name from a `command not found` line
fn missing_tool(output: &str) -> Option<String> {
    let re = Regex::new(r"(?m)bash:\s*(?:line\s*\d+:\s*)?([A-Za-z0-9_.+-]+):\s*command not found").ok()?;
    re.captures(output).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_plain() {
        let output = "bash: subfinder: command not found";
        assert_eq!(missing_tool(output).as_deref(), Some("subfinder"));
    }

    #[test]
    fn test_missing_tool_with_line_prefix() {
        let output = "bash: line 1: nikto: command not found";
        assert_eq!(missing_tool(output).as_deref(), Some("nikto"));
    }

    #[test]
    fn test_missing_tool_takes_first_of_many() {
        let output = "bash: gobuster: command not found\nbash: dirb: command not found";
        assert_eq!(missing_tool(output).as_deref(), Some("gobuster"));
    }

    #[test]
    fn test_missing_tool_none_on_clean_output() {
        assert_eq!(missing_tool("PING 8.8.8.8: 3 packets transmitted"), None);
    }

    #[test]
    fn test_exec_outcome_plain() {
        let outcome = ExecOutcome::plain("ok");
        assert_eq!(outcome.output, "ok");
        assert!(!outcome.tool_installed);
    }
}
