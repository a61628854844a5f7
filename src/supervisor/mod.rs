//! Process supervisor
//!
//! Runs N sibling tuner instances (same binary, different configs) and
//! keeps them alive: restart on exit with capped exponential backoff,
//! termination signals forwarded on shutdown, SIGKILL after a grace
//! period. The contract with children is nothing more than argv, env,
//! signals, and exit codes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// Error types for the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to read supervisor config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse supervisor config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Supervisor config lists no instances")]
    NoInstances,
}

/// One supervised instance
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Set false to let an instance stay down after it exits
    #[serde(default = "default_true")]
    pub restart: bool,
}

/// Supervisor configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    pub instances: Vec<InstanceConfig>,
    #[serde(default = "default_backoff_max_secs")]
    pub restart_backoff_max_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_backoff_max_secs() -> u64 {
    60
}
fn default_grace_period_secs() -> u64 {
    10
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SupervisorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: SupervisorConfig = serde_json::from_str(&raw)?;
        if config.instances.is_empty() {
            return Err(SupervisorError::NoInstances);
        }
        Ok(config)
    }
}

/// Run the supervisor until a termination signal arrives
pub async fn run(config: SupervisorConfig) -> Result<(), SupervisorError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for instance in config.instances.clone() {
        let rx = shutdown_rx.clone();
        let backoff_max = Duration::from_secs(config.restart_backoff_max_secs);
        let grace = Duration::from_secs(config.grace_period_secs);
        tasks.push(tokio::spawn(async move {
            supervise_instance(instance, rx, backoff_max, grace).await;
        }));
    }

    wait_for_termination().await;
    tracing::info!("termination signal received, stopping children");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("all children stopped");
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Keep one instance alive, restarting with backoff
async fn supervise_instance(
    instance: InstanceConfig,
    mut shutdown: watch::Receiver<bool>,
    backoff_max: Duration,
    grace: Duration,
) {
    let mut attempt: u32 = 0;

    loop {
        let mut child = match spawn_instance(&instance) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(instance = %instance.name, error = %e, "failed to spawn");
                if !instance.restart {
                    return;
                }
                let delay = backoff_delay(attempt, backoff_max);
                attempt += 1;
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        tracing::info!(instance = %instance.name, pid = ?child.id(), "child started");

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => {
                        tracing::info!(instance = %instance.name, "child exited cleanly");
                        attempt = 0;
                    }
                    Ok(status) => {
                        tracing::warn!(instance = %instance.name, %status, "child crashed");
                    }
                    Err(e) => {
                        tracing::error!(instance = %instance.name, error = %e, "wait failed");
                    }
                }
                if !instance.restart {
                    return;
                }
                let delay = backoff_delay(attempt, backoff_max);
                attempt = attempt.saturating_add(1);
                tracing::info!(
                    instance = %instance.name,
                    delay_secs = delay.as_secs(),
                    "restarting after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            _ = shutdown.changed() => {
                terminate_child(&instance.name, &mut child, grace).await;
                return;
            }
        }
    }
}

fn spawn_instance(instance: &InstanceConfig) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.args(&instance.args);
    for (key, value) in &instance.env {
        command.env(key, value);
    }
    command.kill_on_drop(true);
    command.spawn()
}

/// Graceful stop: SIGTERM, wait out the grace period, then SIGKILL
async fn terminate_child(name: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // A thin supervisor forwards signals with the platform tool rather
        // than pulling in a signals crate for one syscall
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            tracing::info!(instance = name, "child terminated gracefully");
        }
        Err(_) => {
            tracing::warn!(instance = name, "grace period expired, killing");
            let _ = child.kill().await;
        }
    }
}

/// Exponential backoff capped at `max`: 1s, 2s, 4s, ...
fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let base = Duration::from_secs(1);
    let delay = base * 2u32.saturating_pow(attempt.min(16));
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, max), Duration::from_secs(32));
        assert_eq!(backoff_delay(6, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(30, max), Duration::from_secs(60));
    }

    #[test]
    fn test_config_parses_with_defaults() {
        let config: SupervisorConfig = serde_json::from_str(
            r#"{"instances":[{"name":"a","args":["serve","--config","a.json"]}]}"#,
        )
        .unwrap();
        assert_eq!(config.instances.len(), 1);
        assert!(config.instances[0].restart);
        assert_eq!(config.restart_backoff_max_secs, 60);
        assert_eq!(config.grace_period_secs, 10);
    }

    #[test]
    fn test_config_with_env_and_no_restart() {
        let config: SupervisorConfig = serde_json::from_str(
            r#"{
                "instances": [
                    {"name":"b","args":[],"env":{"TUNERFORGE_LISTEN_PORT":"5005"},"restart":false}
                ],
                "restart_backoff_max_secs": 120,
                "grace_period_secs": 5
            }"#,
        )
        .unwrap();
        assert!(!config.instances[0].restart);
        assert_eq!(
            config.instances[0].env.get("TUNERFORGE_LISTEN_PORT").unwrap(),
            "5005"
        );
        assert_eq!(config.restart_backoff_max_secs, 120);
    }

    #[test]
    fn test_empty_instances_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(&path, r#"{"instances":[]}"#).unwrap();
        assert!(matches!(
            SupervisorConfig::load(&path),
            Err(SupervisorError::NoInstances)
        ));
    }
}
