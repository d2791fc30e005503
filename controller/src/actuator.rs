use std::{process::Stdio, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{process::Command, sync::Mutex, task::JoinSet};
use tracing::{debug, info, warn};

use lampctl_common::{ActuatorError, CommandPurpose, Gpio};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ActuatorDiagnostics {
    pub attempted: u64,
    pub failed: u64,
    #[serde(rename = "timedOut")]
    pub timed_out: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

impl ActuatorDiagnostics {
    pub fn record(&mut self, what: &str, result: &Result<(), ActuatorError>) {
        self.attempted += 1;
        if let Err(err) = result {
            self.failed += 1;
            if matches!(err, ActuatorError::Timeout { .. }) {
                self.timed_out += 1;
            }
            self.last_error = Some(format!("{what}: {err}"));
        }
    }
}

/// Runs external commands and relay pulses off the control loop.
///
/// Every task is tracked so shutdown can wait for in-flight work and abandon
/// whatever is still running after the grace period.
pub struct CommandRunner {
    timeout: Duration,
    tasks: Mutex<JoinSet<()>>,
    diagnostics: Arc<Mutex<ActuatorDiagnostics>>,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tasks: Mutex::new(JoinSet::new()),
            diagnostics: Arc::new(Mutex::new(ActuatorDiagnostics::default())),
        }
    }

    pub async fn diagnostics(&self) -> ActuatorDiagnostics {
        self.diagnostics.lock().await.clone()
    }

    pub async fn record(&self, what: &str, result: &Result<(), ActuatorError>) {
        self.diagnostics.lock().await.record(what, result);
    }

    pub async fn run(&self, command: String, purpose: CommandPurpose) {
        let timeout = self.timeout;
        let diagnostics = self.diagnostics.clone();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            debug!("running {} command `{command}`", purpose.as_str());
            let result = run_command(&command, timeout).await;
            if let Err(err) = &result {
                warn!("{} command failed: {err}", purpose.as_str());
            }
            diagnostics.lock().await.record(purpose.as_str(), &result);
        });
    }

    /// Pulls `pin` low for `low_ms`, then back high.
    pub async fn pulse(&self, gpio: Arc<dyn Gpio>, pin: u8, low_ms: u64) {
        let diagnostics = self.diagnostics.clone();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let mut result = gpio.write_output(pin, false).map_err(ActuatorError::from);
            if result.is_ok() {
                tokio::time::sleep(Duration::from_millis(low_ms)).await;
                result = gpio.write_output(pin, true).map_err(ActuatorError::from);
            }
            if let Err(err) = &result {
                warn!("relay pulse on pin {pin} failed: {err}");
            }
            diagnostics.lock().await.record("pulse", &result);
        });
    }

    /// Waits up to `grace` for in-flight tasks, then aborts the rest.
    /// Returns the number of abandoned tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return 0;
        }

        info!("waiting for {} pending actuator task(s)", tasks.len());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            return 0;
        }
        let abandoned = tasks.len();
        warn!("abandoning {abandoned} actuator task(s) still running after {grace:?}");
        tasks.abort_all();
        abandoned
    }
}

pub async fn run_command(command: &str, timeout: Duration) -> Result<(), ActuatorError> {
    if command.trim().is_empty() {
        return Err(ActuatorError::EmptyCommand);
    }

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ActuatorError::Spawn {
            command: command.to_string(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(ActuatorError::ExitStatus {
            command: command.to_string(),
            status: status.to_string(),
        }),
        Ok(Err(source)) => Err(ActuatorError::Spawn {
            command: command.to_string(),
            source,
        }),
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!("failed to kill timed out command `{command}`: {err}");
            }
            Err(ActuatorError::Timeout {
                command: command.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use lampctl_common::MemoryGpio;

    use super::*;

    #[tokio::test]
    async fn successful_command() {
        assert!(run_command("true", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn failing_command_reports_exit_status() {
        let result = run_command("exit 3", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ActuatorError::ExitStatus { .. })));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let result = run_command("   ", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ActuatorError::EmptyCommand)));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let result = run_command("sleep 5", Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(ActuatorError::Timeout {
                timeout_ms: 100,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn runner_counts_failures() {
        let runner = CommandRunner::new(Duration::from_millis(200));
        runner.run("true".to_string(), CommandPurpose::TurnOn).await;
        runner.run("false".to_string(), CommandPurpose::TurnOff).await;
        runner.run("sleep 5".to_string(), CommandPurpose::LongPress).await;

        assert_eq!(runner.shutdown(Duration::from_secs(5)).await, 0);
        let diagnostics = runner.diagnostics().await;
        assert_eq!(diagnostics.attempted, 3);
        assert_eq!(diagnostics.failed, 2);
        assert_eq!(diagnostics.timed_out, 1);
        assert!(diagnostics.last_error.is_some());
    }

    #[tokio::test]
    async fn shutdown_abandons_tasks_past_grace() {
        let runner = CommandRunner::new(Duration::from_secs(30));
        runner.run("sleep 10".to_string(), CommandPurpose::TurnOn).await;

        assert_eq!(runner.shutdown(Duration::from_millis(100)).await, 1);
        assert_eq!(runner.diagnostics().await.attempted, 0);
    }

    #[tokio::test]
    async fn pulse_returns_pin_high() {
        let gpio = Arc::new(MemoryGpio::new());
        let runner = CommandRunner::new(Duration::from_secs(1));
        runner.pulse(gpio.clone(), 5, 10).await;
        runner.shutdown(Duration::from_secs(1)).await;

        assert!(gpio.output(5));
        assert_eq!(gpio.write_count(), 2);
        assert_eq!(runner.diagnostics().await.failed, 0);
    }
}
