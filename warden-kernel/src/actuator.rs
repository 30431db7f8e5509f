/**
 * REMEDIATION ACTUATOR - Pilotage du script de cycle de vie d'un composant
 *
 * RÔLE : start / stop / status via la commande de cycle de vie, recherche et
 * kill du processus résiduel, séquence de remédiation du heartbeat manager.
 *
 * Le script ne répond qu'en texte libre. `interpret_output` est le seul
 * endroit qui transforme ce texte en `Response`.
 */

use crate::component::MonitoredComponent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("invalid lifecycle command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Status => "status",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Running,
    NotRunning,
    UnknownComponent,
    FailedToExecute,
    StartAttempted,
    Stopped,
    ExecutionError,
    Aborted,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Response::Running => "running",
            Response::NotRunning => "not running",
            Response::UnknownComponent => "unknown component",
            Response::FailedToExecute => "failed to execute",
            Response::StartAttempted => "start attempted",
            Response::Stopped => "stopped",
            Response::ExecutionError => "execution error",
            Response::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Pid(u32),
    Pattern(String),
}

/// Captured output of one external command, stdout and stderr combined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: Option<i32>,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{}{}", stdout, stderr)
        };
        Self { text, exit_code: output.status.code() }
    }
}

/// Maps lifecycle script output to a response.
pub fn interpret_output(action: LifecycleAction, output: &CommandOutput) -> Response {
    let text = output.text.as_str();
    let lower = text.to_ascii_lowercase();

    if lower.contains("unknown application") {
        return Response::UnknownComponent;
    }

    match action {
        LifecycleAction::Start => {
            if lower.contains("already running") {
                Response::Running
            } else if text.contains("nohup:") || text.trim().is_empty() {
                Response::StartAttempted
            } else {
                Response::ExecutionError
            }
        }
        LifecycleAction::Stop => {
            if lower.contains("was not running") {
                Response::NotRunning
            } else if matches!(output.exit_code, None | Some(0)) {
                Response::Stopped
            } else {
                Response::ExecutionError
            }
        }
        LifecycleAction::Status => {
            if text.contains("NOT") || lower.contains("not running") {
                Response::NotRunning
            } else if lower.contains("running") {
                Response::Running
            } else {
                Response::ExecutionError
            }
        }
        // composite, never produced by a single command
        LifecycleAction::Restart => Response::ExecutionError,
    }
}

pub fn interpret_kill(output: &CommandOutput) -> Response {
    if output.exit_code == Some(0) {
        Response::Stopped
    } else if output.text.to_ascii_lowercase().contains("no such process") {
        Response::NotRunning
    } else {
        Response::ExecutionError
    }
}

#[async_trait]
pub trait Actuator: Send + Sync {
    async fn run(&self, component: &MonitoredComponent, action: LifecycleAction) -> Response;

    async fn find_pid(&self, pattern: &str) -> Option<u32>;

    async fn kill(&self, target: KillTarget, forceful: bool) -> Response;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Lifecycle script, split with shell rules (`"./appctl --quiet"`)
    pub command: String,
    pub working_dir: Option<PathBuf>,
    /// Argument templates, `{name}` is the component lifecycle name
    pub start: String,
    pub stop: String,
    pub status: String,
    /// Pause between the steps of a restart
    pub step_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            command: "./appctl".into(),
            working_dir: None,
            start: "{name} start background".into(),
            stop: "{name} stop".into(),
            status: "{name} status".into(),
            step_delay_secs: 5,
            timeout_secs: 60,
        }
    }
}

fn render_args(template: &str, name: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(&template.replace("{name}", &shell_words::quote(name)))
}

/// Actuator backed by the external lifecycle script.
pub struct ScriptActuator {
    program: String,
    base_args: Vec<String>,
    settings: LifecycleSettings,
}

impl ScriptActuator {
    pub fn new(settings: LifecycleSettings) -> Result<Self, ActuatorError> {
        let mut words = shell_words::split(&settings.command)
            .map_err(|e| ActuatorError::InvalidCommand(e.to_string()))?;
        if words.is_empty() {
            return Err(ActuatorError::InvalidCommand("empty command".into()));
        }
        let program = words.remove(0);
        Ok(Self { program, base_args: words, settings })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs.max(1))
    }

    async fn execute(&self, component: &MonitoredComponent, action: LifecycleAction) -> Response {
        let template = match action {
            LifecycleAction::Start => &self.settings.start,
            LifecycleAction::Stop => &self.settings.stop,
            LifecycleAction::Status => &self.settings.status,
            LifecycleAction::Restart => return Response::ExecutionError,
        };

        let mut args = self.base_args.clone();
        match render_args(template, component.lifecycle_name()) {
            Ok(extra) => args.extend(extra),
            Err(e) => {
                error!("[actuator] bad {} template '{}': {}", action, template, e);
                return Response::FailedToExecute;
            }
        }

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.settings.working_dir {
            command.current_dir(dir);
        }

        debug!("[actuator] exec {} {:?}", self.program, args);
        let output = match tokio::time::timeout(self.timeout(), command.output()).await {
            Err(_) => {
                warn!("[actuator] {} {} timed out", action, component.id());
                return Response::Aborted;
            }
            Ok(Err(e)) => {
                error!("[actuator] failed to spawn {}: {}", self.program, e);
                return Response::FailedToExecute;
            }
            Ok(Ok(output)) => CommandOutput::from(output),
        };

        let response = interpret_output(action, &output);
        info!("[actuator] {} {} -> {}", action, component.id(), response);
        response
    }

    // the script's own restart verb does not restart a running instance
    async fn restart(&self, component: &MonitoredComponent) -> Response {
        let delay = Duration::from_secs(self.settings.step_delay_secs);

        let stopped = self.execute(component, LifecycleAction::Stop).await;
        debug!("[actuator] restart {}: stop -> {}", component.id(), stopped);
        tokio::time::sleep(delay).await;

        let started = self.execute(component, LifecycleAction::Start).await;
        debug!("[actuator] restart {}: start -> {}", component.id(), started);
        tokio::time::sleep(delay).await;

        self.execute(component, LifecycleAction::Status).await
    }
}

pub fn find_pid_blocking(pattern: &str) -> Option<u32> {
    if pattern.trim().is_empty() {
        return None;
    }
    let own_pid = sysinfo::get_current_pid().ok();

    let mut sys = System::new();
    sys.refresh_processes();

    sys.processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != own_pid)
        .filter(|(_, process)| {
            process.name().contains(pattern) || process.cmd().join(" ").contains(pattern)
        })
        .map(|(pid, _)| pid.as_u32())
        .min()
}

#[async_trait]
impl Actuator for ScriptActuator {
    async fn run(&self, component: &MonitoredComponent, action: LifecycleAction) -> Response {
        match action {
            LifecycleAction::Restart => self.restart(component).await,
            other => self.execute(component, other).await,
        }
    }

    async fn find_pid(&self, pattern: &str) -> Option<u32> {
        let pattern = pattern.to_string();
        match tokio::task::spawn_blocking(move || find_pid_blocking(&pattern)).await {
            Ok(pid) => pid,
            Err(e) => {
                error!("[actuator] process lookup panicked: {}", e);
                None
            }
        }
    }

    async fn kill(&self, target: KillTarget, forceful: bool) -> Response {
        let pid = match target {
            KillTarget::Pid(pid) => pid,
            KillTarget::Pattern(pattern) => match self.find_pid(&pattern).await {
                Some(pid) => pid,
                None => return Response::NotRunning,
            },
        };

        let mut command = Command::new("kill");
        if forceful {
            command.arg("-9");
        }
        command.arg(pid.to_string()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let response = match tokio::time::timeout(self.timeout(), command.output()).await {
            Err(_) => Response::Aborted,
            Ok(Err(e)) => {
                error!("[actuator] failed to run kill: {}", e);
                Response::FailedToExecute
            }
            Ok(Ok(output)) => interpret_kill(&CommandOutput::from(output)),
        };
        info!("[actuator] kill {} -> {}", pid, response);
        response
    }
}

/// Outcome of each remediation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationReport {
    pub component_id: String,
    pub stop: Response,
    pub residual_pid: Option<u32>,
    pub kill: Option<Response>,
    pub start: Response,
    pub status: Response,
}

impl RemediationReport {
    pub fn summary(&self) -> String {
        let residual = match (self.residual_pid, self.kill) {
            (Some(pid), Some(kill)) => format!("residual process {pid}: {kill}"),
            _ => "residual process: none".to_string(),
        };
        format!(
            "stop: {}\n{}\nstart: {}\nstatus: {}",
            self.stop, residual, self.start, self.status
        )
    }
}

/// stop -> find residual pid -> kill (when found) -> start -> status.
/// Every step runs whatever the previous one reported.
pub async fn remediate(actuator: &dyn Actuator, component: &MonitoredComponent) -> RemediationReport {
    let id = component.id();
    info!("[actuator] remediating {}", id);

    let stop = actuator.run(component, LifecycleAction::Stop).await;
    let residual_pid = actuator.find_pid(component.process_pattern()).await;
    let kill = match residual_pid {
        Some(pid) => Some(actuator.kill(KillTarget::Pid(pid), true).await),
        None => None,
    };
    let start = actuator.run(component, LifecycleAction::Start).await;
    let status = actuator.run(component, LifecycleAction::Status).await;

    RemediationReport { component_id: id, stop, residual_pid, kill, start, status }
}
