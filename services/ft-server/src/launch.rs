//! Building and running node-runtime launch commands.
//!
//! A launch starts from a plain [`CommandDescriptor`] and goes through a
//! [`LaunchPipeline`] of named stages. Each stage wraps the command it is
//! given: environment setup adds variables, remote login turns it into an
//! `ssh` invocation, batch submit hands it to a cluster scheduler.
//!
//! ```text
//! ftpool-node --url ...
//!   -> EnvironmentSetup   (FTPOOL_HOME=... ftpool-node ...)
//!   -> BatchSubmit(slurm) (sbatch --wrap '...')
//!   -> RemoteLogin        (ssh frontend -- 'sbatch --wrap ...')
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("command has no program")]
    EmptyProgram,

    #[error("stage '{stage}' cannot wrap the command: {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("'{program}' exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_string()))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("'{program}' did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
}

// =============================================================================
// Command descriptor
// =============================================================================

/// A command to run, before or after wrapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl CommandDescriptor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Renders the command as one `sh` command line, environment and
    /// working directory included.
    pub fn to_shell(&self) -> String {
        let mut parts = Vec::new();
        if let Some(dir) = &self.workdir {
            parts.push(format!("cd {} &&", shell_quote(&dir.to_string_lossy())));
        }
        if !self.env.is_empty() {
            parts.push("env".to_string());
            for (key, value) in &self.env {
                parts.push(format!("{key}={}", shell_quote(value)));
            }
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

// =============================================================================
// Stages
// =============================================================================

/// One transformation of a launch command.
pub trait LaunchStage: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn apply(&self, command: CommandDescriptor) -> Result<CommandDescriptor, LaunchError>;
}

/// Adds environment variables, overriding existing ones.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSetup {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl LaunchStage for EnvironmentSetup {
    fn name(&self) -> &str {
        "environment-setup"
    }

    fn apply(&self, mut command: CommandDescriptor) -> Result<CommandDescriptor, LaunchError> {
        if let Some(key) = self.vars.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(LaunchError::InvalidStage {
                stage: self.name().to_string(),
                reason: format!("invalid variable name '{key}'"),
            });
        }
        command.env.extend(self.vars.clone());
        Ok(command)
    }
}

/// Runs the command on another host through `ssh`.
#[derive(Debug, Clone)]
pub struct RemoteLogin {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Extra `ssh` options, e.g. `-oBatchMode=yes`.
    pub options: Vec<String>,
    pub ssh_program: String,
}

impl RemoteLogin {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            options: vec!["-oBatchMode=yes".to_string()],
            ssh_program: "ssh".to_string(),
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl LaunchStage for RemoteLogin {
    fn name(&self) -> &str {
        "remote-login"
    }

    fn apply(&self, command: CommandDescriptor) -> Result<CommandDescriptor, LaunchError> {
        if self.host.is_empty() {
            return Err(LaunchError::InvalidStage {
                stage: self.name().to_string(),
                reason: "no host".to_string(),
            });
        }

        let mut ssh = CommandDescriptor::new(&self.ssh_program);
        if let Some(port) = self.port {
            ssh = ssh.arg("-p").arg(port.to_string());
        }
        ssh = ssh.args(self.options.iter().cloned());
        let target = match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        };
        Ok(ssh.arg(target).arg("--").arg(command.to_shell()))
    }
}

/// Cluster batch schedulers a command can be submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchScheduler {
    Pbs,
    Slurm,
    Oar,
}

impl FromStr for BatchScheduler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pbs" => Ok(BatchScheduler::Pbs),
            "slurm" => Ok(BatchScheduler::Slurm),
            "oar" => Ok(BatchScheduler::Oar),
            other => Err(format!("unknown batch scheduler '{other}'")),
        }
    }
}

/// Submits the command as a batch job.
#[derive(Debug, Clone)]
pub struct BatchSubmit {
    pub scheduler: BatchScheduler,
    pub queue: Option<String>,
    /// Extra submit options, passed as-is.
    pub options: Vec<String>,
}

impl BatchSubmit {
    pub fn new(scheduler: BatchScheduler) -> Self {
        Self {
            scheduler,
            queue: None,
            options: Vec::new(),
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

impl LaunchStage for BatchSubmit {
    fn name(&self) -> &str {
        "batch-submit"
    }

    fn apply(&self, command: CommandDescriptor) -> Result<CommandDescriptor, LaunchError> {
        let script = command.to_shell();
        let (program, queue_flag) = match self.scheduler {
            BatchScheduler::Pbs => ("qsub", "-q"),
            BatchScheduler::Slurm => ("sbatch", "-p"),
            BatchScheduler::Oar => ("oarsub", "-q"),
        };

        let mut submit = CommandDescriptor::new(program);
        if let Some(queue) = &self.queue {
            submit = submit.arg(queue_flag).arg(queue);
        }
        submit = submit.args(self.options.iter().cloned());

        Ok(match self.scheduler {
            BatchScheduler::Pbs => submit.args(["--", "/bin/sh", "-c"]).arg(script),
            BatchScheduler::Slurm => submit.arg("--wrap").arg(script),
            BatchScheduler::Oar => submit.arg(script),
        })
    }
}

/// Ordered list of stages applied to a launch command.
#[derive(Debug, Default)]
pub struct LaunchPipeline {
    stages: Vec<Box<dyn LaunchStage>>,
}

impl LaunchPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl LaunchStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Applies every stage in order.
    pub fn apply(&self, command: CommandDescriptor) -> Result<CommandDescriptor, LaunchError> {
        if command.program.is_empty() {
            return Err(LaunchError::EmptyProgram);
        }
        self.stages.iter().try_fold(command, |command, stage| {
            let wrapped = stage.apply(command)?;
            debug!(stage = stage.name(), program = %wrapped.program, "Applied launch stage");
            Ok(wrapped)
        })
    }
}

// =============================================================================
// Running
// =============================================================================

/// Output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs launch commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion; a non-zero exit is an error.
    async fn run(&self, command: &CommandDescriptor) -> Result<CommandOutput, LaunchError>;
}

/// Runs commands as local child processes.
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, command: &CommandDescriptor) -> Result<CommandOutput, LaunchError> {
        if command.program.is_empty() {
            return Err(LaunchError::EmptyProgram);
        }

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.workdir {
            process.current_dir(dir);
        }

        debug!(command = %command, "Running launch command");
        let output = match tokio::time::timeout(self.timeout, process.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LaunchError::Spawn {
                    program: command.program.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(LaunchError::Timeout {
                    program: command.program.clone(),
                    after: self.timeout,
                })
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if !output.status.success() {
            warn!(program = %command.program, code = ?result.code, stderr = %result.stderr, "Launch command failed");
            return Err(LaunchError::Failed {
                program: command.program.clone(),
                code: result.code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}
