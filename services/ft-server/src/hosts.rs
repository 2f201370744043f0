//! Deployment that starts one node runtime per host of a fixed list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ftpool_id::NodeUrl;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::launch::{CommandDescriptor, CommandRunner, LaunchError, LaunchPipeline, RemoteLogin};
use crate::nodesource::{AttachSink, Deployment, DeploymentError, NodeSourceError};
use crate::params::{Configurable, ParamDescriptor, ParamError, ParamKind, ParamValues};

const DEFAULT_COMMAND: &str = "ftpool-node";

/// Starts a node runtime on every listed host over `ssh` and attaches the
/// resulting nodes.
pub struct HostListDeployment {
    name: String,
    hosts: Vec<String>,
    command: String,
    scheme: String,
    port: u16,
    user: Option<String>,
    attempts: u32,
    retry_delay: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl Configurable for HostListDeployment {
    fn parameters() -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor::new("hosts", ParamKind::List, "Comma separated host names"),
            ParamDescriptor::new("hosts_file", ParamKind::Path, "File with one host per line")
                .file(),
            ParamDescriptor::new("command", ParamKind::String, "Node runtime to start")
                .default_value(DEFAULT_COMMAND),
            ParamDescriptor::new("scheme", ParamKind::String, "Scheme of the node URLs")
                .default_value("tcp"),
            ParamDescriptor::new("port", ParamKind::Integer, "Port the node runtime listens on")
                .default_value("1099"),
            ParamDescriptor::new("user", ParamKind::String, "Remote login user"),
            ParamDescriptor::new("attempts", ParamKind::Integer, "Launch attempts per host")
                .default_value("3"),
            ParamDescriptor::new("retry_delay", ParamKind::Duration, "Delay between attempts")
                .default_value("1000"),
        ]
    }
}

impl HostListDeployment {
    /// Builds the deployment from validated parameters.
    ///
    /// At least one of `hosts` and `hosts_file` must be given; hosts from
    /// both are used, in that order, without duplicates.
    pub fn from_params(
        name: impl Into<String>,
        values: &ParamValues,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ParamError> {
        let mut hosts: Vec<String> = values.list("hosts")?.map(<[String]>::to_vec).unwrap_or_default();

        if let Some(path) = values.path("hosts_file")? {
            let content = std::fs::read_to_string(path).map_err(|e| ParamError::Invalid {
                name: "hosts_file".to_string(),
                kind: ParamKind::Path,
                reason: e.to_string(),
            })?;
            hosts.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }

        let mut seen = std::collections::HashSet::new();
        hosts.retain(|host| seen.insert(host.clone()));
        if hosts.is_empty() {
            return Err(ParamError::Missing("hosts".to_string()));
        }

        let port = values.integer("port")?.unwrap_or(1099);
        let port = u16::try_from(port).map_err(|_| ParamError::Invalid {
            name: "port".to_string(),
            kind: ParamKind::Integer,
            reason: format!("{port} is not a port"),
        })?;

        let attempts = values.integer("attempts")?.unwrap_or(3);
        let attempts = u32::try_from(attempts)
            .ok()
            .filter(|a| *a > 0)
            .ok_or_else(|| ParamError::Invalid {
                name: "attempts".to_string(),
                kind: ParamKind::Integer,
                reason: "must be at least 1".to_string(),
            })?;

        Ok(Self {
            name: name.into(),
            hosts,
            command: values
                .string("command")?
                .unwrap_or(DEFAULT_COMMAND)
                .to_string(),
            scheme: values.string("scheme")?.unwrap_or("tcp").to_string(),
            port,
            user: values.string("user")?.map(str::to_string),
            attempts,
            retry_delay: values
                .duration("retry_delay")?
                .unwrap_or(Duration::from_secs(1)),
            runner,
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// URL the node started on `host` will answer on.
    pub fn node_url(&self, host: &str) -> Result<NodeUrl, DeploymentError> {
        let raw = format!("{}://{host}:{}/{}-{host}", self.scheme, self.port, self.name);
        NodeUrl::parse(&raw).map_err(|e| DeploymentError::Failed {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Command that starts the node runtime for `url` on `host`.
    pub fn launch_command(&self, host: &str, url: &NodeUrl) -> Result<CommandDescriptor, LaunchError> {
        let mut login = RemoteLogin::new(host);
        if let Some(user) = &self.user {
            login = login.user(user);
        }
        LaunchPipeline::new()
            .stage(login)
            .apply(CommandDescriptor::new(&self.command).arg("--url").arg(url.as_str()))
    }
}

#[async_trait]
impl Deployment for HostListDeployment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, sink: AttachSink) -> Result<(), DeploymentError> {
        info!(
            deployment_id = %sink.deployment(),
            deployment = %self.name,
            hosts = self.hosts.len(),
            "Deploying nodes"
        );

        let mut launches = JoinSet::new();
        for host in &self.hosts {
            let url = self.node_url(host)?;
            let command = self
                .launch_command(host, &url)
                .map_err(|e| DeploymentError::Failed {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })?;
            launches.spawn(launch_and_attach(
                Arc::clone(&self.runner),
                sink.clone(),
                command,
                url,
                self.attempts,
                self.retry_delay,
            ));
        }

        let mut attached = 0;
        let mut failed = 0;
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok(true) => attached += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    error!(error = %e, "Launch task failed");
                    failed += 1;
                }
            }
        }

        info!(deployment = %self.name, attached, failed, "Deployment done");
        if attached == 0 {
            return Err(DeploymentError::NothingAttached {
                name: self.name.clone(),
                failed,
            });
        }
        Ok(())
    }
}

/// Launches the node runtime once, then waits for it to answer.
///
/// Launch failures are retried. Once a launch succeeds only the attach is
/// retried, so a slow node never gets a second runtime.
async fn launch_and_attach(
    runner: Arc<dyn CommandRunner>,
    sink: AttachSink,
    command: CommandDescriptor,
    url: NodeUrl,
    attempts: u32,
    retry_delay: Duration,
) -> bool {
    if !launch(runner.as_ref(), &command, &url, attempts, retry_delay).await {
        error!(node_url = %url, attempts, "Node runtime never started");
        return false;
    }

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(retry_delay).await;
        }
        match sink.attach(url.clone()).await {
            Ok(_) => return true,
            Err(NodeSourceError::Lookup(e)) => {
                warn!(node_url = %url, attempt, attempts, error = %e, "Launched node not reachable yet");
            }
            Err(e) => {
                warn!(node_url = %url, error = %e, "Node not attached, giving up");
                return false;
            }
        }
    }

    error!(node_url = %url, attempts, "Node never came up");
    false
}

async fn launch(
    runner: &dyn CommandRunner,
    command: &CommandDescriptor,
    url: &NodeUrl,
    attempts: u32,
    retry_delay: Duration,
) -> bool {
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(retry_delay).await;
        }
        match runner.run(command).await {
            Ok(_) => {
                debug!(node_url = %url, attempt, "Node launched");
                return true;
            }
            Err(e) => warn!(node_url = %url, attempt, attempts, error = %e, "Node launch failed"),
        }
    }
    false
}
