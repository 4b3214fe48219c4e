//! Agent RPC surface and the pre-run reachability gate.
//!
//! Every leaf phase is dispatched to the node it must run on through an
//! agent. The engine only ever ships `plan execute|rollback` subcommands;
//! what each executor does on the node is the agent's business.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::Server;
use crate::error::GupError;

/// Reported agent health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentStatus {
    Ready,
    NotReady,
}

/// RPC surface of the update agents.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Cheap reachability probe.
    async fn can_execute(&self, server: &Server) -> Result<()>;

    /// Run a gravity subcommand on the given server.
    async fn exec(&self, server: &Server, args: &[String]) -> Result<()>;

    async fn status(&self, server: &Server) -> Result<AgentStatus>;

    /// Ask the agent service to shut down all agents.
    async fn shutdown(&self) -> Result<()>;
}

/// Phase subcommand shipped to an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseCommand {
    Execute,
    Rollback,
}

/// Build the agent command line for a phase:
/// `plan execute|rollback --phase <id> --operation-id <id> [--force]`.
pub fn plan_command(
    command: PhaseCommand,
    phase_id: &str,
    operation_id: Uuid,
    force: bool,
) -> Vec<String> {
    let mut args = vec![
        "plan".to_string(),
        match command {
            PhaseCommand::Execute => "execute".to_string(),
            PhaseCommand::Rollback => "rollback".to_string(),
        },
        "--phase".to_string(),
        phase_id.to_string(),
        "--operation-id".to_string(),
        operation_id.to_string(),
    ];
    if force {
        args.push("--force".to_string());
    }
    args
}

/// Deadlines of the wait-for-agents gate.
#[derive(Clone, Copy, Debug)]
pub struct WaitConfig {
    /// Overall deadline for all agents to become reachable.
    pub timeout: Duration,
    /// Per-probe health check deadline.
    pub probe_timeout: Duration,
    /// Pause between probe rounds.
    pub interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(2),
        }
    }
}

/// Wait until every server is reachable by agent probe, retrying until the
/// overall deadline. Fails with `Unreachable` only when the deadline elapses
/// with at least one node still unreachable.
pub async fn wait_for_agents(
    runner: &dyn AgentRunner,
    servers: &[Server],
    config: WaitConfig,
) -> Result<()> {
    let deadline = Instant::now() + config.timeout;
    loop {
        let mut unreachable = Vec::new();
        for server in servers {
            let probe = tokio::time::timeout(config.probe_timeout, runner.can_execute(server));
            match probe.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!("Agent on {} not ready: {}", server.advertise_ip, err);
                    unreachable.push(server.advertise_ip.clone());
                }
                Err(_) => {
                    debug!("Agent probe on {} timed out", server.advertise_ip);
                    unreachable.push(server.advertise_ip.clone());
                }
            }
        }

        if unreachable.is_empty() {
            info!("All {} agents are reachable", servers.len());
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("Agents still unreachable: {}", unreachable.join(", "));
            return Err(GupError::Unreachable(
                unreachable.join(", "),
                format!(
                    "agents did not become reachable within {:?}",
                    config.timeout
                ),
            )
            .into());
        }
        tokio::time::sleep(config.interval).await;
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::RecordingRunner;
    use super::*;
    use crate::cluster::ClusterRole;
    use crate::cluster::fixtures::server;

    fn fast_config() -> WaitConfig {
        WaitConfig {
            timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(50),
            interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_plan_command_execute() {
        let operation_id = Uuid::new_v4();
        let args = plan_command(PhaseCommand::Execute, "/init/node-1", operation_id, false);
        assert_eq!(
            args,
            vec![
                "plan",
                "execute",
                "--phase",
                "/init/node-1",
                "--operation-id",
                &operation_id.to_string(),
            ]
        );
    }

    #[test]
    fn test_plan_command_rollback_forced() {
        let operation_id = Uuid::new_v4();
        let args = plan_command(PhaseCommand::Rollback, "/masters/node-2", operation_id, true);
        assert_eq!(args[1], "rollback");
        assert_eq!(args.last().unwrap(), "--force");
    }

    #[tokio::test]
    async fn test_wait_for_agents_ready() {
        let runner = RecordingRunner::default();
        let servers = vec![server(1, ClusterRole::Master), server(2, ClusterRole::Worker)];
        wait_for_agents(&runner, &servers, fast_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_agents_retries_until_ready() {
        let runner = RecordingRunner::failing_probes(2);
        let servers = vec![server(1, ClusterRole::Master)];
        wait_for_agents(&runner, &servers, fast_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_agents_deadline() {
        let runner = RecordingRunner::failing_probes(usize::MAX);
        let servers = vec![server(1, ClusterRole::Master)];
        let err = wait_for_agents(&runner, &servers, fast_config())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreachable"));
        assert!(err.to_string().contains("172.28.128.1"));
    }
}
