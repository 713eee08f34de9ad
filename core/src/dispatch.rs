//! Answers requests coming from the peer.
//!
//! `list-commands` and `execute` are always available. Any other name is
//! looked up in the registry and executed directly.

use crate::error::ExecError;
use crate::executor::run_command;
use crate::protocol::{
    CMD_EXECUTE, CMD_LIST_COMMANDS, EXIT_CANNOT_EXECUTE, EXIT_COMMAND_NOT_FOUND, EXIT_FAILURE,
    EXIT_USAGE, Request, Response,
};
use crate::registry::CommandRegistry;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: CommandRegistry,
    /// Variables identifying the calling peer, applied after the request's
    /// own environment so a caller cannot override them.
    peer_env: BTreeMap<String, String>,
}

impl Dispatcher {
    pub fn new(registry: CommandRegistry, peer_env: BTreeMap<String, String>) -> Self {
        Self { registry, peer_env }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub async fn handle(&self, request: Request) -> Response {
        tracing::info!(
            "Peer is calling {} {:?}",
            request.command,
            request.arguments
        );

        match request.command.as_str() {
            CMD_LIST_COMMANDS => self.list_commands(&request).await,
            CMD_EXECUTE => match request.arguments.split_first() {
                Some((name, args)) => self.execute(&request, name, args).await,
                None => Response::failure(
                    &request.id,
                    EXIT_USAGE,
                    "execute requires the name of a command",
                ),
            },
            name => self.execute(&request, name, &request.arguments).await,
        }
    }

    async fn list_commands(&self, request: &Request) -> Response {
        match self.registry.names().await {
            Ok(names) => {
                let mut output = names.join("\n").into_bytes();
                if !output.is_empty() {
                    output.push(b'\n');
                }
                Response::success(&request.id, output, 0)
            }
            Err(e) => {
                tracing::warn!("Failed to scan command directories: {}", e);
                Response::failure(&request.id, EXIT_FAILURE, e.to_string())
            }
        }
    }

    async fn execute(&self, request: &Request, name: &str, args: &[String]) -> Response {
        let program = match self.registry.lookup(name).await {
            Ok(Some(program)) => program,
            Ok(None) => {
                tracing::warn!("Peer requested unknown command {}", name);
                return Response::failure(
                    &request.id,
                    EXIT_COMMAND_NOT_FOUND,
                    ExecError::CommandNotFound(name.to_string()).to_string(),
                );
            }
            Err(e) => return Response::failure(&request.id, EXIT_FAILURE, e.to_string()),
        };

        let mut env = request.environment.clone();
        env.extend(self.peer_env.clone());

        match run_command(&program, args, &env, &request.input).await {
            Ok(output) => Response::success(&request.id, output.stdout, output.exit_status),
            Err(e) => {
                tracing::warn!("Failed to run {}: {}", program.display(), e);
                let status = match e {
                    ExecError::Spawn { .. } => EXIT_CANNOT_EXECUTE,
                    _ => EXIT_FAILURE,
                };
                Response::failure(&request.id, status, e.to_string())
            }
        }
    }
}
