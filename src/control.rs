//! Operator commands
//!
//! Five commands drive the relay: `status` is open to everyone, the rest need
//! the channel-management privilege. The binary exposes them on stdin as a
//! local console, one command per line, with JSON replies on stdout.

use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::status::{DebugReport, RelayStatus};
use crate::RelayHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Restart,
    Debug,
    Fix,
    Refresh,
}

impl Command {
    /// Parse a command word, with or without a leading `!`. Arguments are ignored.
    pub fn parse(input: &str) -> Option<Self> {
        let word = input
            .trim()
            .trim_start_matches('!')
            .split_whitespace()
            .next()?
            .to_ascii_lowercase();

        match word.as_str() {
            "status" => Some(Command::Status),
            "restart" => Some(Command::Restart),
            "debug" => Some(Command::Debug),
            "fix" => Some(Command::Fix),
            "refresh" => Some(Command::Refresh),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Restart => "restart",
            Command::Debug => "debug",
            Command::Fix => "fix",
            Command::Refresh => "refresh",
        }
    }

    pub fn requires_privilege(&self) -> bool {
        !matches!(self, Command::Status)
    }
}

/// Who issued a command.
#[derive(Debug, Clone)]
pub struct Invoker {
    pub name: String,
    pub can_manage_channels: bool,
}

impl Invoker {
    /// Whoever has the process's stdin.
    pub fn local_operator() -> Self {
        Self {
            name: "console".to_string(),
            can_manage_channels: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CommandReply {
    Status(RelayStatus),
    Debug(DebugReport),
    Accepted {
        command: &'static str,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub enum CommandError {
    NotPermitted { command: &'static str, invoker: String },
    /// The relay loop has shut down
    RelayUnavailable,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotPermitted { command, invoker } => write!(
                f,
                "{} needs the manage channels permission to use {}",
                invoker, command
            ),
            CommandError::RelayUnavailable => write!(f, "Relay is shutting down"),
        }
    }
}

impl std::error::Error for CommandError {}

pub async fn execute(
    relay: &RelayHandle,
    invoker: &Invoker,
    command: Command,
) -> Result<CommandReply, CommandError> {
    if command.requires_privilege() && !invoker.can_manage_channels {
        log::warn!("{} tried {} without permission", invoker.name, command.name());
        return Err(CommandError::NotPermitted {
            command: command.name(),
            invoker: invoker.name.clone(),
        });
    }

    log::info!("{} ran {}", invoker.name, command.name());

    match command {
        Command::Status => Ok(CommandReply::Status(relay.status().await)),
        Command::Debug => Ok(CommandReply::Debug(relay.debug_report().await)),
        Command::Restart => {
            let already = relay.coordinator().in_flight;
            relay
                .request_restart()
                .await
                .map_err(|_| CommandError::RelayUnavailable)?;
            Ok(CommandReply::Accepted {
                command: command.name(),
                detail: if already {
                    "a restart is already in progress".to_string()
                } else {
                    "restart requested".to_string()
                },
            })
        }
        Command::Fix => {
            relay
                .force_restart()
                .await
                .map_err(|_| CommandError::RelayUnavailable)?;
            Ok(CommandReply::Accepted {
                command: command.name(),
                detail: "restart flag cleared, restarting now".to_string(),
            })
        }
        Command::Refresh => {
            let detail = if relay.refresh_metadata().await {
                "relabeling from the current track"
            } else {
                "track metadata is disabled"
            };
            Ok(CommandReply::Accepted {
                command: command.name(),
                detail: detail.to_string(),
            })
        }
    }
}

/// Read commands from stdin until EOF or `quit`.
pub async fn run_console(relay: Arc<RelayHandle>) {
    let invoker = Invoker::local_operator();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    log::info!("Console ready: status, restart, debug, fix, refresh, quit");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("Console closed");
                return;
            }
            Err(e) => {
                log::warn!("Console read failed: {}", e);
                return;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "quit" | "exit") {
            return;
        }

        let reply = match Command::parse(trimmed) {
            Some(command) => match execute(&relay, &invoker, command).await {
                Ok(reply) => serde_json::to_string_pretty(&reply)
                    .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e)),
                Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
            },
            None => serde_json::json!({ "error": format!("unknown command: {}", trimmed) }).to_string(),
        };
        println!("{}", reply);
    }
}
