// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Administrative commands.
//!
//! Commands are registered by name at startup. A name may span several
//! words (`ls tunnels`); dispatch picks the longest registered prefix of
//! the input line and passes the remaining words as arguments.

use crate::bus::MessageBus;
use crate::tunnel::TunnelRegistry;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

/// Command failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("command '{0}' already registered")]
    Duplicate(String),
}

type Handler = Arc<dyn Fn(&[&str]) -> Result<String, CommandError> + Send + Sync>;

struct Command {
    usage: String,
    summary: String,
    handler: Handler,
}

/// Name → handler registry.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, Command>>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` (one or more words).
    ///
    /// `usage` is shown on argument errors, `summary` in `help`.
    pub fn register<F>(
        &self,
        name: &str,
        usage: &str,
        summary: &str,
        handler: F,
    ) -> Result<(), CommandError>
    where
        F: Fn(&[&str]) -> Result<String, CommandError> + Send + Sync + 'static,
    {
        let name = normalize(name);
        if name.is_empty() || name == "help" {
            return Err(CommandError::Duplicate(name));
        }
        let mut commands = self.commands.write();
        if commands.contains_key(&name) {
            return Err(CommandError::Duplicate(name));
        }
        commands.insert(
            name,
            Command {
                usage: usage.to_string(),
                summary: summary.to_string(),
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }

    /// Run one command line.
    pub fn execute(&self, line: &str) -> Result<String, CommandError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => Ok(String::new()),
            ["help", rest @ ..] => self.help(rest),
            _ => {
                let (handler, args) = {
                    let commands = self.commands.read();
                    let found = (1..=words.len()).rev().find_map(|n| {
                        commands
                            .get(&words[..n].join(" "))
                            .map(|cmd| (cmd.handler.clone(), n))
                    });
                    match found {
                        Some((handler, n)) => (handler, &words[n..]),
                        None => return Err(CommandError::Unknown(words.join(" "))),
                    }
                };
                // Handlers run without the registry lock held.
                handler(args)
            }
        }
    }

    fn help(&self, topic: &[&str]) -> Result<String, CommandError> {
        let commands = self.commands.read();
        if topic.is_empty() {
            let mut out = String::new();
            for (name, cmd) in commands.iter() {
                let _ = writeln!(out, "{:<24} {}", name, cmd.summary);
            }
            let _ = write!(out, "{:<24} {}", "help [command]", "show this list or one command's usage");
            return Ok(out);
        }
        let name = topic.join(" ");
        commands
            .get(&name)
            .map(|cmd| format!("{}\n  {}", cmd.usage, cmd.summary))
            .ok_or(CommandError::Unknown(name))
    }
}

fn normalize(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Domain commands
// ============================================================================

/// Register the read-only domain commands on `registry`.
pub fn register_domain_commands(
    registry: &CommandRegistry,
    bus: Arc<MessageBus>,
    tunnels: Arc<TunnelRegistry>,
) -> Result<(), CommandError> {
    {
        let bus = bus.clone();
        let tunnels = tunnels.clone();
        registry.register("info", "info", "domain name and message counters", move |args| {
            if !args.is_empty() {
                return Err(CommandError::Usage("info".into()));
            }
            let totals = tunnels.totals();
            Ok(format!(
                "domain={} cells={} tunnels={} routes={} to-tunnel={} to-domain={} dropped={} delivery-failures={} connects={} retries={}",
                bus.local_domain(),
                bus.cell_names().len(),
                tunnels.len(),
                bus.routes().len(),
                totals.messages_to_tunnel,
                totals.messages_to_domain,
                totals.messages_dropped,
                totals.delivery_failures,
                totals.connect_attempts,
                totals.retries,
            ))
        })?;
    }

    {
        let tunnels = tunnels.clone();
        registry.register(
            "ls tunnels",
            "ls tunnels [-waiting]",
            "list tunnels, or only those not forwarding",
            move |args| {
                let list = match args {
                    [] => tunnels.list(),
                    ["-waiting"] => tunnels.waiting(),
                    _ => return Err(CommandError::Usage("ls tunnels [-waiting]".into())),
                };
                Ok(list
                    .iter()
                    .map(|t| t.status())
                    .collect::<Vec<_>>()
                    .join("\n"))
            },
        )?;
    }

    registry.register("ls routes", "ls routes", "list installed routes", move |args| {
        if !args.is_empty() {
            return Err(CommandError::Usage("ls routes".into()));
        }
        Ok(bus
            .routes()
            .routes()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n"))
    })?;

    registry.register(
        "tunnel",
        "tunnel <name|tunnel#N|domain>",
        "status of one tunnel",
        move |args| {
            let [key] = args else {
                return Err(CommandError::Usage("tunnel <name|tunnel#N|domain>".into()));
            };
            let tunnel = tunnels
                .find(key)
                .ok_or_else(|| CommandError::NotFound(key.to_string()))?;
            let mut out = tunnel.status();
            if let Some(error) = tunnel.last_error() {
                let _ = write!(out, "\nlast-error: {}", error);
            }
            Ok(out)
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::DomainIdentity;
    use crate::routing::{Route, RoutingTable, TunnelId};

    #[test]
    fn test_longest_prefix_dispatch() {
        let registry = CommandRegistry::new();
        registry
            .register("ls", "ls", "short", |args| Ok(format!("ls {:?}", args)))
            .unwrap();
        registry
            .register("ls tunnels", "ls tunnels", "long", |args| Ok(format!("tunnels {:?}", args)))
            .unwrap();

        assert_eq!(registry.execute("ls tunnels -waiting").unwrap(), "tunnels [\"-waiting\"]");
        assert_eq!(registry.execute("ls  cells").unwrap(), "ls [\"cells\"]");
        assert_eq!(registry.execute("   ").unwrap(), "");
        assert_eq!(
            registry.execute("frobnicate now").unwrap_err(),
            CommandError::Unknown("frobnicate now".into())
        );
    }

    #[test]
    fn test_duplicate_and_help() {
        let registry = CommandRegistry::new();
        registry.register("info", "info", "domain info", |_| Ok("x".into())).unwrap();
        assert!(matches!(
            registry.register("info", "info", "again", |_| Ok(String::new())),
            Err(CommandError::Duplicate(_))
        ));
        assert!(registry.register("help", "help", "no", |_| Ok(String::new())).is_err());

        let help = registry.execute("help").unwrap();
        assert!(help.contains("info"));
        assert!(help.contains("help [command]"));
        assert_eq!(registry.execute("help info").unwrap(), "info\n  domain info");
        assert!(registry.execute("help nothing").is_err());
    }

    #[tokio::test]
    async fn test_domain_commands() {
        let routes = Arc::new(RoutingTable::new("nodeA"));
        let bus = Arc::new(MessageBus::new(DomainIdentity::new("nodeA"), routes.clone()));
        let tunnels = Arc::new(TunnelRegistry::new());
        let registry = CommandRegistry::new();
        register_domain_commands(&registry, bus.clone(), tunnels).unwrap();

        let info = registry.execute("info").unwrap();
        assert!(info.starts_with("domain=nodeA cells=0 tunnels=0 routes=0"));

        routes.install(Route::domain("nodeB", TunnelId(7))).unwrap();
        assert_eq!(registry.execute("ls routes").unwrap(), "nodeB -> tunnel#7 (DOMAIN)");

        assert_eq!(registry.execute("ls tunnels").unwrap(), "");
        assert!(matches!(
            registry.execute("ls tunnels -all"),
            Err(CommandError::Usage(_))
        ));
        assert_eq!(
            registry.execute("tunnel nodeB").unwrap_err(),
            CommandError::NotFound("nodeB".into())
        );
        assert!(matches!(registry.execute("tunnel"), Err(CommandError::Usage(_))));
    }
}
