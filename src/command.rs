//! The UFW-style administrative command grammar.
//!
//! Text commands from the administrative surface are parsed into typed
//! `Command` values and executed against the controller. This is the only
//! place `InvalidTarget` can arise; the engine's typed API never sees
//! malformed input.

use std::fmt::Write as _;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::engine::{
    Action, Connection, Controller, LogLevel, Policy, Protocol, Rule, RuleId, SourcePattern,
};
use crate::error::{NetguardError, Result};

/// Traffic direction accepted by `default`. The engine applies one policy
/// to every evaluation; the token is parsed for grammar compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Enable,
    Disable,
    Status { verbose: bool },
    AddRule {
        action: Action,
        port: u16,
        protocol: Protocol,
        source: Option<SourcePattern>,
    },
    Delete(RuleId),
    SetDefault {
        policy: Policy,
        direction: Option<Direction>,
    },
    SetLogging(LogLevel),
    AppList,
    AppAllow(String),
    AppDeny(String),
    Block(IpAddr),
    Unblock(IpAddr),
    Trust(SourcePattern),
    /// Console helper: evaluate a synthetic connection against the engine.
    Eval {
        source: IpAddr,
        destination: IpAddr,
        port: u16,
        protocol: Protocol,
    },
}

fn invalid(msg: impl Into<String>) -> NetguardError {
    NetguardError::InvalidTarget(msg.into())
}

fn parse_port_proto(token: &str) -> Result<(u16, Protocol)> {
    let (port_str, proto) = match token.split_once('/') {
        Some((port, proto)) => {
            let protocol: Protocol = proto
                .parse()
                .map_err(|e: String| invalid(e))?;
            (port, protocol)
        }
        None => (token, Protocol::Any),
    };
    let port: u16 = port_str
        .parse()
        .map_err(|_| invalid(format!("bad port: {}", port_str)))?;
    Ok((port, proto))
}

fn parse_ip(token: &str) -> Result<IpAddr> {
    token
        .parse()
        .map_err(|_| invalid(format!("bad address: {}", token)))
}

/// Parse one command line. Unknown verbs and malformed targets yield
/// `InvalidTarget`.
pub fn parse(line: &str) -> Result<Command> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (verb, rest) = tokens
        .split_first()
        .ok_or_else(|| invalid("empty command"))?;

    match (*verb, rest) {
        ("enable", []) => Ok(Command::Enable),
        ("disable", []) => Ok(Command::Disable),
        ("status", []) => Ok(Command::Status { verbose: false }),
        ("status", ["verbose"]) => Ok(Command::Status { verbose: true }),

        ("allow" | "deny" | "reject" | "limit", _) => {
            let action = match *verb {
                "allow" => Action::Allow,
                "deny" => Action::Deny,
                "reject" => Action::Reject,
                _ => Action::Limit,
            };
            let (target, source) = match rest {
                [target] => (*target, None),
                [target, "from", addr] => (*target, Some(addr.parse::<SourcePattern>()?)),
                _ => return Err(invalid(format!("usage: {} <port>[/proto] [from <addr>]", verb))),
            };
            let (port, protocol) = parse_port_proto(target)?;
            Ok(Command::AddRule {
                action,
                port,
                protocol,
                source,
            })
        }

        ("delete", [id]) => {
            let id: RuleId = id
                .parse()
                .map_err(|_| invalid(format!("bad rule id: {}", id)))?;
            Ok(Command::Delete(id))
        }

        ("default", [policy, rest @ ..]) => {
            let policy: Policy = policy.parse().map_err(|e: String| invalid(e))?;
            let direction = match rest {
                [] => None,
                ["incoming"] => Some(Direction::Incoming),
                ["outgoing"] => Some(Direction::Outgoing),
                [other, ..] => return Err(invalid(format!("unknown direction: {}", other))),
            };
            Ok(Command::SetDefault { policy, direction })
        }

        ("logging", [level]) => {
            let level: LogLevel = level.parse().map_err(|e: String| invalid(e))?;
            Ok(Command::SetLogging(level))
        }

        ("app", ["list"]) => Ok(Command::AppList),
        ("app", ["allow", name]) => Ok(Command::AppAllow(name.to_string())),
        ("app", ["deny", name]) => Ok(Command::AppDeny(name.to_string())),

        ("block", [addr]) => Ok(Command::Block(parse_ip(addr)?)),
        ("unblock", [addr]) => Ok(Command::Unblock(parse_ip(addr)?)),
        ("trust", [addr]) => Ok(Command::Trust(addr.parse()?)),

        ("eval", [source, destination, port, rest @ ..]) => {
            let protocol = match rest {
                [] => Protocol::Tcp,
                [proto] => proto.parse().map_err(|e: String| invalid(e))?,
                _ => return Err(invalid("usage: eval <src> <dst> <port> [proto]")),
            };
            Ok(Command::Eval {
                source: parse_ip(source)?,
                destination: parse_ip(destination)?,
                port: port
                    .parse()
                    .map_err(|_| invalid(format!("bad port: {}", port)))?,
                protocol,
            })
        }

        _ => Err(invalid(format!("unknown command: {}", line.trim()))),
    }
}

/// Execute a parsed command against the controller, returning the text the
/// console prints.
pub fn execute(controller: &Controller, command: Command, now: DateTime<Utc>) -> Result<String> {
    match command {
        Command::Enable => {
            controller.enable();
            Ok("engine enabled".to_string())
        }
        Command::Disable => {
            controller.disable();
            Ok("engine disabled".to_string())
        }
        Command::Status { verbose } => Ok(render_status(controller, verbose)),
        Command::AddRule {
            action,
            port,
            protocol,
            source,
        } => {
            let id = controller.add_rule(Rule {
                priority: 100,
                action,
                protocol,
                source,
                destination_port: Some(port),
                established_only: false,
                rate_limit: None,
            });
            Ok(format!("rule {} added", id))
        }
        Command::Delete(id) => {
            if controller.remove_rule(id) {
                Ok(format!("rule {} deleted", id))
            } else {
                Err(NetguardError::RuleNotFound(id))
            }
        }
        Command::SetDefault { policy, .. } => {
            controller.set_default_policy(policy);
            Ok(format!("default policy set to {}", policy))
        }
        Command::SetLogging(level) => {
            controller.set_log_level(level);
            Ok(format!("logging set to {}", level))
        }
        Command::AppList => {
            let names = controller.list_profiles();
            if names.is_empty() {
                Ok("no profiles registered".to_string())
            } else {
                Ok(names.join("\n"))
            }
        }
        Command::AppAllow(name) => {
            controller.enable_profile(&name)?;
            Ok(format!("profile {} activated", name))
        }
        Command::AppDeny(name) => {
            controller.disable_profile(&name)?;
            Ok(format!("profile {} deactivated", name))
        }
        Command::Block(addr) => {
            controller.block_ip(addr);
            Ok(format!("{} blocked", addr))
        }
        Command::Unblock(addr) => {
            controller.unblock_ip(addr);
            Ok(format!("{} unblocked", addr))
        }
        Command::Trust(zone) => {
            controller.add_trusted_zone(zone);
            Ok(format!("{} trusted", zone))
        }
        Command::Eval {
            source,
            destination,
            port,
            protocol,
        } => {
            let connection = Connection::new(source, destination, port, protocol);
            let decision = controller.evaluate(&connection, now);
            Ok(format!(
                "{} ({}, action {})",
                decision.verdict, decision.reason, decision.action
            ))
        }
    }
}

fn render_status(controller: &Controller, verbose: bool) -> String {
    let status = controller.status();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "status: {}",
        if status.enabled { "active" } else { "inactive" }
    );
    let _ = writeln!(out, "default policy: {}", status.default_policy);
    let _ = writeln!(out, "logging: {}", status.log_level);
    let _ = writeln!(out, "rules: {}", status.total_rules);
    let _ = writeln!(
        out,
        "profiles: {}",
        if status.active_profiles.is_empty() {
            "none".to_string()
        } else {
            status.active_profiles.join(", ")
        }
    );
    let _ = write!(
        out,
        "allowed: {}  denied: {}",
        status.allowed_count, status.denied_count
    );

    if verbose {
        for rule in controller.list_rules() {
            let _ = write!(out, "\n[{}] prio {} {}", rule.id, rule.rule.priority, rule.rule.action);
            if let Some(port) = rule.rule.destination_port {
                let _ = write!(out, " port {}", port);
            }
            let _ = write!(out, " proto {}", rule.rule.protocol);
            if let Some(ref source) = rule.rule.source {
                let _ = write!(out, " from {}", source);
            }
        }
        for entry in controller.recent_connections(10) {
            let _ = write!(
                out,
                "\n{} {} {} -> {}:{} {}",
                entry.timestamp,
                entry.decision.verdict,
                entry.connection.source_ip,
                entry.connection.destination_ip,
                entry.connection.destination_port,
                entry.decision.reason
            );
        }
    }
    out
}
