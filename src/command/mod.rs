//! Command model and dispatch.
//!
//! Commands are registered in static tables: canonical name, aliases, an
//! arity descriptor and an async handler function pointer. The session
//! dispatcher routes a parsed command to the user or admin table based on
//! the sigil and the issuer's roles.

pub mod parser;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::net::message::Message;
use crate::AppState;

/// A parsed command line.
#[derive(Debug, Clone)]
pub struct Command {
    pub raw: String,
    pub name: String,
    pub args: Vec<String>,
    /// True when the command carried the privileged sigil.
    pub local: bool,
}

/// A command bound to the authenticated principal that issued it.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub raw: String,
    pub name: String,
    pub args: Vec<String>,
    pub local: bool,
    pub issuer: String,
}

impl ServerCommand {
    pub fn new(command: Command, issuer: &str) -> Self {
        Self {
            raw: command.raw,
            name: command.name,
            args: command.args,
            local: command.local,
            issuer: issuer.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No matching command could be found for '{0}'")]
    NoSuchCommand(String),

    #[error("Command '{name}' requires {required} positional argument(s), {given} given")]
    BadArity {
        name: String,
        required: usize,
        given: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(&self, given: usize) -> bool {
        match self {
            Arity::Exact(n) => given == *n,
            Arity::AtLeast(n) => given >= *n,
        }
    }

    fn required(&self) -> usize {
        match self {
            Arity::Exact(n) | Arity::AtLeast(n) => *n,
        }
    }
}

pub type Handler =
    fn(Arc<AppState>, ServerCommand) -> BoxFuture<'static, anyhow::Result<Message>>;

pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub arity: Arity,
    pub handler: Handler,
}

pub struct CommandTable {
    specs: Vec<CommandSpec>,
    index: HashMap<&'static str, usize>,
}

impl CommandTable {
    pub fn new(specs: Vec<CommandSpec>) -> Self {
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            index.insert(spec.name, i);
            for alias in spec.aliases {
                index.insert(*alias, i);
            }
        }
        Self { specs, index }
    }

    pub fn dispatch(
        &self,
        state: &Arc<AppState>,
        command: ServerCommand,
    ) -> Result<BoxFuture<'static, anyhow::Result<Message>>, DispatchError> {
        let spec = self
            .index
            .get(command.name.as_str())
            .map(|&i| &self.specs[i])
            .ok_or_else(|| DispatchError::NoSuchCommand(command.name.clone()))?;

        if !spec.arity.accepts(command.args.len()) {
            return Err(DispatchError::BadArity {
                name: command.name.clone(),
                required: spec.arity.required(),
                given: command.args.len(),
            });
        }

        Ok((spec.handler)(Arc::clone(state), command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(_state: Arc<AppState>, cmd: ServerCommand) -> BoxFuture<'static, anyhow::Result<Message>> {
        Box::pin(async move { Ok(Message::value("echo", serde_json::json!(cmd.name))) })
    }

    fn table() -> CommandTable {
        CommandTable::new(vec![
            CommandSpec {
                name: "whoami",
                aliases: &[],
                arity: Arity::Exact(0),
                handler: probe,
            },
            CommandSpec {
                name: "pay",
                aliases: &["pp"],
                arity: Arity::Exact(2),
                handler: probe,
            },
            CommandSpec {
                name: "query",
                aliases: &[],
                arity: Arity::AtLeast(1),
                handler: probe,
            },
        ])
    }

    fn command(name: &str, args: &[&str]) -> ServerCommand {
        ServerCommand {
            raw: name.to_string(),
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            local: false,
            issuer: "alice".to_string(),
        }
    }

    #[test]
    fn test_unknown_command_not_registered() {
        let table = table();
        assert!(table.index.get(command("nope", &[]).name.as_str()).is_none());
        let err = DispatchError::NoSuchCommand("nope".into());
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_alias_resolves_to_same_spec() {
        let table = table();
        assert_eq!(table.index.get("pay"), table.index.get("pp"));
    }

    #[test]
    fn test_arity_check() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(1));
        assert!(Arity::AtLeast(1).accepts(3));
        assert!(!Arity::AtLeast(1).accepts(0));
    }

    #[test]
    fn test_bad_arity_message() {
        let err = DispatchError::BadArity {
            name: "pay".into(),
            required: 2,
            given: 1,
        };
        assert_eq!(
            err.to_string(),
            "Command 'pay' requires 2 positional argument(s), 1 given"
        );
    }
}
