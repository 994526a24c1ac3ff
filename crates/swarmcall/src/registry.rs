//! Local command registry — the procedures this node exposes to peers.

use crate::channel::CommandHandler;
use swarmcall_types::error::{SwarmError, SwarmResult};
use swarmcall_types::manifest::Manifest;

/// Insertion-ordered map of command name to handler.
///
/// Owned exclusively by the [`Session`](crate::session::Session) for its
/// lifetime; the registry only grows. Re-registering an existing name is
/// an accepted no-op and the original handler stays active. That quirk
/// governs which handler a newly-connected peer sees under contention and
/// is part of the observable contract, not an accident to fix.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<(String, CommandHandler)>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command.
    ///
    /// Returns `Ok(true)` when the name was newly inserted, `Ok(false)`
    /// when it was already taken (the existing handler is kept). Fails
    /// with [`SwarmError::InvalidArgument`] on an empty or all-whitespace
    /// name; a failed registration never mutates the registry.
    pub fn register(&mut self, name: &str, handler: CommandHandler) -> SwarmResult<bool> {
        if name.trim().is_empty() {
            return Err(SwarmError::InvalidArgument(
                "command name must be a non-empty string".to_string(),
            ));
        }
        if self.commands.iter().any(|(n, _)| n == name) {
            return Ok(false);
        }
        self.commands.push((name.to_string(), handler));
        Ok(true)
    }

    /// Register a batch of commands. Returns the names that were newly
    /// inserted; already-registered names are skipped per the
    /// [`register`](Self::register) contract.
    pub fn register_all<I>(&mut self, pairs: I) -> SwarmResult<Vec<String>>
    where
        I: IntoIterator<Item = (String, CommandHandler)>,
    {
        let mut added = Vec::new();
        for (name, handler) in pairs {
            if self.register(&name, handler)? {
                added.push(name);
            }
        }
        Ok(added)
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.commands
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h.clone())
    }

    /// Snapshot the registered names as a manifest, in registration order.
    pub fn manifest(&self) -> Manifest {
        Manifest::new(self.commands.iter().map(|(n, _)| n.clone()).collect())
    }

    /// Iterate over registered commands in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CommandHandler)> {
        self.commands.iter().map(|(n, h)| (n.as_str(), h))
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.manifest().commands)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{handler, InboundRequest, ReplySink};
    use serde_json::{json, Value};
    use tokio::sync::oneshot;

    async fn invoke(registry: &CommandRegistry, name: &str, args: Vec<Value>) -> Value {
        let h = registry.get(name).expect("command not registered");
        let (tx, rx) = oneshot::channel();
        let request = InboundRequest {
            id: 1,
            command: name.to_string(),
            arguments: args.clone(),
        };
        h(args, ReplySink::new(tx), request).await;
        rx.await.expect("handler dropped reply").expect("handler failed")
    }

    #[tokio::test]
    async fn test_reregistration_keeps_first_handler() {
        let mut registry = CommandRegistry::new();
        assert!(registry
            .register("greet", handler(|_| async { Ok(json!("first")) }))
            .unwrap());
        // Second registration under the same name is accepted but inert.
        assert!(!registry
            .register("greet", handler(|_| async { Ok(json!("second")) }))
            .unwrap());

        assert_eq!(registry.len(), 1);
        assert_eq!(invoke(&registry, "greet", vec![]).await, json!("first"));
    }

    #[test]
    fn test_invalid_name_never_mutates() {
        let mut registry = CommandRegistry::new();
        for bad in ["", "   ", "\t"] {
            let err = registry
                .register(bad, handler(|_| async { Ok(Value::Null) }))
                .unwrap_err();
            assert!(matches!(err, SwarmError::InvalidArgument(_)));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_manifest_preserves_registration_order() {
        let mut registry = CommandRegistry::new();
        for name in ["zulu", "alpha", "mike"] {
            registry
                .register(name, handler(|_| async { Ok(Value::Null) }))
                .unwrap();
        }
        assert_eq!(registry.manifest().commands, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn test_register_all_reports_only_new_names() {
        let mut registry = CommandRegistry::new();
        registry
            .register("a", handler(|_| async { Ok(Value::Null) }))
            .unwrap();

        let added = registry
            .register_all(vec![
                ("a".to_string(), handler(|_| async { Ok(Value::Null) })),
                ("b".to_string(), handler(|_| async { Ok(Value::Null) })),
            ])
            .unwrap();
        assert_eq!(added, vec!["b"]);
        assert_eq!(registry.len(), 2);
    }
}
