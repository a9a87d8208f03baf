//! Resolves a [`CommandPolicy`] for a given operation.
//!
//! Lookup order: explicit override by `operation_name`, then by
//! `metadata["operation"]`, then the configured default. The resolver holds
//! its configuration behind an `RwLock` so it can be hot-reloaded — callers
//! must tolerate that two calls in a row may return different instances.

use std::sync::RwLock;

use crate::config::{CommandPoliciesConfig, CommandPolicy};

#[derive(Debug)]
pub struct CommandPolicyResolver {
    config: RwLock<CommandPoliciesConfig>,
}

impl CommandPolicyResolver {
    pub fn new(config: CommandPoliciesConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace the active configuration, taking effect on the next lookup.
    pub fn reload(&self, config: CommandPoliciesConfig) {
        *self.config.write().unwrap() = config;
    }

    #[must_use]
    pub fn resolve(&self, operation_name: &str, metadata_operation: Option<&str>) -> CommandPolicy {
        let config = self.config.read().unwrap();
        if let Some(policy) = config.commands.get(operation_name) {
            return policy.clone();
        }
        if let Some(op) = metadata_operation {
            if let Some(policy) = config.commands.get(op) {
                return policy.clone();
            }
        }
        config.default.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver_with(overrides: &[(&str, CommandPolicy)]) -> CommandPolicyResolver {
        let mut commands = HashMap::new();
        for (name, policy) in overrides {
            commands.insert((*name).to_string(), policy.clone());
        }
        CommandPolicyResolver::new(CommandPoliciesConfig {
            default: CommandPolicy::default(),
            commands,
        })
    }

    #[test]
    fn unknown_operation_falls_back_to_default() {
        let resolver = resolver_with(&[]);
        let policy = resolver.resolve("NoSuchOperation", None);
        assert_eq!(policy, CommandPolicy::default());
    }

    #[test]
    fn operation_name_override_wins() {
        let custom = CommandPolicy {
            max_attempts: 5,
            ..CommandPolicy::default()
        };
        let resolver = resolver_with(&[("ReviseAndEvaluate", custom.clone())]);
        assert_eq!(resolver.resolve("ReviseAndEvaluate", Some("other")), custom);
    }

    #[test]
    fn metadata_operation_is_used_when_name_has_no_override() {
        let custom = CommandPolicy {
            max_attempts: 3,
            ..CommandPolicy::default()
        };
        let resolver = resolver_with(&[("evaluate", custom.clone())]);
        let policy = resolver.resolve("SomeHandlerClassName", Some("evaluate"));
        assert_eq!(policy, custom);
    }

    #[test]
    fn reload_takes_effect_on_next_lookup() {
        let resolver = resolver_with(&[]);
        assert_eq!(resolver.resolve("x", None).max_attempts, 1);
        resolver.reload(CommandPoliciesConfig {
            default: CommandPolicy {
                max_attempts: 9,
                ..CommandPolicy::default()
            },
            commands: HashMap::new(),
        });
        assert_eq!(resolver.resolve("x", None).max_attempts, 9);
    }
}
