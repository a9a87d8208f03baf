//! Layered configuration for the dispatcher core.
//!
//! Follows the same layering convention used elsewhere in this codebase's
//! configuration surface: built-in defaults, then an optional TOML file,
//! then environment overrides prefixed `COMMAND_CORE_`. All of it is
//! ordinary `serde`-deserialized data — nothing here depends on a running
//! dispatcher, so it can be constructed, hot-reloaded, and handed to the
//! `CommandPolicyResolver` and `IdleAutoOperations` independently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Retry/backoff policy resolved per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    pub max_attempts: u32,
    pub retry_delay_base_seconds: f64,
    pub retry_delay_max_seconds: f64,
    pub exponential_backoff: bool,
    pub retry_on_failure_result: bool,
    pub retry_on_exception: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay_base_seconds: 1.0,
            retry_delay_max_seconds: 30.0,
            exponential_backoff: true,
            retry_on_failure_result: false,
            retry_on_exception: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPoliciesConfig {
    pub default: CommandPolicy,
    pub commands: HashMap<String, CommandPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleTaskConfig {
    pub enabled: bool,
    pub priority: i32,
}

impl Default for IdleTaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomaticOperationsConfig {
    pub enabled: bool,
    pub idle_seconds: u64,
    pub ignored_operations: Vec<String>,
    pub tasks: HashMap<String, IdleTaskConfig>,
}

impl Default for AutomaticOperationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_seconds: 300,
            ignored_operations: Vec::new(),
            tasks: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub log_request_response: bool,
    pub log_tool_responses: bool,
    pub other_logs: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval_ms: 5_000,
            log_request_response: true,
            log_tool_responses: false,
            other_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSwitchConfig {
    pub local_kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub automatic_operations: AutomaticOperationsConfig,
    pub command_policies: CommandPoliciesConfig,
    pub logger: LoggerConfig,
    pub model_switch: ModelSwitchConfig,
}

impl CoreConfig {
    /// Load configuration from built-in defaults, an optional TOML file at
    /// `path`, and `COMMAND_CORE_*` environment overrides, in that order.
    pub fn load(path: Option<&str>) -> crate::error::CoreResult<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults)?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("COMMAND_CORE")
                .separator("__")
                .try_parsing(true),
        );
        let built = builder.build()?;
        Ok(built.try_deserialize()?)
    }
}
