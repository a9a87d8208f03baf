//! Command dispatcher and automatic-operations core for a multi-agent
//! content pipeline.
//!
//! This crate is the fabric a host application embeds: a
//! [`dispatcher::CommandDispatcher`] that runs arbitrary async work under
//! scope-serialization, priority, and retry rules; an
//! [`idle_ops::IdleAutoOperations`] scheduler that rotates maintenance
//! tasks while the dispatcher is quiescent; [`triggers::ReactiveTrigger`]
//! subscribers that chain follow-up work off completions; a
//! [`provider_switch::ModelProviderSwitch`] that keeps at most one local
//! model backend alive; and an [`log_buffer::AsyncLogBuffer`] that
//! correlates every log line with its originating command.
//!
//! Domain logic, persistence, and transport are deliberately absent — the
//! core consumes them through the ports in [`ports`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod idle_ops;
pub mod log_buffer;
pub mod log_scope;
pub mod periodic;
pub mod policy;
pub mod ports;
pub mod provider_switch;
pub mod triggers;

pub use config::CoreConfig;
pub use dispatcher::{
    CommandCompletedEvent, CommandContext, CommandDispatcher, CommandHandle, CommandHandler,
    CommandResult, CommandSnapshot, CommandStatus, EnqueueOptions,
};
pub use error::{CoreError, CoreResult};
