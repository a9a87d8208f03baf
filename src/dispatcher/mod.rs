//! Command dispatch: queueing, scope serialization, retries, and completion.

mod core;
mod types;

pub use core::CommandDispatcher;
pub use types::{
    CommandCompletedEvent, CommandContext, CommandHandle, CommandHandler, CommandResult,
    CommandSnapshot, CommandStatus, EnqueueOptions,
};
