//! Command data model: the types every dispatcher operation is built from.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResult {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Frozen view of a command exposed to its handler.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub run_id: String,
    pub operation_name: String,
    pub metadata: HashMap<String, String>,
    pub operation_number: u64,
    pub cancellation_token: CancellationToken,
}

pub type CommandHandler =
    Arc<dyn Fn(CommandContext) -> BoxFuture<'static, CoreResult<CommandResult>> + Send + Sync>;

pub(super) type PinnedHandlerFuture = Pin<Box<dyn std::future::Future<Output = CoreResult<CommandResult>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

/// Options accepted by [`crate::dispatcher::CommandDispatcher::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub run_id: Option<String>,
    pub thread_scope: Option<String>,
    pub metadata: HashMap<String, String>,
    pub priority: Option<i32>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn with_thread_scope(mut self, scope: impl Into<String>) -> Self {
        self.thread_scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Immutable point-in-time view of a command, as returned by
/// `GetActiveCommands` and friends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSnapshot {
    pub run_id: String,
    pub operation_name: String,
    pub thread_scope: String,
    pub priority: i32,
    pub metadata: HashMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: CommandStatus,
    pub retry_count: u32,
    pub current_step: Option<u64>,
    pub max_step: Option<u64>,
    pub error_message: Option<String>,
}

/// Internal, mutable record backing one command for its whole lifetime.
pub(super) struct CommandRecord {
    pub run_id: String,
    pub operation_name: AsyncMutex<String>,
    pub thread_scope: String,
    pub priority: i32,
    pub metadata: HashMap<String, String>,
    pub handler: CommandHandler,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: AsyncMutex<Option<DateTime<Utc>>>,
    pub completed_at: AsyncMutex<Option<DateTime<Utc>>>,
    pub status: AsyncMutex<CommandStatus>,
    pub retry_count: AtomicU32,
    pub current_step: AsyncMutex<Option<u64>>,
    pub max_step: AsyncMutex<Option<u64>>,
    pub error_message: AsyncMutex<Option<String>>,
    pub operation_id: once_cell::sync::OnceCell<u64>,
    pub cancellation: CancellationToken,
    pub result_tx: watch::Sender<Option<CommandResult>>,
    pub result_rx: watch::Receiver<Option<CommandResult>>,
}

impl CommandRecord {
    pub async fn snapshot(&self) -> CommandSnapshot {
        CommandSnapshot {
            run_id: self.run_id.clone(),
            operation_name: self.operation_name.lock().await.clone(),
            thread_scope: self.thread_scope.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
            enqueued_at: self.enqueued_at,
            started_at: *self.started_at.lock().await,
            completed_at: *self.completed_at.lock().await,
            status: *self.status.lock().await,
            retry_count: self.retry_count.load(AtomicOrdering::SeqCst),
            current_step: *self.current_step.lock().await,
            max_step: *self.max_step.lock().await,
            error_message: self.error_message.lock().await.clone(),
        }
    }

    pub async fn is_terminal(&self) -> bool {
        matches!(
            *self.status.lock().await,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

/// One item in a per-scope ready queue, ordered by ascending priority then
/// ascending enqueue time (FIFO among equal priorities).
pub(super) struct QueueItem {
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub seq: u64,
    pub run_id: String,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueued_at == other.enqueued_at && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    /// `BinaryHeap::pop` returns the "greatest" item; we want that to be the
    /// lowest-priority-number, earliest-enqueued item, so every comparison
    /// below is inverted relative to natural ordering.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle returned by `enqueue`, letting the caller await completion or read
/// back identity fields without holding a reference to the dispatcher's
/// internal table.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    pub run_id: String,
    pub operation_name: String,
    pub(super) enqueued_at: DateTime<Utc>,
    pub(super) result_rx: watch::Receiver<Option<CommandResult>>,
}

impl CommandHandle {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    #[must_use]
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Resolve once the command reaches a terminal state.
    pub async fn completion(&self) -> CommandResult {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return CommandResult::failed("dispatcher dropped before completion");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandCompletedEvent {
    pub run_id: String,
    pub operation_name: String,
    pub success: bool,
    pub message: Option<String>,
}
