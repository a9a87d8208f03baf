//! The command dispatcher itself: queueing, scope serialization, priority
//! ordering, retries, cancellation, and the `CommandCompleted` event.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::CommandPolicy;
use crate::error::{CoreError, CoreResult};
use crate::log_buffer::AsyncLogBuffer;
use crate::log_scope::{LogFrame, LogScope};
use crate::policy::CommandPolicyResolver;

use super::types::{
    CommandCompletedEvent, CommandContext, CommandHandle, CommandHandler, CommandRecord,
    CommandResult, CommandSnapshot, CommandStatus, EnqueueOptions, QueueItem,
};

struct ScopeState {
    heap: BinaryHeap<QueueItem>,
    running: bool,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            running: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.heap.is_empty() && !self.running
    }
}

pub struct CommandDispatcher {
    commands: DashMap<String, Arc<CommandRecord>>,
    scopes: DashMap<String, Arc<StdMutex<ScopeState>>>,
    policy_resolver: Arc<CommandPolicyResolver>,
    log_buffer: Arc<AsyncLogBuffer>,
    completed_tx: broadcast::Sender<CommandCompletedEvent>,
    shutdown: CancellationToken,
    seq_counter: AtomicU64,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("active_commands", &self.commands.len())
            .field("active_scopes", &self.scopes.len())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    pub fn new(policy_resolver: Arc<CommandPolicyResolver>, log_buffer: Arc<AsyncLogBuffer>) -> Arc<Self> {
        let (completed_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            commands: DashMap::new(),
            scopes: DashMap::new(),
            policy_resolver,
            log_buffer,
            completed_tx,
            shutdown: CancellationToken::new(),
            seq_counter: AtomicU64::new(0),
        })
    }

    /// Link a dispatcher-wide shutdown signal; cancelling it interrupts
    /// every in-flight command, including backoff sleeps between retries.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn subscribe_completed(&self) -> broadcast::Receiver<CommandCompletedEvent> {
        self.completed_tx.subscribe()
    }

    /// Submit a unit of work. `run_id` is assigned when absent, in the form
    /// `"{operation}_{yyyyMMddHHmmssfff}_{rand}"`.
    pub fn enqueue(
        self: &Arc<Self>,
        operation_name: impl Into<String>,
        handler: CommandHandler,
        opts: EnqueueOptions,
    ) -> CoreResult<CommandHandle> {
        let operation_name = operation_name.into();
        let run_id = opts.run_id.unwrap_or_else(|| generate_run_id(&operation_name));
        if self.commands.contains_key(&run_id) {
            return Err(CoreError::DuplicateRunId { run_id });
        }

        let thread_scope = opts.thread_scope.unwrap_or_else(|| "global".to_string());
        let priority = opts.priority.unwrap_or(5);
        let enqueued_at = Utc::now();
        let (result_tx, result_rx) = watch::channel(None);

        let record = Arc::new(CommandRecord {
            run_id: run_id.clone(),
            operation_name: tokio::sync::Mutex::new(operation_name.clone()),
            thread_scope: thread_scope.clone(),
            priority,
            metadata: opts.metadata,
            handler,
            enqueued_at,
            started_at: tokio::sync::Mutex::new(None),
            completed_at: tokio::sync::Mutex::new(None),
            status: tokio::sync::Mutex::new(CommandStatus::Queued),
            retry_count: AtomicU32::new(0),
            current_step: tokio::sync::Mutex::new(None),
            max_step: tokio::sync::Mutex::new(None),
            error_message: tokio::sync::Mutex::new(None),
            operation_id: once_cell::sync::OnceCell::new(),
            cancellation: self.shutdown.child_token(),
            result_tx,
            result_rx: result_rx.clone(),
        });

        // Reject duplicates atomically against the command table itself.
        if self.commands.insert(run_id.clone(), record.clone()).is_some() {
            return Err(CoreError::DuplicateRunId { run_id });
        }

        let seq = self.seq_counter.fetch_add(1, AtomicOrdering::Relaxed);
        let item = QueueItem {
            priority,
            enqueued_at,
            seq,
            run_id: run_id.clone(),
        };

        let scope_state = self
            .scopes
            .entry(thread_scope.clone())
            .or_insert_with(|| Arc::new(StdMutex::new(ScopeState::new())))
            .clone();

        let should_spawn = {
            let mut state = scope_state.lock().unwrap();
            state.heap.push(item);
            if !state.running {
                state.running = true;
                true
            } else {
                false
            }
        };

        if should_spawn {
            let dispatcher = Arc::clone(self);
            let scope_name = thread_scope.clone();
            tokio::spawn(async move {
                dispatcher.run_scope_worker(scope_name, scope_state).await;
            });
        }

        Ok(CommandHandle {
            run_id,
            operation_name,
            enqueued_at,
            result_rx,
        })
    }

    /// Immutable snapshot of every command not yet in a terminal state.
    pub async fn get_active_commands(&self) -> Vec<CommandSnapshot> {
        let mut out = Vec::new();
        for entry in self.commands.iter() {
            let record = entry.value().clone();
            if !record.is_terminal().await {
                out.push(record.snapshot().await);
            }
        }
        out
    }

    pub async fn get_snapshot(&self, run_id: &str) -> Option<CommandSnapshot> {
        let record = self.commands.get(run_id)?.value().clone();
        Some(record.snapshot().await)
    }

    pub async fn update_step(&self, run_id: &str, current: u64, max: u64) {
        if let Some(record) = self.commands.get(run_id) {
            *record.current_step.lock().await = Some(current);
            *record.max_step.lock().await = Some(max);
            LogScope::set_step(Some(current), Some(max));
        }
    }

    pub async fn update_retry(&self, run_id: &str, retry_count: u32) {
        if let Some(record) = self.commands.get(run_id) {
            record.retry_count.store(retry_count, AtomicOrdering::SeqCst);
        }
    }

    pub async fn update_operation_name(&self, run_id: &str, new_name: impl Into<String>) {
        if let Some(record) = self.commands.get(run_id) {
            *record.operation_name.lock().await = new_name.into();
        }
    }

    /// Resolve once `run_id` terminates. If it has already terminated the
    /// cached result is returned immediately.
    pub async fn wait_for_completion(&self, run_id: &str) -> CoreResult<CommandResult> {
        let record = self
            .commands
            .get(run_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::UnknownRunId {
                run_id: run_id.to_string(),
            })?;
        let mut rx = record.result_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return Ok(result);
            }
            if rx.changed().await.is_err() {
                return Ok(CommandResult::failed("dispatcher dropped before completion"));
            }
        }
    }

    async fn run_scope_worker(self: Arc<Self>, scope_name: String, scope_state: Arc<StdMutex<ScopeState>>) {
        loop {
            let next = {
                let mut state = scope_state.lock().unwrap();
                match state.heap.pop() {
                    Some(item) => Some(item),
                    None => {
                        state.running = false;
                        None
                    }
                }
            };

            let Some(item) = next else {
                // Reclaim the scope only if it is still idle: a racing
                // enqueue may have repopulated it between our pop and here.
                self.scopes.remove_if(&scope_name, |_, state| state.lock().unwrap().is_idle());
                return;
            };

            if let Some(record) = self.commands.get(&item.run_id).map(|e| e.value().clone()) {
                self.execute(record).await;
            }
        }
    }

    async fn execute(self: &Arc<Self>, record: Arc<CommandRecord>) {
        *record.status.lock().await = CommandStatus::Running;
        *record.started_at.lock().await = Some(Utc::now());

        let operation_id = *record
            .operation_id
            .get_or_init(|| self.log_buffer.next_operation_id());

        let operation_name = record.operation_name.lock().await.clone();
        let frame = LogFrame {
            name: operation_name.clone(),
            operation_id,
            agent_name: record.metadata.get("agentName").cloned(),
            story_correlation_id: record.metadata.get("storyId").cloned(),
            ..Default::default()
        };

        let dispatcher = Arc::clone(self);
        let record_for_root = Arc::clone(&record);
        let result = LogScope::root(frame, async move {
            dispatcher.retry_loop(record_for_root, operation_id).await
        })
        .await;

        let (status, command_result) = match result {
            Ok(res) if res.success => (CommandStatus::Completed, res),
            Ok(res) => (CommandStatus::Failed, res),
            Err(CoreError::Cancelled) => (
                CommandStatus::Cancelled,
                CommandResult::failed("cancelled"),
            ),
            Err(err) => (CommandStatus::Failed, CommandResult::failed(err.to_string())),
        };

        *record.status.lock().await = status;
        *record.completed_at.lock().await = Some(Utc::now());
        if !command_result.success {
            *record.error_message.lock().await = command_result.message.clone();
        }

        self.log_buffer
            .log(
                "Information",
                "Command",
                &format!("{} -> {:?}", record.run_id, status),
                None,
                None,
            )
            .await;

        let final_operation_name = record.operation_name.lock().await.clone();
        let _ = record.result_tx.send(Some(command_result.clone()));

        let event = CommandCompletedEvent {
            run_id: record.run_id.clone(),
            operation_name: final_operation_name,
            success: command_result.success,
            message: command_result.message,
        };
        // Subscribers are isolated: a broadcast send only clones the event,
        // it never runs subscriber code itself, so one panicking listener
        // cannot affect another or the dispatcher.
        let _ = self.completed_tx.send(event);
    }

    async fn retry_loop(
        self: &Arc<Self>,
        record: Arc<CommandRecord>,
        operation_id: u64,
    ) -> CoreResult<CommandResult> {
        let policy = self
            .policy_resolver
            .resolve(&record.operation_name.lock().await.clone(), record.metadata.get("operation").map(String::as_str));

        let mut attempt: u32 = 0;
        loop {
            if record.cancellation.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let ctx = CommandContext {
                run_id: record.run_id.clone(),
                operation_name: record.operation_name.lock().await.clone(),
                metadata: record.metadata.clone(),
                operation_number: operation_id,
                cancellation_token: record.cancellation.clone(),
            };

            let outcome = (record.handler)(ctx).await;

            // Cancellation is terminal and never retried, regardless of policy.
            if matches!(outcome, Err(CoreError::Cancelled)) {
                return outcome;
            }

            let should_retry = match &outcome {
                Ok(res) if res.success => false,
                Ok(_) => policy.retry_on_failure_result,
                Err(ref err) => err.is_recoverable() && policy.retry_on_exception,
            };

            let attempts_remain = attempt + 1 < policy.max_attempts;

            if !should_retry || !attempts_remain {
                return outcome;
            }

            attempt += 1;
            record.retry_count.store(attempt, AtomicOrdering::SeqCst);
            *record.status.lock().await = CommandStatus::Retrying;

            let delay = backoff_delay(&policy, attempt);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = record.cancellation.cancelled() => {
                    return Err(CoreError::Cancelled);
                }
            }
            *record.status.lock().await = CommandStatus::Running;
        }
    }
}

fn backoff_delay(policy: &CommandPolicy, attempt: u32) -> Duration {
    let base = policy.retry_delay_base_seconds.max(0.0);
    let raw = if policy.exponential_backoff {
        base * 2f64.powi(attempt as i32 - 1)
    } else {
        base * attempt as f64
    };
    Duration::from_secs_f64(raw.min(policy.retry_delay_max_seconds.max(0.0)))
}

fn generate_run_id(operation_name: &str) -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S%3f");
    let rand_suffix: u32 = rand::random();
    format!("{operation_name}_{ts}_{:06}", rand_suffix % 1_000_000)
}
