//! Buffered, structured logging on top of [`tracing`].
//!
//! Every call to [`AsyncLogBuffer::log`] emits a `tracing` event immediately
//! (so `RUST_LOG` consumers get live visibility) and queues a [`LogEntry`]
//! for batched persistence through a [`LogSink`]. Flushing is guarded by a
//! single-permit semaphore acquired with `try_acquire` so overlapping flush
//! attempts postpone rather than queue, matching the non-blocking contract
//! the dispatcher relies on at its hottest path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{event, Level};

use crate::error::CoreResult;
use crate::log_scope::LogScope;

/// Categories that are always persisted regardless of `other_logs`.
const ALWAYS_PERSISTED: &[&str] = &[
    "Command",
    "ModelPrompt",
    "ModelCompletion",
    "ModelRequest",
    "ModelResponse",
];

/// Categories broadcast live regardless of the persistence filter.
const LIVE_BROADCAST_ALLOWLIST: &[&str] = &["Command", "General"];

const MODEL_TRAFFIC_CATEGORIES: &[&str] =
    &["ModelPrompt", "ModelCompletion", "ModelRequest", "ModelResponse"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogResult {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub category: String,
    pub message: String,
    pub exception: Option<String>,
    pub thread_id: u64,
    pub thread_scope: Option<String>,
    pub story_correlation_id: Option<String>,
    pub agent_name: Option<String>,
    pub model_name: Option<String>,
    pub step_number: Option<u64>,
    pub max_step: Option<u64>,
    pub chat_text: Option<String>,
    pub result: Option<LogResult>,
    pub result_fail_reason: Option<String>,
    pub examined: bool,
}

/// Abstract persistence destination for flushed log entries.
///
/// The core never depends on a concrete log table; a host application
/// supplies an implementation (an actual database writer in production, an
/// in-memory sink in tests — see [`InMemoryLogSink`] below).
#[async_trait]
pub trait LogSink: Send + Sync + std::fmt::Debug {
    async fn persist(&self, entries: &[LogEntry]) -> CoreResult<()>;

    /// Update the verdict of the most recent persisted model-response row
    /// for `thread_id`. A no-op for sinks that don't track that row.
    async fn mark_latest_model_response(
        &self,
        _thread_id: u64,
        _result: LogResult,
        _fail_reason: Option<String>,
        _examined: bool,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// Reference sink used by tests and the demonstration binary.
#[derive(Debug, Default)]
pub struct InMemoryLogSink {
    rows: Mutex<Vec<LogEntry>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl InMemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `persist` call fail once, to exercise the buffer's
    /// head-reinsertion-on-failure behavior in tests.
    pub fn fail_next_persist(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<LogEntry> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl LogSink for InMemoryLogSink {
    async fn persist(&self, entries: &[LogEntry]) -> CoreResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(crate::error::CoreError::Io(std::io::Error::other(
                "simulated persistence failure",
            )));
        }
        self.rows.lock().await.extend_from_slice(entries);
        Ok(())
    }

    async fn mark_latest_model_response(
        &self,
        thread_id: u64,
        result: LogResult,
        fail_reason: Option<String>,
        examined: bool,
    ) -> CoreResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows
            .iter_mut()
            .rev()
            .find(|r| r.thread_id == thread_id && MODEL_TRAFFIC_CATEGORIES.contains(&r.category.as_str()))
        {
            row.result = Some(result);
            row.result_fail_reason = fail_reason;
            row.examined = examined;
        }
        Ok(())
    }
}

pub struct AsyncLogBuffer {
    sink: Arc<dyn LogSink>,
    pending: Mutex<VecDeque<LogEntry>>,
    batch_size: usize,
    log_tool_responses: bool,
    other_logs: bool,
    flush_permit: Semaphore,
    appended_tx: broadcast::Sender<Vec<LogEntry>>,
    op_counter: AtomicU64,
    self_weak: std::sync::Weak<AsyncLogBuffer>,
}

impl std::fmt::Debug for AsyncLogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLogBuffer")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl AsyncLogBuffer {
    pub fn new(
        sink: Arc<dyn LogSink>,
        batch_size: usize,
        log_tool_responses: bool,
        other_logs: bool,
    ) -> Arc<Self> {
        let (appended_tx, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak| Self {
            sink,
            pending: Mutex::new(VecDeque::new()),
            batch_size,
            log_tool_responses,
            other_logs,
            flush_permit: Semaphore::new(1),
            appended_tx,
            op_counter: AtomicU64::new(0),
            self_weak: weak.clone(),
        })
    }

    pub fn subscribe_appended(&self) -> broadcast::Receiver<Vec<LogEntry>> {
        self.appended_tx.subscribe()
    }

    /// Allocate the next monotonic operation id (the "thread id" of log
    /// records), assigned once per command on first dispatch.
    pub fn next_operation_id(&self) -> u64 {
        self.op_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue a structured log entry, deriving `result` from content when the
    /// caller didn't supply one. Never blocks: if the pending queue crosses
    /// `batch_size` a flush is only *attempted* via a non-blocking permit.
    pub async fn log(
        &self,
        level: &str,
        category: &str,
        message: &str,
        exception: Option<String>,
        result: Option<LogResult>,
    ) {
        if category == "ModelResponse" && !self.log_tool_responses && message.starts_with("[tool]") {
            return;
        }

        let frame = LogScope::current();
        let entry = LogEntry {
            ts: Utc::now(),
            level: level.to_string(),
            category: category.to_string(),
            message: message.to_string(),
            exception,
            thread_id: frame.as_ref().map(|f| f.operation_id).unwrap_or_default(),
            thread_scope: None,
            story_correlation_id: frame.as_ref().and_then(|f| f.story_correlation_id.clone()),
            agent_name: frame.as_ref().and_then(|f| f.agent_name.clone()),
            model_name: None,
            step_number: frame.as_ref().and_then(|f| f.step_number),
            max_step: frame.as_ref().and_then(|f| f.max_step),
            chat_text: None,
            result: result.or_else(|| derive_result(category, level, message)),
            result_fail_reason: None,
            examined: false,
        };

        emit_tracing_event(&entry);
        self.enqueue(entry).await;
    }

    /// Specialized entry for an outbound model prompt; `chat_text` captures
    /// the salient excerpt (the last user message).
    pub async fn log_prompt(&self, model_name: &str, last_user_message: &str) {
        self.log_chat("ModelPrompt", model_name, last_user_message).await;
    }

    /// Specialized entry for a model response; `chat_text` captures the
    /// assistant content or a tool-call summary. Dropped entirely when the
    /// response role is `tool` and tool-response logging is disabled.
    pub async fn log_response(&self, model_name: &str, role: &str, content: &str) {
        if role == "tool" && !self.log_tool_responses {
            return;
        }
        self.log_chat("ModelResponse", model_name, content).await;
    }

    async fn log_chat(&self, category: &str, model_name: &str, chat_text: &str) {
        let frame = LogScope::current();
        let entry = LogEntry {
            ts: Utc::now(),
            level: "Information".to_string(),
            category: category.to_string(),
            message: chat_text.to_string(),
            exception: None,
            thread_id: frame.as_ref().map(|f| f.operation_id).unwrap_or_default(),
            thread_scope: None,
            story_correlation_id: frame.as_ref().and_then(|f| f.story_correlation_id.clone()),
            agent_name: frame.as_ref().and_then(|f| f.agent_name.clone()),
            model_name: Some(model_name.to_string()),
            step_number: frame.as_ref().and_then(|f| f.step_number),
            max_step: frame.as_ref().and_then(|f| f.max_step),
            chat_text: Some(chat_text.to_string()),
            result: None,
            result_fail_reason: None,
            examined: false,
        };
        emit_tracing_event(&entry);
        self.enqueue(entry).await;
    }

    pub async fn mark_latest_model_response_result(
        &self,
        result: LogResult,
        fail_reason: Option<String>,
        examined: bool,
    ) {
        let Some(frame) = LogScope::current() else {
            return;
        };
        let _ = self
            .sink
            .mark_latest_model_response(frame.operation_id, result, fail_reason, examined)
            .await;
    }

    async fn enqueue(&self, entry: LogEntry) {
        // Live broadcast is independent of the persistence filter below: an
        // allow-listed entry is broadcast even when `other_logs` would drop
        // it from the persisted batch entirely.
        if LIVE_BROADCAST_ALLOWLIST.contains(&entry.category.as_str()) {
            let _ = self.appended_tx.send(vec![entry.clone()]);
        }

        let should_persist = ALWAYS_PERSISTED.contains(&entry.category.as_str()) || self.other_logs;
        if should_persist {
            let mut pending = self.pending.lock().await;
            pending.push_back(entry);
            if pending.len() >= self.batch_size {
                drop(pending);
                self.try_flush_in_background();
            }
        }
    }

    /// Best-effort, non-blocking flush trigger: hands the work to a
    /// detached task so `log()` never waits on sink I/O.
    fn try_flush_in_background(&self) {
        if let Some(strong) = self.self_weak.upgrade() {
            tokio::spawn(async move {
                strong.flush().await;
            });
        }
    }

    /// Flush whatever is pending, unless another flush is already in
    /// flight — in which case this call returns immediately without
    /// touching the queue. Safe to call from a periodic timer.
    pub async fn flush(&self) {
        let Ok(_permit) = self.flush_permit.try_acquire() else {
            return;
        };
        let batch: Vec<LogEntry> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        match self.sink.persist(&batch).await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(error = %err, count = batch.len(), "log flush failed, reinserting batch at head");
                let mut pending = self.pending.lock().await;
                for entry in batch.into_iter().rev() {
                    pending.push_front(entry);
                }
            }
        }
    }

    /// Spawn the periodic flush loop. Returns the join handle so callers can
    /// cancel it on shutdown.
    pub fn spawn_periodic_flush(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        })
    }

    #[cfg(test)]
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn emit_tracing_event(entry: &LogEntry) {
    match entry.level.as_str() {
        "Error" | "Fatal" => event!(Level::ERROR, category = %entry.category, message = %entry.message),
        "Warning" => event!(Level::WARN, category = %entry.category, message = %entry.message),
        "Debug" => event!(Level::DEBUG, category = %entry.category, message = %entry.message),
        _ => event!(Level::INFO, category = %entry.category, message = %entry.message),
    }
}

/// Derive a `SUCCESS`/`FAILED` verdict from level and message content.
///
/// Model-traffic categories are left `None`: payloads may legitimately
/// contain failure vocabulary (a story about a character's "failure") that
/// must not be mistaken for an operational result.
fn derive_result(category: &str, level: &str, message: &str) -> Option<LogResult> {
    if MODEL_TRAFFIC_CATEGORIES.contains(&category) {
        return None;
    }
    if level.eq_ignore_ascii_case("error") || level.eq_ignore_ascii_case("fatal") {
        return Some(LogResult::Failed);
    }
    let lower = message.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    const FAIL_WORDS: &[&str] = &["fail", "failed", "failure", "error", "errors", "exception"];
    const SUCCESS_WORDS: &[&str] = &["success", "successful", "completed", "passed"];
    if words.iter().any(|w| FAIL_WORDS.contains(w)) {
        return Some(LogResult::Failed);
    }
    if words.iter().any(|w| SUCCESS_WORDS.contains(w)) {
        return Some(LogResult::Success);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> (Arc<AsyncLogBuffer>, Arc<InMemoryLogSink>) {
        let sink = Arc::new(InMemoryLogSink::new());
        let buf = AsyncLogBuffer::new(sink.clone(), 4, false, false);
        (buf, sink)
    }

    #[test]
    fn derives_failed_from_error_level() {
        let result = derive_result("General", "Information", "Operation completed successfully");
        assert_eq!(result, Some(LogResult::Success));
    }

    #[test]
    fn derives_failed_from_message_vocabulary() {
        let result = derive_result("General", "Information", "Model responded: error code 500");
        assert_eq!(result, Some(LogResult::Failed));
    }

    #[test]
    fn model_traffic_never_derives_a_result() {
        let result = derive_result("ModelResponse", "Information", "Model responded: error code 500");
        assert_eq!(result, None);
    }

    #[test]
    fn error_level_forces_failed_regardless_of_words() {
        let result = derive_result("General", "Error", "all good here");
        assert_eq!(result, Some(LogResult::Failed));
    }

    #[tokio::test]
    async fn log_persists_command_category_immediately_eligible_for_flush() {
        let (buf, sink) = buffer();
        buf.log("Information", "Command", "enqueued", None, None).await;
        buf.flush().await;
        assert_eq!(sink.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn other_logs_disabled_drops_uncategorized_entries() {
        let (buf, sink) = buffer();
        buf.log("Information", "Diagnostics", "chatter", None, None).await;
        buf.flush().await;
        assert!(sink.rows().await.is_empty());
    }

    #[tokio::test]
    async fn general_category_is_live_broadcast_even_when_not_persisted() {
        let (buf, sink) = buffer();
        let mut rx = buf.subscribe_appended();
        buf.log("Information", "General", "chatter", None, None).await;
        let broadcast = rx.try_recv().expect("General is allow-listed for live broadcast");
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].message, "chatter");
        buf.flush().await;
        assert!(sink.rows().await.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_reinserts_batch_at_head_preserving_order() {
        let (buf, sink) = buffer();
        buf.log("Information", "Command", "first", None, None).await;
        buf.log("Information", "Command", "second", None, None).await;
        sink.fail_next_persist();
        buf.flush().await;
        assert_eq!(buf.pending_len().await, 2);
        buf.flush().await;
        let rows = sink.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "first");
        assert_eq!(rows[1].message, "second");
    }

    #[tokio::test]
    async fn tool_role_response_dropped_when_tool_logging_disabled() {
        let sink = Arc::new(InMemoryLogSink::new());
        let buf = AsyncLogBuffer::new(sink.clone(), 4, false, false);
        buf.log_response("local-primary", "tool", "tool result payload").await;
        buf.flush().await;
        assert!(sink.rows().await.is_empty());
    }

    #[tokio::test]
    async fn tool_role_response_kept_when_tool_logging_enabled() {
        let sink = Arc::new(InMemoryLogSink::new());
        let buf = AsyncLogBuffer::new(sink.clone(), 4, true, false);
        buf.log_response("local-primary", "tool", "tool result payload").await;
        buf.flush().await;
        assert_eq!(sink.rows().await.len(), 1);
    }
}
