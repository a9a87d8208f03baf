//! Rotates through a configured set of maintenance tasks while the
//! dispatcher is quiescent, enqueuing at most one at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::AutomaticOperationsConfig;
use crate::dispatcher::CommandDispatcher;

const TICK_PERIOD: Duration = Duration::from_secs(10);

/// One candidate maintenance operation. Rebuilt fresh on every tick by the
/// caller supplying [`IdleAutoOperations::run_once`] with a task list, since
/// a task owns no persistent state of its own — the scheduler keeps the
/// only carried-over state (timestamps, round-robin cursor).
pub struct IdleTask {
    pub name: String,
    pub priority: i32,
    pub has_candidate: Box<dyn Fn() -> bool + Send + Sync>,
    pub try_enqueue: Box<dyn Fn() -> bool + Send + Sync>,
}

impl std::fmt::Debug for IdleTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTask")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

struct Cursor {
    last_activity: Instant,
    last_attempt: Instant,
    last_task_index: Option<usize>,
}

pub struct IdleAutoOperations {
    dispatcher: Arc<CommandDispatcher>,
    cursor: Mutex<Cursor>,
}

impl std::fmt::Debug for IdleAutoOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleAutoOperations").finish_non_exhaustive()
    }
}

impl IdleAutoOperations {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        let now = Instant::now();
        Self {
            dispatcher,
            cursor: Mutex::new(Cursor {
                last_activity: now,
                last_attempt: now,
                last_task_index: None,
            }),
        }
    }

    /// Spawn the 10-second tick loop. `build_tasks` is invoked on every
    /// tick to obtain the current candidate list, so configuration
    /// hot-reloads between ticks are picked up automatically.
    pub fn spawn(
        self: Arc<Self>,
        config: Arc<tokio::sync::RwLock<AutomaticOperationsConfig>>,
        build_tasks: impl Fn() -> Vec<IdleTask> + Send + Sync + 'static,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_PERIOD);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.cancelled() => return,
                }
                let cfg = config.read().await.clone();
                self.run_once(&cfg, build_tasks()).await;
            }
        })
    }

    /// Execute a single idle tick against the given configuration and
    /// candidate list. Exposed standalone so callers (and tests) can drive
    /// it deterministically without waiting on the 10-second timer.
    pub async fn run_once(&self, config: &AutomaticOperationsConfig, mut tasks: Vec<IdleTask>) {
        if !config.enabled {
            return;
        }

        let ignored: HashSet<&str> = config.ignored_operations.iter().map(String::as_str).collect();
        let active = self.dispatcher.get_active_commands().await;
        let non_ignored_busy = active.iter().any(|c| {
            !ignored.contains(c.operation_name.as_str())
                && matches!(
                    c.status,
                    crate::dispatcher::CommandStatus::Queued
                        | crate::dispatcher::CommandStatus::Running
                        | crate::dispatcher::CommandStatus::Retrying
                )
        });

        let idle_threshold = Duration::from_secs(config.idle_seconds);
        let now = Instant::now();

        if non_ignored_busy {
            let mut cursor = self.cursor.lock().await;
            cursor.last_activity = now;
            return;
        }

        {
            let cursor = self.cursor.lock().await;
            if now.duration_since(cursor.last_activity) < idle_threshold
                || now.duration_since(cursor.last_attempt) < idle_threshold
            {
                return;
            }
        }

        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        let eligible: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| (t.has_candidate)())
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            self.cursor.lock().await.last_attempt = now;
            return;
        }

        let mut cursor = self.cursor.lock().await;
        let start_after = cursor.last_task_index.unwrap_or(usize::MAX);
        let next_index = eligible
            .iter()
            .find(|&&i| start_after == usize::MAX || i > start_after)
            .or_else(|| eligible.first())
            .copied()
            .unwrap();

        let task = &tasks[next_index];
        if (task.try_enqueue)() {
            cursor.last_activity = now;
            cursor.last_attempt = now;
            cursor.last_task_index = Some(next_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandPoliciesConfig, CommandPolicy};
    use crate::dispatcher::EnqueueOptions;
    use crate::log_buffer::{AsyncLogBuffer, InMemoryLogSink};
    use crate::policy::CommandPolicyResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_dispatcher() -> Arc<CommandDispatcher> {
        make_dispatcher_with_policies(CommandPoliciesConfig::default())
    }

    fn make_dispatcher_with_policies(policies: CommandPoliciesConfig) -> Arc<CommandDispatcher> {
        let resolver = Arc::new(CommandPolicyResolver::new(policies));
        let log_buffer = AsyncLogBuffer::new(Arc::new(InMemoryLogSink::new()), 100, false, false);
        CommandDispatcher::new(resolver, log_buffer)
    }

    fn cfg(idle_seconds: u64) -> AutomaticOperationsConfig {
        AutomaticOperationsConfig {
            enabled: true,
            idle_seconds,
            ignored_operations: Vec::new(),
            tasks: Default::default(),
        }
    }

    fn always_eligible_task(name: &str, priority: i32, calls: Arc<AtomicUsize>) -> IdleTask {
        let name_owned = name.to_string();
        IdleTask {
            name: name_owned,
            priority,
            has_candidate: Box::new(|| true),
            try_enqueue: Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            }),
        }
    }

    #[tokio::test]
    async fn disabled_config_skips_entirely() {
        let idle = IdleAutoOperations::new(make_dispatcher());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = cfg(0);
        config.enabled = false;
        idle.run_once(&config, vec![always_eligible_task("x", 1, calls.clone())]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_candidates_updates_last_attempt_without_enqueuing() {
        let idle = IdleAutoOperations::new(make_dispatcher());
        let task = IdleTask {
            name: "never".to_string(),
            priority: 1,
            has_candidate: Box::new(|| false),
            try_enqueue: Box::new(|| panic!("must not be called")),
        };
        idle.run_once(&cfg(0), vec![task]).await;
    }

    // Timing-sensitive: touches real `Instant`-based cursor state, so it
    // must not interleave with another test mutating the same clock
    // window in this binary.
    #[serial_test::serial]
    #[tokio::test]
    async fn rotates_round_robin_between_two_eligible_tasks() {
        let idle = IdleAutoOperations::new(make_dispatcher());
        let x_calls = Arc::new(AtomicUsize::new(0));
        let y_calls = Arc::new(AtomicUsize::new(0));

        idle.run_once(
            &cfg(0),
            vec![
                always_eligible_task("X", 1, x_calls.clone()),
                always_eligible_task("Y", 1, y_calls.clone()),
            ],
        )
        .await;
        assert_eq!(x_calls.load(Ordering::SeqCst), 1);
        assert_eq!(y_calls.load(Ordering::SeqCst), 0);

        // Force idle again so the tick proceeds past the threshold guard.
        idle.cursor.lock().await.last_activity = Instant::now() - Duration::from_secs(60);
        idle.cursor.lock().await.last_attempt = Instant::now() - Duration::from_secs(60);

        idle.run_once(
            &cfg(0),
            vec![
                always_eligible_task("X", 1, x_calls.clone()),
                always_eligible_task("Y", 1, y_calls.clone()),
            ],
        )
        .await;
        assert_eq!(x_calls.load(Ordering::SeqCst), 1);
        assert_eq!(y_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_dispatcher_updates_activity_and_skips() {
        let dispatcher = make_dispatcher();
        let handler: crate::dispatcher::CommandHandler = Arc::new(|_ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(crate::dispatcher::CommandResult::ok("done"))
            })
        });
        dispatcher
            .enqueue("Busy", handler, EnqueueOptions::default())
            .unwrap();

        let idle = IdleAutoOperations::new(dispatcher);
        let calls = Arc::new(AtomicUsize::new(0));
        idle.run_once(&cfg(0), vec![always_eligible_task("x", 1, calls.clone())]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retrying_command_counts_as_busy() {
        let dispatcher = make_dispatcher_with_policies(CommandPoliciesConfig {
            default: CommandPolicy {
                max_attempts: 2,
                retry_delay_base_seconds: 1.0,
                retry_delay_max_seconds: 5.0,
                exponential_backoff: true,
                retry_on_failure_result: false,
                retry_on_exception: true,
            },
            commands: Default::default(),
        });
        let handler: crate::dispatcher::CommandHandler = Arc::new(|_ctx| {
            Box::pin(async move { Err(crate::error::CoreError::HandlerException("boom".into())) })
        });
        let handle = dispatcher
            .enqueue("Flaky", handler, EnqueueOptions::default())
            .unwrap();

        // Give the first attempt time to fail and enter its backoff sleep,
        // where the command sits as `Retrying` rather than a terminal state.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let snapshot = dispatcher.get_snapshot(handle.run_id()).await.unwrap();
        assert_eq!(snapshot.status, crate::dispatcher::CommandStatus::Retrying);

        let idle = IdleAutoOperations::new(dispatcher);
        let calls = Arc::new(AtomicUsize::new(0));
        idle.run_once(&cfg(0), vec![always_eligible_task("x", 1, calls.clone())]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
