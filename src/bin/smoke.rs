//! Minimal runnable wiring of the dispatcher, idle scheduler, and a dummy
//! set of ports. Not a service — a demonstration that the pieces connect.

use std::sync::Arc;
use std::time::Duration;

use command_core::config::CoreConfig;
use command_core::dispatcher::{CommandDispatcher, CommandResult, EnqueueOptions};
use command_core::idle_ops::{IdleAutoOperations, IdleTask};
use command_core::log_buffer::{AsyncLogBuffer, InMemoryLogSink};
use command_core::policy::CommandPolicyResolver;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoreConfig::load(None).expect("default configuration always loads");

    let log_sink = Arc::new(InMemoryLogSink::new());
    let log_buffer = AsyncLogBuffer::new(
        log_sink.clone(),
        config.logger.batch_size,
        config.logger.log_tool_responses,
        config.logger.other_logs,
    );
    let _flush_handle = log_buffer
        .clone()
        .spawn_periodic_flush(Duration::from_millis(config.logger.flush_interval_ms));

    let policy_resolver = Arc::new(CommandPolicyResolver::new(config.command_policies.clone()));
    let dispatcher = CommandDispatcher::new(policy_resolver, log_buffer.clone());

    let handle = dispatcher
        .enqueue(
            "GenerateStoryDraft",
            Arc::new(|ctx| {
                Box::pin(async move {
                    tracing::info!(run_id = %ctx.run_id, "generating draft");
                    Ok(CommandResult::ok("draft generated"))
                })
            }),
            EnqueueOptions::default().with_thread_scope("story/42"),
        )
        .expect("unique run id");

    let result = handle.completion().await;
    tracing::info!(success = result.success, "smoke command finished");

    let idle = Arc::new(IdleAutoOperations::new(dispatcher.clone()));
    let idle_shutdown = CancellationToken::new();
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter_for_task = counter.clone();
    let tasks = move || {
        let counter = counter_for_task.clone();
        vec![IdleTask {
            name: "update_model_stats".to_string(),
            priority: 5,
            has_candidate: Box::new(|| true),
            try_enqueue: Box::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                true
            }),
        }]
    };
    let config_handle = Arc::new(tokio::sync::RwLock::new(config.automatic_operations.clone()));
    let _idle_handle = idle.spawn(config_handle, tasks, idle_shutdown.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    log_buffer.flush().await;
    tracing::info!(rows = log_sink.rows().await.len(), "buffered log rows");

    idle_shutdown.cancel();
}
