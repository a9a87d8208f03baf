//! Debounces "memory saved" notifications into a single backfill command,
//! replaying at most once more if requests arrive while one is already
//! running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatcher::{CommandDispatcher, CommandHandler, CommandResult, EnqueueOptions};

/// Runs `memory_embedding_worker` at most once at a time; a request that
/// arrives while one is in flight sets a rerun flag instead of enqueuing a
/// second overlapping command, and exactly one replay follows once the
/// in-flight run completes.
#[derive(Debug)]
pub struct EmbeddingBackfillWorker {
    dispatcher: Arc<CommandDispatcher>,
    running: AtomicBool,
    rerun_requested: AtomicBool,
    handler: CommandHandler,
}

impl EmbeddingBackfillWorker {
    pub fn new(dispatcher: Arc<CommandDispatcher>, handler: CommandHandler) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            running: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            handler,
        })
    }

    /// Called on startup and whenever the "memory saved" hook fires.
    pub fn request(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            self.rerun_requested.store(true, Ordering::SeqCst);
            return;
        }
        self.spawn_run();
    }

    fn spawn_run(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let handler = Arc::clone(&worker.handler);
                let result = worker
                    .dispatcher
                    .enqueue(
                        "memory_embedding_worker",
                        handler,
                        EnqueueOptions::default().with_thread_scope("memory/embedding"),
                    )
                    .map(|handle| handle.completion());

                match result {
                    Ok(completion) => {
                        completion.await;
                    }
                    Err(_duplicate) => {}
                }

                if !worker.rerun_requested.swap(false, Ordering::SeqCst) {
                    worker.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandPoliciesConfig;
    use crate::log_buffer::{AsyncLogBuffer, InMemoryLogSink};
    use crate::policy::CommandPolicyResolver;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn make_dispatcher() -> Arc<CommandDispatcher> {
        let resolver = Arc::new(CommandPolicyResolver::new(CommandPoliciesConfig::default()));
        let log_buffer = AsyncLogBuffer::new(Arc::new(InMemoryLogSink::new()), 100, false, false);
        CommandDispatcher::new(resolver, log_buffer)
    }

    #[tokio::test]
    async fn concurrent_requests_collapse_into_one_replay() {
        let dispatcher = make_dispatcher();
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();
        let handler: CommandHandler = Arc::new(move |_ctx| {
            let invocations = invocations_clone.clone();
            Box::pin(async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(CommandResult::ok("backfilled"))
            })
        });

        let worker = EmbeddingBackfillWorker::new(dispatcher, handler);
        worker.request();
        tokio::time::sleep(Duration::from_millis(5)).await;
        worker.request();
        worker.request();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }
}
