//! Reactive triggers: subscribers to `CommandCompleted` that conditionally
//! enqueue follow-up commands.
//!
//! Each trigger runs its own `broadcast::Receiver`, so one trigger's
//! processing time or panic cannot delay or take down another — the same
//! isolation the dispatcher itself gives `CommandCompleted` subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::{CommandCompletedEvent, CommandDispatcher, CommandResult, EnqueueOptions};
use crate::ports::StoryStore;

/// A reactive trigger evaluated once per `CommandCompleted` event. `handle`
/// runs on a detached task so triggers never delay completion dispatch for
/// other subscribers.
#[async_trait]
pub trait ReactiveTrigger: Send + Sync + std::fmt::Debug {
    async fn handle(&self, event: &CommandCompletedEvent, dispatcher: &Arc<CommandDispatcher>);
}

/// Subscribes every registered trigger to the dispatcher's completion
/// stream and fans each event out to a detached task per trigger.
pub struct TriggerRegistry {
    triggers: Vec<Arc<dyn ReactiveTrigger>>,
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("count", &self.triggers.len())
            .finish_non_exhaustive()
    }
}

impl TriggerRegistry {
    pub fn new(triggers: Vec<Arc<dyn ReactiveTrigger>>) -> Self {
        Self { triggers }
    }

    pub fn spawn(self, dispatcher: Arc<CommandDispatcher>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut rx = dispatcher.subscribe_completed();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    recv = rx.recv() => match recv {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    () = shutdown.cancelled() => return,
                };
                for trigger in &self.triggers {
                    let trigger = Arc::clone(trigger);
                    let dispatcher = Arc::clone(&dispatcher);
                    let event = event.clone();
                    tokio::spawn(async move {
                        trigger.handle(&event, &dispatcher).await;
                    });
                }
            }
        })
    }
}

/// After a high-scoring evaluation completes, enqueues a follow-up
/// formatting pass on the story, unless it is already tagged.
#[derive(Debug)]
pub struct AutoFormatTrigger {
    store: Arc<dyn StoryStore>,
    evaluation_operation_name: String,
    min_evaluation_count: u32,
    min_average: f64,
}

impl AutoFormatTrigger {
    pub fn new(store: Arc<dyn StoryStore>) -> Self {
        Self {
            store,
            evaluation_operation_name: "EvaluateStory".to_string(),
            min_evaluation_count: 2,
            min_average: 65.0,
        }
    }
}

#[async_trait]
impl ReactiveTrigger for AutoFormatTrigger {
    async fn handle(&self, event: &CommandCompletedEvent, dispatcher: &Arc<CommandDispatcher>) {
        if !event.success || event.operation_name != self.evaluation_operation_name {
            return;
        }

        let Some(snapshot) = dispatcher.get_snapshot(&event.run_id).await else {
            return;
        };
        let Some(story_id) = snapshot.metadata.get("storyId").and_then(|s| s.parse::<Uuid>().ok()) else {
            return;
        };

        let Some(story) = self.store.get_story(story_id).await else {
            return;
        };
        if story.has_tagged_artifact {
            return;
        }

        let stats = self.store.get_evaluation_stats(story_id).await;
        if stats.count < self.min_evaluation_count || stats.average <= self.min_average {
            return;
        }

        let mut metadata = HashMap::new();
        metadata.insert("storyId".to_string(), story_id.to_string());
        metadata.insert("trigger".to_string(), "evaluate_story_completed".to_string());

        let handler: crate::dispatcher::CommandHandler = Arc::new(move |_ctx| {
            Box::pin(async move { Ok(CommandResult::ok("formatted")) })
        });

        let opts = EnqueueOptions::default()
            .with_thread_scope("story/format")
            .with_priority(2)
            .with_metadata(metadata)
            .with_run_id(format!("TransformStoryRawToTagged_{story_id}"));

        let _ = dispatcher.enqueue("TransformStoryRawToTagged", handler, opts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandPoliciesConfig;
    use crate::log_buffer::{AsyncLogBuffer, InMemoryLogSink};
    use crate::policy::CommandPolicyResolver;
    use crate::ports::{EvaluationStats, StorySummary};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    fn make_dispatcher() -> Arc<CommandDispatcher> {
        let resolver = Arc::new(CommandPolicyResolver::new(CommandPoliciesConfig::default()));
        let log_buffer = AsyncLogBuffer::new(Arc::new(InMemoryLogSink::new()), 100, false, false);
        CommandDispatcher::new(resolver, log_buffer)
    }

    #[derive(Debug)]
    struct FakeStore {
        tagged: bool,
        stats: EvaluationStats,
    }

    #[async_trait]
    impl StoryStore for FakeStore {
        async fn get_story(&self, id: Uuid) -> Option<StorySummary> {
            Some(StorySummary {
                id,
                has_tagged_artifact: self.tagged,
            })
        }
        async fn get_evaluation_stats(&self, _id: Uuid) -> EvaluationStats {
            self.stats.clone()
        }
        async fn get_latest_model_response_result(&self, _thread_id: u64) -> Option<String> {
            None
        }
    }

    #[derive(Debug)]
    struct WatchingTrigger {
        inner: AutoFormatTrigger,
        notify: Arc<Notify>,
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ReactiveTrigger for WatchingTrigger {
        async fn handle(&self, event: &CommandCompletedEvent, dispatcher: &Arc<CommandDispatcher>) {
            self.inner.handle(event, dispatcher).await;
            self.seen.lock().unwrap().push(event.run_id.clone());
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn high_evaluation_enqueues_formatting_command() {
        let dispatcher = make_dispatcher();
        let store = Arc::new(FakeStore {
            tagged: false,
            stats: EvaluationStats { count: 2, average: 70.0 },
        });
        let notify = Arc::new(Notify::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let trigger = Arc::new(WatchingTrigger {
            inner: AutoFormatTrigger::new(store.clone()),
            notify: notify.clone(),
            seen: seen.clone(),
        }) as Arc<dyn ReactiveTrigger>;

        let registry = TriggerRegistry::new(vec![trigger]);
        let shutdown = CancellationToken::new();
        let _handle = registry.spawn(dispatcher.clone(), shutdown.clone());

        let story_id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert("storyId".to_string(), story_id.to_string());

        let handler: crate::dispatcher::CommandHandler =
            Arc::new(|_ctx| Box::pin(async { Ok(CommandResult::ok("done")) }));
        let handle = dispatcher
            .enqueue(
                "EvaluateStory",
                handler,
                EnqueueOptions::default().with_metadata(metadata),
            )
            .unwrap();
        handle.completion().await;

        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();

        let follow_up_run_id = format!("TransformStoryRawToTagged_{story_id}");
        let snapshot = dispatcher.get_snapshot(&follow_up_run_id).await;
        assert!(snapshot.is_some());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn low_average_does_not_enqueue() {
        let dispatcher = make_dispatcher();
        let store = Arc::new(FakeStore {
            tagged: false,
            stats: EvaluationStats { count: 2, average: 60.0 },
        });
        let notify = Arc::new(Notify::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let trigger = Arc::new(WatchingTrigger {
            inner: AutoFormatTrigger::new(store.clone()),
            notify: notify.clone(),
            seen: seen.clone(),
        }) as Arc<dyn ReactiveTrigger>;

        let registry = TriggerRegistry::new(vec![trigger]);
        let shutdown = CancellationToken::new();
        let _handle = registry.spawn(dispatcher.clone(), shutdown.clone());

        let story_id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert("storyId".to_string(), story_id.to_string());

        let handler: crate::dispatcher::CommandHandler =
            Arc::new(|_ctx| Box::pin(async { Ok(CommandResult::ok("done")) }));
        let handle = dispatcher
            .enqueue(
                "EvaluateStory",
                handler,
                EnqueueOptions::default().with_metadata(metadata),
            )
            .unwrap();
        handle.completion().await;

        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();

        let follow_up_run_id = format!("TransformStoryRawToTagged_{story_id}");
        let snapshot = dispatcher.get_snapshot(&follow_up_run_id).await;
        assert!(snapshot.is_none());
        shutdown.cancel();
    }
}
