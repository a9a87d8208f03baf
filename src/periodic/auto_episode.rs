//! Picks the most-behind active series and assembles a compound command to
//! generate its next episode, selecting a writer by weighted random choice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::{CommandDispatcher, CommandHandler, CommandResult, EnqueueOptions};

#[derive(Debug, Clone)]
pub struct ActiveSeries {
    pub id: Uuid,
    pub completed_episode_count: u32,
}

#[derive(Debug, Clone)]
pub struct WriterCandidate {
    pub agent_name: String,
    pub score: f64,
}

#[async_trait]
pub trait SeriesStore: Send + Sync + std::fmt::Debug {
    async fn active_series(&self) -> Vec<ActiveSeries>;
    async fn writer_candidates(&self, series_id: Uuid) -> Vec<WriterCandidate>;
}

/// Runs on a configurable interval, always picking the series with the
/// fewest completed episodes so no series is starved of attention.
#[derive(Debug)]
pub struct AutoStateDrivenEpisode {
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<dyn SeriesStore>,
    handler: CommandHandler,
}

impl AutoStateDrivenEpisode {
    pub fn new(dispatcher: Arc<CommandDispatcher>, store: Arc<dyn SeriesStore>, handler: CommandHandler) -> Self {
        Self {
            dispatcher,
            store,
            handler,
        }
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.cancelled() => return,
                }
                self.run_once().await;
            }
        })
    }

    pub async fn run_once(&self) {
        let mut series = self.store.active_series().await;
        if series.is_empty() {
            return;
        }
        series.sort_by_key(|s| s.completed_episode_count);
        let target = &series[0];

        let candidates = self.store.writer_candidates(target.id).await;
        let Some(writer) = self.pick_writer(&candidates) else {
            return;
        };

        let mut metadata = HashMap::new();
        metadata.insert("seriesId".to_string(), target.id.to_string());
        metadata.insert("agentName".to_string(), writer.clone());

        let handler = Arc::clone(&self.handler);
        let _ = self.dispatcher.enqueue(
            "AutoGenerateSeriesEpisode",
            handler,
            EnqueueOptions::default()
                .with_thread_scope(format!("series/{}", target.id))
                .with_metadata(metadata)
                .with_run_id(format!(
                    "auto_episode_{}_{}",
                    target.id,
                    target.completed_episode_count + 1
                )),
        );
    }

    /// Weighted-random pick over `score`-derived weights, biased toward
    /// higher-scoring writers without ever fully excluding a low scorer.
    fn pick_writer(&self, candidates: &[WriterCandidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<f64> = candidates.iter().map(|c| c.score.max(0.0001)).collect();
        let total: f64 = weights.iter().sum();
        let mut roll: f64 = rand::random::<f64>() * total;
        for (candidate, weight) in candidates.iter().zip(weights.iter()) {
            if roll < *weight {
                return Some(candidate.agent_name.clone());
            }
            roll -= weight;
        }
        candidates.last().map(|c| c.agent_name.clone())
    }
}
