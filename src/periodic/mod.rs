//! Timer- and hook-driven background workers that submit work to the
//! dispatcher the same way any other producer does.

mod auto_episode;
mod cost_accounting;
mod embedding_backfill;

pub use auto_episode::AutoStateDrivenEpisode;
pub use cost_accounting::CostAccountant;
pub use embedding_backfill::EmbeddingBackfillWorker;
