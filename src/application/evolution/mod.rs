pub mod worker;

pub use worker::{EvolutionThresholds, EvolutionWorker, WorkerStatus};
