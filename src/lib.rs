pub const STATE_DIM: usize = 4;
pub type Features = [f32; STATE_DIM];

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod critic;
pub mod dataset;
pub mod episode;
pub mod error;
pub mod monitor;
pub mod normalize;
pub mod pool;
pub mod replay;
pub mod search;
pub mod stage;
pub mod surrogate;
pub mod tracker;
pub mod trainer;

pub use config::{
    CriticConfig, CurriculumConfig, DamageMode, DatasetConfig, DecisionMode, StageConfig,
};
pub use controller::{
    CurriculumController, Decision, Environment, EnvironmentFactory, Policy, RunSummary,
    StageOutcome, StagePolicy, StageRunner, run_cost,
};
pub use critic::StageCritic;
pub use error::CurriculumError;
pub use episode::{EpisodeRecord, StepSample, Summarizer, Trajectory};
pub use pool::{CancellationToken, TaskOutcome, WorkerPool};
pub use replay::{Batch, ReplayBuffer, Transition};
pub use search::{Optimizer, RandomSearch, SweepConfig};
pub use stage::{Stage, StageEncoding};
pub use tracker::PerformanceTracker;
pub use trainer::{CriticTrainer, TdSeries};
