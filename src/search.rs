use anyhow::Result;
use candle_core::Device;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::STATE_DIM;
use crate::config::{CurriculumConfig, DecisionMode};
use crate::controller::{CurriculumController, EnvironmentFactory, StageRunner};
use crate::critic::StageCritic;
use crate::pool::{CancellationToken, TaskOutcome, WorkerPool};

// =============================================================================
// Optimizer contract
// =============================================================================

/// Black-box minimizer over candidate vectors.
pub trait Optimizer {
    fn ask(&mut self) -> Vec<Vec<f32>>;
    fn tell(&mut self, candidates: &[Vec<f32>], costs: &[f64]);
    fn best(&self) -> Option<(&[f32], f64)>;
}

/// Uniform sampling of `[-1, 1]^dim`, keeping the best candidate seen.
pub struct RandomSearch {
    dim: usize,
    popsize: usize,
    rng: SmallRng,
    best: Option<(Vec<f32>, f64)>,
}

impl RandomSearch {
    pub fn new(dim: usize, popsize: usize, seed: u64) -> Self {
        Self {
            dim,
            popsize: popsize.max(1),
            rng: SmallRng::seed_from_u64(seed),
            best: None,
        }
    }
}

impl Optimizer for RandomSearch {
    fn ask(&mut self) -> Vec<Vec<f32>> {
        (0..self.popsize)
            .map(|_| (0..self.dim).map(|_| self.rng.random_range(-1.0..=1.0)).collect())
            .collect()
    }

    fn tell(&mut self, candidates: &[Vec<f32>], costs: &[f64]) {
        for (c, &cost) in candidates.iter().zip(costs) {
            if cost.is_finite() && self.best.as_ref().is_none_or(|(_, b)| cost < *b) {
                self.best = Some((c.clone(), cost));
            }
        }
    }

    fn best(&self) -> Option<(&[f32], f64)> {
        self.best.as_ref().map(|(c, b)| (c.as_slice(), *b))
    }
}

// =============================================================================
// Sweep
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub generations: usize,
    pub popsize: usize,
    pub workers: usize,
    pub seed: u64,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub index: usize,
    /// Infinite when the run failed or was cancelled.
    pub cost: f64,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub generation: usize,
    pub best_cost: f64,
    pub candidates: Vec<CandidateReport>,
}

/// Number of critic parameters a candidate vector must provide.
pub fn candidate_dim(config: &CurriculumConfig) -> Result<usize> {
    let critic = StageCritic::new(&Device::Cpu, config.cl_depth * STATE_DIM, &config.critic)?;
    critic.num_params()
}

fn write_candidate(config: &CurriculumConfig, weights: &[f32], path: &Path) -> Result<()> {
    let mut critic =
        StageCritic::new(&Device::Cpu, config.cl_depth * STATE_DIM, &config.critic)?;
    critic.set_flat_params(weights)?;
    critic.save(path)
}

fn write_generation_log(dir: &Path, report: &GenerationReport, best: &[f32]) -> Result<()> {
    let path = dir.join(format!("sweep-g{:04}.txt", report.generation));
    let mut f = std::io::BufWriter::new(File::create(path)?);
    writeln!(f, "{}", report.best_cost)?;
    writeln!(f, "{best:?}\n\n")?;
    for c in &report.candidates {
        writeln!(f, "{:>3}: ({}, '{}')", c.index, c.cost, c.info)?;
    }
    Ok(())
}

/// Runs `generations` rounds of ask → evaluate → tell. Every candidate is a
/// full curriculum run steered by a critic holding the candidate's weights;
/// runs go to `{dir}/g{gen}-c{index}/` and execute on the worker pool.
pub fn sweep<O, M, R, F>(
    optimizer: &mut O,
    base: &CurriculumConfig,
    sweep: &SweepConfig,
    cancel: &CancellationToken,
    make: M,
) -> Result<Vec<GenerationReport>>
where
    O: Optimizer,
    M: Fn() -> (R, F) + Sync,
    R: StageRunner,
    F: EnvironmentFactory,
{
    base.validate()?;
    std::fs::create_dir_all(&sweep.dir)?;
    let pool = WorkerPool::new(sweep.workers);
    let mut history = Vec::new();

    for generation in 0..sweep.generations {
        if cancel.is_cancelled() {
            warn!("sweep cancelled before generation {generation}");
            break;
        }
        let candidates = optimizer.ask();
        let mut configs = Vec::with_capacity(candidates.len());
        for (i, weights) in candidates.iter().enumerate() {
            let run_dir = sweep.dir.join(format!("g{generation:04}-c{i:03}"));
            let weights_path = run_dir.join("candidate.safetensors");
            write_candidate(base, weights, &weights_path)?;
            configs.push(CurriculumConfig {
                output: run_dir.join("ddpg-cl"),
                cl_save: run_dir.join("cl"),
                cl_load: Some(weights_path),
                decision: DecisionMode::Critic,
                ..base.clone()
            });
        }

        let entropy = sweep.seed ^ ((generation as u64) << 32);
        let results = pool.run(configs, cancel, |i, cfg, token| {
            let (runner, factory) = make();
            let mut controller =
                CurriculumController::new(cfg, runner, factory).with_cancellation(token.clone());
            controller.run(entropy.wrapping_add(i as u64))
        })?;

        let mut reports = Vec::with_capacity(results.len());
        for r in results {
            let (cost, info) = match r.outcome {
                TaskOutcome::Completed(s) => (s.cost, s.cl_info),
                TaskOutcome::Failed(e) => (f64::INFINITY, format!("failed: {e}")),
                TaskOutcome::Cancelled => (f64::INFINITY, "cancelled".to_string()),
            };
            reports.push(CandidateReport {
                index: r.id,
                cost,
                info,
            });
        }
        let costs: Vec<f64> = reports.iter().map(|r| r.cost).collect();
        optimizer.tell(&candidates, &costs);

        let (best, best_cost) = optimizer
            .best()
            .map(|(c, b)| (c.to_vec(), b))
            .unwrap_or((Vec::new(), f64::INFINITY));
        let report = GenerationReport {
            generation,
            best_cost,
            candidates: reports,
        };
        write_generation_log(&sweep.dir, &report, &best)?;
        info!("generation {generation}: best cost {best_cost:.3}");
        history.push(report);

        let file = File::create(sweep.dir.join("sweep.json"))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &history)?;
    }
    Ok(history)
}
