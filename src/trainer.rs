use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::checkpoint::Checkpointer;
use crate::config::CriticConfig;
use crate::critic::StageCritic;
use crate::error::CurriculumError;
use crate::pool::CancellationToken;
use crate::replay::ReplayBuffer;

/// Rows per forward pass when scoring a whole buffer.
const EVAL_CHUNK: usize = 4096;

/// Mean absolute TD error over every transition of `rb`.
pub fn full_td_error(critic: &StageCritic, rb: &ReplayBuffer) -> Result<f32> {
    let mut weighted = 0.0f64;
    let mut n = 0usize;
    for batch in rb.chunks(EVAL_CHUNK) {
        weighted += critic.td_error(&batch)? as f64 * batch.len() as f64;
        n += batch.len();
    }
    Ok(if n == 0 { 0.0 } else { (weighted / n as f64) as f32 })
}

// =============================================================================
// TD-error series
// =============================================================================

/// Minibatch, full-train and held-out TD errors, one entry per evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TdSeries {
    pub iteration: Vec<usize>,
    pub minibatch: Vec<f32>,
    pub train: Vec<f32>,
    pub test: Vec<f32>,
}

impl TdSeries {
    pub fn len(&self) -> usize {
        self.iteration.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iteration.is_empty()
    }

    fn push(&mut self, iteration: usize, minibatch: f32, train: f32, test: f32) {
        self.iteration.push(iteration);
        self.minibatch.push(minibatch);
        self.train.push(train);
        self.test.push(test);
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open TD-error series {}", path.display()))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

// =============================================================================
// Offline Critic Training
// =============================================================================

#[derive(Debug)]
pub struct TrainOutcome {
    pub iterations: usize,
    pub series: TdSeries,
    pub weights: PathBuf,
    pub series_path: PathBuf,
}

pub struct CriticTrainer<'a> {
    critic: &'a mut StageCritic,
    config: &'a CriticConfig,
    checkpointer: Checkpointer,
    save_path: PathBuf,
    rng: SmallRng,
    /// Iterations already behind the critic.
    start: usize,
}

impl<'a> CriticTrainer<'a> {
    /// Final weights go to `save_path`; periodic snapshots beside it.
    pub fn new(
        critic: &'a mut StageCritic,
        config: &'a CriticConfig,
        save_path: PathBuf,
        seed: u64,
    ) -> Result<Self> {
        let checkpointer =
            Checkpointer::beside(&save_path, config.save_every, config.keep_checkpoints)?;
        Ok(Self {
            critic,
            config,
            checkpointer,
            save_path,
            rng: SmallRng::seed_from_u64(seed),
            start: 0,
        })
    }

    /// Loads the newest periodic snapshot into the critic and counts
    /// iterations on from it. `None` when there is nothing to resume.
    pub fn resume(&mut self) -> Result<Option<usize>> {
        let resumed = self.checkpointer.load_latest(&mut *self.critic)?;
        self.start = resumed.unwrap_or(0);
        Ok(resumed)
    }

    pub fn train(
        &mut self,
        train: &ReplayBuffer,
        test: &ReplayBuffer,
        cancel: &CancellationToken,
    ) -> Result<TrainOutcome> {
        if train.is_empty() {
            return Err(CurriculumError::InsufficientData {
                requested: self.config.minibatch_size,
                available: 0,
            }
            .into());
        }
        let minibatch = self.config.minibatch_size.min(train.len());
        let eval_every = self.config.eval_every.max(1);
        let mut series = TdSeries::default();
        let mut loss_sum = 0.0f64;
        let t_start = Instant::now();

        let mut done = self.start;
        for it in self.start + 1..=self.config.iterations {
            if cancel.is_cancelled() {
                info!("critic training interrupted at iteration {it}");
                break;
            }
            let batch = train.sample_batch(minibatch, &mut self.rng)?;
            loss_sum += self.critic.train_step(&batch)? as f64;
            done = it;

            if it.is_multiple_of(eval_every) {
                let mb = self.critic.td_error(&batch)?;
                let tr = full_td_error(&*self.critic, train)?;
                let te = full_td_error(&*self.critic, test)?;
                series.push(it, mb, tr, te);
                info!(
                    "it {:>7} | loss {:>9.5} | td mb {:>8.5} train {:>8.5} test {:>8.5} | {:.0} it/s",
                    it,
                    loss_sum / eval_every as f64,
                    mb,
                    tr,
                    te,
                    (it - self.start) as f64 / t_start.elapsed().as_secs_f64().max(1e-9)
                );
                loss_sum = 0.0;
            }
            self.checkpointer.maybe_save(it, &*self.critic)?;
        }

        self.critic.save(&self.save_path)?;
        let series_path = series_path(&self.save_path);
        series.save(&series_path)?;
        info!(
            "critic saved to {} after {done} iterations",
            self.save_path.display()
        );
        Ok(TrainOutcome {
            iterations: done,
            series,
            weights: self.save_path.clone(),
            series_path,
        })
    }
}

/// `{weights}_td_error.json`
pub fn series_path(weights: &Path) -> PathBuf {
    let mut s = weights.as_os_str().to_owned();
    s.push("_td_error.json");
    PathBuf::from(s)
}
