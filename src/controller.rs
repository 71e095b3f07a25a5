//! Curriculum Controller.
//!
//! Sequences the stages of one curriculum run. Each iteration hands one
//! bounded training stage to the [`StageRunner`], accumulates its damage and
//! step usage, records an online transition for the stage-value critic and
//! decides whether to hold, advance or finish. The run ends on budget
//! exhaustion or once the target return is reached, and is scored by
//! [`run_cost`].

use anyhow::Result;
use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::STATE_DIM;
use crate::config::{CurriculumConfig, DecisionMode, PreviousStage, StageConfig, derive_seed};
use crate::critic::{StageCritic, checkpoint_l2_norm};
use crate::episode::StepSample;
use crate::normalize::DatasetNorm;
use crate::pool::CancellationToken;
use crate::replay::{ReplayBuffer, Transition};
use crate::stage::Stage;
use crate::tracker::{PerformanceTracker, TrackerSummary};

// =============================================================================
// Collaborators
// =============================================================================

/// Maps an observation to an action. Supplied by the training loop.
pub trait Policy {
    fn act(&mut self, observation: &[f32]) -> Vec<f32>;
}

/// One stage's simulated task. Built fresh for every stage.
pub trait Environment {
    /// Plays one episode with `policy` and reports it step by step.
    fn run_episode(&mut self, policy: &mut dyn Policy) -> Result<Vec<StepSample>>;
    fn close(&mut self) -> Result<()>;
}

pub trait EnvironmentFactory {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Environment>>;
}

/// What the training loop reports after one bounded stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub avg_test_return: f64,
    /// Damage incurred during this stage only.
    pub damage: f64,
    pub steps: u64,
    /// The training loop's own suggestion for the next stage.
    pub next_stage: Option<Stage>,
}

/// The low-level policy training loop. It pushes one record per finished
/// episode into `tracker`.
pub trait StageRunner {
    fn run_stage(
        &mut self,
        env: &mut dyn Environment,
        tracker: &mut PerformanceTracker,
        stage: Stage,
        config: &StageConfig,
    ) -> Result<StageOutcome>;
}

// =============================================================================
// Stage decisions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Advance(Stage),
    Finish,
}

/// Chooses the next stage from a finished stage's outcome.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    pub mode: DecisionMode,
    pub stages: Vec<Stage>,
    pub monotonic: bool,
    pub reach_return: f64,
}

impl StagePolicy {
    pub fn from_config(config: &CurriculumConfig) -> Self {
        Self {
            mode: config.decision,
            stages: config.stages.clone(),
            monotonic: config.monotonic,
            reach_return: config.reach_return(),
        }
    }

    fn is_final(&self, stage: Stage) -> bool {
        self.stages.last() == Some(&stage)
    }

    /// Candidate stages after `current`, kept as data for the critic. The
    /// final stage is locked: the run stays on it until it ends.
    pub fn candidates(&self, current: Stage) -> Vec<Stage> {
        if self.is_final(current) {
            return vec![current];
        }
        self.stages
            .iter()
            .copied()
            .filter(|&s| !self.monotonic || s >= current)
            .collect()
    }

    fn following(&self, current: Stage) -> Option<Stage> {
        self.stages.iter().copied().find(|&s| s > current)
    }

    fn threshold(&self, current: Stage, outcome: &StageOutcome) -> Decision {
        if outcome.avg_test_return <= self.reach_return {
            return Decision::Hold;
        }
        match self.following(current) {
            Some(next) if !self.is_final(current) => Decision::Advance(next),
            _ => Decision::Finish,
        }
    }

    fn to(current: Stage, next: Stage) -> Decision {
        if next == current {
            Decision::Hold
        } else {
            Decision::Advance(next)
        }
    }

    /// `critic` is consulted only in [`DecisionMode::Critic`] and only once
    /// it has been trained; before that the threshold rule applies.
    pub fn decide(
        &self,
        current: Stage,
        outcome: &StageOutcome,
        state: &[f32],
        critic: Option<&StageCritic>,
    ) -> Result<Decision> {
        let reached = outcome.avg_test_return > self.reach_return;
        let decision = match self.mode {
            DecisionMode::FollowRunner => {
                if reached {
                    Decision::Finish
                } else {
                    match outcome.next_stage {
                        Some(next) if self.candidates(current).contains(&next) => {
                            Self::to(current, next)
                        }
                        Some(next) => {
                            warn!("ignoring suggested stage {next} after {current}");
                            Decision::Hold
                        }
                        None => Decision::Hold,
                    }
                }
            }
            DecisionMode::Threshold => self.threshold(current, outcome),
            DecisionMode::Critic => match critic {
                _ if reached && self.is_final(current) => Decision::Finish,
                Some(c) => match c.best_stage(state, &self.candidates(current))? {
                    Some(next) => Self::to(current, next),
                    None => Decision::Hold,
                },
                None => self.threshold(current, outcome),
            },
        };
        Ok(decision)
    }
}

// =============================================================================
// Cost
// =============================================================================

/// Scalar score of a finished run. Runs that miss the target are charged
/// at least `default_damage`.
pub fn run_cost(damage: f64, reached: bool, default_damage: f64, reg: f64) -> f64 {
    if reached {
        damage + reg
    } else {
        default_damage.max(damage) + reg
    }
}

/// `cl_l2_reg · ‖θ‖₂` of the critic checkpoint named by `cl_load`, or 0 when
/// disabled or the checkpoint does not exist.
pub fn regularization(config: &CurriculumConfig) -> Result<f64> {
    if config.cl_l2_reg == 0.0 {
        return Ok(0.0);
    }
    match &config.cl_load {
        Some(path) if path.exists() => Ok(config.cl_l2_reg * checkpoint_l2_norm(path)?),
        _ => Ok(0.0),
    }
}

/// `{path}.replay.bin`: the curriculum transitions saved beside a critic.
pub fn critic_replay_path(critic_path: &Path) -> PathBuf {
    let mut s = critic_path.as_os_str().to_owned();
    s.push(".replay.bin");
    PathBuf::from(s)
}

// =============================================================================
// Run summary
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub counter: usize,
    pub stage: Stage,
    pub steps: u64,
    pub damage: f64,
    pub avg_test_return: f64,
    /// Tracker window as it stood when the stage ended.
    pub window: Option<TrackerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub seed: u32,
    pub steps: u64,
    pub damage: f64,
    pub reached: bool,
    pub reg: f64,
    pub cost: f64,
    /// Stage names and their step counts, in the order they ran.
    pub cl_info: String,
    pub stages: Vec<StageReport>,
    pub last: Option<PreviousStage>,
}

impl RunSummary {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

// =============================================================================
// Curriculum Controller
// =============================================================================

pub struct CurriculumController<R, F> {
    config: CurriculumConfig,
    runner: R,
    factory: F,
    device: Device,
    cancel: CancellationToken,
}

impl<R: StageRunner, F: EnvironmentFactory> CurriculumController<R, F> {
    pub fn new(config: CurriculumConfig, runner: R, factory: F) -> Self {
        Self {
            config,
            runner,
            factory,
            device: Device::Cpu,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &CurriculumConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn tracker(&self) -> Result<PerformanceTracker> {
        let stats = match &self.config.pt_stats {
            Some(path) => {
                let stats = DatasetNorm::load(path)?.state;
                stats.expect_dim(STATE_DIM, path)?;
                Some(stats)
            }
            None => None,
        };
        Ok(PerformanceTracker::new(
            self.config.cl_depth,
            self.config.cl_input_norm,
            stats,
        ))
    }

    /// Critic and transition store carried over from `cl_load`, if any.
    fn curriculum_state(&self, state_len: usize) -> Result<(Option<StageCritic>, ReplayBuffer, bool)> {
        let cfg = &self.config;
        let load = cfg.cl_load.as_deref().filter(|p| p.exists());

        let rb_path = cfg.cl_load.as_deref().map(critic_replay_path);
        let rb = match rb_path.filter(|p| p.exists()) {
            Some(p) => {
                let rb = ReplayBuffer::load_into(&p, cfg.rb_max_size)?;
                info!("loaded {} curriculum transitions from {}", rb.len(), p.display());
                rb
            }
            None => ReplayBuffer::new(cfg.rb_max_size, state_len),
        };

        if cfg.decision != DecisionMode::Critic {
            return Ok((None, rb, false));
        }
        let mut critic = StageCritic::new(&self.device, state_len, &cfg.critic)?
            .with_stages(cfg.stages.clone());
        let loaded = match load {
            Some(path) => {
                critic.load(path)?;
                info!("loaded curriculum critic from {}", path.display());
                true
            }
            None => false,
        };
        Ok((Some(critic), rb, loaded))
    }

    /// Runs one curriculum. `entropy` seeds the run when no explicit seed is
    /// configured.
    pub fn run(&mut self, entropy: u64) -> Result<RunSummary> {
        self.config.validate()?;
        let seed = derive_seed(self.config.seed, entropy);
        let reg = regularization(&self.config)?;
        let policy = StagePolicy::from_config(&self.config);
        let mut tracker = self.tracker()?;
        let (mut critic, mut rb, mut critic_ready) = self.curriculum_state(tracker.state_len())?;
        let mut rng = SmallRng::seed_from_u64(seed as u64);

        let budget = self.config.steps;
        let mut stage = self.config.starting_stage;
        let mut steps_done = 0u64;
        let mut damage = 0.0f64;
        let mut counter = 0usize;
        let mut previous: Option<PreviousStage> = None;
        let mut reached = false;
        let mut cl_info = String::new();
        let mut reports = Vec::new();

        info!(
            "curriculum run {} (seed {seed}, budget {budget}, reach {})",
            self.config.output.display(),
            policy.reach_return
        );

        while steps_done < budget {
            if self.cancel.is_cancelled() {
                warn!("run {} cancelled", self.config.output.display());
                break;
            }
            let sc = self.config.stage_config(
                stage,
                counter,
                budget - steps_done,
                seed,
                previous.as_ref(),
            );
            cl_info.push_str(stage.name());
            cl_info.push(' ');

            let state_before = tracker.state();
            let mut env = self.factory.create(&sc)?;
            let outcome = self.runner.run_stage(env.as_mut(), &mut tracker, stage, &sc);
            env.close()?;
            let outcome = outcome?;
            anyhow::ensure!(outcome.steps > 0, "stage {stage} consumed no steps");

            damage += outcome.damage;
            steps_done += outcome.steps;
            cl_info.push_str(&format!("{:<7} ", outcome.steps));
            let window = tracker.summary();
            if let Some(w) = &window {
                debug!("tracker window mean {:?} trend {:?}", w.mean, w.trend);
            }
            reports.push(StageReport {
                counter,
                stage,
                steps: outcome.steps,
                damage: outcome.damage,
                avg_test_return: outcome.avg_test_return,
                window,
            });

            let state_after = tracker.state();
            let decision = match policy.decide(
                stage,
                &outcome,
                &state_after,
                critic.as_ref().filter(|_| critic_ready),
            )? {
                Decision::Advance(next) if !sc.curriculum_enabled => {
                    warn!("curriculum is off on {stage}; not moving to {next}");
                    Decision::Hold
                }
                d => d,
            };
            let terminal = decision == Decision::Finish || steps_done >= budget;
            rb.add(Transition {
                state: state_before,
                stage,
                reward: -outcome.damage as f32,
                terminal,
                next_state: state_after,
            })?;
            if let Some(c) = critic.as_mut()
                && rb.ready(self.config.rb_min_size)
            {
                let batch = rb.sample_batch(self.config.critic.minibatch_size.min(rb.len()), &mut rng)?;
                let loss = c.train_step(&batch)?;
                debug!("curriculum critic loss {loss:.5}");
                critic_ready = true;
            }
            if let Some(c) = &critic {
                c.save(&sc.cl_save)?;
            }
            rb.save(critic_replay_path(&sc.cl_save))?;

            info!(
                "{:02} {:<22} return {:>9.2} | damage {:>9.2} | steps {:>7} ({}/{budget}) | {:?}",
                counter,
                stage.name(),
                outcome.avg_test_return,
                outcome.damage,
                outcome.steps,
                steps_done,
                decision
            );

            previous = Some(sc.as_previous());
            counter += 1;
            match decision {
                Decision::Finish => {
                    reached = true;
                    break;
                }
                // The target counts even when the budget ran out on a
                // stage that would otherwise advance.
                _ if steps_done >= budget && outcome.avg_test_return > policy.reach_return => {
                    reached = true;
                }
                Decision::Hold => {}
                Decision::Advance(next) => stage = next,
            }
        }

        let cost = run_cost(damage, reached, self.config.default_damage, reg);
        info!(
            "{} finished: damage {damage:.2}, steps {steps_done}, cost {cost:.2}",
            self.config.output.display()
        );
        Ok(RunSummary {
            seed,
            steps: steps_done,
            damage,
            reached,
            reg,
            cost,
            cl_info,
            stages: reports,
            last: previous,
        })
    }
}
