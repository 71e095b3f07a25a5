//! Deterministic stand-ins for the simulator and the policy training loop.
//!
//! The policy is a single "skill" scalar in `[0, 1]` that improves with
//! every episode. Higher skill means longer, calmer episodes with less
//! damage and, once walking, more distance. Everything is seeded from the
//! stage configuration, so the same run replays identically.

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::StageConfig;
use crate::controller::{Environment, EnvironmentFactory, Policy, StageOutcome, StageRunner};
use crate::episode::{StepSample, Summarizer};
use crate::monitor::{MonitorRow, MonitorWriter};
use crate::replay::{ReplayBuffer, Transition};
use crate::stage::Stage;
use crate::tracker::PerformanceTracker;

/// Observation width: stage id plus one progress value.
const OBS_DIM: usize = 2;
const DT: f64 = 0.03;

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn monitor_path(output: &Path) -> PathBuf {
    with_suffix(output, ".monitor.csv")
}

pub fn policy_path(output: &Path) -> PathBuf {
    with_suffix(output, ".policy.json")
}

pub fn policy_replay_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".policy-replay.bin")
}

// =============================================================================
// Environment
// =============================================================================

pub struct SkillPolicy {
    pub skill: f64,
}

impl Policy for SkillPolicy {
    fn act(&mut self, _observation: &[f32]) -> Vec<f32> {
        vec![self.skill as f32]
    }
}

pub struct SurrogateEnv {
    stage: Stage,
    /// Whether the observation carries the stage signal.
    curriculum: bool,
    rng: SmallRng,
    max_steps: usize,
    episodes: u64,
    closed: bool,
}

impl SurrogateEnv {
    pub fn new(stage: Stage, seed: u64, env_timeout: f64) -> Self {
        Self {
            stage,
            curriculum: true,
            rng: SmallRng::seed_from_u64(seed),
            max_steps: ((env_timeout / DT) as usize).max(1),
            episodes: 0,
            closed: false,
        }
    }

    pub fn with_curriculum(mut self, enabled: bool) -> Self {
        self.curriculum = enabled;
        self
    }

    pub fn observation(&self) -> [f32; OBS_DIM] {
        let stage = if self.curriculum {
            self.stage.index() as f32
        } else {
            0.0
        };
        [stage, (self.episodes as f32 / 100.0).min(1.0)]
    }
}

impl Environment for SurrogateEnv {
    fn run_episode(&mut self, policy: &mut dyn Policy) -> Result<Vec<StepSample>> {
        anyhow::ensure!(!self.closed, "environment already closed");
        let skill = policy
            .act(&self.observation())
            .first()
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0) as f64;
        let difficulty = 1.0 + self.stage.index() as f64;

        // Unskilled policies fall early.
        let len = ((self.max_steps as f64) * (0.2 + 0.8 * skill)) as usize;
        let len = len.clamp(1, self.max_steps);
        let mut damage = 0.0;
        let mut distance = 0.0;
        let mut steps = Vec::with_capacity(len);
        for _ in 0..len {
            let noise: f64 = self.rng.random_range(0.5..1.5);
            damage += 0.01 * difficulty * (1.0 - skill) * noise;
            if self.stage == Stage::Walk {
                distance += DT * skill * noise;
            }
            steps.push(StepSample {
                dt: DT,
                td_error: 300.0 * (1.0 - skill) * noise,
                complexity: difficulty,
                damage,
                distance,
            });
        }
        self.episodes += 1;
        Ok(steps)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub struct SurrogateFactory;

impl EnvironmentFactory for SurrogateFactory {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Environment>> {
        let seed = ((config.seed as u64) << 8) | config.counter as u64;
        Ok(Box::new(
            SurrogateEnv::new(config.stage, seed, config.env_timeout)
                .with_curriculum(config.curriculum_enabled),
        ))
    }
}

// =============================================================================
// Training loop
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SavedPolicy {
    skill: f64,
}

#[derive(Debug, Clone)]
pub struct SurrogateRunner {
    /// Skill of a policy that starts from scratch.
    pub initial_skill: f64,
    /// Fraction of the remaining skill gap closed per episode.
    pub learning_rate: f64,
    /// Stage length in episodes, unless the step budget runs out first.
    pub episodes_per_stage: usize,
    /// Episodes averaged into the reported test return.
    pub test_window: usize,
    /// Per-stage return the training loop itself uses to suggest advancing.
    pub advance_return: f64,
    skill: f64,
}

impl Default for SurrogateRunner {
    fn default() -> Self {
        Self {
            initial_skill: 0.05,
            learning_rate: 0.03,
            episodes_per_stage: 40,
            test_window: 5,
            advance_return: 600.0,
            skill: 0.05,
        }
    }
}

impl SurrogateRunner {
    pub fn skill(&self) -> f64 {
        self.skill
    }

    fn episode_return(stage: Stage, skill: f64, len: usize) -> f64 {
        let stage_weight = 1.0 + 0.5 * stage.index() as f64;
        1000.0 * skill * stage_weight * (len as f64 * DT / 10.0).min(1.0)
    }

    fn warm_start(&mut self, config: &StageConfig) -> Result<()> {
        self.skill = match config.load_file.as_deref().map(policy_path) {
            Some(p) if p.exists() => {
                let file = File::open(&p)
                    .with_context(|| format!("Failed to open policy {}", p.display()))?;
                let saved: SavedPolicy = serde_json::from_reader(std::io::BufReader::new(file))?;
                debug!("warm start from {} (skill {:.3})", p.display(), saved.skill);
                saved.skill
            }
            _ => self.initial_skill,
        };
        Ok(())
    }

    fn replay(config: &StageConfig) -> Result<ReplayBuffer> {
        match config.replay_load.as_deref().map(policy_replay_path) {
            Some(p) if p.exists() => ReplayBuffer::load_into(&p, config.rb_max_size),
            _ => Ok(ReplayBuffer::new(config.rb_max_size, OBS_DIM)),
        }
    }
}

impl StageRunner for SurrogateRunner {
    fn run_stage(
        &mut self,
        env: &mut dyn Environment,
        tracker: &mut PerformanceTracker,
        stage: Stage,
        config: &StageConfig,
    ) -> Result<StageOutcome> {
        self.warm_start(config)?;
        let mut replay = Self::replay(config)?;
        let summarizer = Summarizer::new(config.env_timeout, config.env_td_error_scale);
        let mut monitor = MonitorWriter::create(monitor_path(&config.output), stage.name())?;

        let mut steps_used = 0u64;
        let mut damage = 0.0f64;
        let mut returns = Vec::new();
        let mut obs = [stage.index() as f32, self.skill as f32];

        for _ in 0..self.episodes_per_stage {
            let remaining = config.steps.saturating_sub(steps_used) as usize;
            if remaining == 0 {
                break;
            }
            let mut policy = SkillPolicy { skill: self.skill };
            let mut samples = env.run_episode(&mut policy)?;
            samples.truncate(remaining);
            let Some(row) = summarizer.reduce_steps(&samples) else {
                break;
            };

            let ret = Self::episode_return(stage, self.skill, samples.len());
            steps_used += samples.len() as u64;
            damage += row.damage;
            let reward = -row.damage as f32;
            // Logged damage is cumulative over the stage.
            let row = MonitorRow { damage, ..row };
            tracker.add(summarizer.from_row(&row, stage));
            monitor.record(steps_used, ret, &row)?;
            returns.push(ret);

            self.skill += self.learning_rate * (1.0 - self.skill);
            let next_obs = [stage.index() as f32, self.skill as f32];
            replay.add(Transition {
                state: obs.to_vec(),
                stage,
                reward,
                terminal: false,
                next_state: next_obs.to_vec(),
            })?;
            obs = next_obs;
        }

        monitor.finish()?;
        replay.save(policy_replay_path(&config.replay_save))?;
        let file = File::create(policy_path(&config.output))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &SavedPolicy { skill: self.skill })?;

        let window = self.test_window.max(1).min(returns.len().max(1));
        let avg_test_return = if returns.is_empty() {
            0.0
        } else {
            returns[returns.len() - window..].iter().sum::<f64>() / window as f64
        };
        let next_stage = if !config.curriculum_enabled {
            Some(stage)
        } else if avg_test_return > self.advance_return {
            stage.next().or(Some(stage))
        } else {
            Some(stage)
        };
        Ok(StageOutcome {
            avg_test_return,
            damage,
            steps: steps_used,
            next_stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CurriculumConfig;
    use crate::monitor::read_log;

    fn stage_config(dir: &Path, steps: u64) -> StageConfig {
        let base = CurriculumConfig {
            output: dir.join("run"),
            cl_save: dir.join("cl"),
            ..Default::default()
        };
        base.stage_config(Stage::Balance, 0, steps, 7, None)
    }

    #[test]
    fn episodes_are_reproducible() {
        let run = || {
            let mut env = SurrogateEnv::new(Stage::Walk, 3, 20.0);
            env.run_episode(&mut SkillPolicy { skill: 0.5 }).unwrap()
        };
        let (a, b) = (run(), run());
        assert_eq!(a.len(), b.len());
        assert_eq!(a.last().unwrap().damage, b.last().unwrap().damage);
        assert!(a.last().unwrap().distance > 0.0);
    }

    #[test]
    fn runner_respects_budget_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let sc = stage_config(dir.path(), 1_000);
        let mut env = SurrogateFactory.create(&sc).unwrap();
        let mut tracker = PerformanceTracker::new(2, false, None);
        let mut runner = SurrogateRunner::default();
        let out = runner
            .run_stage(env.as_mut(), &mut tracker, Stage::Balance, &sc)
            .unwrap();

        assert!(out.steps <= 1_000 && out.steps > 0);
        assert!(out.damage > 0.0);
        assert_eq!(tracker.len(), 2);
        let rows = read_log(monitor_path(&sc.output)).unwrap();
        assert!(!rows.is_empty());
        assert!(policy_path(&sc.output).exists());
        let rb = ReplayBuffer::load(policy_replay_path(&sc.replay_save)).unwrap();
        assert_eq!(rb.len(), rows.len());
    }

    #[test]
    fn final_stage_runs_without_curriculum() {
        let dir = tempfile::tempdir().unwrap();
        let base = CurriculumConfig {
            stages: vec![Stage::TeacherForcedBalance, Stage::Balance],
            output: dir.path().join("run"),
            cl_save: dir.path().join("cl"),
            ..Default::default()
        };
        let sc = base.stage_config(Stage::Balance, 0, 2_000, 7, None);
        assert!(!sc.curriculum_enabled);
        let env = SurrogateEnv::new(Stage::Walk, 1, 20.0);
        assert_eq!(env.observation()[0], Stage::Walk.index() as f32);
        assert_eq!(env.with_curriculum(false).observation()[0], 0.0);

        // Even a runner eager to advance stays put.
        let mut runner = SurrogateRunner {
            advance_return: f64::NEG_INFINITY,
            ..Default::default()
        };
        let mut env = SurrogateFactory.create(&sc).unwrap();
        let mut tracker = PerformanceTracker::new(1, false, None);
        let out = runner
            .run_stage(env.as_mut(), &mut tracker, Stage::Balance, &sc)
            .unwrap();
        assert_eq!(out.next_stage, Some(Stage::Balance));
    }

    #[test]
    fn warm_start_restores_skill() {
        let dir = tempfile::tempdir().unwrap();
        let first = stage_config(dir.path(), 5_000);
        let mut tracker = PerformanceTracker::new(1, false, None);
        let mut runner = SurrogateRunner::default();
        let mut env = SurrogateFactory.create(&first).unwrap();
        runner
            .run_stage(env.as_mut(), &mut tracker, Stage::Balance, &first)
            .unwrap();
        let learned = runner.skill();
        assert!(learned > runner.initial_skill);

        let base = CurriculumConfig {
            output: dir.path().join("run"),
            cl_save: dir.path().join("cl"),
            ..Default::default()
        };
        let second = base.stage_config(Stage::Walk, 1, 5_000, 7, Some(&first.as_previous()));
        let mut fresh = SurrogateRunner::default();
        fresh.warm_start(&second).unwrap();
        assert_eq!(fresh.skill(), learned);
        assert!(!SurrogateRunner::replay(&second).unwrap().is_empty());
    }
}
