use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::CurriculumError;
use crate::stage::{Stage, StageEncoding};

// =============================================================================
// Stage Decision Mode
// =============================================================================

/// Who decides between holding and advancing after each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// Trust the `next_stage` reported by the training-loop collaborator.
    #[default]
    FollowRunner,
    /// Advance once the average test return exceeds `reach_return`.
    Threshold,
    /// Greedy argmax of the stage-value critic over the candidate stages.
    Critic,
}

/// Damage signal used as the offline reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageMode {
    /// Successive negative differences of cumulative damage.
    #[default]
    ToReward,
    /// z-scored damage still to come (`final - running`).
    NormalizedRemaining,
}

// =============================================================================
// Critic Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    pub hidden: Vec<usize>,
    pub learning_rate: f64,
    pub l2_reg: f64,
    pub dropout_keep: f32,
    pub gamma: f64,
    /// Soft-update rate of the target network.
    pub tau: f64,
    pub max_grad_norm: f64,
    pub minibatch_size: usize,
    pub iterations: usize,
    pub eval_every: usize,
    pub save_every: usize,
    pub keep_checkpoints: usize,
    pub stage_encoding: StageEncoding,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            hidden: vec![4, 3, 3],
            learning_rate: 1e-4,
            l2_reg: 1e-3,
            dropout_keep: 0.7,
            gamma: 0.99,
            tau: 0.01,
            max_grad_norm: 10.0,
            minibatch_size: 128,
            iterations: 200_000,
            eval_every: 500,
            save_every: 5_000,
            keep_checkpoints: 3,
            stage_encoding: StageEncoding::Centered,
        }
    }
}

// =============================================================================
// Offline Dataset Options
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub steps_of_history: usize,
    pub zero_padding_after: usize,
    /// Trajectories ending at or above this damage are dropped.
    pub damage_threshold: Option<f64>,
    pub min_walked_distance: f64,
    pub individual_norm: bool,
    pub damage_mode: DamageMode,
    pub stage_encoding: StageEncoding,
    pub test_fraction: f64,
    pub generations: u32,
    pub rb_max_size: usize,
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            steps_of_history: 1,
            zero_padding_after: 0,
            damage_threshold: Some(10_000.0),
            min_walked_distance: 10.0,
            individual_norm: true,
            damage_mode: DamageMode::ToReward,
            stage_encoding: StageEncoding::Centered,
            test_fraction: 0.3,
            generations: 6,
            rb_max_size: 300_000,
            seed: 0,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.steps_of_history == 0 {
            return Err(CurriculumError::config("steps_of_history must be at least 1").into());
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(CurriculumError::config(format!(
                "test_fraction must be in [0, 1), got {}",
                self.test_fraction
            ))
            .into());
        }
        if self.rb_max_size == 0 {
            return Err(CurriculumError::config("rb_max_size must be nonzero").into());
        }
        Ok(())
    }
}

// =============================================================================
// Curriculum Run Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurriculumConfig {
    /// Total environment step budget for the whole run.
    pub steps: u64,
    pub trials: u32,
    pub reach_return: Option<f64>,
    /// Cost floor applied when the run fails to reach its target.
    pub default_damage: f64,
    pub cl_l2_reg: f64,
    pub cl_depth: usize,
    pub cl_input_norm: bool,
    pub stages: Vec<Stage>,
    pub starting_stage: Stage,
    pub monotonic: bool,
    pub decision: DecisionMode,
    pub env_timeout: f64,
    pub env_td_error_scale: f64,
    pub rb_max_size: usize,
    pub rb_min_size: usize,
    pub seed: Option<u32>,
    pub output: PathBuf,
    pub cl_save: PathBuf,
    pub cl_load: Option<PathBuf>,
    /// Normalization statistics for the performance tracker.
    pub pt_stats: Option<PathBuf>,
    pub critic: CriticConfig,
}

impl Default for CurriculumConfig {
    fn default() -> Self {
        Self {
            steps: 300_000,
            trials: 0,
            reach_return: Some(1_000.0),
            default_damage: 4035.0,
            cl_l2_reg: 0.0,
            cl_depth: 2,
            cl_input_norm: true,
            stages: Stage::ALL.to_vec(),
            starting_stage: Stage::TeacherForcedBalance,
            monotonic: true,
            decision: DecisionMode::FollowRunner,
            env_timeout: 20.0,
            env_td_error_scale: 600.0,
            rb_max_size: 300_000,
            rb_min_size: 1_000,
            seed: None,
            output: PathBuf::from("runs/ddpg-cl"),
            cl_save: PathBuf::from("runs/ddpg-cl-critic"),
            cl_load: None,
            pt_stats: None,
            critic: CriticConfig::default(),
        }
    }
}

impl CurriculumConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: CurriculumConfig = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Pre-run checks. Any failure here is fatal before training starts.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(CurriculumError::config("step budget must be nonzero").into());
        }
        if self.trials != 0 {
            return Err(CurriculumError::config(format!(
                "curriculum runs are step-bounded, trials must be 0 (got {})",
                self.trials
            ))
            .into());
        }
        match self.reach_return {
            Some(r) if r != 0.0 && r.is_finite() => {}
            _ => {
                return Err(CurriculumError::config("reach_return target is required").into());
            }
        }
        if self.stages.is_empty() {
            return Err(CurriculumError::config("at least one stage is required").into());
        }
        if self.stages.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CurriculumError::config(format!(
                "stages must be strictly increasing, got {:?}",
                self.stages
            ))
            .into());
        }
        if !self.stages.contains(&self.starting_stage) {
            return Err(CurriculumError::config(format!(
                "starting stage {} is not in the stage list",
                self.starting_stage
            ))
            .into());
        }
        if self.cl_depth == 0 {
            return Err(CurriculumError::config("cl_depth must be at least 1").into());
        }
        if self.rb_max_size == 0 || self.critic.minibatch_size == 0 {
            return Err(CurriculumError::config("buffer and minibatch sizes must be nonzero").into());
        }
        if !(0.0..=1.0).contains(&self.critic.gamma) {
            return Err(CurriculumError::config("gamma must be in [0, 1]").into());
        }
        Ok(())
    }

    pub fn reach_return(&self) -> f64 {
        self.reach_return.unwrap_or(f64::INFINITY)
    }

    /// The last stage of this run's stage list.
    pub fn final_stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Walk)
    }

    /// Builds the immutable configuration for one stage of a run.
    pub fn stage_config(
        &self,
        stage: Stage,
        counter: usize,
        steps_remaining: u64,
        seed: u32,
        previous: Option<&PreviousStage>,
    ) -> StageConfig {
        let prefix = format!("-{counter:02}_{}", stage.name());
        let mut overrides = vec![
            StageOverride::Steps(steps_remaining),
            StageOverride::Output {
                output: with_suffix(&self.output, &prefix),
                cl_save: with_suffix(&self.cl_save, &prefix),
            },
            StageOverride::Seed(seed),
        ];
        if let Some(prev) = previous {
            overrides.push(StageOverride::WarmStart(prev.clone()));
        }
        if stage == self.final_stage() {
            overrides.push(StageOverride::ForbidCurriculum);
        }
        overrides
            .into_iter()
            .fold(StageConfig::base(self, stage, counter), StageConfig::apply)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

// =============================================================================
// Per-Stage Configuration
// =============================================================================

/// Where a finished stage left its artefacts, for warm-starting the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousStage {
    pub stage: Stage,
    pub checkpoint: PathBuf,
    pub replay_file: PathBuf,
    pub cl_save: PathBuf,
    pub seed: u32,
}

/// The closed set of changes a stage may make to the base configuration.
#[derive(Debug, Clone)]
pub enum StageOverride {
    Steps(u64),
    Output { output: PathBuf, cl_save: PathBuf },
    Seed(u32),
    WarmStart(PreviousStage),
    ForbidCurriculum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: Stage,
    pub counter: usize,
    pub steps: u64,
    pub output: PathBuf,
    pub cl_save: PathBuf,
    pub replay_save: PathBuf,
    pub seed: u32,
    pub load_file: Option<PathBuf>,
    pub replay_load: Option<PathBuf>,
    pub cl_load: Option<PathBuf>,
    pub curriculum_enabled: bool,
    pub gamma: f64,
    pub rb_max_size: usize,
    pub rb_min_size: usize,
    pub minibatch_size: usize,
    pub env_timeout: f64,
    pub env_td_error_scale: f64,
}

impl StageConfig {
    fn base(config: &CurriculumConfig, stage: Stage, counter: usize) -> Self {
        Self {
            stage,
            counter,
            steps: config.steps,
            output: config.output.clone(),
            cl_save: config.cl_save.clone(),
            replay_save: config.output.clone(),
            seed: config.seed.unwrap_or(0),
            load_file: None,
            replay_load: None,
            cl_load: config.cl_load.clone(),
            curriculum_enabled: true,
            gamma: config.critic.gamma,
            rb_max_size: config.rb_max_size,
            rb_min_size: config.rb_min_size,
            minibatch_size: config.critic.minibatch_size,
            env_timeout: config.env_timeout,
            env_td_error_scale: config.env_td_error_scale,
        }
    }

    /// Returns a copy with one override applied.
    pub fn apply(self, o: StageOverride) -> Self {
        match o {
            StageOverride::Steps(steps) => Self { steps, ..self },
            StageOverride::Output { output, cl_save } => Self {
                replay_save: output.clone(),
                output,
                cl_save,
                ..self
            },
            StageOverride::Seed(seed) => Self { seed, ..self },
            StageOverride::WarmStart(prev) => Self {
                load_file: Some(prev.checkpoint),
                replay_load: Some(prev.replay_file),
                cl_load: Some(prev.cl_save),
                ..self
            },
            StageOverride::ForbidCurriculum => Self {
                curriculum_enabled: false,
                ..self
            },
        }
    }

    /// The record handed to the next stage once this one finishes.
    pub fn as_previous(&self) -> PreviousStage {
        PreviousStage {
            stage: self.stage,
            checkpoint: self.output.clone(),
            replay_file: self.replay_save.clone(),
            cl_save: self.cl_save.clone(),
            seed: self.seed,
        }
    }
}

// =============================================================================
// Seeds
// =============================================================================

/// Resolves the run seed. An explicit seed wins; otherwise the fallback
/// entropy is mixed down to a non-negative 31-bit value.
pub fn derive_seed(seed: Option<u32>, fallback: u64) -> u32 {
    match seed {
        Some(s) => s,
        None => {
            let mut z = fallback.wrapping_add(0x9E37_79B9_7F4A_7C15);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            ((z >> 32) as u32) / 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    fn is_config_error(r: Result<()>) -> bool {
        match r {
            Err(e) => matches!(kind_of(&e), Some(CurriculumError::Configuration(_))),
            Ok(()) => false,
        }
    }

    #[test]
    fn default_config_is_valid() {
        CurriculumConfig::default().validate().unwrap();
    }

    #[test]
    fn pre_run_asserts() {
        let zero_steps = CurriculumConfig {
            steps: 0,
            ..Default::default()
        };
        assert!(is_config_error(zero_steps.validate()));

        let trials = CurriculumConfig {
            trials: 3,
            ..Default::default()
        };
        assert!(is_config_error(trials.validate()));

        let no_target = CurriculumConfig {
            reach_return: None,
            ..Default::default()
        };
        assert!(is_config_error(no_target.validate()));

        let zero_target = CurriculumConfig {
            reach_return: Some(0.0),
            ..Default::default()
        };
        assert!(is_config_error(zero_target.validate()));

        let unordered = CurriculumConfig {
            stages: vec![Stage::Walk, Stage::Balance],
            starting_stage: Stage::Walk,
            ..Default::default()
        };
        assert!(is_config_error(unordered.validate()));
    }

    #[test]
    fn seed_derivation_is_pure() {
        assert_eq!(derive_seed(Some(7), 123), 7);
        assert_eq!(derive_seed(None, 42), derive_seed(None, 42));
        assert_ne!(derive_seed(None, 1), derive_seed(None, 2));
        assert!(derive_seed(None, u64::MAX) <= u32::MAX / 2);
    }

    #[test]
    fn stage_config_naming_and_warm_start() {
        let base = CurriculumConfig {
            output: PathBuf::from("out/run"),
            cl_save: PathBuf::from("out/cl"),
            ..Default::default()
        };
        let first = base.stage_config(Stage::TeacherForcedBalance, 0, 10_000, 5, None);
        assert_eq!(first.output, PathBuf::from("out/run-00_teacher_forced_balance"));
        assert_eq!(first.cl_save, PathBuf::from("out/cl-00_teacher_forced_balance"));
        assert!(first.load_file.is_none());
        assert!(first.curriculum_enabled);

        let prev = first.as_previous();
        let second = base.stage_config(Stage::Walk, 1, 8_000, 5, Some(&prev));
        assert_eq!(second.load_file.as_deref(), Some(first.output.as_path()));
        assert_eq!(second.replay_load.as_deref(), Some(first.replay_save.as_path()));
        assert_eq!(second.cl_load.as_deref(), Some(first.cl_save.as_path()));
        assert_eq!(second.steps, 8_000);
        assert!(!second.curriculum_enabled);
        // the base is untouched
        assert_eq!(base.output, PathBuf::from("out/run"));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: CurriculumConfig =
            serde_json::from_str(r#"{"steps": 10000, "reach_return": 100.0}"#).unwrap();
        assert_eq!(cfg.steps, 10_000);
        assert_eq!(cfg.default_damage, 4035.0);
        assert_eq!(cfg.critic.hidden, vec![4, 3, 3]);
    }
}
