use anyhow::Result;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use stagewise::controller::critic_replay_path;
use stagewise::error::kind_of;
use stagewise::normalize::{DatasetNorm, NormStats};
use stagewise::{
    CurriculumConfig, CurriculumController, CurriculumError, DecisionMode, Environment,
    EnvironmentFactory, EpisodeRecord, PerformanceTracker, Policy, ReplayBuffer, Stage,
    StageConfig, StageOutcome, StageRunner, StepSample,
};

// =============================================================================
// Scripted collaborators
// =============================================================================

struct IdleEnv;

impl Environment for IdleEnv {
    fn run_episode(&mut self, _policy: &mut dyn Policy) -> Result<Vec<StepSample>> {
        Ok(Vec::new())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct IdleFactory;

impl EnvironmentFactory for IdleFactory {
    fn create(&self, _config: &StageConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(IdleEnv))
    }
}

/// Replays canned stage outcomes and remembers the configs it was given.
struct Scripted {
    script: VecDeque<StageOutcome>,
    seen: Arc<Mutex<Vec<StageConfig>>>,
}

impl Scripted {
    fn new(script: Vec<StageOutcome>) -> (Self, Arc<Mutex<Vec<StageConfig>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script: script.into(),
                seen: seen.clone(),
            },
            seen,
        )
    }
}

impl StageRunner for Scripted {
    fn run_stage(
        &mut self,
        _env: &mut dyn Environment,
        tracker: &mut PerformanceTracker,
        stage: Stage,
        config: &StageConfig,
    ) -> Result<StageOutcome> {
        self.seen.lock().unwrap().push(config.clone());
        let outcome = self
            .script
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
        tracker.add(EpisodeRecord {
            duration: 0.5,
            td_error: 0.2,
            complexity: 1.0 + self.script.len() as f32,
            stage,
            damage: outcome.damage,
            distance: 1.0,
        });
        Ok(outcome)
    }
}

fn outcome(ret: f64, steps: u64, damage: f64, next: Option<Stage>) -> StageOutcome {
    StageOutcome {
        avg_test_return: ret,
        damage,
        steps,
        next_stage: next,
    }
}

fn config(dir: &Path, steps: u64) -> CurriculumConfig {
    CurriculumConfig {
        steps,
        reach_return: Some(100.0),
        output: dir.join("run"),
        cl_save: dir.join("cl"),
        seed: Some(11),
        ..Default::default()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn target_reached_in_second_stage() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, seen) = Scripted::new(vec![
        outcome(50.0, 2000, 10.0, Some(Stage::Balance)),
        outcome(120.0, 3000, 5.0, Some(Stage::Walk)),
    ]);
    let mut controller = CurriculumController::new(config(dir.path(), 10_000), runner, IdleFactory);
    let summary = controller.run(0).unwrap();

    assert!(summary.reached);
    assert_eq!(summary.damage, 15.0);
    assert_eq!(summary.cost, 15.0);
    assert_eq!(summary.steps, 5000);
    assert!(summary.cl_info.contains("teacher_forced_balance 2000"));
    assert!(summary.cl_info.contains("balance 3000"));
    assert_eq!(summary.stages.len(), 2);
    assert!(summary.stages.iter().all(|r| r.window.is_some()));
    assert_eq!(summary.seed, 11);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].stage, Stage::TeacherForcedBalance);
    assert_eq!(seen[0].steps, 10_000);
    assert_eq!(seen[0].load_file, None);
    assert_eq!(seen[1].stage, Stage::Balance);
    assert_eq!(seen[1].steps, 8_000);
    assert_eq!(seen[1].counter, 1);
    assert_eq!(
        seen[1].load_file.as_deref(),
        Some(dir.path().join("run-00_teacher_forced_balance").as_path())
    );
    assert_eq!(seen[1].output, dir.path().join("run-01_balance"));
    assert!(seen[1].curriculum_enabled);
}

#[test]
fn exhausted_budget_is_charged_the_default_penalty() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = Scripted::new(vec![
        outcome(10.0, 2000, 100.0, Some(Stage::TeacherForcedBalance)),
        outcome(20.0, 2000, 100.0, Some(Stage::TeacherForcedBalance)),
    ]);
    let cfg = config(dir.path(), 4000);
    let default_damage = cfg.default_damage;
    let summary = CurriculumController::new(cfg, runner, IdleFactory)
        .run(0)
        .unwrap();
    assert!(!summary.reached);
    assert_eq!(summary.damage, 200.0);
    assert_eq!(summary.cost, default_damage);
    assert_eq!(summary.steps, 4000);
}

#[test]
fn damage_above_the_penalty_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = Scripted::new(vec![outcome(10.0, 1000, 5000.0, None)]);
    let summary = CurriculumController::new(config(dir.path(), 1000), runner, IdleFactory)
        .run(0)
        .unwrap();
    assert_eq!(summary.cost, 5000.0);
}

#[test]
fn invalid_configs_fail_before_training() {
    let dir = tempfile::tempdir().unwrap();
    for cfg in [
        CurriculumConfig {
            reach_return: None,
            ..config(dir.path(), 1000)
        },
        CurriculumConfig {
            trials: 2,
            ..config(dir.path(), 1000)
        },
        config(dir.path(), 0),
    ] {
        let (runner, seen) = Scripted::new(vec![outcome(500.0, 10, 0.0, None)]);
        let err = CurriculumController::new(cfg, runner, IdleFactory)
            .run(0)
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(CurriculumError::Configuration(_))
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}

#[test]
fn stage_without_progress_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = Scripted::new(vec![outcome(10.0, 0, 0.0, None)]);
    assert!(
        CurriculumController::new(config(dir.path(), 1000), runner, IdleFactory)
            .run(0)
            .is_err()
    );
}

#[test]
fn curriculum_transitions_are_persisted_per_stage() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = Scripted::new(vec![
        outcome(50.0, 2000, 10.0, Some(Stage::Balance)),
        outcome(120.0, 3000, 5.0, None),
    ]);
    CurriculumController::new(config(dir.path(), 10_000), runner, IdleFactory)
        .run(0)
        .unwrap();

    let first = ReplayBuffer::load(critic_replay_path(
        &dir.path().join("cl-00_teacher_forced_balance"),
    ))
    .unwrap();
    assert_eq!(first.len(), 1);
    let last = ReplayBuffer::load(critic_replay_path(&dir.path().join("cl-01_balance"))).unwrap();
    let transitions: Vec<_> = last.iter().collect();
    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[0].stage, Stage::TeacherForcedBalance);
    assert_eq!(transitions[0].reward, -10.0);
    assert!(!transitions[0].terminal);
    assert!(transitions[1].terminal);
    assert_eq!(transitions[1].state, transitions[0].next_state);
}

#[test]
fn critic_mode_trains_saves_and_stays_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let script: Vec<_> = (0..5)
        .map(|i| outcome(10.0, 1000, 1.0 + i as f64, None))
        .collect();
    let (runner, _) = Scripted::new(script);
    let cfg = CurriculumConfig {
        decision: DecisionMode::Critic,
        rb_min_size: 1,
        cl_l2_reg: 0.1,
        ..config(dir.path(), 5000)
    };
    let summary = CurriculumController::new(cfg.clone(), runner, IdleFactory)
        .run(0)
        .unwrap();
    assert_eq!(summary.steps, 5000);
    assert_eq!(summary.reg, 0.0);
    assert!(
        summary
            .stages
            .windows(2)
            .all(|w| w[0].stage <= w[1].stage)
    );
    let last = summary.last.as_ref().unwrap();
    assert!(last.cl_save.exists());

    // A second run warm-started from the first critic pays its L2 norm.
    let (runner, _) = Scripted::new(vec![outcome(10.0, 1000, 1.0, None)]);
    let warm = CurriculumConfig {
        steps: 1000,
        cl_load: Some(last.cl_save.clone()),
        output: dir.path().join("warm"),
        cl_save: dir.path().join("warm-cl"),
        ..cfg
    };
    let summary = CurriculumController::new(warm, runner, IdleFactory)
        .run(0)
        .unwrap();
    assert!(summary.reg > 0.0);
    assert_eq!(summary.cost, summary.damage.max(4035.0) + summary.reg);
}

#[test]
fn final_stage_is_kept_even_when_runner_suggests_going_back() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, seen) = Scripted::new(vec![
        outcome(10.0, 1000, 1.0, Some(Stage::Balance)),
        outcome(10.0, 1000, 1.0, None),
    ]);
    let cfg = CurriculumConfig {
        starting_stage: Stage::Walk,
        monotonic: false,
        ..config(dir.path(), 2000)
    };
    let summary = CurriculumController::new(cfg, runner, IdleFactory)
        .run(0)
        .unwrap();

    assert!(summary.stages.iter().all(|r| r.stage == Stage::Walk));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(
        seen.iter()
            .all(|sc| sc.stage == Stage::Walk && !sc.curriculum_enabled)
    );
}

#[test]
fn tracker_stats_of_the_wrong_width_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let stats = dir.path().join("short_stat.json");
    DatasetNorm {
        state: NormStats::identity(2),
        damage: NormStats::identity(1),
    }
    .save(&stats)
    .unwrap();

    let (runner, seen) = Scripted::new(vec![outcome(10.0, 1000, 1.0, None)]);
    let cfg = CurriculumConfig {
        cl_input_norm: true,
        pt_stats: Some(stats),
        ..config(dir.path(), 1000)
    };
    let err = CurriculumController::new(cfg, runner, IdleFactory)
        .run(0)
        .unwrap_err();
    assert!(matches!(
        kind_of(&err),
        Some(CurriculumError::Configuration(_))
    ));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn target_reached_as_the_budget_runs_out_is_not_penalized() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = Scripted::new(vec![outcome(150.0, 2000, 7.0, None)]);
    let cfg = CurriculumConfig {
        decision: DecisionMode::Threshold,
        ..config(dir.path(), 2000)
    };
    let summary = CurriculumController::new(cfg, runner, IdleFactory)
        .run(0)
        .unwrap();
    // Threshold would advance out of the first stage, but the budget is gone.
    assert_eq!(summary.stages.len(), 1);
    assert!(summary.reached);
    assert_eq!(summary.cost, 7.0);
}
