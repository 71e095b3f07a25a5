//! Offline transition dataset builder.
//!
//! Historical monitor logs become replay buffers for critic training in a
//! chain of pure steps, each taking an immutable collection and returning a
//! new one:
//!
//! 1. [`load_runs`]: read every run's per-stage logs and join them into one
//!    trajectory per run.
//! 2. [`clean`]: drop runs that never walked or ended too damaged, and a
//!    trailing duplicate export row.
//! 3. [`split`]: seeded train/test split.
//! 4. [`fit_norm`] + [`prepare`]: z-score with training statistics, pad
//!    with history rows, turn damage into rewards.
//! 5. [`window`] + [`DatasetStats`]: fixed-length history windows and a
//!    min/median/max sanity report.
//! 6. [`fill_replay_buffer`]: consecutive windows become transitions.

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{DamageMode, DatasetConfig};
use crate::episode::{self, Summarizer, Trajectory, feat};
use crate::error::{CurriculumError, kind_of};
use crate::normalize::{DatasetNorm, NormStats};
use crate::replay::{ReplayBuffer, Transition};
use crate::stage::{Stage, StageEncoding};
use crate::{Features, STATE_DIM};

// =============================================================================
// Load
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct LoadedCorpus {
    pub trajectories: Vec<Trajectory>,
    /// Stage logs that were missing or corrupt.
    pub skipped_logs: usize,
}

/// First-stage log files of generation `g`, sorted by name.
fn first_stage_logs(dir: &Path, generation: u32) -> Result<Vec<PathBuf>> {
    let prefix = format!("ddpg-g{generation:04}-mp");
    let suffix = format!("-{}.monitor.csv", Stage::TeacherForcedBalance.log_tag());
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list log directory {}", dir.display()))?
    {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with(&prefix)
            && name.ends_with(&suffix)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn sibling_log(first: &Path, stage: Stage) -> PathBuf {
    let name = first
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .replace(Stage::TeacherForcedBalance.log_tag(), stage.log_tag());
    first.with_file_name(name)
}

/// Reads one stage log, turning a missing or malformed file into `None`.
fn read_stage(
    summarizer: &Summarizer,
    path: &Path,
    stage: Stage,
    skipped: &mut usize,
) -> Result<Option<Trajectory>> {
    if !path.exists() {
        debug!("no {} log at {}", stage, path.display());
        *skipped += 1;
        return Ok(None);
    }
    match summarizer.summarize_log(path, stage) {
        Ok(t) => Ok(Some(t)),
        Err(e) if kind_of(&e).is_some_and(CurriculumError::is_recoverable) => {
            warn!("skipping {}: {e}", path.display());
            *skipped += 1;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Loads every run of generations `1..=generations` from `dir`.
///
/// Runs are discovered by their first-stage log
/// (`ddpg-gGGGG-mp*-00_balancing_tf.monitor.csv`); the later stages are the
/// sibling files with the stage tag substituted. Each run's stages are
/// concatenated into one trajectory with monotone damage.
pub fn load_runs(dir: &Path, generations: u32, summarizer: &Summarizer) -> Result<LoadedCorpus> {
    let mut corpus = LoadedCorpus::default();
    for g in 1..=generations {
        for first in first_stage_logs(dir, g)? {
            let mut joined = None;
            for stage in Stage::ALL {
                let path = sibling_log(&first, stage);
                let part = read_stage(summarizer, &path, stage, &mut corpus.skipped_logs)?;
                joined = episode::concat(joined, part, false);
            }
            if let Some(t) = joined {
                corpus.trajectories.push(t);
            }
        }
    }
    info!(
        "loaded {} runs from {} ({} stage logs skipped)",
        corpus.trajectories.len(),
        dir.display(),
        corpus.skipped_logs
    );
    Ok(corpus)
}

// =============================================================================
// Clean
// =============================================================================

#[derive(Debug, Clone)]
pub struct Cleaned {
    pub trajectories: Vec<Trajectory>,
    pub retained_fraction: f64,
}

fn trailing_duplicate(t: &Trajectory) -> bool {
    let n = t.records.len();
    if n < 2 {
        return false;
    }
    let a = t.records[n - 1].features();
    let b = t.records[n - 2].features();
    a[feat::TD_ERROR..] == b[feat::TD_ERROR..]
}

/// Keeps runs that walked further than `min_walked_distance` and, when a
/// damage threshold is set, ended below it. For kept runs under a
/// threshold, a last row repeating the previous one (an export not caused
/// by the end of testing) is dropped.
pub fn clean(trajectories: &[Trajectory], cfg: &DatasetConfig) -> Cleaned {
    let mut kept = Vec::new();
    for t in trajectories {
        if t.is_empty() || t.max_distance() <= cfg.min_walked_distance {
            continue;
        }
        let mut t = t.clone();
        if let Some(threshold) = cfg.damage_threshold {
            if t.final_damage() >= threshold {
                continue;
            }
            if trailing_duplicate(&t) {
                t.records.pop();
            }
        }
        kept.push(t);
    }
    let retained_fraction = if trajectories.is_empty() {
        0.0
    } else {
        kept.len() as f64 / trajectories.len() as f64
    };
    info!(
        "retained {}/{} trajectories ({:.1}%)",
        kept.len(),
        trajectories.len(),
        retained_fraction * 100.0
    );
    Cleaned {
        trajectories: kept,
        retained_fraction,
    }
}

// =============================================================================
// Split
// =============================================================================

/// Seeded shuffle split; the first `test_fraction` of the shuffle is test.
pub fn split(
    trajectories: &[Trajectory],
    test_fraction: f64,
    seed: u64,
) -> (Vec<Trajectory>, Vec<Trajectory>) {
    let mut idx: Vec<usize> = (0..trajectories.len()).collect();
    idx.shuffle(&mut SmallRng::seed_from_u64(seed));
    let n_test = (trajectories.len() as f64 * test_fraction) as usize;
    let test = idx[..n_test].iter().map(|&i| trajectories[i].clone()).collect();
    let train = idx[n_test..].iter().map(|&i| trajectories[i].clone()).collect();
    (train, test)
}

// =============================================================================
// Normalize & pad
// =============================================================================

fn row_f64(f: &Features) -> Vec<f64> {
    f.iter().map(|&v| v as f64).collect()
}

/// Damage still to come at each episode, preceded by the total.
fn damage_to_go(t: &Trajectory) -> Vec<f64> {
    let last = t.final_damage();
    std::iter::once(last)
        .chain(t.records.iter().map(|r| last - r.damage))
        .collect()
}

/// Fits state and damage statistics on a training split.
pub fn fit_norm(train: &[Trajectory]) -> Result<DatasetNorm> {
    let rows: Vec<Vec<f64>> = train
        .iter()
        .flat_map(|t| t.features())
        .map(|f| row_f64(&f))
        .collect();
    let damage: Vec<[f64; 1]> = train
        .iter()
        .flat_map(damage_to_go)
        .map(|d| [d])
        .collect();
    let state = NormStats::fit(&rows)
        .ok_or_else(|| CurriculumError::config("training split is empty"))?;
    let damage = NormStats::fit(&damage).unwrap_or_else(|| NormStats::identity(1));

    if let Some(i) = rows
        .iter()
        .position(|r| !episode::is_populated(&state.normalize_f32(&to_f32(r))))
    {
        anyhow::bail!("normalized training row {i} is all zeros");
    }
    Ok(DatasetNorm { state, damage })
}

fn to_f32(r: &[f64]) -> Vec<f32> {
    r.iter().map(|&v| v as f32).collect()
}

/// A trajectory after normalization and padding. All three columns have
/// `steps_of_history + episodes + zero_padding_after` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTrajectory {
    pub rows: Vec<Features>,
    pub rewards: Vec<f32>,
    /// `None` marks trailing padding.
    pub stages: Vec<Option<Stage>>,
}

impl PreparedTrajectory {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stage labels as fed to the critic; trailing padding is -1.
    pub fn labels(&self, encoding: StageEncoding) -> Vec<f32> {
        self.stages
            .iter()
            .map(|s| s.map_or(-1.0, |s| s.action_value(encoding)))
            .collect()
    }
}

/// Normalizes and pads every trajectory with the given statistics.
pub fn prepare(
    trajectories: &[Trajectory],
    norm: &DatasetNorm,
    cfg: &DatasetConfig,
) -> Vec<PreparedTrajectory> {
    trajectories
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| prepare_one(t, norm, cfg))
        .collect()
}

fn prepare_one(t: &Trajectory, norm: &DatasetNorm, cfg: &DatasetConfig) -> PreparedTrajectory {
    let soh = cfg.steps_of_history;
    let after = cfg.zero_padding_after;

    let real: Vec<Features> = t
        .features()
        .iter()
        .map(|f| {
            if cfg.individual_norm {
                let mut out = [0.0f32; STATE_DIM];
                out.copy_from_slice(&norm.state.normalize_f32(f));
                out
            } else {
                *f
            }
        })
        .collect();
    let mut lead = [0.0f32; STATE_DIM];
    lead[feat::STAGE] = real[0][feat::STAGE];
    let mut rows = vec![lead; soh];
    rows.extend_from_slice(&real);
    rows.extend(std::iter::repeat_n([0.0f32; STATE_DIM], after));

    let damage = t.damage();
    let mut rewards: Vec<f32> = match cfg.damage_mode {
        DamageMode::ToReward => {
            let mut r = vec![0.0f32; soh];
            r.extend(damage.windows(2).map(|w| -(w[1] - w[0]) as f32));
            r.push(0.0);
            r
        }
        DamageMode::NormalizedRemaining => {
            let last = t.final_damage();
            std::iter::repeat_n(last, soh)
                .chain(damage.iter().map(|d| last - d))
                .map(|d| norm.damage.normalize_scalar(d) as f32)
                .collect()
        }
    };
    // Trailing damage padding is zero, matching the recorded datasets.
    rewards.extend(std::iter::repeat_n(0.0f32, after));

    let first = t.records[0].stage;
    let mut stages = vec![Some(first); soh];
    stages.extend(t.records.iter().map(|r| Some(r.stage)));
    stages.extend(std::iter::repeat_n(None, after));

    PreparedTrajectory {
        rows,
        rewards,
        stages,
    }
}

// =============================================================================
// Windowing & statistics
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct Windowed {
    /// Flattened `steps_of_history x STATE_DIM` windows.
    pub windows: Vec<Vec<f32>>,
    /// Reward or damage at each window's last index.
    pub rewards: Vec<f32>,
    pub labels: Vec<f32>,
    /// Last row of each window.
    pub last_rows: Vec<Features>,
}

pub fn window(
    prepared: &[PreparedTrajectory],
    steps_of_history: usize,
    encoding: StageEncoding,
) -> Windowed {
    let mut out = Windowed::default();
    for p in prepared {
        if p.len() < steps_of_history {
            continue;
        }
        let labels = p.labels(encoding);
        for i in 0..=p.len() - steps_of_history {
            let end = i + steps_of_history - 1;
            out.windows
                .push(p.rows[i..=end].iter().flatten().copied().collect());
            out.rewards.push(p.rewards[end]);
            out.labels.push(labels[end]);
            out.last_rows.push(p.rows[end]);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Vec<f64>,
    pub median: Vec<f64>,
    pub max: Vec<f64>,
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

impl ColumnStats {
    fn of<R: AsRef<[f64]>>(rows: &[R]) -> Option<Self> {
        let dim = rows.first()?.as_ref().len();
        let mut stats = ColumnStats {
            min: Vec::with_capacity(dim),
            median: Vec::with_capacity(dim),
            max: Vec::with_capacity(dim),
        };
        for c in 0..dim {
            let mut col: Vec<f64> = rows.iter().map(|r| r.as_ref()[c]).collect();
            col.sort_by(f64::total_cmp);
            stats.min.push(col[0]);
            stats.median.push(median(&col));
            stats.max.push(col[col.len() - 1]);
        }
        Some(stats)
    }
}

/// Sanity report over a windowed dataset. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub windows: usize,
    pub state: Option<ColumnStats>,
    pub damage: Option<ColumnStats>,
}

impl DatasetStats {
    pub fn of(w: &Windowed) -> Self {
        let state: Vec<Vec<f64>> = w.last_rows.iter().map(row_f64).collect();
        let damage: Vec<[f64; 1]> = w.rewards.iter().map(|&r| [r as f64]).collect();
        Self {
            windows: w.windows.len(),
            state: ColumnStats::of(&state),
            damage: ColumnStats::of(&damage),
        }
    }

    pub fn log(&self, split: &str) {
        info!("{split}: {} windows", self.windows);
        if let (Some(s), Some(d)) = (&self.state, &self.damage) {
            info!("  state  min {:?}", s.min);
            info!("  state  med {:?}", s.median);
            info!("  state  max {:?}", s.max);
            info!(
                "  damage min {:.4} med {:.4} max {:.4}",
                d.min[0], d.median[0], d.max[0]
            );
        }
    }
}

// =============================================================================
// Replay filling
// =============================================================================

fn history(p: &PreparedTrajectory, end: usize, steps_of_history: usize) -> Vec<f32> {
    p.rows[end + 1 - steps_of_history..=end]
        .iter()
        .flatten()
        .copied()
        .collect()
}

/// Turns every pair of consecutive history windows into a transition. The
/// last transition of each trajectory is terminal. Exceeding `rb_max_size`
/// is a [`CurriculumError::CapacityViolation`].
pub fn fill_replay_buffer(
    prepared: &[PreparedTrajectory],
    steps_of_history: usize,
    rb_max_size: usize,
) -> Result<ReplayBuffer> {
    let mut rb = ReplayBuffer::new(rb_max_size, steps_of_history * STATE_DIM);
    for p in prepared {
        if p.len() < steps_of_history + 1 {
            continue;
        }
        let last_real = p.stages.iter().rev().find_map(|s| *s);
        for i in steps_of_history - 1..p.len() - 1 {
            let stage = p.stages[i]
                .or(last_real)
                .unwrap_or(Stage::TeacherForcedBalance);
            rb.add_bounded(Transition {
                state: history(p, i, steps_of_history),
                stage,
                reward: p.rewards[i],
                terminal: i == p.len() - 2,
                next_state: history(p, i + 1, steps_of_history),
            })?;
        }
    }
    Ok(rb)
}

// =============================================================================
// Whole pipeline
// =============================================================================

pub struct BuiltDataset {
    pub train: ReplayBuffer,
    pub test: ReplayBuffer,
    pub norm: DatasetNorm,
    pub train_stats: DatasetStats,
    pub test_stats: DatasetStats,
    pub retained_fraction: f64,
}

#[derive(Serialize)]
struct Report<'a> {
    retained_fraction: f64,
    train: &'a DatasetStats,
    test: &'a DatasetStats,
}

impl BuiltDataset {
    /// Writes `{name}_train.bin`, `{name}_test.bin`, `{name}_stat.json` and
    /// `{name}_report.json` into `dir`.
    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.train.save(dir.join(format!("{name}_train.bin")))?;
        self.test.save(dir.join(format!("{name}_test.bin")))?;
        self.norm.save(dir.join(format!("{name}_stat.json")))?;
        let report = Report {
            retained_fraction: self.retained_fraction,
            train: &self.train_stats,
            test: &self.test_stats,
        };
        let file = std::fs::File::create(dir.join(format!("{name}_report.json")))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &report)?;
        Ok(())
    }
}

/// Runs clean → split → normalize → window → fill on a loaded corpus.
pub fn build(trajectories: &[Trajectory], cfg: &DatasetConfig) -> Result<BuiltDataset> {
    cfg.validate()?;
    let cleaned = clean(trajectories, cfg);
    let (train, test) = split(&cleaned.trajectories, cfg.test_fraction, cfg.seed);
    let norm = fit_norm(&train)?;

    let train_p = prepare(&train, &norm, cfg);
    let test_p = prepare(&test, &norm, cfg);

    let train_stats = DatasetStats::of(&window(&train_p, cfg.steps_of_history, cfg.stage_encoding));
    let test_stats = DatasetStats::of(&window(&test_p, cfg.steps_of_history, cfg.stage_encoding));
    train_stats.log("train");
    test_stats.log("test");

    let train_rb = fill_replay_buffer(&train_p, cfg.steps_of_history, cfg.rb_max_size)?;
    let test_rb = fill_replay_buffer(&test_p, cfg.steps_of_history, cfg.rb_max_size)?;
    info!(
        "replay buffers: train {} / test {} transitions",
        train_rb.len(),
        test_rb.len()
    );

    Ok(BuiltDataset {
        train: train_rb,
        test: test_rb,
        norm,
        train_stats,
        test_stats,
        retained_fraction: cleaned.retained_fraction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeRecord;
    use crate::monitor::{MonitorRow, MonitorWriter};

    fn record(stage: Stage, i: usize, damage: f64, distance: f64) -> EpisodeRecord {
        EpisodeRecord {
            duration: 0.1 * (i + 1) as f32,
            td_error: 0.01 * (i + 1) as f32,
            complexity: 1.0 + (i * i) as f32,
            stage,
            damage,
            distance,
        }
    }

    fn walked(damage: &[f64]) -> Trajectory {
        Trajectory {
            records: damage
                .iter()
                .enumerate()
                .map(|(i, &d)| record(Stage::ALL[i.min(2)], i, d, 6.0 * i as f64))
                .collect(),
        }
    }

    #[test]
    fn clean_filters_by_distance_and_damage() {
        let cfg = DatasetConfig {
            damage_threshold: Some(100.0),
            min_walked_distance: 10.0,
            ..Default::default()
        };
        let never_walked = Trajectory {
            records: vec![record(Stage::Balance, 0, 1.0, 2.0)],
        };
        let too_damaged = walked(&[10.0, 50.0, 200.0, 300.0]);
        let good = walked(&[1.0, 2.0, 3.0, 4.0]);
        let out = clean(&[never_walked, too_damaged, good.clone()], &cfg);
        assert_eq!(out.trajectories, vec![good]);
        assert!((out.retained_fraction - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn clean_drops_trailing_duplicate() {
        let cfg = DatasetConfig::default();
        let mut t = walked(&[1.0, 2.0, 3.0]);
        let mut dup = t.records[2];
        dup.duration = 9.0; // only the trailing columns are compared
        t.records.push(dup);
        let out = clean(&[t], &cfg);
        assert_eq!(out.trajectories[0].len(), 3);
    }

    #[test]
    fn split_is_disjoint_and_seeded() {
        let ts: Vec<Trajectory> = (0..10).map(|i| walked(&[i as f64, i as f64 + 1.0])).collect();
        let (train, test) = split(&ts, 0.3, 7);
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 7);
        for t in &test {
            assert!(!train.contains(t));
        }
        let (train2, _) = split(&ts, 0.3, 7);
        assert_eq!(train, train2);
    }

    #[test]
    fn prepare_pads_and_converts_damage() {
        let cfg = DatasetConfig {
            steps_of_history: 2,
            zero_padding_after: 1,
            individual_norm: false,
            ..Default::default()
        };
        let t = walked(&[1.0, 4.0, 6.0]);
        let norm = fit_norm(std::slice::from_ref(&t)).unwrap();
        let p = prepare_one(&t, &norm, &cfg);
        assert_eq!(p.len(), 2 + 3 + 1);
        assert_eq!(p.rewards, vec![0.0, 0.0, -3.0, -2.0, 0.0, 0.0]);
        // leading rows are zero except the forward-filled stage
        assert_eq!(p.rows[0][feat::DURATION], 0.0);
        assert_eq!(p.rows[0][feat::STAGE], p.rows[2][feat::STAGE]);
        assert_eq!(p.rows[5], [0.0; STATE_DIM]);
        assert_eq!(p.stages[0], Some(Stage::TeacherForcedBalance));
        assert_eq!(p.stages[5], None);
        assert_eq!(p.labels(StageEncoding::Centered)[5], -1.0);
        assert_eq!(p.labels(StageEncoding::Centered)[4], 1.0);
    }

    #[test]
    fn remaining_damage_mode_uses_training_stats() {
        let cfg = DatasetConfig {
            damage_mode: DamageMode::NormalizedRemaining,
            ..Default::default()
        };
        let t = walked(&[0.0, 2.0, 4.0]);
        let norm = fit_norm(std::slice::from_ref(&t)).unwrap();
        let p = prepare_one(&t, &norm, &cfg);
        let raw = [4.0, 4.0, 2.0, 0.0];
        for (r, d) in p.rewards.iter().zip(raw) {
            assert!((*r as f64 - norm.damage.normalize_scalar(d)).abs() < 1e-6);
        }
    }

    #[test]
    fn windows_end_at_every_index() {
        let cfg = DatasetConfig {
            steps_of_history: 2,
            ..Default::default()
        };
        let t = walked(&[1.0, 2.0, 3.0]);
        let norm = fit_norm(std::slice::from_ref(&t)).unwrap();
        let p = prepare(std::slice::from_ref(&t), &norm, &cfg);
        let w = window(&p, 2, StageEncoding::Centered);
        assert_eq!(w.windows.len(), p[0].len() - 1);
        assert!(w.windows.iter().all(|x| x.len() == 2 * STATE_DIM));
        let stats = DatasetStats::of(&w);
        assert_eq!(stats.windows, w.windows.len());
        let d = stats.damage.unwrap();
        assert!(d.min[0] <= d.median[0] && d.median[0] <= d.max[0]);
    }

    #[test]
    fn replay_fill_marks_last_transition_terminal() {
        let cfg = DatasetConfig::default();
        let t = walked(&[1.0, 2.0, 5.0]);
        let norm = fit_norm(std::slice::from_ref(&t)).unwrap();
        let p = prepare(std::slice::from_ref(&t), &norm, &cfg);
        let rb = fill_replay_buffer(&p, 1, 100).unwrap();
        // one leading pad row + 3 episodes -> 3 transitions
        assert_eq!(rb.len(), 3);
        let terminals: Vec<bool> = rb.iter().map(|t| t.terminal).collect();
        assert_eq!(terminals, vec![false, false, true]);
        let rewards: Vec<f32> = rb.iter().map(|t| t.reward).collect();
        assert_eq!(rewards, vec![0.0, -1.0, -3.0]);
    }

    #[test]
    fn replay_fill_overflow_is_fatal() {
        let cfg = DatasetConfig::default();
        let t = walked(&[1.0, 2.0, 5.0, 6.0]);
        let norm = fit_norm(std::slice::from_ref(&t)).unwrap();
        let p = prepare(std::slice::from_ref(&t), &norm, &cfg);
        let err = fill_replay_buffer(&p, 1, 2).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(CurriculumError::CapacityViolation { .. })
        ));
    }

    #[test]
    fn load_runs_skips_corrupt_stage_logs() {
        let dir = tempfile::tempdir().unwrap();
        let row = |d: f64| MonitorRow {
            duration: 2.0,
            td_error: 30.0,
            complexity: 1.0,
            damage: d,
            distance: 12.0,
        };
        for stage in [Stage::TeacherForcedBalance, Stage::Walk] {
            let name = format!("ddpg-g0001-mp0-{}.monitor.csv", stage.log_tag());
            let mut w = MonitorWriter::create(dir.path().join(name), "t").unwrap();
            w.record(10, 1.0, &row(1.0)).unwrap();
            w.record(20, 1.0, &row(2.0)).unwrap();
            w.finish().unwrap();
        }
        std::fs::write(
            dir.path()
                .join(format!("ddpg-g0001-mp0-{}.monitor.csv", Stage::Balance.log_tag())),
            "#\n#\n#\n1 2 3\n",
        )
        .unwrap();

        let corpus = load_runs(dir.path(), 1, &Summarizer::new(20.0, 600.0)).unwrap();
        assert_eq!(corpus.trajectories.len(), 1);
        assert_eq!(corpus.skipped_logs, 1);
        let t = &corpus.trajectories[0];
        assert_eq!(t.damage(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.records[2].stage, Stage::Walk);
    }
}
