use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::monitor::{self, MonitorRow};
use crate::stage::Stage;
use crate::{Features, STATE_DIM};

/// Column positions inside a [`Features`] row.
pub mod feat {
    pub const DURATION: usize = 0;
    pub const TD_ERROR: usize = 1;
    pub const COMPLEXITY: usize = 2;
    pub const STAGE: usize = 3;
}

/// Stage column value of a feature row. Never zero, so a row always has
/// at least one populated entry.
pub fn stage_feature(stage: Stage) -> f32 {
    (stage.index() as f32 + 1.0) / 10.0
}

// =============================================================================
// Episode Record
// =============================================================================

/// Summary of one completed training episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Episode length over the environment timeout.
    pub duration: f32,
    /// Mean TD error over the error scale constant.
    pub td_error: f32,
    pub complexity: f32,
    pub stage: Stage,
    /// Cumulative damage at episode end.
    pub damage: f64,
    pub distance: f64,
}

impl EpisodeRecord {
    pub fn features(&self) -> Features {
        let mut f = [0.0f32; STATE_DIM];
        f[feat::DURATION] = self.duration;
        f[feat::TD_ERROR] = self.td_error;
        f[feat::COMPLEXITY] = self.complexity;
        f[feat::STAGE] = stage_feature(self.stage);
        f
    }
}

pub fn is_populated(row: &[f32]) -> bool {
    row.iter().any(|v| *v != 0.0)
}

// =============================================================================
// Summarizer
// =============================================================================

/// One simulation step as reported by the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSample {
    pub dt: f64,
    pub td_error: f64,
    pub complexity: f64,
    /// Cumulative damage after this step.
    pub damage: f64,
    /// Distance travelled so far.
    pub distance: f64,
}

/// Turns raw episode data into [`EpisodeRecord`]s using the environment's
/// scale constants.
#[derive(Debug, Clone, Copy)]
pub struct Summarizer {
    pub env_timeout: f64,
    pub td_error_scale: f64,
}

impl Summarizer {
    pub fn new(env_timeout: f64, td_error_scale: f64) -> Self {
        Self {
            env_timeout,
            td_error_scale,
        }
    }

    /// Scales one monitor row that already summarizes an episode.
    pub fn from_row(&self, row: &MonitorRow, stage: Stage) -> EpisodeRecord {
        EpisodeRecord {
            duration: (row.duration / self.env_timeout) as f32,
            td_error: (row.td_error / self.td_error_scale) as f32,
            complexity: row.complexity as f32,
            stage,
            damage: row.damage,
            distance: row.distance,
        }
    }

    /// Reduces a per-step time series to its monitor row.
    pub fn reduce_steps(&self, steps: &[StepSample]) -> Option<MonitorRow> {
        let last = steps.last()?;
        let n = steps.len() as f64;
        Some(MonitorRow {
            duration: steps.iter().map(|s| s.dt).sum(),
            td_error: steps.iter().map(|s| s.td_error.abs()).sum::<f64>() / n,
            complexity: steps.iter().map(|s| s.complexity).sum::<f64>() / n,
            damage: last.damage,
            distance: steps.iter().map(|s| s.distance).fold(0.0, f64::max),
        })
    }

    /// Summarizes a per-step time series. `None` when there is no data.
    pub fn summarize(&self, steps: &[StepSample], stage: Stage) -> Option<EpisodeRecord> {
        self.reduce_steps(steps).map(|row| self.from_row(&row, stage))
    }

    /// Reads a whole monitor log produced by one stage of one run.
    pub fn summarize_log<P: AsRef<Path>>(&self, path: P, stage: Stage) -> Result<Trajectory> {
        let rows = monitor::read_log(path)?;
        Ok(Trajectory {
            records: rows.iter().map(|r| self.from_row(r, stage)).collect(),
        })
    }
}

// =============================================================================
// Trajectories
// =============================================================================

/// Consecutive episodes of one run, possibly spanning several stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trajectory {
    pub records: Vec<EpisodeRecord>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn features(&self) -> Vec<Features> {
        self.records.iter().map(EpisodeRecord::features).collect()
    }

    pub fn damage(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.damage).collect()
    }

    pub fn final_damage(&self) -> f64 {
        self.records.last().map(|r| r.damage).unwrap_or(0.0)
    }

    pub fn max_distance(&self) -> f64 {
        self.records.iter().map(|r| r.distance).fold(0.0, f64::max)
    }
}

/// Joins two trajectories of the same run. The second one's damage is
/// offset by the first one's final damage so the result stays monotone;
/// with `first_no_damage` the first part's damage is zeroed beforehand.
pub fn concat(
    first: Option<Trajectory>,
    second: Option<Trajectory>,
    first_no_damage: bool,
) -> Option<Trajectory> {
    let (mut first, second) = match (first, second) {
        (None, None) => return None,
        (Some(a), None) => return Some(a),
        (None, Some(b)) => return Some(b),
        (Some(a), Some(b)) => (a, b),
    };
    if first_no_damage {
        for r in &mut first.records {
            r.damage = 0.0;
        }
    }
    let offset = first.final_damage();
    first
        .records
        .extend(second.records.into_iter().map(|r| EpisodeRecord {
            damage: r.damage + offset,
            ..r
        }));
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traj(stage: Stage, damage: &[f64]) -> Trajectory {
        Trajectory {
            records: damage
                .iter()
                .map(|&d| EpisodeRecord {
                    duration: 0.5,
                    td_error: 0.1,
                    complexity: 1.0,
                    stage,
                    damage: d,
                    distance: 1.0,
                })
                .collect(),
        }
    }

    #[test]
    fn concat_offsets_damage() {
        let a = traj(Stage::TeacherForcedBalance, &[1.0, 3.0]);
        let b = traj(Stage::Balance, &[0.0, 2.0]);
        let c = concat(Some(a), Some(b), false).unwrap();
        assert_eq!(c.damage(), vec![1.0, 3.0, 3.0, 5.0]);
        assert_eq!(c.records[2].stage, Stage::Balance);
        assert!(c.damage()[2] >= c.damage()[1]);
    }

    #[test]
    fn concat_first_no_damage() {
        let a = traj(Stage::TeacherForcedBalance, &[1.0, 3.0]);
        let b = traj(Stage::Balance, &[0.5, 2.0]);
        let c = concat(Some(a), Some(b), true).unwrap();
        assert_eq!(c.damage(), vec![0.0, 0.0, 0.5, 2.0]);
    }

    #[test]
    fn concat_with_missing_parts() {
        let a = traj(Stage::Balance, &[1.0]);
        assert_eq!(concat(Some(a.clone()), None, false), Some(a.clone()));
        assert_eq!(concat(None, Some(a.clone()), true), Some(a));
        assert_eq!(concat(None, None, false), None);
    }

    #[test]
    fn summarized_records_are_populated() {
        let s = Summarizer::new(20.0, 600.0);
        let rec = s
            .summarize(&[StepSample::default(), StepSample::default()], Stage::TeacherForcedBalance)
            .unwrap();
        assert!(is_populated(&rec.features()));
        assert!(s.summarize(&[], Stage::Walk).is_none());
    }

    #[test]
    fn summarize_scales_fields() {
        let s = Summarizer::new(10.0, 100.0);
        let steps = [
            StepSample {
                dt: 2.0,
                td_error: -20.0,
                complexity: 1.0,
                damage: 1.0,
                distance: 4.0,
            },
            StepSample {
                dt: 3.0,
                td_error: 40.0,
                complexity: 3.0,
                damage: 2.5,
                distance: 3.0,
            },
        ];
        let rec = s.summarize(&steps, Stage::Walk).unwrap();
        assert!((rec.duration - 0.5).abs() < 1e-6);
        assert!((rec.td_error - 0.3).abs() < 1e-6);
        assert!((rec.complexity - 2.0).abs() < 1e-6);
        assert_eq!(rec.damage, 2.5);
        assert_eq!(rec.distance, 4.0);
    }
}
