use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::episode::{EpisodeRecord, feat};
use crate::normalize::{NormStats, RunningMeanStd};
use crate::{Features, STATE_DIM};

/// Where the tracker takes its z-scoring statistics from.
#[derive(Debug, Clone)]
enum InputNorm {
    Raw,
    Fixed(NormStats),
    Running(RunningMeanStd),
}

/// Mean and first-to-last change of each feature over the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerSummary {
    pub mean: Features,
    pub trend: Features,
}

// =============================================================================
// Performance Tracker
// =============================================================================

/// Sliding window over the most recent episode records of a run.
///
/// The exposed state is `depth` feature rows, oldest first. Missing history
/// is zero rows whose stage column copies the oldest real row, the same
/// layout the offline dataset builder produces.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    depth: usize,
    window: VecDeque<EpisodeRecord>,
    norm: InputNorm,
}

impl PerformanceTracker {
    /// With `input_norm` and no `stats`, statistics are accumulated online.
    pub fn new(depth: usize, input_norm: bool, stats: Option<NormStats>) -> Self {
        let depth = depth.max(1);
        let norm = match (input_norm, stats) {
            (false, _) => InputNorm::Raw,
            (true, Some(s)) => InputNorm::Fixed(s),
            (true, None) => InputNorm::Running(RunningMeanStd::new(STATE_DIM)),
        };
        Self {
            depth,
            window: VecDeque::with_capacity(depth),
            norm,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn state_len(&self) -> usize {
        self.depth * STATE_DIM
    }

    pub fn input_norm(&self) -> bool {
        !matches!(self.norm, InputNorm::Raw)
    }

    pub fn records(&self) -> impl Iterator<Item = &EpisodeRecord> {
        self.window.iter()
    }

    pub fn latest(&self) -> Option<&EpisodeRecord> {
        self.window.back()
    }

    pub fn add(&mut self, record: EpisodeRecord) {
        if let InputNorm::Running(stats) = &mut self.norm {
            stats.update(&record.features());
        }
        if self.window.len() == self.depth {
            self.window.pop_front();
        }
        self.window.push_back(record);
    }

    fn exposed(&self, record: &EpisodeRecord) -> Features {
        let raw = record.features();
        let scaled = match &self.norm {
            InputNorm::Raw => return raw,
            InputNorm::Fixed(s) => s.normalize_f32(&raw),
            InputNorm::Running(r) => r.stats().normalize_f32(&raw),
        };
        let mut out = [0.0f32; STATE_DIM];
        out.copy_from_slice(&scaled);
        out
    }

    /// Flattened `depth x STATE_DIM` state for the critic.
    pub fn state(&self) -> Vec<f32> {
        let mut state = vec![0.0f32; self.state_len()];
        let missing = self.depth - self.window.len();
        let rows: Vec<Features> = self.window.iter().map(|r| self.exposed(r)).collect();
        if let Some(first) = rows.first() {
            for pad in 0..missing {
                state[pad * STATE_DIM + feat::STAGE] = first[feat::STAGE];
            }
        }
        for (i, row) in rows.iter().enumerate() {
            let at = (missing + i) * STATE_DIM;
            state[at..at + STATE_DIM].copy_from_slice(row);
        }
        state
    }

    pub fn summary(&self) -> Option<TrackerSummary> {
        let rows: Vec<Features> = self.window.iter().map(|r| self.exposed(r)).collect();
        let first = rows.first()?;
        let last = rows.last()?;
        let n = rows.len() as f32;
        let mut mean = [0.0f32; STATE_DIM];
        for row in &rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut trend = [0.0f32; STATE_DIM];
        for (i, t) in trend.iter_mut().enumerate() {
            *t = last[i] - first[i];
        }
        Some(TrackerSummary { mean, trend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::stage_feature;
    use crate::stage::Stage;

    fn rec(duration: f32, stage: Stage) -> EpisodeRecord {
        EpisodeRecord {
            duration,
            td_error: 0.2,
            complexity: 1.0,
            stage,
            damage: 0.0,
            distance: 0.0,
        }
    }

    #[test]
    fn window_is_fifo_with_fixed_depth() {
        let mut pt = PerformanceTracker::new(2, false, None);
        pt.add(rec(0.1, Stage::Balance));
        pt.add(rec(0.2, Stage::Balance));
        pt.add(rec(0.3, Stage::Walk));
        assert_eq!(pt.len(), 2);
        let durations: Vec<f32> = pt.records().map(|r| r.duration).collect();
        assert_eq!(durations, vec![0.2, 0.3]);
        assert_eq!(pt.latest().unwrap().stage, Stage::Walk);
    }

    #[test]
    fn state_pads_missing_history() {
        let mut pt = PerformanceTracker::new(3, false, None);
        assert_eq!(pt.state(), vec![0.0; 12]);
        pt.add(rec(0.5, Stage::Balance));
        let s = pt.state();
        assert_eq!(s.len(), 12);
        // two padding rows carry only the stage column
        assert_eq!(&s[0..4], &[0.0, 0.0, 0.0, stage_feature(Stage::Balance)]);
        assert_eq!(&s[4..8], &[0.0, 0.0, 0.0, stage_feature(Stage::Balance)]);
        assert_eq!(s[8], 0.5);
    }

    #[test]
    fn fixed_stats_are_applied() {
        let stats = NormStats {
            mean: vec![0.5, 0.0, 0.0, 0.0],
            std: vec![0.25, 1.0, 1.0, 1.0],
        };
        let mut pt = PerformanceTracker::new(1, true, Some(stats));
        pt.add(rec(1.0, Stage::TeacherForcedBalance));
        assert!((pt.state()[0] - 2.0).abs() < 1e-6);
        assert!(pt.input_norm());
    }

    #[test]
    fn summary_reports_mean_and_trend() {
        let mut pt = PerformanceTracker::new(4, false, None);
        assert!(pt.summary().is_none());
        pt.add(rec(0.2, Stage::Balance));
        pt.add(rec(0.6, Stage::Balance));
        let s = pt.summary().unwrap();
        assert!((s.mean[0] - 0.4).abs() < 1e-6);
        assert!((s.trend[0] - 0.4).abs() < 1e-6);
    }
}
