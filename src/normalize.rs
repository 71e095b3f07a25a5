//! Per-column z-scoring.
//!
//! [`NormStats`] are fit once on a training split and reused verbatim for
//! test data and for online tracker states. [`RunningMeanStd`] covers the
//! case where no precomputed statistics are available.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::error::CurriculumError;

/// Columns whose spread is below this are left unscaled.
const MIN_STD: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl NormStats {
    /// Identity statistics of the given width.
    pub fn identity(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            std: vec![1.0; dim],
        }
    }

    /// Column mean and population standard deviation over `rows`.
    pub fn fit<R: AsRef<[f64]>>(rows: &[R]) -> Option<Self> {
        let dim = rows.first()?.as_ref().len();
        let n = rows.len() as f64;
        let mut mean = vec![0.0; dim];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row.as_ref()) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mut var = vec![0.0; dim];
        for row in rows {
            for ((s, v), m) in var.iter_mut().zip(row.as_ref()).zip(&mean) {
                *s += (v - m) * (v - m);
            }
        }
        let std = var.into_iter().map(|s| (s / n).sqrt()).collect();
        Some(Self { mean, std })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Rejects statistics whose width is not `dim`. `source` names the file
    /// they came from.
    pub fn expect_dim(&self, dim: usize, source: &Path) -> Result<()> {
        if self.mean.len() != dim || self.std.len() != dim {
            return Err(CurriculumError::config(format!(
                "{}: statistics have {} means and {} stds, expected {dim}",
                source.display(),
                self.mean.len(),
                self.std.len()
            ))
            .into());
        }
        Ok(())
    }

    fn scale(&self, i: usize) -> f64 {
        if self.std[i] < MIN_STD { 1.0 } else { self.std[i] }
    }

    pub fn normalize(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, v)| (v - self.mean[i]) / self.scale(i))
            .collect()
    }

    pub fn denormalize(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, v)| v * self.scale(i) + self.mean[i])
            .collect()
    }

    pub fn normalize_f32(&self, row: &[f32]) -> Vec<f32> {
        row.iter()
            .enumerate()
            .map(|(i, v)| ((*v as f64 - self.mean[i]) / self.scale(i)) as f32)
            .collect()
    }

    pub fn normalize_scalar(&self, v: f64) -> f64 {
        (v - self.mean[0]) / self.scale(0)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open normalization stats {}", path.display()))?;
        let stats = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(stats)
    }
}

/// State and damage statistics of one training split, persisted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetNorm {
    pub state: NormStats,
    pub damage: NormStats,
}

impl DatasetNorm {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset stats {}", path.display()))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

// =============================================================================
// Running statistics (Welford)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningMeanStd {
    mean: Vec<f64>,
    var_sum: Vec<f64>,
    count: f64,
}

impl RunningMeanStd {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            var_sum: vec![0.0; dim],
            count: 0.0,
        }
    }

    pub fn update(&mut self, obs: &[f32]) {
        debug_assert_eq!(obs.len(), self.mean.len());
        self.count += 1.0;
        for (i, &x) in obs.iter().enumerate() {
            let x = x as f64;
            let delta = x - self.mean[i];
            self.mean[i] += delta / self.count;
            self.var_sum[i] += delta * (x - self.mean[i]);
        }
    }

    pub fn count(&self) -> u64 {
        self.count as u64
    }

    pub fn stats(&self) -> NormStats {
        let std = if self.count < 2.0 {
            vec![1.0; self.mean.len()]
        } else {
            self.var_sum.iter().map(|s| (s / self.count).sqrt()).collect()
        };
        NormStats {
            mean: self.mean.clone(),
            std,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_matches_population_moments() {
        let rows = vec![vec![1.0, 10.0], vec![3.0, 10.0]];
        let s = NormStats::fit(&rows).unwrap();
        assert_eq!(s.mean, vec![2.0, 10.0]);
        assert_eq!(s.std, vec![1.0, 0.0]);
        // constant column passes through centred but unscaled
        assert_eq!(s.normalize(&[3.0, 12.0]), vec![1.0, 2.0]);
    }

    #[test]
    fn normalize_inverts_denormalize() {
        let s = NormStats {
            mean: vec![0.3, -4.0, 100.0],
            std: vec![0.01, 2.5, 1e-20],
        };
        for x in [[0.0, 0.0, 0.0], [1.5, -3.25, 7.0], [-1e3, 1e-3, 42.0]] {
            let back = s.normalize(&s.denormalize(&x));
            for (a, b) in back.iter().zip(x.iter()) {
                assert!((a - b).abs() < 1e-9, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn width_mismatch_is_a_configuration_error() {
        let src = Path::new("stat.json");
        assert!(NormStats::identity(4).expect_dim(4, src).is_ok());
        let short = NormStats::identity(2);
        let err = short.expect_dim(4, src).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(CurriculumError::Configuration(_))
        ));
        let ragged = NormStats {
            mean: vec![0.0; 4],
            std: vec![1.0; 3],
        };
        assert!(ragged.expect_dim(4, src).is_err());
    }

    #[test]
    fn running_stats_agree_with_batch_fit() {
        let data = [[1.0f32, 2.0], [2.0, 4.0], [6.0, 0.0]];
        let mut r = RunningMeanStd::new(2);
        data.iter().for_each(|d| r.update(d));
        let rows: Vec<Vec<f64>> = data
            .iter()
            .map(|d| d.iter().map(|&v| v as f64).collect())
            .collect();
        let batch = NormStats::fit(&rows).unwrap();
        let online = r.stats();
        for i in 0..2 {
            assert!((batch.mean[i] - online.mean[i]).abs() < 1e-9);
            assert!((batch.std[i] - online.std[i]).abs() < 1e-9);
        }
        assert_eq!(r.count(), 3);
    }
}
