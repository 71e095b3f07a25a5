use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::critic::StageCritic;

/// Anything whose parameters can be written to and read from one file.
pub trait Checkpointable {
    fn save_to_path(&self, path: &Path) -> Result<()>;
    fn load_from_path(&mut self, path: &Path) -> Result<()>;
}

impl Checkpointable for StageCritic {
    fn save_to_path(&self, path: &Path) -> Result<()> {
        self.save(path)
    }

    fn load_from_path(&mut self, path: &Path) -> Result<()> {
        self.load(path)
    }
}

/// Periodic critic snapshots named `{run}_iter_{iteration:08}.safetensors`.
/// Only the newest `keep` periodic snapshots are retained.
pub struct Checkpointer {
    save_every: usize,
    dir: PathBuf,
    run_name: String,
    keep: usize,
}

impl Checkpointer {
    pub fn new(save_every: usize, dir: PathBuf, run_name: String, keep: usize) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            save_every,
            dir,
            run_name,
            keep,
        })
    }

    /// Snapshots go next to `base`, named after its file name.
    pub fn beside(base: &Path, save_every: usize, keep: usize) -> Result<Self> {
        let dir = match base.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let run_name = base
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("critic")
            .to_string();
        Self::new(save_every, dir, run_name, keep)
    }

    pub fn checkpoint_path(&self, iteration: usize) -> PathBuf {
        self.dir
            .join(format!("{}_iter_{iteration:08}.safetensors", self.run_name))
    }

    fn iteration_of(&self, filename: &str) -> Option<usize> {
        let rest = filename
            .strip_prefix(&self.run_name)?
            .strip_prefix("_iter_")?
            .strip_suffix(".safetensors")?;
        rest.parse().ok()
    }

    /// Saves when `iteration` is a positive multiple of the save interval.
    pub fn maybe_save<T: Checkpointable + ?Sized>(
        &self,
        iteration: usize,
        item: &T,
    ) -> Result<Option<PathBuf>> {
        if self.save_every == 0 || iteration == 0 || !iteration.is_multiple_of(self.save_every) {
            return Ok(None);
        }
        let path = self.save(iteration, item)?;
        self.cleanup()?;
        Ok(Some(path))
    }

    pub fn save<T: Checkpointable + ?Sized>(&self, iteration: usize, item: &T) -> Result<PathBuf> {
        let path = self.checkpoint_path(iteration);
        item.save_to_path(&path)?;
        info!("saved critic checkpoint at iteration {iteration} to {}", path.display());
        Ok(path)
    }

    fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        if !self.dir.exists() {
            return Ok(found);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && let Some(iteration) = self.iteration_of(name)
            {
                found.push((iteration, path));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }

    /// Newest snapshot and its iteration.
    pub fn latest(&self) -> Result<Option<(PathBuf, usize)>> {
        Ok(self.list()?.into_iter().next().map(|(i, p)| (p, i)))
    }

    pub fn load_latest<T: Checkpointable + ?Sized>(&self, item: &mut T) -> Result<Option<usize>> {
        match self.latest()? {
            Some((path, iteration)) => {
                item.load_from_path(&path)?;
                info!("loaded critic checkpoint from iteration {iteration}");
                Ok(Some(iteration))
            }
            None => Ok(None),
        }
    }

    fn cleanup(&self) -> Result<()> {
        for (_, path) in self.list()?.iter().skip(self.keep.max(1)) {
            if let Err(e) = fs::remove_file(path) {
                warn!("failed to remove old checkpoint {}: {e}", path.display());
            }
        }
        Ok(())
    }
}
