use anyhow::{Context, Result};
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::error::CurriculumError;
use crate::stage::Stage;

// =============================================================================
// Transitions
// =============================================================================

/// One step of curriculum experience. States are flattened history
/// windows of `state_len` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Vec<f32>,
    pub stage: Stage,
    pub reward: f32,
    pub terminal: bool,
    pub next_state: Vec<f32>,
}

/// Column-major view of a set of transitions, ready to become tensors.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub states: Vec<f32>,
    pub stages: Vec<Stage>,
    pub rewards: Vec<f32>,
    pub terminals: Vec<bool>,
    pub next_states: Vec<f32>,
    pub state_len: usize,
}

impl Batch {
    fn with_capacity(n: usize, state_len: usize) -> Self {
        Self {
            states: Vec::with_capacity(n * state_len),
            stages: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            terminals: Vec::with_capacity(n),
            next_states: Vec::with_capacity(n * state_len),
            state_len,
        }
    }

    fn push(&mut self, t: &Transition) {
        self.states.extend_from_slice(&t.state);
        self.stages.push(t.stage);
        self.rewards.push(t.reward);
        self.terminals.push(t.terminal);
        self.next_states.extend_from_slice(&t.next_state);
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

// =============================================================================
// Replay Buffer
// =============================================================================

/// Fixed-capacity ring of transitions. Once full, each insert overwrites
/// the oldest slot.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    slots: Vec<Transition>,
    capacity: usize,
    /// Slot the next insert writes to once the ring is full.
    head: usize,
    count: usize,
    state_len: usize,
}

#[derive(Serialize, Deserialize)]
struct SavedBuffer {
    capacity: usize,
    count: usize,
    state_len: usize,
    /// Oldest first.
    transitions: Vec<Transition>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, state_len: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(1 << 16)),
            capacity,
            head: 0,
            count: 0,
            state_len,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state_len(&self) -> usize {
        self.state_len
    }

    /// Whether at least `min_size` transitions are stored.
    pub fn ready(&self, min_size: usize) -> bool {
        self.count >= min_size.max(1)
    }

    pub fn add(&mut self, t: Transition) -> Result<()> {
        anyhow::ensure!(
            t.state.len() == self.state_len && t.next_state.len() == self.state_len,
            "transition state width {}/{} does not match buffer width {}",
            t.state.len(),
            t.next_state.len(),
            self.state_len
        );
        anyhow::ensure!(self.capacity > 0, "replay buffer has zero capacity");
        if self.slots.len() < self.capacity {
            self.slots.push(t);
            self.count += 1;
        } else {
            self.slots[self.head] = t;
            self.head = (self.head + 1) % self.capacity;
        }
        Ok(())
    }

    /// Like [`add`](Self::add) but refuses to overwrite: a full buffer
    /// means the caller sized it wrong.
    pub fn add_bounded(&mut self, t: Transition) -> Result<()> {
        if self.count >= self.capacity {
            return Err(CurriculumError::CapacityViolation {
                count: self.count + 1,
                capacity: self.capacity,
            }
            .into());
        }
        self.add(t)
    }

    /// Stored transitions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        let (newer, older) = self.slots.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    /// Draws `n` transitions uniformly with replacement.
    pub fn sample_batch(&self, n: usize, rng: &mut SmallRng) -> Result<Batch> {
        if n > self.count {
            return Err(CurriculumError::InsufficientData {
                requested: n,
                available: self.count,
            }
            .into());
        }
        let mut batch = Batch::with_capacity(n, self.state_len);
        for _ in 0..n {
            let idx = rng.random_range(0..self.count);
            batch.push(&self.slots[idx]);
        }
        Ok(batch)
    }

    /// Every stored transition, oldest first.
    pub fn all(&self) -> Batch {
        let mut batch = Batch::with_capacity(self.count, self.state_len);
        self.iter().for_each(|t| batch.push(t));
        batch
    }

    /// Every stored transition in consecutive batches of at most `size`.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = Batch> + '_ {
        let size = size.max(1);
        let mut it = self.iter().peekable();
        std::iter::from_fn(move || {
            it.peek()?;
            let mut batch = Batch::with_capacity(size, self.state_len);
            it.by_ref().take(size).for_each(|t| batch.push(t));
            Some(batch)
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let saved = SavedBuffer {
            capacity: self.capacity,
            count: self.count,
            state_len: self.state_len,
            transitions: self.iter().cloned().collect(),
        };
        let file = File::create(path)
            .with_context(|| format!("Failed to create replay file {}", path.display()))?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, &saved)?;
        Ok(())
    }

    fn read_saved(path: &Path) -> Result<SavedBuffer> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open replay file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let saved: SavedBuffer = bincode::deserialize_from(reader)
            .with_context(|| format!("Failed to decode replay file {}", path.display()))?;
        anyhow::ensure!(
            saved.count == saved.transitions.len(),
            "replay file {} is truncated",
            path.display()
        );
        Ok(saved)
    }

    /// Restores a saved buffer with its original capacity.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let saved = Self::read_saved(path.as_ref())?;
        let capacity = saved.capacity;
        Self::restore(saved, capacity)
    }

    /// Restores a saved buffer into a new buffer of `capacity`, which must
    /// hold every saved transition.
    pub fn load_into<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let saved = Self::read_saved(path.as_ref())?;
        Self::restore(saved, capacity)
    }

    fn restore(saved: SavedBuffer, capacity: usize) -> Result<Self> {
        if saved.count > capacity {
            return Err(CurriculumError::PersistenceMismatch {
                saved: saved.count,
                capacity,
            }
            .into());
        }
        let mut buffer = Self::new(capacity, saved.state_len);
        for t in saved.transitions {
            buffer.add(t)?;
        }
        Ok(buffer)
    }
}
