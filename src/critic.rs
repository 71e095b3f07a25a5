use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Dropout, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::path::Path;
use tracing::trace;

use crate::config::CriticConfig;
use crate::replay::Batch;
use crate::stage::{Stage, StageEncoding};

// =============================================================================
// Critic Network (candle)
// =============================================================================

/// Q(state, stage) regressor.
/// Input: flattened history window followed by the stage action → scalar.
pub struct CriticNet {
    hidden: Vec<Linear>,
    out: Linear,
    dropout: Option<Dropout>,
}

impl CriticNet {
    pub fn new(vs: VarBuilder, input_dim: usize, config: &CriticConfig) -> Result<Self> {
        let mut hidden = Vec::with_capacity(config.hidden.len());
        let mut width = input_dim;
        for (i, &h) in config.hidden.iter().enumerate() {
            hidden.push(candle_nn::linear(width, h, vs.pp(format!("fc{}", i + 1)))?);
            width = h;
        }
        let out = candle_nn::linear(width, 1, vs.pp("out"))?;
        let drop_p = 1.0 - config.dropout_keep;
        let dropout = (drop_p > 0.0).then(|| Dropout::new(drop_p));
        Ok(Self {
            hidden,
            out,
            dropout,
        })
    }

    /// `(n, input_dim)` → `(n, 1)`. Dropout is active only when `train`.
    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.hidden {
            h = layer.forward(&h)?.relu()?;
            if let Some(d) = &self.dropout {
                h = d.forward(&h, train)?;
            }
        }
        self.out.forward(&h)
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// One-step TD targets. Terminal transitions bootstrap nothing: their
/// target is exactly the reward.
pub fn td_targets(rewards: &[f32], terminals: &[bool], next_max: &[f32], gamma: f64) -> Vec<f32> {
    rewards
        .iter()
        .zip(terminals)
        .zip(next_max)
        .map(|((&r, &done), &q)| {
            if done {
                r
            } else {
                (r as f64 + gamma * q as f64) as f32
            }
        })
        .collect()
}

/// Highest-valued candidate. Ties go to the earlier candidate.
pub fn max_over_candidates<F>(candidates: &[Stage], mut eval: F) -> Result<Option<(Stage, f32)>>
where
    F: FnMut(Stage) -> Result<f32>,
{
    let mut best: Option<(Stage, f32)> = None;
    for &stage in candidates {
        let q = eval(stage)?;
        if best.is_none_or(|(_, b)| q > b) {
            best = Some((stage, q));
        }
    }
    Ok(best)
}

/// Runs one critic update. On macOS the Metal temporaries it creates are
/// released when it returns instead of piling up across updates.
fn update_scope<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    #[cfg(target_os = "macos")]
    let f = || objc::rc::autoreleasepool(f);
    f()
}

/// Global L2 norm over the gradients of `vars`.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sq = 0.0f64;
    for g in vars.iter().filter_map(|v| grads.get(v.as_tensor())) {
        sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    Ok(sq.sqrt())
}

/// Rescales the gradients so their global norm is at most `max_norm` and
/// returns the norm before rescaling. `max_norm <= 0` leaves them alone.
fn clip_gradients(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled = g.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}

/// Metal when available and not disabled, else CPU.
pub fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

/// L2 norm of every parameter stored in a safetensors checkpoint.
pub fn checkpoint_l2_norm<P: AsRef<Path>>(path: P) -> Result<f64> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("Failed to read critic checkpoint {}", path.display()))?;
    let mut sq = 0.0f64;
    for t in tensors.values() {
        sq += t.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
    }
    Ok(sq.sqrt())
}

// =============================================================================
// Stage-Value Critic
// =============================================================================

pub struct StageCritic {
    varmap: VarMap,
    target_varmap: VarMap,
    net: CriticNet,
    target_net: CriticNet,
    optimizer: AdamW,
    device: Device,
    state_len: usize,
    gamma: f64,
    tau: f64,
    max_grad_norm: f64,
    encoding: StageEncoding,
    /// Stages the bootstrap max ranges over.
    stages: Vec<Stage>,
    pub steps: u64,
}

impl StageCritic {
    pub fn new(device: &Device, state_len: usize, config: &CriticConfig) -> Result<Self> {
        let varmap = VarMap::new();
        let target_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let target_vb = VarBuilder::from_varmap(&target_varmap, DType::F32, device);
        let net = CriticNet::new(vb, state_len + 1, config)?;
        let target_net = CriticNet::new(target_vb, state_len + 1, config)?;

        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.l2_reg,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        let mut critic = Self {
            varmap,
            target_varmap,
            net,
            target_net,
            optimizer,
            device: device.clone(),
            state_len,
            gamma: config.gamma,
            tau: config.tau,
            max_grad_norm: config.max_grad_norm,
            encoding: config.stage_encoding,
            stages: Stage::ALL.to_vec(),
            steps: 0,
        };
        critic.hard_update_target()?;
        Ok(critic)
    }

    /// Builds a critic and loads `path` into it.
    pub fn from_checkpoint<P: AsRef<Path>>(
        device: &Device,
        state_len: usize,
        config: &CriticConfig,
        path: P,
    ) -> Result<Self> {
        let mut critic = Self::new(device, state_len, config)?;
        critic.load(path)?;
        Ok(critic)
    }

    /// Restricts the TD bootstrap to `stages`. An empty list keeps all.
    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        if !stages.is_empty() {
            self.stages = stages;
        }
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn state_len(&self) -> usize {
        self.state_len
    }

    pub fn encoding(&self) -> StageEncoding {
        self.encoding
    }

    fn input(&self, states: &[f32], actions: Vec<f32>) -> Result<Tensor> {
        let n = actions.len();
        anyhow::ensure!(
            states.len() == n * self.state_len,
            "expected {} state values for {n} rows, got {}",
            n * self.state_len,
            states.len()
        );
        let s = Tensor::from_slice(states, (n, self.state_len), &self.device)?;
        let a = Tensor::from_vec(actions, (n, 1), &self.device)?;
        Ok(Tensor::cat(&[&s, &a], 1)?)
    }

    fn actions(&self, stages: &[Stage]) -> Vec<f32> {
        stages.iter().map(|s| s.action_value(self.encoding)).collect()
    }

    /// Q(s, a) for every row, evaluation mode.
    pub fn predict(&self, states: &[f32], stages: &[Stage]) -> Result<Vec<f32>> {
        let x = self.input(states, self.actions(stages))?;
        Ok(self.net.forward(&x, false)?.squeeze(1)?.to_vec1::<f32>()?)
    }

    /// max over the candidate stages of the target network's Q(s', ·).
    fn next_max(&self, next_states: &[f32], n: usize) -> Result<Vec<f32>> {
        let mut columns = Vec::with_capacity(self.stages.len());
        for &stage in &self.stages {
            let x = self.input(next_states, vec![stage.action_value(self.encoding); n])?;
            let q = self.target_net.forward(&x, false)?.squeeze(1)?.to_vec1::<f32>()?;
            columns.push((stage, q));
        }
        (0..n)
            .map(|row| {
                let best = max_over_candidates(&self.stages, |stage| {
                    Ok(columns
                        .iter()
                        .find(|(s, _)| *s == stage)
                        .map_or(f32::NEG_INFINITY, |(_, q)| q[row]))
                })?;
                Ok(best.map_or(0.0, |(_, q)| q))
            })
            .collect()
    }

    fn targets(&self, batch: &Batch) -> Result<Vec<f32>> {
        let next = self.next_max(&batch.next_states, batch.len())?;
        Ok(td_targets(&batch.rewards, &batch.terminals, &next, self.gamma))
    }

    /// One gradient step of mean-squared TD error. Returns the loss.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        update_scope(|| {
            anyhow::ensure!(!batch.is_empty(), "empty training batch");
            let n = batch.len();
            let targets = self.targets(batch)?;
            let target = Tensor::from_vec(targets, n, &self.device)?.detach();

            let x = self.input(&batch.states, self.actions(&batch.stages))?;
            let q = self.net.forward(&x, true)?.squeeze(1)?;
            let loss = candle_nn::loss::mse(&q, &target)?;

            let mut grads = loss.backward()?;
            let vars = self.varmap.all_vars();
            let norm = clip_gradients(&mut grads, &vars, self.max_grad_norm)?;
            trace!("critic grad norm {norm:.4}");
            self.optimizer.step(&grads)?;
            self.soft_update_target()?;
            self.steps += 1;

            loss.to_scalar::<f32>().map_err(Into::into)
        })
    }

    /// Mean absolute TD error over a batch, evaluation mode.
    pub fn td_error(&self, batch: &Batch) -> Result<f32> {
        if batch.is_empty() {
            return Ok(0.0);
        }
        let targets = self.targets(batch)?;
        let q = self.predict(&batch.states, &batch.stages)?;
        let sum: f64 = q
            .iter()
            .zip(&targets)
            .map(|(a, b)| (a - b).abs() as f64)
            .sum();
        Ok((sum / q.len() as f64) as f32)
    }

    /// Greedy stage among `allowed` for a single state.
    pub fn best_stage(&self, state: &[f32], allowed: &[Stage]) -> Result<Option<Stage>> {
        let best = max_over_candidates(allowed, |stage| {
            Ok(self.predict(state, &[stage])?[0])
        })?;
        Ok(best.map(|(s, _)| s))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap.save(path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .load(path)
            .with_context(|| format!("Failed to load critic weights {}", path.display()))?;
        self.hard_update_target()
    }

    pub fn param_l2_norm(&self) -> Result<f64> {
        let mut sq = 0.0f64;
        for var in self.varmap.all_vars() {
            sq += var.as_tensor().to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
        }
        Ok(sq.sqrt())
    }

    fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock critic varmap"))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    pub fn num_params(&self) -> Result<usize> {
        Ok(Self::sorted_vars(&self.varmap)?
            .iter()
            .map(|(_, v)| v.elem_count())
            .sum())
    }

    /// All parameters, concatenated in parameter-name order.
    pub fn flat_params(&self) -> Result<Vec<f32>> {
        let mut flat = Vec::new();
        for (_, var) in Self::sorted_vars(&self.varmap)? {
            flat.extend(var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(flat)
    }

    /// Inverse of [`flat_params`](Self::flat_params).
    pub fn set_flat_params(&mut self, flat: &[f32]) -> Result<()> {
        let vars = Self::sorted_vars(&self.varmap)?;
        let total: usize = vars.iter().map(|(_, v)| v.elem_count()).sum();
        anyhow::ensure!(
            flat.len() == total,
            "expected {total} parameters, got {}",
            flat.len()
        );
        let mut offset = 0;
        for (_, var) in vars {
            let n = var.elem_count();
            let t = Tensor::from_slice(&flat[offset..offset + n], var.dims(), &self.device)?;
            var.set(&t)?;
            offset += n;
        }
        self.hard_update_target()
    }

    /// Copy online weights → target.
    pub fn hard_update_target(&mut self) -> Result<()> {
        self.blend_target(1.0)
    }

    /// target = tau * online + (1 - tau) * target
    pub fn soft_update_target(&mut self) -> Result<()> {
        self.blend_target(self.tau)
    }

    fn blend_target(&mut self, tau: f64) -> Result<()> {
        let online = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock critic varmap"))?;
        let mut target = self
            .target_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock target varmap"))?;
        for (name, target_v) in target.iter_mut() {
            let online_v = online
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Missing var {name} in critic varmap"))?;
            let new_val = if tau >= 1.0 {
                online_v.as_tensor().detach()
            } else {
                online_v
                    .as_tensor()
                    .affine(tau, 0.0)?
                    .add(&target_v.as_tensor().affine(1.0 - tau, 0.0)?)?
                    .detach()
            };
            target_v.set(&new_val)?;
        }
        Ok(())
    }
}
