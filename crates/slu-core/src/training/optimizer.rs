//! AdamW optimizer for Candle `Var` parameters.
//!
//! - per-parameter moment estimates (m, v)
//! - linear warmup then cosine decay schedule
//! - global gradient-norm clipping
//! - decoupled weight decay
//!
//! Parameters are registered in two groups so a fine-tuned encoder can
//! run at a lower learning rate than the freshly initialized decoder.

use candle_core::{Tensor, Var};

use crate::config::OptimSection;
use crate::error::SluResult;

/// Optimizer configuration with the schedule horizon fixed.
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr_encoder: f64,
    pub lr_decoder: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl AdamWConfig {
    /// Build from the config section, fixing the schedule at `total_steps`.
    pub fn from_section(section: &OptimSection, total_steps: usize) -> Self {
        Self {
            lr_encoder: section.encoder_lr.unwrap_or(section.lr),
            lr_decoder: section.lr,
            beta1: section.beta1,
            beta2: section.beta2,
            epsilon: 1e-8,
            weight_decay: section.weight_decay,
            max_grad_norm: section.max_grad_norm,
            warmup_steps: section.warmup_steps,
            total_steps,
        }
    }
}

/// Learning-rate group for a registered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    Encoder,
    Decoder,
}

struct TrackedParam {
    var: Var,
    m: Tensor,
    v: Tensor,
    group: ParamGroup,
}

/// AdamW over registered `Var`s.
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            params: Vec::new(),
            step: 0,
        }
    }

    /// Register a trainable parameter.
    pub fn add_param(&mut self, var: Var, group: ParamGroup) -> SluResult<()> {
        let shape = var.as_tensor().shape().clone();
        let dtype = var.as_tensor().dtype();
        let device = var.as_tensor().device().clone();
        let m = Tensor::zeros(&shape, dtype, &device)?;
        let v = Tensor::zeros(&shape, dtype, &device)?;
        self.params.push(TrackedParam { var, m, v, group });
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Current learning rate for a group: linear warmup to the base rate,
    /// then cosine decay towards zero at `total_steps`.
    pub fn current_lr(&self, group: ParamGroup) -> f64 {
        let base = match group {
            ParamGroup::Encoder => self.config.lr_encoder,
            ParamGroup::Decoder => self.config.lr_decoder,
        };
        let warmup = self.config.warmup_steps;
        if self.step < warmup {
            return base * (self.step as f64 / warmup.max(1) as f64);
        }
        let decay_steps = self.config.total_steps.saturating_sub(warmup);
        let progress = (self.step - warmup) as f64 / decay_steps.max(1) as f64;
        let progress = progress.min(1.0);
        base * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }

    /// Backward pass and one update over all registered parameters.
    pub fn step(&mut self, loss: &Tensor) -> SluResult<()> {
        self.step += 1;
        let t = self.step as f64;
        let grads = loss.backward()?;

        // global gradient norm, computed before any update
        let mut sq_sum = 0f32;
        for p in &self.params {
            if let Some(g) = grads.get(p.var.as_tensor()) {
                sq_sum += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
            }
        }
        let norm = sq_sum.sqrt() as f64;
        let clip = if norm > self.config.max_grad_norm && norm > 0.0 {
            self.config.max_grad_norm / norm
        } else {
            1.0
        };

        let b1 = self.config.beta1;
        let b2 = self.config.beta2;
        let lr_encoder = self.current_lr(ParamGroup::Encoder);
        let lr_decoder = self.current_lr(ParamGroup::Decoder);
        for p in &mut self.params {
            let Some(grad) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let grad = (grad * clip)?;
            p.m = ((&p.m * b1)? + (&grad * (1.0 - b1))?)?;
            p.v = ((&p.v * b2)? + (grad.sqr()? * (1.0 - b2))?)?;
            let m_hat = (&p.m / (1.0 - b1.powf(t)))?;
            let v_hat = (&p.v / (1.0 - b2.powf(t)))?;

            let lr = match p.group {
                ParamGroup::Encoder => lr_encoder,
                ParamGroup::Decoder => lr_decoder,
            };
            let denom = (v_hat.sqrt()? + self.config.epsilon)?;
            let update = ((m_hat / denom)? * lr)?;
            let decayed = (p.var.as_tensor() * (1.0 - lr * self.config.weight_decay))?;
            let next = (decayed - update)?;
            p.var.set(&next)?;
        }
        Ok(())
    }
}
