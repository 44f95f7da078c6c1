//! Training driver: the fit loop, validation, checkpointing, early
//! stopping, and the test pass.
//!
//! Single-process, single-device, synchronous. Checkpoints written here
//! (`best.safetensors`, `last.safetensors` under the run's `checkpoints/`
//! directory) use the `state_dict.` format the pretrained-encoder
//! resolver consumes, so any run's checkpoint can seed the next run.

pub mod optimizer;

use candle_core::Device;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::config::{ModelSection, OptimSection, TrainerSection};
use crate::data::SluDataset;
use crate::error::{SluError, SluResult};
use crate::exp::RunContext;
use crate::model::SluModel;
use crate::pretrained::merge::ENCODER_PREFIX;

use optimizer::{AdamW, AdamWConfig, ParamGroup};

/// Resolve a device spec: `auto`, `cpu`, or `cuda[:N]`.
pub fn resolve_device(spec: &str) -> SluResult<Device> {
    match spec {
        "cpu" => Ok(Device::Cpu),
        "auto" => Ok(Device::cuda_if_available(0)?),
        other => {
            if let Some(rest) = other.strip_prefix("cuda") {
                let ordinal = match rest.strip_prefix(':') {
                    Some(n) => n.parse::<usize>().map_err(|_| {
                        SluError::Config(format!("invalid device ordinal in `{}`", other))
                    })?,
                    None if rest.is_empty() => 0,
                    None => {
                        return Err(SluError::Config(format!("unknown device `{}`", other)))
                    }
                };
                Ok(Device::new_cuda(ordinal)?)
            } else {
                Err(SluError::Config(format!("unknown device `{}`", other)))
            }
        }
    }
}

/// Whether the configuration requests a test phase at all: a `test_ds`
/// section with a non-empty manifest path. The third gate condition,
/// `model.prepare_test`, is checked by the caller on the live model.
pub fn test_phase_requested(model_cfg: &ModelSection) -> bool {
    model_cfg
        .test_ds
        .as_ref()
        .is_some_and(|ds| !ds.manifest_filepath.trim().is_empty())
}

/// Summary of a completed fit.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub epochs_run: usize,
    pub total_steps: usize,
    pub final_train_loss: f32,
    pub best_val_loss: Option<f32>,
    pub best_epoch: Option<usize>,
    pub early_stopped: bool,
}

/// Test-pass metrics.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub utterances: usize,
    /// Position-wise token accuracy over hypothesis/reference pairs.
    pub token_accuracy: f32,
    /// Fraction of utterances decoded exactly.
    pub exact_match: f32,
}

/// The training driver.
pub struct Trainer {
    cfg: TrainerSection,
    optim_cfg: OptimSection,
    device: Device,
    run: RunContext,
}

impl Trainer {
    pub fn new(
        cfg: TrainerSection,
        optim_cfg: OptimSection,
        device: Device,
        run: RunContext,
    ) -> Self {
        Self {
            cfg,
            optim_cfg,
            device,
            run,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    /// The epoch loop: seeded shuffling, AdamW steps, periodic validation
    /// with best-checkpoint saving and early stopping.
    pub fn fit(
        &mut self,
        model: &mut SluModel,
        train: &SluDataset,
        val: Option<&SluDataset>,
    ) -> SluResult<FitReport> {
        if train.is_empty() {
            return Err(SluError::Config("training dataset is empty".into()));
        }
        let batch_size = train.batch_size().max(1);
        let batches_per_epoch = train.len().div_ceil(batch_size);
        let total_steps = batches_per_epoch * self.cfg.max_epochs;

        let mut opt = AdamW::new(AdamWConfig::from_section(&self.optim_cfg, total_steps));
        for (name, var) in model.trainable_vars() {
            let group = if name.starts_with(ENCODER_PREFIX) {
                ParamGroup::Encoder
            } else {
                ParamGroup::Decoder
            };
            opt.add_param(var, group)?;
        }
        info!(
            trainable = opt.num_params(),
            encoder_frozen = model.encoder_frozen(),
            total_steps,
            "starting fit"
        );

        let mut rng = ChaCha8Rng::seed_from_u64(self.cfg.seed);
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut best_val_loss: Option<f32> = None;
        let mut best_epoch = None;
        let mut stale_evals = 0usize;
        let mut early_stopped = false;
        let mut epochs_run = 0usize;
        let mut steps = 0usize;
        let mut last_train_loss = f32::NAN;

        for epoch in 1..=self.cfg.max_epochs {
            epochs_run = epoch;
            if train.shuffle() {
                indices.shuffle(&mut rng);
            }
            let mut epoch_loss = 0f32;
            let mut batches = 0usize;
            for chunk in indices.chunks(batch_size) {
                let batch = train.batch(chunk, model.vocab(), &self.device)?;
                let loss = model.forward_loss(&batch)?;
                epoch_loss += loss.to_scalar::<f32>()?;
                opt.step(&loss)?;
                steps += 1;
                batches += 1;
            }
            last_train_loss = epoch_loss / batches as f32;
            info!(epoch, train_loss = last_train_loss, "epoch complete");

            if let Some(val) = val {
                if epoch % self.cfg.eval_every == 0 {
                    let val_loss = self.evaluate_loss(model, val)?;
                    info!(epoch, val_loss, "validation");
                    if best_val_loss.map_or(true, |best| val_loss < best) {
                        best_val_loss = Some(val_loss);
                        best_epoch = Some(epoch);
                        stale_evals = 0;
                        let path = self.run.checkpoint_dir.join("best.safetensors");
                        save_checkpoint(
                            &path,
                            &model.state_snapshot()?,
                            &CheckpointMeta {
                                epoch: epoch as u32,
                                val_loss: Some(val_loss),
                            },
                        )?;
                        info!(epoch, path = %path.display(), "saved best checkpoint");
                    } else {
                        stale_evals += 1;
                        if stale_evals >= self.cfg.early_stopping_patience {
                            info!(epoch, stale_evals, "early stopping");
                            early_stopped = true;
                            break;
                        }
                    }
                }
            }
        }

        let last_path = self.run.checkpoint_dir.join("last.safetensors");
        save_checkpoint(
            &last_path,
            &model.state_snapshot()?,
            &CheckpointMeta {
                epoch: epochs_run as u32,
                val_loss: best_val_loss,
            },
        )?;

        Ok(FitReport {
            epochs_run,
            total_steps: steps,
            final_train_loss: last_train_loss,
            best_val_loss,
            best_epoch,
            early_stopped,
        })
    }

    /// Mean batch loss over a dataset, without optimizer updates.
    pub fn evaluate_loss(&self, model: &SluModel, set: &SluDataset) -> SluResult<f32> {
        if set.is_empty() {
            return Err(SluError::Config("cannot evaluate an empty dataset".into()));
        }
        let batch_size = set.batch_size().max(1);
        let indices: Vec<usize> = (0..set.len()).collect();
        let mut total = 0f32;
        let mut batches = 0usize;
        for chunk in indices.chunks(batch_size) {
            let batch = set.batch(chunk, model.vocab(), &self.device)?;
            total += model.forward_loss(&batch)?.to_scalar::<f32>()?;
            batches += 1;
        }
        Ok(total / batches as f32)
    }

    /// One greedy-decoding evaluation pass over the test set prepared by
    /// [`SluModel::prepare_test`].
    pub fn test(&mut self, model: &mut SluModel) -> SluResult<TestReport> {
        let set = model.take_test_set().ok_or_else(|| {
            SluError::Config("test dataset not prepared; call prepare_test first".into())
        })?;
        let mut correct = 0usize;
        let mut total = 0usize;
        let mut exact = 0usize;
        for idx in 0..set.len() {
            let utt = set.utterance(idx);
            let feats = set.features_tensor(idx, &self.device)?;
            let hyp = model.greedy_decode(&feats, utt.frames)?;
            let reference = &utt.target;
            correct += hyp
                .iter()
                .zip(reference.iter())
                .filter(|(h, r)| h == r)
                .count();
            total += hyp.len().max(reference.len());
            if &hyp == reference {
                exact += 1;
            }
        }
        let report = TestReport {
            utterances: set.len(),
            token_accuracy: if total == 0 {
                0.0
            } else {
                correct as f32 / total as f32
            },
            exact_match: exact as f32 / set.len() as f32,
        };
        info!(
            utterances = report.utterances,
            token_accuracy = report.token_accuracy,
            exact_match = report.exact_match,
            "test complete"
        );
        Ok(report)
    }
}
