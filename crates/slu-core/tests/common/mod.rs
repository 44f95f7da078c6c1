//! Shared fixtures for slu-core integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use slu_core::config::{
    ArchConfig, DatasetSection, DecoderConfig, EncoderConfig, OptimSection, TokenizerSection,
    TrainerSection,
};
use slu_core::exp::RunContext;
use slu_core::pretrained::{InitEvent, InitObserver};
use slu_core::training::Trainer;
use slu_core::{SluModel, TensorMap, VocabSpec};

pub const FEAT_DIM: usize = 4;

pub fn tiny_arch() -> ArchConfig {
    ArchConfig {
        feat_dim: FEAT_DIM,
        encoder: EncoderConfig {
            d_model: 16,
            n_heads: 2,
            n_layers: 1,
            ff_dim: 32,
        },
        decoder: DecoderConfig {
            n_layers: 1,
            ff_dim: 32,
            max_target_len: 8,
        },
    }
}

pub fn tiny_vocab() -> VocabSpec {
    VocabSpec {
        size: 10,
        pad_id: 0,
        bos_id: 2,
        eos_id: 3,
    }
}

pub fn tiny_model() -> SluModel {
    SluModel::new(&tiny_arch(), tiny_vocab(), &Device::Cpu).unwrap()
}

/// Write a minimal word-level tokenizer whose vocabulary matches
/// [`tiny_vocab`].
pub fn write_tokenizer(dir: &Path) -> PathBuf {
    let vocab: HashMap<&str, u32> = [
        ("<pad>", 0),
        ("<unk>", 1),
        ("<s>", 2),
        ("</s>", 3),
        ("turn", 4),
        ("on", 5),
        ("off", 6),
        ("lights", 7),
        ("kitchen", 8),
        ("heat", 9),
    ]
    .into_iter()
    .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    let path = dir.join("tokenizer.json");
    std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
    path
}

pub fn load_tokenizer(dir: &Path) -> Arc<Tokenizer> {
    let path = write_tokenizer(dir);
    Arc::new(Tokenizer::from_file(path).unwrap())
}

/// Write one utterance's feature tensor.
pub fn write_features(dir: &Path, name: &str, frames: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<f32> = (0..frames * FEAT_DIM).map(|i| (i % 7) as f32 * 0.1).collect();
    let t = Tensor::from_vec(data, (frames, FEAT_DIM), &Device::Cpu).unwrap();
    let mut map = HashMap::new();
    map.insert("features".to_string(), t);
    candle_core::safetensors::save(&map, &path).unwrap();
    path
}

/// Write a two-utterance manifest plus its feature files, returning the
/// dataset section pointing at it.
pub fn write_split(dir: &Path, tag: &str) -> DatasetSection {
    use std::io::Write;
    let f1 = write_features(dir, &format!("{tag}_u1.safetensors"), 6);
    let f2 = write_features(dir, &format!("{tag}_u2.safetensors"), 9);
    let manifest = dir.join(format!("{tag}_manifest.json"));
    let mut f = std::fs::File::create(&manifest).unwrap();
    writeln!(
        f,
        r#"{{"feature_filepath": "{}", "text": "turn on lights"}}"#,
        f1.display()
    )
    .unwrap();
    writeln!(
        f,
        r#"{{"feature_filepath": "{}", "text": "turn off heat"}}"#,
        f2.display()
    )
    .unwrap();
    DatasetSection {
        manifest_filepath: manifest.display().to_string(),
        batch_size: 2,
        shuffle: false,
    }
}

pub fn tokenizer_section() -> TokenizerSection {
    TokenizerSection {
        path: "tokenizer.json".into(),
        pad_token: "<pad>".into(),
        unk_token: "<unk>".into(),
        bos_token: "<s>".into(),
        eos_token: "</s>".into(),
    }
}

/// A trainer writing into a fresh run directory under `dir`.
pub fn trainer_at(dir: &Path, max_epochs: usize) -> Trainer {
    let run = RunContext::at(dir.join("run")).unwrap();
    let trainer_cfg = TrainerSection {
        max_epochs,
        seed: 7,
        eval_every: 1,
        early_stopping_patience: 3,
        device: "cpu".to_string(),
    };
    Trainer::new(trainer_cfg, OptimSection::default(), Device::Cpu, run)
}

/// Flattened comparison of two parameter snapshots.
pub fn snapshots_equal(a: &TensorMap, b: &TensorMap) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, t)| {
        b.get(name).is_some_and(|u| {
            let x = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let y = u.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            x == y
        })
    })
}

/// Names whose values differ between two snapshots.
pub fn changed_names(before: &TensorMap, after: &TensorMap) -> Vec<String> {
    before
        .iter()
        .filter(|(name, t)| {
            let x = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let y = after[*name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            x != y
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Observer that records a compact description of every event.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Vec<String>,
}

impl InitObserver for RecordingObserver {
    fn observe(&mut self, event: InitEvent<'_>) {
        let tag = match event {
            InitEvent::NoPretrainedEncoder => "none".to_string(),
            InitEvent::LoadingCheckpoint { .. } => "checkpoint".to_string(),
            InitEvent::LoadingArchive { .. } => "archive".to_string(),
            InitEvent::FetchingRemote { name, .. } => format!("remote:{name}"),
            InitEvent::WeightsApplied { scope, report } => {
                format!("applied:{scope}:{}", report.applied)
            }
            InitEvent::FreezePolicy { frozen } => format!("freeze:{frozen}"),
        };
        self.events.push(tag);
    }
}
