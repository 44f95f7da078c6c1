//! Dataset handling for SLU training.
//!
//! - [`manifest`]: JSONL manifest parsing with line-level error context
//! - [`dataset`]: feature loading, target tokenization, padded batching
//!
//! Manifests reference precomputed filterbank features stored as
//! safetensors files (one `features` tensor of shape `[frames, feat_dim]`
//! per utterance). The `text` field carries the serialized intent/slot
//! semantics and is tokenized with a HuggingFace tokenizer.

pub mod dataset;
pub mod manifest;

pub use dataset::{SluBatch, SluDataset, Utterance};
pub use manifest::{read_manifest, ManifestEntry};
