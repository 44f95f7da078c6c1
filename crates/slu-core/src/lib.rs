//! Speech intent and slot (SLU) recognition training library.
//!
//! This crate provides everything the `slu` training entry point needs:
//!
//! - `config`: TOML configuration with dotted `key=value` overrides
//! - `data`: JSONL manifests, feature loading, batching
//! - `model`: encoder/decoder model built on Candle
//! - `pretrained`: encoder initialization from checkpoints, archives, or
//!   the remote model zoo, with an explicit freeze policy
//! - `training`: fit/test loops with AdamW and checkpointing
//! - `exp`: experiment run directory management
//!
//! The pretrained-encoder source is classified exactly once at configuration
//! validation time into a [`PretrainedSource`], then applied by
//! [`initialize_encoder`]. The resolver itself performs no logging; it emits
//! [`InitEvent`]s through a caller-supplied [`InitObserver`].

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod exp;
pub mod model;
pub mod pretrained;
pub mod training;

pub use error::{SluError, SluResult};
pub use model::{SluModel, VocabSpec};
pub use pretrained::merge::{MergeReport, MergeScope, TensorMap};
pub use pretrained::registry::{EncoderFetch, EncoderKind, ZooRegistry};
pub use pretrained::{initialize_encoder, InitEvent, InitObserver, InitOutcome, PretrainedSource};
pub use training::{test_phase_requested, Trainer};
