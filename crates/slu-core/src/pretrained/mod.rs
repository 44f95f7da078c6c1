//! Encoder initialization from pretrained sources.
//!
//! Given a classified [`PretrainedSource`], [`initialize_encoder`] loads
//! the corresponding weights, merges them into the target model
//! (non-strict), and applies the freeze policy. The branch taken:
//!
//! 1. [`PretrainedSource::None`] — nothing loaded; no file or network I/O.
//! 2. [`PretrainedSource::LocalCheckpoint`] — the checkpoint's
//!    `state_dict.` sub-mapping applies to the **whole** model.
//! 3. [`PretrainedSource::LocalArchive`] — a complete source model is
//!    restored, its full parameter mapping applies to the **whole**
//!    model, and the source model is dropped.
//! 4. [`PretrainedSource::Remote`] — the registry fetcher downloads the
//!    named model and only its `encoder.*` parameters apply, into the
//!    target encoder.
//!
//! The freeze policy runs unconditionally afterwards, on every branch.
//!
//! The resolver performs no logging. It reports progress through a
//! caller-supplied [`InitObserver`]; the branch-selection event is always
//! emitted *before* the failure-prone load, so a failure's log context
//! names the active branch.

pub mod archive;
pub mod merge;
pub mod registry;
pub mod source;

use std::path::Path;

use candle_core::Device;

use crate::checkpoint;
use crate::error::{SluError, SluResult};
use crate::model::SluModel;

use merge::{MergeReport, MergeScope};
use registry::{EncoderKind, ZooRegistry};

pub use source::{PretrainedSource, ARCHIVE_EXTENSION};

/// Progress events emitted during encoder initialization.
#[derive(Debug)]
pub enum InitEvent<'a> {
    /// No pretrained source configured; random initialization kept.
    NoPretrainedEncoder,
    /// About to load a raw training checkpoint.
    LoadingCheckpoint { path: &'a Path },
    /// About to restore a model archive.
    LoadingArchive { path: &'a Path },
    /// About to fetch a named model from the zoo.
    FetchingRemote { name: &'a str, kind: EncoderKind },
    /// Weights were merged into the target model.
    WeightsApplied {
        scope: MergeScope,
        report: &'a MergeReport,
    },
    /// The freeze policy was applied.
    FreezePolicy { frozen: bool },
}

/// Receives [`InitEvent`]s. The CLI installs a tracing-backed observer;
/// tests record events.
pub trait InitObserver {
    fn observe(&mut self, event: InitEvent<'_>);
}

/// Observer that discards every event.
pub struct NullObserver;

impl InitObserver for NullObserver {
    fn observe(&mut self, _event: InitEvent<'_>) {}
}

/// What the resolver did.
#[derive(Debug, Clone, Copy)]
pub struct InitOutcome {
    /// Merge counts, absent on the no-source branch.
    pub merge: Option<MergeReport>,
    /// Whether the encoder ended up frozen.
    pub frozen: bool,
}

/// Resolve the pretrained source, merge weights into `model`, and apply
/// the freeze policy. Mutates the model's parameters in place.
pub fn initialize_encoder(
    source: &PretrainedSource,
    freeze: bool,
    model: &mut SluModel,
    registry: &ZooRegistry,
    observer: &mut dyn InitObserver,
) -> SluResult<InitOutcome> {
    let merge = match source {
        PretrainedSource::None => {
            observer.observe(InitEvent::NoPretrainedEncoder);
            None
        }
        PretrainedSource::LocalCheckpoint(path) => {
            observer.observe(InitEvent::LoadingCheckpoint { path });
            let state = checkpoint::load_state_dict(path, &Device::Cpu)?;
            let report = model.apply_weights(&state, MergeScope::WholeModel)?;
            drop(state);
            observer.observe(InitEvent::WeightsApplied {
                scope: MergeScope::WholeModel,
                report: &report,
            });
            Some(report)
        }
        PretrainedSource::LocalArchive(path) => {
            observer.observe(InitEvent::LoadingArchive { path });
            let source_model = archive::restore_archive(path, &Device::Cpu)?;
            let state = source_model.state_snapshot()?;
            drop(source_model);
            let report = model.apply_weights(&state, MergeScope::WholeModel)?;
            observer.observe(InitEvent::WeightsApplied {
                scope: MergeScope::WholeModel,
                report: &report,
            });
            Some(report)
        }
        PretrainedSource::Remote { name, kind } => {
            observer.observe(InitEvent::FetchingRemote { name, kind: *kind });
            let fetcher =
                registry
                    .fetcher_for(name)
                    .ok_or_else(|| SluError::UnknownEncoderKind {
                        name: name.clone(),
                    })?;
            let state = fetcher.fetch(name)?;
            let report = model.apply_weights(&state, MergeScope::EncoderOnly)?;
            drop(state);
            observer.observe(InitEvent::WeightsApplied {
                scope: MergeScope::EncoderOnly,
                report: &report,
            });
            Some(report)
        }
    };

    if freeze {
        model.freeze_encoder();
    } else {
        model.unfreeze_encoder();
    }
    observer.observe(InitEvent::FreezePolicy { frozen: freeze });

    Ok(InitOutcome {
        merge,
        frozen: freeze,
    })
}
