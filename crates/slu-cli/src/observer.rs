//! Tracing-backed observer for encoder initialization.

use slu_core::{InitEvent, InitObserver};
use tracing::info;

/// Forwards every initialization event to the `tracing` subscriber.
pub struct TracingObserver;

impl InitObserver for TracingObserver {
    fn observe(&mut self, event: InitEvent<'_>) {
        match event {
            InitEvent::NoPretrainedEncoder => {
                info!("Not using a pretrained encoder.");
            }
            InitEvent::LoadingCheckpoint { path } => {
                info!(path = %path.display(), "Loading encoder from a training checkpoint");
            }
            InitEvent::LoadingArchive { path } => {
                info!(path = %path.display(), "Loading encoder from a model archive");
            }
            InitEvent::FetchingRemote { name, kind } => {
                info!(name, %kind, "Fetching pretrained model from the zoo");
            }
            InitEvent::WeightsApplied { scope, report } => {
                info!(%scope, %report, "Pretrained weights applied");
            }
            InitEvent::FreezePolicy { frozen } => {
                if frozen {
                    info!("Encoder frozen, gradient updates disabled.");
                } else {
                    info!("Encoder trainable.");
                }
            }
        }
    }
}
