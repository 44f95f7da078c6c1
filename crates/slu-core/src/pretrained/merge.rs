//! Non-strict weight merging between named parameter sets.
//!
//! The merge is an explicit operation with a documented conflict policy:
//!
//! - target parameter absent from the source → retained unchanged
//! - source parameter unmatched in the target (or out of scope) → dropped
//! - name matched with a differing shape → [`SluError::ShapeMismatch`]
//!
//! Key-set mismatches in either direction are expected during partial
//! fine-tuning and are never an error. Every merge returns a
//! [`MergeReport`] so callers can log what actually happened.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Tensor, Var};

use crate::error::{SluError, SluResult};

/// Parameter name prefix for encoder variables.
pub const ENCODER_PREFIX: &str = "encoder.";

/// Ordered mapping from parameter name to tensor.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Which part of the target model a merge writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeScope {
    /// All parameters (encoder and decoder).
    WholeModel,
    /// Only `encoder.*` parameters.
    EncoderOnly,
}

impl MergeScope {
    /// Whether a parameter name falls inside this scope.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            MergeScope::WholeModel => true,
            MergeScope::EncoderOnly => name.starts_with(ENCODER_PREFIX),
        }
    }
}

impl std::fmt::Display for MergeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeScope::WholeModel => write!(f, "whole model"),
            MergeScope::EncoderOnly => write!(f, "encoder only"),
        }
    }
}

/// Outcome counts of a non-strict merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Target parameters overwritten from the source.
    pub applied: usize,
    /// In-scope target parameters with no source counterpart.
    pub retained: usize,
    /// Source parameters that matched nothing (including out-of-scope).
    pub dropped: usize,
}

impl std::fmt::Display for MergeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} applied, {} retained, {} dropped",
            self.applied, self.retained, self.dropped
        )
    }
}

/// Merge `source` into the target variables, non-strict, restricted to
/// `scope`. Source tensors are moved to the target's device and dtype
/// before assignment.
pub fn merge_into(
    targets: &HashMap<String, Var>,
    source: &TensorMap,
    scope: MergeScope,
) -> SluResult<MergeReport> {
    let mut report = MergeReport::default();
    for (name, var) in targets {
        if !scope.includes(name) {
            continue;
        }
        match source.get(name) {
            Some(tensor) => {
                let expected = var.as_tensor().dims().to_vec();
                let got = tensor.dims().to_vec();
                if expected != got {
                    return Err(SluError::ShapeMismatch {
                        name: name.clone(),
                        expected,
                        got,
                    });
                }
                let tensor = tensor
                    .to_device(var.as_tensor().device())?
                    .to_dtype(var.as_tensor().dtype())?;
                var.set(&tensor)?;
                report.applied += 1;
            }
            None => report.retained += 1,
        }
    }
    report.dropped = source.len() - report.applied;
    Ok(report)
}
