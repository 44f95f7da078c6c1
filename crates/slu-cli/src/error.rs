//! Exit-code mapping for the CLI.
//!
//! - 0: success
//! - 1: runtime error (I/O, tensor computation, remote lookup, ...)
//! - 2: configuration error (invalid config, bad override, unknown
//!   pretrained encoder name, malformed manifest)

use slu_core::SluError;

/// Map an error to the process exit code.
pub fn exit_code_for_error(err: &SluError) -> i32 {
    match err {
        SluError::Config(_)
        | SluError::Manifest { .. }
        | SluError::UnknownEncoderKind { .. } => 2,
        _ => 1,
    }
}
