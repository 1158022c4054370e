use thiserror::Error;

use super::registry::GeometryFingerprint;

/// Failure kinds a caller may need to branch on.
///
/// Functions still return `anyhow::Result`; recover the kind with
/// `err.downcast_ref::<RadiosityError>()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadiosityError {
    #[error("patch count {count} exceeds the matrix capacity of {capacity}")]
    PatchCapacityExceeded { count: usize, capacity: usize },
    #[error("hemicube resolution must be even and non-zero, got {0}")]
    InvalidResolution(usize),
    #[error("sample offset must be strictly positive and finite, got {0}")]
    InvalidOffset(f64),
    #[error("a hemicube rig is already alive on this thread")]
    RigInUse,
    #[error("form-factor matrix fingerprint mismatch: expected {expected}, found {found}")]
    FingerprintMismatch {
        expected: GeometryFingerprint,
        found: GeometryFingerprint,
    },
    #[error("not a form-factor matrix file: {0}")]
    BadMatrixFile(String),
    #[error("render device failure: {0}")]
    DeviceFailure(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("unknown patch id {0}")]
    UnknownPatch(u32),
}
