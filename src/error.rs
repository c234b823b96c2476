//! Error types for misuse and insertion failures.
//!
//! Expected absence (a dead weak reference, a refused non-blocking
//! acquire) is reported through `Option`/`bool`, not through these types.

use thiserror::Error;

/// Insert rejected by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsertError {
    /// A live entry with the same key already exists (unique ordering only).
    #[error("a live entry with this key already exists")]
    DuplicateKey,
}

/// Programmer misuse, reported at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MisuseError {
    #[error("request for zero units")]
    ZeroUnits,
    #[error("lock set is empty")]
    EmptyLockSet,
    #[error("token already installed")]
    TokenAlreadyInstalled,
}
