//! Error types for the pool.

use thiserror::Error;

/// Errors surfaced by pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
  /// Zero-byte request. Reported, never retried.
  #[error("invalid allocation size {0}")]
  InvalidSize(usize),
  /// The OS refused to map more pages.
  #[error("out of memory mapping {pages} pages")]
  OutOfMemory { pages: usize },
  /// A freed pointer does not resolve to a span of the expected owner.
  #[error("corrupted free of {addr:#x}")]
  CorruptionDetected { addr: usize },
}

impl PoolError {
  pub(crate) fn corrupt(addr: usize) -> Self {
    Self::CorruptionDetected { addr }
  }
}

pub type Result<T> = core::result::Result<T, PoolError>;
