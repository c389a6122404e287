//! Pool geometry and runtime tuning.

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 4KB

/// Largest request served from size classes. Anything bigger is a page span.
pub const MAX_BYTES: usize = 64 * 1024;

/// Number of size classes covering `1..=MAX_BYTES`.
pub const NUM_CLASSES: usize = 240;

/// Largest span the page cache keeps in its buckets.
pub const MAX_PAGES: usize = 128;

/// Pages requested from the OS per grow. One region is one maximal span.
pub const GROW_PAGES: usize = MAX_PAGES;

/// Hard upper bound for any batch moved between tiers.
pub const MAX_BATCH: usize = 512;

/// Lower bound so even the largest class moves more than one block.
pub const MIN_BATCH: usize = 2;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(GROW_PAGES * PAGE_SIZE >= MAX_BYTES * MIN_BATCH);
const _: () = assert!(MIN_BATCH <= MAX_BATCH);

// =============================================================================
// Runtime tuning
// =============================================================================

/// Slow-start knobs for thread caches.
///
/// Only performance depends on these; any value >= 1 is correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
  /// Batch fetched on the first miss for a class. Also the first release threshold.
  pub initial_batch: usize,
  /// Cap applied on top of the per-class batch limit.
  pub max_batch: usize,
}

impl PoolConfig {
  /// Returns a copy with every knob clamped into its valid range.
  pub fn validated(self) -> Self {
    let max_batch = self.max_batch.clamp(1, MAX_BATCH);
    Self {
      initial_batch: self.initial_batch.clamp(1, max_batch),
      max_batch,
    }
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      initial_batch: MIN_BATCH,
      max_batch: MAX_BATCH,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_valid() {
    let config = PoolConfig::default();
    assert_eq!(config, config.validated());
  }

  #[test]
  fn test_validated_clamps() {
    let config = PoolConfig {
      initial_batch: 0,
      max_batch: 10_000,
    }
    .validated();
    assert_eq!(config.initial_batch, 1);
    assert_eq!(config.max_batch, MAX_BATCH);

    let config = PoolConfig {
      initial_batch: 50,
      max_batch: 8,
    }
    .validated();
    assert_eq!(config.initial_batch, 8);
  }
}
