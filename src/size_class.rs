//! Size classes.
//!
//! Requests up to [`MAX_BYTES`] round up to one of [`NUM_CLASSES`] block
//! sizes. Alignment widens with size so waste stays under 1/8 past 128 bytes:
//!
//! | request          | step  | classes |
//! |------------------|-------|---------|
//! | 1..=128          | 8     | 16      |
//! | 129..=1024       | 16    | 56      |
//! | 1025..=8192      | 128   | 56      |
//! | 8193..=65536     | 512   | 112     |

use crate::config::{MAX_BATCH, MAX_BYTES, MIN_BATCH, NUM_CLASSES, PAGE_SIZE};

/// Upper bound and step (as a shift) of each band.
const BANDS: [(usize, usize); 4] = [(128, 3), (1024, 4), (8 * 1024, 7), (64 * 1024, 9)];

/// Classes in all bands below each band.
const BAND_START: [usize; 4] = [0, 16, 16 + 56, 16 + 56 + 56];

const _: () = assert!(class_size(0) == 8);
const _: () = assert!(class_size(NUM_CLASSES - 1) == MAX_BYTES);
const _: () = assert!(BAND_START[3] + (MAX_BYTES - 8 * 1024) / 512 == NUM_CLASSES);
const _: () = assert!(span_pages(NUM_CLASSES - 1) * PAGE_SIZE >= MIN_BATCH * MAX_BYTES);

/// Maps a request to its class. `None` for zero and for anything above `MAX_BYTES`.
#[inline(always)]
pub const fn class_of(size: usize) -> Option<usize> {
  if size == 0 || size > MAX_BYTES {
    return None;
  }

  let mut band = 0;
  let mut floor = 0;
  while size > BANDS[band].0 {
    floor = BANDS[band].0;
    band += 1;
  }

  let shift = BANDS[band].1;
  let steps = (size - floor + (1 << shift) - 1) >> shift;
  Some(BAND_START[band] + steps - 1)
}

/// Block size of `class`. Inverse of [`class_of`] on class boundaries.
#[inline(always)]
pub const fn class_size(class: usize) -> usize {
  debug_assert!(class < NUM_CLASSES);

  let mut band = BANDS.len() - 1;
  while class < BAND_START[band] {
    band -= 1;
  }

  let floor = if band == 0 { 0 } else { BANDS[band - 1].0 };
  floor + ((class - BAND_START[band] + 1) << BANDS[band].1)
}

/// Most blocks a single batch of `class` may carry.
pub const fn batch_limit(class: usize) -> usize {
  let fit = MAX_BYTES / class_size(class);
  if fit < MIN_BATCH {
    MIN_BATCH
  } else if fit > MAX_BATCH {
    MAX_BATCH
  } else {
    fit
  }
}

/// Pages in each span the central cache carves for `class`.
///
/// Always enough for one full batch.
pub const fn span_pages(class: usize) -> usize {
  pages_for(batch_limit(class) * class_size(class))
}

/// Whole pages needed for `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
  bytes.div_ceil(PAGE_SIZE)
}
