//! Page-granularity memory from the operating system.

use core::ptr::{NonNull, null_mut};
use std::sync::Arc;

use crate::config::PAGE_SIZE;
use crate::error::{PoolError, Result};

/// Where the page cache gets its memory from.
///
/// Returned regions must be zeroed, readable, writable and aligned to at
/// least `PAGE_SIZE`. Nothing stronger is assumed.
pub trait PageSource: Send + Sync {
  /// Maps `pages` contiguous pages.
  fn acquire(&self, pages: usize) -> Result<NonNull<u8>>;

  /// Unmaps a region previously returned by [`PageSource::acquire`].
  ///
  /// # Safety
  ///
  /// `base` and `pages` must match one earlier `acquire` call exactly, and no
  /// byte of the region may be used afterwards.
  unsafe fn release(&self, base: NonNull<u8>, pages: usize);
}

impl<T: PageSource + ?Sized> PageSource for Arc<T> {
  fn acquire(&self, pages: usize) -> Result<NonNull<u8>> {
    (**self).acquire(pages)
  }

  unsafe fn release(&self, base: NonNull<u8>, pages: usize) {
    unsafe { (**self).release(base, pages) }
  }
}

/// Anonymous private mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource;

impl PageSource for MmapSource {
  fn acquire(&self, pages: usize) -> Result<NonNull<u8>> {
    let size = pages
      .checked_mul(PAGE_SIZE)
      .ok_or(PoolError::OutOfMemory { pages })?;
    NonNull::new(unsafe { os_mmap(size) }).ok_or(PoolError::OutOfMemory { pages })
  }

  unsafe fn release(&self, base: NonNull<u8>, pages: usize) {
    unsafe { os_munmap(base.as_ptr(), pages * PAGE_SIZE) };
  }
}

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

#[cfg(not(unix))]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  match std::alloc::Layout::from_size_align(size, PAGE_SIZE) {
    Ok(layout) if size > 0 => unsafe { std::alloc::alloc_zeroed(layout) },
    _ => null_mut(),
  }
}

#[cfg(not(unix))]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if let Ok(layout) = std::alloc::Layout::from_size_align(size, PAGE_SIZE) {
    unsafe { std::alloc::dealloc(ptr, layout) };
  }
}
