//! Thread-caching memory pool.
//!
//! Three tiers, fastest first:
//!
//! - [`ThreadCache`]: one per thread, no locking. Per-class free lists.
//! - [`CentralCache`]: shared, one lock per size class. Carves page spans
//!   into blocks and moves them to and from thread caches in batches.
//! - [`PageCache`]: shared, one lock. Hands out page spans, grows from the OS
//!   and merges neighbouring free spans back together.
//!
//! Requests up to [`MAX_BYTES`](config::MAX_BYTES) are served from size
//! classes; anything larger is a span of whole pages. A lock is only ever
//! taken while holding locks of the tiers above it (thread cache, then class
//! lock, then page cache lock), never the other way around.
//!
//! The pool keeps its own bookkeeping in std collections, so it cannot be
//! installed as the `#[global_allocator]`. Use a [`Pool`] and its
//! [`ThreadCache`]s directly, or the process-wide [`allocate`] /
//! [`deallocate`] front door.

#![allow(clippy::missing_safety_doc)]

use core::ptr::NonNull;
use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

pub mod config;
pub mod free_list;
pub mod size_class;
pub mod span;

mod central_cache;
mod diag;
mod error;
mod os;
mod page_cache;
mod pool;
mod thread_cache;

pub use central_cache::CentralCache;
pub use config::PoolConfig;
pub use diag::Logger;
pub use error::{PoolError, Result};
pub use os::{MmapSource, PageSource};
pub use page_cache::{PageCache, SpanTag};
pub use pool::Pool;
pub use span::SpanOwner;
pub use thread_cache::ThreadCache;

// =============================================================================
// Process-wide pool
// =============================================================================

static POOL: OnceLock<Arc<Pool>> = OnceLock::new();

/// The process-wide pool behind [`allocate`] and [`deallocate`], built on
/// first use with default tuning.
pub fn global() -> &'static Arc<Pool> {
  POOL.get_or_init(|| Arc::new(Pool::default()))
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: RefCell<Option<ThreadCache>> = const { RefCell::new(None) };
}

/// Runs `f` on this thread's cache. During thread teardown, or if `f` is
/// re-entered, a transient cache is used instead and flushed when done.
fn with_cache<R>(mut f: impl FnMut(&mut ThreadCache) -> Result<R>) -> Result<R> {
  let local = CACHE.try_with(|cell| {
    let mut slot = cell.try_borrow_mut().ok()?;
    let cache = slot.get_or_insert_with(|| global().thread_cache());
    Some(f(cache))
  });

  match local {
    Ok(Some(result)) => result,
    _ => {
      let mut transient = global().thread_cache();
      let result = f(&mut transient);
      transient.flush()?;
      result
    }
  }
}

// =============================================================================
// Front door
// =============================================================================

/// Allocates `size` bytes from the process-wide pool.
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
  with_cache(|cache| cache.allocate(size))
}

/// Frees a block from [`allocate`]. `size` must be the size it was
/// requested with.
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) -> Result<()> {
  with_cache(|cache| unsafe { cache.deallocate(ptr, size) })
}

/// Frees a block from [`allocate`] without knowing its size.
pub unsafe fn deallocate_unsized(ptr: NonNull<u8>) -> Result<()> {
  with_cache(|cache| unsafe { cache.deallocate_unsized(ptr) })
}

/// Returns the calling thread's cached blocks to the process-wide pool.
pub fn flush_thread_cache() -> Result<()> {
  with_cache(ThreadCache::flush)
}
