//! Per-thread front end.
//!
//! A [`ThreadCache`] is owned by exactly one thread at a time and takes no
//! lock on a hit. Misses and overflows go to the central cache in batches
//! whose size grows with demand (slow start).

use core::ptr::NonNull;
use std::sync::Arc;

use log::Level;

use crate::config::NUM_CLASSES;
use crate::diag::diag;
use crate::error::{PoolError, Result};
use crate::free_list::FreeList;
use crate::pool::Pool;
use crate::size_class::{batch_limit, class_of};
use crate::span::SpanOwner;

pub struct ThreadCache {
  pool: Arc<Pool>,
  lists: Box<[FreeList]>,
}

impl ThreadCache {
  pub fn new(pool: Arc<Pool>) -> Self {
    let initial = pool.config().initial_batch;
    let lists = (0..NUM_CLASSES)
      .map(|_| {
        let mut list = FreeList::new();
        list.set_max_size(initial);
        list
      })
      .collect();
    Self { pool, lists }
  }

  pub fn pool(&self) -> &Arc<Pool> {
    &self.pool
  }

  /// Returns a block of at least `size` bytes, aligned for a pointer.
  ///
  /// Requests above `MAX_BYTES` bypass the caches and get whole pages.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    let Some(class) = class_of(size) else {
      if size == 0 {
        return Err(PoolError::InvalidSize(0));
      }
      return self.pool.allocate_large(size);
    };

    match self.lists[class].pop() {
      Some(block) => Ok(block),
      None => self.refill(class),
    }
  }

  /// Gives back a block from [`ThreadCache::allocate`].
  ///
  /// # Safety
  ///
  /// `ptr` must come from `allocate(size)` on a cache of the same pool, with
  /// the same `size`, and must not be used afterwards.
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<()> {
    let Some(class) = class_of(size) else {
      if size == 0 {
        return Err(PoolError::InvalidSize(0));
      }
      return unsafe { self.pool.deallocate_large(ptr) };
    };

    #[cfg(feature = "verify-free")]
    self.verify(ptr, class)?;

    unsafe { self.release(ptr, class) }
  }

  /// Like [`ThreadCache::deallocate`], with the size looked up from the span
  /// the pointer belongs to.
  ///
  /// # Safety
  ///
  /// `ptr` must come from `allocate` on a cache of the same pool and must not
  /// be used afterwards.
  pub unsafe fn deallocate_unsized(&mut self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    match self.pool.page_cache().lookup(addr).map(|tag| tag.owner) {
      Some(SpanOwner::Class(class)) => unsafe { self.release(ptr, class) },
      Some(SpanOwner::Large) => unsafe { self.pool.deallocate_large(ptr) },
      None => Err(PoolError::corrupt(addr)),
    }
  }

  /// Hands every cached block back to the central cache.
  pub fn flush(&mut self) -> Result<()> {
    let pool = &self.pool;
    let mut result = Ok(());
    for (class, list) in self.lists.iter_mut().enumerate() {
      if let Some(batch) = list.take_all() {
        let returned = pool
          .central_cache()
          .return_batch(class, batch, pool.page_cache());
        result = result.and(returned);
      }
    }
    result
  }

  /// Blocks of `class` cached by this thread.
  pub fn local_len(&self, class: usize) -> usize {
    self.lists[class].len()
  }

  /// Slow-start threshold of `class`.
  pub fn max_size(&self, class: usize) -> usize {
    self.lists[class].max_size()
  }

  fn refill(&mut self, class: usize) -> Result<NonNull<u8>> {
    let limit = batch_limit(class).min(self.pool.config().max_batch);
    let list = &mut self.lists[class];
    let batch_size = list.max_size().min(limit);
    if batch_size == list.max_size() {
      list.set_max_size(batch_size + 1);
    }

    let batch = self
      .pool
      .central_cache()
      .fetch_batch(class, batch_size, self.pool.page_cache())?;
    let (block, rest) = batch.split_first();
    if let Some(rest) = rest {
      list.push_range(rest);
    }
    Ok(block)
  }

  unsafe fn release(&mut self, ptr: NonNull<u8>, class: usize) -> Result<()> {
    let list = &mut self.lists[class];
    unsafe { list.push(ptr) };
    if list.len() <= list.max_size() {
      return Ok(());
    }

    match list.take_range(list.max_size()) {
      Some(batch) => self
        .pool
        .central_cache()
        .return_batch(class, batch, self.pool.page_cache()),
      None => Ok(()),
    }
  }

  #[cfg(feature = "verify-free")]
  fn verify(&self, ptr: NonNull<u8>, class: usize) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    match self.pool.page_cache().lookup(addr) {
      Some(tag) if tag.owner == SpanOwner::Class(class) => Ok(()),
      _ => Err(PoolError::corrupt(addr)),
    }
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    if let Err(err) = self.flush() {
      diag!(
        self.pool.logger(),
        Level::Warn,
        "thread cache flush failed: {}",
        err
      );
    }
  }
}

impl core::fmt::Debug for ThreadCache {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let cached: usize = self.lists.iter().map(FreeList::len).sum();
    f.debug_struct("ThreadCache")
      .field("cached", &cached)
      .finish_non_exhaustive()
  }
}
