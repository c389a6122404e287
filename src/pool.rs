//! The three tiers bundled together.

use core::ptr::NonNull;
use std::sync::Arc;

use log::Level;

use crate::central_cache::CentralCache;
use crate::config::{MAX_BYTES, PoolConfig};
use crate::diag::{Logger, diag};
use crate::error::{PoolError, Result};
use crate::os::{MmapSource, PageSource};
use crate::page_cache::PageCache;
use crate::size_class::pages_for;
use crate::span::{SpanOwner, page_of};
use crate::thread_cache::ThreadCache;

/// Shared state behind every [`ThreadCache`]: the central cache and the page
/// cache under it. Share it through an `Arc`.
///
/// Dropping the pool returns every region it mapped to the OS, whether or not
/// blocks are still out.
pub struct Pool {
  // Field order is drop order: the central cache goes before the pages.
  central: CentralCache,
  pages: PageCache,
  config: PoolConfig,
  logger: Logger,
}

impl Pool {
  /// Pool over anonymous mappings, logging through the installed `log` backend.
  pub fn new(config: PoolConfig) -> Self {
    Self::with_source(config, Box::new(MmapSource), Logger::global())
  }

  pub fn with_source(config: PoolConfig, source: Box<dyn PageSource>, logger: Logger) -> Self {
    Self {
      central: CentralCache::new(logger),
      pages: PageCache::new(source, logger),
      config: config.validated(),
      logger,
    }
  }

  /// New, empty cache for the calling thread.
  pub fn thread_cache(self: &Arc<Self>) -> ThreadCache {
    ThreadCache::new(Arc::clone(self))
  }

  /// Maps a request above `MAX_BYTES` to a span of whole pages.
  pub fn allocate_large(&self, size: usize) -> Result<NonNull<u8>> {
    if size <= MAX_BYTES {
      return Err(PoolError::InvalidSize(size));
    }
    let span = self.pages.allocate_span(pages_for(size), SpanOwner::Large)?;
    diag!(
      self.logger,
      Level::Trace,
      "large request of {} bytes took {} pages",
      size,
      span.page_count
    );
    NonNull::new(span.addr() as *mut u8).ok_or(PoolError::corrupt(span.addr()))
  }

  /// Releases a pointer returned by [`Pool::allocate_large`].
  ///
  /// # Safety
  ///
  /// `ptr` must not be used after this call.
  pub unsafe fn deallocate_large(&self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    match self.pages.lookup(addr) {
      Some(tag) if tag.owner == SpanOwner::Large && tag.page_id == page_of(addr) => {
        self.pages.release_span(tag.span())
      }
      _ => Err(PoolError::corrupt(addr)),
    }
  }

  pub fn page_cache(&self) -> &PageCache {
    &self.pages
  }

  pub fn central_cache(&self) -> &CentralCache {
    &self.central
  }

  pub fn config(&self) -> PoolConfig {
    self.config
  }

  pub(crate) fn logger(&self) -> Logger {
    self.logger
  }
}

impl Default for Pool {
  fn default() -> Self {
    Self::new(PoolConfig::default())
  }
}
