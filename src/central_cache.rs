//! Central cache: the shared middle tier.
//!
//! One lock and one free list per size class. Thread caches move blocks in
//! and out of here in batches; the central cache in turn carves fresh spans
//! from the page cache and hands spans back once every block of them has come
//! home.

use core::ops::Range;
use core::ptr::NonNull;
use std::collections::BTreeMap;

use log::Level;
use parking_lot::Mutex;

use crate::config::NUM_CLASSES;
use crate::diag::{Logger, diag};
use crate::error::{PoolError, Result};
use crate::free_list::{Batch, FreeList};
use crate::page_cache::PageCache;
use crate::size_class::{batch_limit, class_size, span_pages};
use crate::span::{PageId, Span, SpanOwner, page_of};

#[derive(Default)]
struct CentralList {
  free: FreeList,
  /// Spans carved for this class, by first page.
  spans: BTreeMap<PageId, Span>,
  /// Blocks cut from `spans`, wherever they are now.
  carved: usize,
}

impl CentralList {
  /// First page of the span `addr` was carved from, if `addr` starts one of
  /// its `size`-byte blocks.
  fn owner_of(&self, addr: usize, size: usize) -> Option<PageId> {
    let page = page_of(addr);
    let (&page_id, span) = self.spans.range(..=page).next_back()?;
    let offset = addr - span.addr();
    (span.contains(page) && offset % size == 0 && offset / size < span.bytes() / size)
      .then_some(page_id)
  }
}

pub struct CentralCache {
  lists: Box<[Mutex<CentralList>]>,
  logger: Logger,
}

impl CentralCache {
  pub fn new(logger: Logger) -> Self {
    Self {
      lists: (0..NUM_CLASSES).map(|_| Mutex::default()).collect(),
      logger,
    }
  }

  /// Detaches up to `batch_size` blocks of `class`, carving a new span first
  /// if the list holds fewer than that.
  ///
  /// `batch_size` is clamped to `1..=batch_limit(class)`. The returned batch
  /// may still be shorter only if the list had some blocks but the page cache
  /// could not supply a span.
  pub fn fetch_batch(&self, class: usize, batch_size: usize, pages: &PageCache) -> Result<Batch> {
    let want = batch_size.clamp(1, batch_limit(class));
    let mut list = self.lists[class].lock();

    if list.free.len() < want {
      match self.populate(class, &mut list, pages) {
        Ok(()) => {}
        Err(err) if list.free.is_empty() => return Err(err),
        Err(_) => {}
      }
    }

    let batch = list
      .free
      .take_range(want)
      .ok_or(PoolError::OutOfMemory {
        pages: span_pages(class),
      })?;

    let size = class_size(class);
    let mut taken: BTreeMap<PageId, usize> = BTreeMap::new();
    let stray = batch
      .blocks()
      .map(|block| block.as_ptr() as usize)
      .find(|&addr| match list.owner_of(addr, size) {
        Some(page_id) => {
          *taken.entry(page_id).or_default() += 1;
          false
        }
        None => true,
      });
    if let Some(addr) = stray {
      list.free.push_range(batch);
      return Err(PoolError::corrupt(addr));
    }

    for (page_id, count) in taken {
      if let Some(span) = list.spans.get_mut(&page_id) {
        span.adjust_use(count as isize);
      }
    }
    Ok(batch)
  }

  /// Takes a batch of `class` blocks back. Spans left with no block handed
  /// out are pulled out of the list and released to the page cache.
  ///
  /// Every block is checked before anything changes. A block that does not
  /// start a block of this class, or that its span has no handed-out block
  /// left for, is left untouched and reported as corruption. So is a chain
  /// that ends before `batch.len()` blocks. The other blocks are still taken
  /// back.
  pub fn return_batch(&self, class: usize, batch: Batch, pages: &PageCache) -> Result<()> {
    let size = class_size(class);
    let blocks: Vec<NonNull<u8>> = batch.blocks().collect();
    let mut list = self.lists[class].lock();

    let mut returned: BTreeMap<PageId, usize> = BTreeMap::new();
    let mut accepted = Vec::with_capacity(blocks.len());
    let mut stray = None;
    for block in blocks {
      let addr = block.as_ptr() as usize;
      let Some(page_id) = list.owner_of(addr, size) else {
        stray.get_or_insert(addr);
        continue;
      };
      let outstanding = list.spans.get(&page_id).map_or(0, Span::use_count);
      let back = returned.get(&page_id).copied().unwrap_or(0);
      if back == outstanding {
        stray.get_or_insert(addr);
        continue;
      }
      returned.insert(page_id, back + 1);
      accepted.push(block);
    }

    if stray.is_none() && accepted.len() == batch.len() {
      list.free.push_range(batch);
    } else {
      if let Some(last) = accepted.last().filter(|_| stray.is_none()) {
        stray = Some(last.as_ptr() as usize);
      }
      for block in accepted {
        // SAFETY: checked above to be a handed-out block of this class.
        unsafe { list.free.push(block) };
      }
    }

    let mut idle = Vec::new();
    for (page_id, back) in returned {
      let span = list.spans.get_mut(&page_id);
      if span.and_then(|span| span.adjust_use(-(back as isize))) == Some(0) {
        idle.extend(list.spans.remove(&page_id));
      }
    }

    let ranges: Vec<Range<usize>> = idle
      .iter()
      .map(|span| span.addr()..span.addr() + span.bytes())
      .collect();
    let removed = list.free.remove_within(&ranges);
    list.carved -= removed;

    let mut outcome = stray.map_or(Ok(()), |addr| Err(PoolError::corrupt(addr)));
    for span in idle {
      diag!(
        self.logger,
        Level::Trace,
        "class {} returned span of {} pages at {:#x}",
        class,
        span.page_count,
        span.addr()
      );
      if let Err(err) = pages.release_span(span) {
        outcome = outcome.and(Err(err));
      }
    }
    outcome
  }

  /// Free blocks held for `class`.
  pub fn free_count(&self, class: usize) -> usize {
    self.lists[class].lock().free.len()
  }

  /// Blocks carved for `class` and not yet returned with their span.
  pub fn carved(&self, class: usize) -> usize {
    self.lists[class].lock().carved
  }

  pub fn span_count(&self, class: usize) -> usize {
    self.lists[class].lock().spans.len()
  }

  fn populate(&self, class: usize, list: &mut CentralList, pages: &PageCache) -> Result<()> {
    let span = pages.allocate_span(span_pages(class), SpanOwner::Class(class))?;
    let size = class_size(class);
    let count = span.bytes() / size;
    let base = NonNull::new(span.addr() as *mut u8).ok_or(PoolError::corrupt(span.addr()))?;

    // SAFETY: the span was just checked out to this class and nothing else
    // references its pages.
    unsafe { list.free.carve(base, size, count) };
    list.carved += count;
    list.spans.insert(span.page_id, span);

    diag!(
      self.logger,
      Level::Trace,
      "class {} carved {} blocks of {} bytes from {} pages at {:#x}",
      class,
      count,
      size,
      span.page_count,
      span.addr()
    );
    Ok(())
  }
}
