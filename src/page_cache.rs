//! Page cache: the bottom tier.
//!
//! Hands out whole-page spans, cutting them from the smallest free span that
//! fits and growing from the OS one region at a time when nothing fits. Free
//! spans are indexed twice: by first page (for neighbour lookup when merging)
//! and by page count (for best-fit allocation). A separate page map records
//! every checked-out span so any pooled address can be traced to its owner.
//!
//! Free neighbours always merge, even across the boundary between two OS
//! regions. Regions are tracked on their own so `trim` can still cut a fully
//! free region out of whichever free span covers it.
//!
//! Lock order: `heap` before `page_map`. Readers of the page map take only the
//! page map lock.

use core::ptr::NonNull;
use std::collections::{BTreeMap, BTreeSet};

use log::Level;
use parking_lot::{Mutex, RwLock};

use crate::config::{GROW_PAGES, MAX_PAGES};
use crate::diag::{Logger, diag};
use crate::error::{PoolError, Result};
use crate::os::PageSource;
use crate::span::{PageId, Span, SpanList, SpanOwner, SpanState, page_addr, page_of};

/// Page-map entry for a checked-out span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanTag {
  pub page_id: PageId,
  pub page_count: usize,
  pub owner: SpanOwner,
}

impl SpanTag {
  fn of(span: &Span, owner: SpanOwner) -> Self {
    Self {
      page_id: span.page_id,
      page_count: span.page_count,
      owner,
    }
  }

  pub const fn contains(&self, page: PageId) -> bool {
    page >= self.page_id && page < self.page_id + self.page_count
  }

  pub const fn addr(&self) -> usize {
    page_addr(self.page_id)
  }

  /// Rebuilds the span this tag describes, with no blocks handed out.
  pub fn span(&self) -> Span {
    let mut span = Span::free(self.page_id, self.page_count);
    span.check_out(self.owner);
    span
  }
}

// =============================================================================
// Heap (guarded by the page cache lock)
// =============================================================================

struct PageHeap {
  /// Free spans by first page.
  free: BTreeMap<PageId, Span>,
  /// Free spans of up to `MAX_PAGES` pages, by page count. Index 0 is unused.
  buckets: Vec<SpanList>,
  /// Merged free spans above `MAX_PAGES`, as `(page count, first page)`.
  large: BTreeSet<(usize, PageId)>,
  /// OS regions: first page -> page count.
  regions: BTreeMap<PageId, usize>,
}

impl PageHeap {
  fn new() -> Self {
    Self {
      free: BTreeMap::new(),
      buckets: vec![SpanList::new(); MAX_PAGES + 1],
      large: BTreeSet::new(),
      regions: BTreeMap::new(),
    }
  }

  fn insert_free(&mut self, span: Span) {
    debug_assert!(span.is_free());
    if span.page_count <= MAX_PAGES {
      self.buckets[span.page_count].push(span.page_id);
    } else {
      self.large.insert((span.page_count, span.page_id));
    }
    self.free.insert(span.page_id, span);
  }

  fn remove_free(&mut self, page_id: PageId) -> Option<Span> {
    let span = self.free.remove(&page_id)?;
    if span.page_count <= MAX_PAGES {
      self.buckets[span.page_count].remove(page_id);
    } else {
      self.large.remove(&(span.page_count, page_id));
    }
    Some(span)
  }

  /// Best fit: exact bucket first, then the smallest larger span, split.
  fn take(&mut self, pages: usize) -> Option<Span> {
    debug_assert!(pages > 0 && pages <= MAX_PAGES);
    let page_id = (pages..=MAX_PAGES)
      .find_map(|count| self.buckets[count].pop())
      .or_else(|| self.large.first().map(|&(_, page_id)| page_id))?;

    let mut span = self.remove_free(page_id)?;
    if span.page_count == pages {
      return Some(span);
    }
    let front = span.split_front(pages);
    self.insert_free(span);
    Some(front)
  }

  /// Merges `span` with its free neighbours until none is left.
  fn coalesce(&mut self, mut span: Span) -> Span {
    loop {
      let prev = self
        .free
        .range(..span.page_id)
        .next_back()
        .map(|(_, prev)| *prev)
        .filter(|prev| prev.end() == span.page_id);
      if let Some(mut prev) = prev {
        self.remove_free(prev.page_id);
        prev.absorb(span);
        span = prev;
        continue;
      }

      if let Some(next) = self.free.get(&span.end()).copied() {
        self.remove_free(next.page_id);
        span.absorb(next);
        continue;
      }

      return span;
    }
  }

  /// Cuts `start..start + pages` out of the free span covering it, putting
  /// back whatever lies on either side. `false` if no single free span covers
  /// the whole range.
  fn cut_free(&mut self, start: PageId, pages: usize) -> bool {
    let covering = self
      .free
      .range(..=start)
      .next_back()
      .map(|(_, span)| *span)
      .filter(|span| span.contains(start) && span.end() >= start + pages);
    let Some(mut rest) = covering else {
      return false;
    };

    self.remove_free(rest.page_id);
    if rest.page_id < start {
      let front = rest.split_front(start - rest.page_id);
      self.insert_free(front);
    }
    if rest.page_count > pages {
      rest.split_front(pages);
      self.insert_free(rest);
    }
    true
  }
}

// =============================================================================
// PageCache
// =============================================================================

pub struct PageCache {
  heap: Mutex<PageHeap>,
  page_map: RwLock<BTreeMap<PageId, SpanTag>>,
  source: Box<dyn PageSource>,
  logger: Logger,
}

impl PageCache {
  pub fn new(source: Box<dyn PageSource>, logger: Logger) -> Self {
    Self {
      heap: Mutex::new(PageHeap::new()),
      page_map: RwLock::new(BTreeMap::new()),
      source,
      logger,
    }
  }

  /// Checks out a span of exactly `page_count` pages for `owner`.
  ///
  /// Above `MAX_PAGES` the span is mapped from the OS on its own. Otherwise
  /// it is cut from the free spans, growing by one region if none fits.
  pub fn allocate_span(&self, page_count: usize, owner: SpanOwner) -> Result<Span> {
    if page_count == 0 {
      return Err(PoolError::InvalidSize(0));
    }

    let mut heap = self.heap.lock();
    let mut span = if page_count > MAX_PAGES {
      self.map_oversized(&mut heap, page_count)?
    } else {
      match heap.take(page_count) {
        Some(span) => span,
        None => {
          self.grow(&mut heap)?;
          heap
            .take(page_count)
            .ok_or(PoolError::OutOfMemory { pages: page_count })?
        }
      }
    };

    span.check_out(owner);
    self
      .page_map
      .write()
      .insert(span.page_id, SpanTag::of(&span, owner));
    Ok(span)
  }

  /// Takes a checked-out span back, merging it with free neighbours.
  ///
  /// Oversized spans go straight back to the OS.
  pub fn release_span(&self, mut span: Span) -> Result<()> {
    let mut heap = self.heap.lock();

    {
      let mut map = self.page_map.write();
      match map.get(&span.page_id) {
        Some(tag) if tag.page_count == span.page_count => {
          map.remove(&span.page_id);
        }
        _ => return Err(PoolError::corrupt(span.addr())),
      }
    }

    span.state = SpanState::Free;

    if span.page_count > MAX_PAGES {
      heap.regions.remove(&span.page_id);
      let base = NonNull::new(span.addr() as *mut u8).ok_or(PoolError::corrupt(span.addr()))?;
      unsafe { self.source.release(base, span.page_count) };
      diag!(
        self.logger,
        Level::Debug,
        "unmapped oversized span of {} pages at {:#x}",
        span.page_count,
        span.addr()
      );
      return Ok(());
    }

    let span = heap.coalesce(span);
    heap.insert_free(span);
    Ok(())
  }

  /// Finds the checked-out span covering `addr`, if any.
  pub fn lookup(&self, addr: usize) -> Option<SpanTag> {
    let page = page_of(addr);
    let map = self.page_map.read();
    let (_, tag) = map.range(..=page).next_back()?;
    tag.contains(page).then_some(*tag)
  }

  /// Returns every region that is entirely free to the OS. Returns the number
  /// of pages released.
  pub fn trim(&self) -> usize {
    let mut heap = self.heap.lock();
    let regions: Vec<(PageId, usize)> = heap
      .regions
      .iter()
      .map(|(&page_id, &pages)| (page_id, pages))
      .collect();

    let mut released = 0;
    for (page_id, pages) in regions {
      if !heap.cut_free(page_id, pages) {
        continue;
      }
      heap.regions.remove(&page_id);
      if let Some(base) = NonNull::new(page_addr(page_id) as *mut u8) {
        unsafe { self.source.release(base, pages) };
        released += pages;
      }
    }

    if released > 0 {
      diag!(self.logger, Level::Info, "trimmed {} idle pages", released);
    }
    released
  }

  /// Pages currently held free.
  pub fn free_pages(&self) -> usize {
    self.heap.lock().free.values().map(|span| span.page_count).sum()
  }

  /// Snapshot of free spans as `(first page, page count)`, by address.
  pub fn free_spans(&self) -> Vec<(PageId, usize)> {
    self
      .heap
      .lock()
      .free
      .values()
      .map(|span| (span.page_id, span.page_count))
      .collect()
  }

  fn grow(&self, heap: &mut PageHeap) -> Result<()> {
    let base = self.source.acquire(GROW_PAGES)?;
    let page_id = page_of(base.as_ptr() as usize);
    heap.regions.insert(page_id, GROW_PAGES);
    let span = heap.coalesce(Span::free(page_id, GROW_PAGES));
    heap.insert_free(span);
    diag!(
      self.logger,
      Level::Debug,
      "grew {} pages at {:#x}",
      GROW_PAGES,
      base.as_ptr() as usize
    );
    Ok(())
  }

  fn map_oversized(&self, heap: &mut PageHeap, pages: usize) -> Result<Span> {
    let base = self.source.acquire(pages)?;
    let page_id = page_of(base.as_ptr() as usize);
    heap.regions.insert(page_id, pages);
    diag!(
      self.logger,
      Level::Debug,
      "mapped oversized span of {} pages at {:#x}",
      pages,
      base.as_ptr() as usize
    );
    Ok(Span::free(page_id, pages))
  }
}

impl Drop for PageCache {
  fn drop(&mut self) {
    let heap = self.heap.get_mut();
    for (&page_id, &pages) in &heap.regions {
      if let Some(base) = NonNull::new(page_addr(page_id) as *mut u8) {
        unsafe { self.source.release(base, pages) };
      }
    }
  }
}
