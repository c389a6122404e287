//! Page spans.
//!
//! A [`Span`] describes a run of whole pages. It is a plain value: the page
//! cache keeps free spans in its own maps, and a checked-out span moves by
//! value into whichever tier owns it.

use std::collections::BTreeSet;

use crate::config::{PAGE_SHIFT, PAGE_SIZE};

/// Page-aligned address divided by the page size.
pub type PageId = usize;

#[inline(always)]
pub const fn page_of(addr: usize) -> PageId {
  addr >> PAGE_SHIFT
}

#[inline(always)]
pub const fn page_addr(page: PageId) -> usize {
  page << PAGE_SHIFT
}

/// Who a checked-out span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOwner {
  /// Carved into blocks of this size class by the central cache.
  Class(usize),
  /// Handed to a caller whole, for a request above `MAX_BYTES`.
  Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
  /// Held by the page cache.
  Free,
  /// Out of the page cache. `use_count` is the number of blocks currently
  /// handed out from it (always 0 for `Large`).
  InUse { owner: SpanOwner, use_count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
  pub page_id: PageId,
  pub page_count: usize,
  pub state: SpanState,
}

impl Span {
  pub const fn free(page_id: PageId, page_count: usize) -> Self {
    Self {
      page_id,
      page_count,
      state: SpanState::Free,
    }
  }

  /// One past the last page.
  pub const fn end(&self) -> PageId {
    self.page_id + self.page_count
  }

  pub const fn addr(&self) -> usize {
    page_addr(self.page_id)
  }

  pub const fn bytes(&self) -> usize {
    self.page_count * PAGE_SIZE
  }

  pub const fn contains(&self, page: PageId) -> bool {
    page >= self.page_id && page < self.end()
  }

  pub const fn is_free(&self) -> bool {
    matches!(self.state, SpanState::Free)
  }

  pub const fn owner(&self) -> Option<SpanOwner> {
    match self.state {
      SpanState::Free => None,
      SpanState::InUse { owner, .. } => Some(owner),
    }
  }

  pub const fn use_count(&self) -> usize {
    match self.state {
      SpanState::Free => 0,
      SpanState::InUse { use_count, .. } => use_count,
    }
  }

  /// Marks the span checked out to `owner` with nothing handed out yet.
  pub fn check_out(&mut self, owner: SpanOwner) {
    self.state = SpanState::InUse {
      owner,
      use_count: 0,
    };
  }

  /// Adjusts the use count of a checked-out span. Returns the new count, or
  /// `None` if the span is free or the count would underflow.
  pub fn adjust_use(&mut self, delta: isize) -> Option<usize> {
    match &mut self.state {
      SpanState::Free => None,
      SpanState::InUse { use_count, .. } => {
        *use_count = use_count.checked_add_signed(delta)?;
        Some(*use_count)
      }
    }
  }

  /// Cuts the first `pages` pages off into a new span. `self` keeps the rest.
  pub fn split_front(&mut self, pages: usize) -> Span {
    debug_assert!(pages > 0 && pages < self.page_count);
    let front = Span {
      page_id: self.page_id,
      page_count: pages,
      state: self.state,
    };
    self.page_id += pages;
    self.page_count -= pages;
    front
  }

  /// Absorbs `other`, which must start right where `self` ends.
  pub fn absorb(&mut self, other: Span) {
    debug_assert_eq!(self.end(), other.page_id);
    self.page_count += other.page_count;
  }
}

// =============================================================================
// SpanList
// =============================================================================

/// Free spans sharing one page count, keyed by first page.
///
/// Popping yields the lowest address so reuse stays dense.
#[derive(Debug, Default, Clone)]
pub struct SpanList {
  spans: BTreeSet<PageId>,
}

impl SpanList {
  pub const fn new() -> Self {
    Self {
      spans: BTreeSet::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.spans.len()
  }

  pub fn is_empty(&self) -> bool {
    self.spans.is_empty()
  }

  pub fn push(&mut self, page_id: PageId) {
    let fresh = self.spans.insert(page_id);
    debug_assert!(fresh, "span {page_id:#x} listed twice");
  }

  pub fn pop(&mut self) -> Option<PageId> {
    self.spans.pop_first()
  }

  pub fn remove(&mut self, page_id: PageId) -> bool {
    self.spans.remove(&page_id)
  }
}
