//! Intrusive free lists.
//!
//! A free block is untyped memory whose first machine word holds the address
//! of the next free block (null at the end). That word is the only metadata a
//! free block carries. This module is the only place that reads or writes it:
//! every other tier moves blocks around as [`FreeList`]s and [`Batch`]es.
//!
//! Blocks must be at least [`LINK_SIZE`] bytes and aligned for a pointer.

use core::{
  fmt,
  mem::{align_of, size_of},
  ops::Range,
  ptr::{NonNull, null_mut},
};

/// Bytes a free block gives up to its link.
pub const LINK_SIZE: usize = size_of::<*mut u8>();

#[inline(always)]
unsafe fn next_of(block: NonNull<u8>) -> Option<NonNull<u8>> {
  NonNull::new(unsafe { block.cast::<*mut u8>().read() })
}

#[inline(always)]
unsafe fn set_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
  let raw = next.map_or(null_mut(), NonNull::as_ptr);
  unsafe { block.cast::<*mut u8>().write(raw) };
}

// =============================================================================
// Batch
// =============================================================================

/// A detached, null-terminated chain of free blocks in transit between tiers.
///
/// Never empty.
#[allow(clippy::len_without_is_empty)]
pub struct Batch {
  head: NonNull<u8>,
  tail: NonNull<u8>,
  len: usize,
}

impl Batch {
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn head(&self) -> NonNull<u8> {
    self.head
  }

  /// Walks the chain front to back.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      next: Some(self.head),
      left: self.len,
      _batch: self,
    }
  }

  /// Detaches the front block. The rest, if any, stays a batch.
  pub fn split_first(self) -> (NonNull<u8>, Option<Batch>) {
    if self.len == 1 {
      return (self.head, None);
    }
    // SAFETY: a batch of len > 1 has a successor behind its head.
    let rest = unsafe { next_of(self.head) }.map(|head| Batch {
      head,
      tail: self.tail,
      len: self.len - 1,
    });
    (self.head, rest)
  }
}

impl fmt::Debug for Batch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Batch")
      .field("head", &self.head)
      .field("tail", &self.tail)
      .field("len", &self.len)
      .finish()
  }
}

/// Iterator over the blocks of a [`Batch`].
pub struct Blocks<'a> {
  next: Option<NonNull<u8>>,
  left: usize,
  _batch: &'a Batch,
}

impl Iterator for Blocks<'_> {
  type Item = NonNull<u8>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.left == 0 {
      return None;
    }
    let block = self.next?;
    self.left -= 1;
    self.next = unsafe { next_of(block) };
    Some(block)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (self.left, Some(self.left))
  }
}

// =============================================================================
// FreeList
// =============================================================================

/// LIFO list of free blocks of one size.
///
/// Not synchronized. The thread cache owns its lists outright; the central
/// cache keeps each list behind its class lock.
pub struct FreeList {
  head: Option<NonNull<u8>>,
  len: usize,
  max_size: usize,
}

// SAFETY: a list owns its blocks exclusively. Moving it to another thread moves
// that ownership with it.
unsafe impl Send for FreeList {}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      head: None,
      len: 0,
      max_size: 1,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  /// Slow-start threshold. See `ThreadCache` for how it moves.
  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn set_max_size(&mut self, max_size: usize) {
    self.max_size = max_size;
  }

  /// Pushes one block.
  ///
  /// # Safety
  ///
  /// `block` must be writable for [`LINK_SIZE`] bytes, pointer-aligned, and
  /// not reachable from any other list or batch.
  #[inline(always)]
  pub unsafe fn push(&mut self, block: NonNull<u8>) {
    debug_assert!(block.as_ptr() as usize % align_of::<*mut u8>() == 0);
    unsafe { set_next(block, self.head) };
    self.head = Some(block);
    self.len += 1;
  }

  /// Pops the most recently pushed block. `None` when empty.
  #[inline(always)]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let block = self.head?;
    self.head = unsafe { next_of(block) };
    self.len -= 1;
    Some(block)
  }

  /// Splices a whole batch onto the front in O(1).
  pub fn push_range(&mut self, batch: Batch) {
    unsafe { set_next(batch.tail, self.head) };
    self.head = Some(batch.head);
    self.len += batch.len;
  }

  /// Detaches up to `count` blocks from the front.
  pub fn take_range(&mut self, count: usize) -> Option<Batch> {
    if count == 0 {
      return None;
    }
    let head = self.head?;

    let mut tail = head;
    let mut len = 1;
    while len < count {
      match unsafe { next_of(tail) } {
        Some(next) => {
          tail = next;
          len += 1;
        }
        None => break,
      }
    }

    self.head = unsafe { next_of(tail) };
    unsafe { set_next(tail, None) };
    self.len -= len;
    Some(Batch { head, tail, len })
  }

  /// Detaches every block.
  pub fn take_all(&mut self) -> Option<Batch> {
    self.take_range(self.len)
  }

  /// Cuts `count` blocks of `block_size` bytes out of raw memory at `base`
  /// and pushes them, lowest address first in line.
  ///
  /// # Safety
  ///
  /// `base..base + count * block_size` must be writable memory owned by the
  /// caller and handed over to this list. `base` must be pointer-aligned and
  /// `block_size` a multiple of the pointer alignment, at least [`LINK_SIZE`].
  pub unsafe fn carve(&mut self, base: NonNull<u8>, block_size: usize, count: usize) {
    debug_assert!(block_size >= LINK_SIZE);
    debug_assert!(block_size % align_of::<*mut u8>() == 0);

    let mut next = self.head;
    for i in (0..count).rev() {
      let block = unsafe { base.add(i * block_size) };
      unsafe { set_next(block, next) };
      next = Some(block);
    }
    self.head = next;
    self.len += count;
  }

  /// Unlinks every block whose address lies in one of `ranges`, in a single
  /// walk. `ranges` must be sorted and disjoint. Returns how many.
  pub fn remove_within(&mut self, ranges: &[Range<usize>]) -> usize {
    debug_assert!(ranges.windows(2).all(|pair| pair[0].end <= pair[1].start));
    let hit = |addr: usize| {
      let at = ranges.partition_point(|range| range.end <= addr);
      ranges.get(at).is_some_and(|range| range.contains(&addr))
    };

    let mut removed = 0;
    let mut prev: Option<NonNull<u8>> = None;
    let mut cur = self.head;

    while let Some(block) = cur {
      let next = unsafe { next_of(block) };
      if hit(block.as_ptr() as usize) {
        match prev {
          Some(prev) => unsafe { set_next(prev, next) },
          None => self.head = next,
        }
        removed += 1;
      } else {
        prev = Some(block);
      }
      cur = next;
    }

    self.len -= removed;
    removed
  }
}

impl Default for FreeList {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for FreeList {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FreeList")
      .field("len", &self.len)
      .field("max_size", &self.max_size)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Word-aligned scratch memory standing in for a span.
  struct Slab(Vec<u64>);

  impl Slab {
    fn new(bytes: usize) -> Self {
      Self(vec![0; bytes / 8])
    }

    fn base(&mut self) -> NonNull<u8> {
      NonNull::new(self.0.as_mut_ptr().cast()).unwrap()
    }

    fn addr(&mut self) -> usize {
      self.base().as_ptr() as usize
    }
  }

  fn carved(slab: &mut Slab, block: usize, count: usize) -> FreeList {
    let mut list = FreeList::new();
    unsafe { list.carve(slab.base(), block, count) };
    list
  }

  #[test]
  fn test_new_list_empty() {
    let mut list = FreeList::new();
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
    assert!(list.pop().is_none());
    assert!(list.take_range(4).is_none());
  }

  #[test]
  fn test_push_pop_lifo() {
    let mut slab = Slab::new(64);
    let base = slab.base();
    let mut list = FreeList::new();
    unsafe {
      list.push(base);
      list.push(base.add(16));
      list.push(base.add(32));
    }
    assert_eq!(list.len(), 3);
    assert_eq!(list.pop(), Some(unsafe { base.add(32) }));
    assert_eq!(list.pop(), Some(unsafe { base.add(16) }));
    assert_eq!(list.pop(), Some(base));
    assert!(list.pop().is_none());
    assert!(list.is_empty());
  }

  #[test]
  fn test_carve_orders_by_address() {
    let mut slab = Slab::new(256);
    let start = slab.addr();
    let mut list = carved(&mut slab, 32, 8);
    assert_eq!(list.len(), 8);
    for i in 0..8 {
      assert_eq!(list.pop().unwrap().as_ptr() as usize, start + i * 32);
    }
    assert!(list.is_empty());
  }

  #[test]
  fn test_take_range_partial_and_short() {
    let mut slab = Slab::new(256);
    let mut list = carved(&mut slab, 16, 10);

    let batch = list.take_range(4).unwrap();
    assert_eq!(batch.len(), 4);
    assert_eq!(batch.blocks().count(), 4);
    assert_eq!(list.len(), 6);

    let rest = list.take_range(100).unwrap();
    assert_eq!(rest.len(), 6);
    assert!(list.is_empty());
  }

  #[test]
  fn test_push_range_splices() {
    let mut slab = Slab::new(256);
    let mut list = carved(&mut slab, 16, 10);
    let batch = list.take_range(3).unwrap();
    let head = batch.head();

    list.push_range(batch);
    assert_eq!(list.len(), 10);
    assert_eq!(list.pop(), Some(head));

    let all = list.take_all().unwrap();
    assert_eq!(all.len(), 9);
    assert_eq!(all.blocks().count(), 9);
  }

  #[test]
  fn test_split_first() {
    let mut slab = Slab::new(128);
    let start = slab.addr();
    let mut list = carved(&mut slab, 32, 3);
    let batch = list.take_range(3).unwrap();

    let (first, rest) = batch.split_first();
    assert_eq!(first.as_ptr() as usize, start);
    let rest = rest.unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest.head().as_ptr() as usize, start + 32);

    let (_, rest) = rest.split_first();
    let (last, rest) = rest.unwrap().split_first();
    assert_eq!(last.as_ptr() as usize, start + 64);
    assert!(rest.is_none());
  }

  #[test]
  fn test_remove_within() {
    let mut slab = Slab::new(512);
    let start = slab.addr();
    let mut list = carved(&mut slab, 32, 16);

    // Interleave: take some out and put them back so the range is scattered.
    let front = list.take_range(5).unwrap();
    let tail = list.take_range(3).unwrap();
    list.push_range(front);
    list.push_range(tail);

    let at = |index: usize| start + index * 32;
    let removed = list.remove_within(&[at(1)..at(2), at(4)..at(10), at(15)..at(16)]);
    assert_eq!(removed, 8);
    assert_eq!(list.len(), 8);

    let mut left = Vec::new();
    while let Some(block) = list.pop() {
      left.push((block.as_ptr() as usize - start) / 32);
    }
    left.sort_unstable();
    assert_eq!(left, vec![0, 2, 3, 10, 11, 12, 13, 14]);
    assert_eq!(list.remove_within(&[]), 0);
  }

  #[test]
  fn test_max_size_tracks() {
    let mut list = FreeList::new();
    assert_eq!(list.max_size(), 1);
    list.set_max_size(7);
    assert_eq!(list.max_size(), 7);
  }
}
