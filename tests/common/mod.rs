#![allow(dead_code)]

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{Level, Log, Metadata, Record};
use parking_lot::Mutex;
use tcpool::{Logger, MmapSource, PageSource, Pool, PoolConfig, PoolError};

/// mmap-backed source that counts grows and can be switched off.
#[derive(Default)]
pub struct Source {
  grows: AtomicUsize,
  released_pages: AtomicUsize,
  fail: AtomicBool,
}

impl Source {
  pub fn grows(&self) -> usize {
    self.grows.load(Ordering::SeqCst)
  }

  pub fn released_pages(&self) -> usize {
    self.released_pages.load(Ordering::SeqCst)
  }

  pub fn fail(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }
}

impl PageSource for Source {
  fn acquire(&self, pages: usize) -> tcpool::Result<NonNull<u8>> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(PoolError::OutOfMemory { pages });
    }
    let base = MmapSource.acquire(pages)?;
    self.grows.fetch_add(1, Ordering::SeqCst);
    Ok(base)
  }

  unsafe fn release(&self, base: NonNull<u8>, pages: usize) {
    self.released_pages.fetch_add(pages, Ordering::SeqCst);
    unsafe { MmapSource.release(base, pages) };
  }
}

/// Keeps every record.
#[derive(Default)]
pub struct Capture {
  records: Mutex<Vec<(Level, String)>>,
}

impl Capture {
  pub fn leak() -> &'static Capture {
    Box::leak(Box::default())
  }

  pub fn records(&self) -> Vec<(Level, String)> {
    self.records.lock().clone()
  }
}

impl Log for Capture {
  fn enabled(&self, _: &Metadata<'_>) -> bool {
    true
  }

  fn log(&self, record: &Record<'_>) {
    self
      .records
      .lock()
      .push((record.level(), record.args().to_string()));
  }

  fn flush(&self) {}
}

pub fn pool_with(logger: Logger) -> (Arc<Pool>, Arc<Source>) {
  let source = Arc::new(Source::default());
  let pool = Pool::with_source(
    PoolConfig::default(),
    Box::new(Arc::clone(&source)),
    logger,
  );
  (Arc::new(pool), source)
}

pub fn pool() -> (Arc<Pool>, Arc<Source>) {
  pool_with(Logger::silent())
}
