//! Diagnostic logging handle.
//!
//! Components never reach for a process-wide logger on their own. Each one is
//! handed a [`Logger`] when built, which forwards records to a `log::Log` sink.

use core::fmt;

use log::{Level, Log, Metadata, Record};

/// Sink that drops everything.
struct Silent;

impl Log for Silent {
  fn enabled(&self, _: &Metadata<'_>) -> bool {
    false
  }

  fn log(&self, _: &Record<'_>) {}

  fn flush(&self) {}
}

static SILENT: Silent = Silent;

/// Cheap, copyable handle to a `log` sink.
#[derive(Clone, Copy)]
pub struct Logger {
  sink: &'static dyn Log,
}

impl Logger {
  pub fn new(sink: &'static dyn Log) -> Self {
    Self { sink }
  }

  /// Forwards to whatever backend the application installed with `log::set_logger`.
  pub fn global() -> Self {
    Self::new(log::logger())
  }

  pub fn silent() -> Self {
    Self::new(&SILENT)
  }

  pub(crate) fn log(&self, level: Level, target: &str, args: fmt::Arguments<'_>) {
    let metadata = Metadata::builder().level(level).target(target).build();
    if !self.sink.enabled(&metadata) {
      return;
    }
    self.sink.log(
      &Record::builder()
        .metadata(metadata)
        .args(args)
        .module_path(Some(target))
        .build(),
    );
  }
}

impl Default for Logger {
  fn default() -> Self {
    Self::global()
  }
}

impl fmt::Debug for Logger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Logger").finish_non_exhaustive()
  }
}

/// `diag!(logger, Level::Debug, "fmt", args..)`
macro_rules! diag {
  ($logger:expr, $level:expr, $($arg:tt)+) => {
    $logger.log($level, module_path!(), format_args!($($arg)+))
  };
}

pub(crate) use diag;
