// src/debug_log.rs
//! Debug log sink for the host.
//!
//! The host may register one callback that receives every log line. Without a
//! callback, records go to the console through `env_logger`.
//!
//! Usage:
//!  let sink = Arc::new(DebugSink::new());
//!  debug_log::install(sink.clone(), LevelFilter::Info)?;
//!  sink.set_callback(Arc::new(|line| host_print(line)));

use std::sync::Arc;

use log::{LevelFilter, Log};
use parking_lot::RwLock;

use crate::error::{Error, Result};

pub type DebugCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Process-wide log destination. Shared by `Arc`; the callback is read-guarded.
#[derive(Default)]
pub struct DebugSink {
    callback: RwLock<Option<DebugCallback>>,
}

impl DebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: DebugCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Send one line to the callback. Returns false when none is registered.
    pub fn forward(&self, message: &str) -> bool {
        // Clone out so the callback runs without the lock held.
        let callback = self.callback.read().clone();
        match callback {
            Some(cb) => {
                cb(message);
                true
            }
            None => false,
        }
    }
}

/// `log::Log` that feeds the sink and falls back to `env_logger` on the console.
struct SinkLogger {
    console: env_logger::Logger,
    sink: Arc<DebugSink>,
    level: LevelFilter,
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] {}", record.level(), record.args());
        if !self.sink.forward(&line) && self.console.enabled(record.metadata()) {
            self.console.log(record);
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}

/// Route the `log` facade through `sink`. Fails if a logger is already set.
pub fn install(sink: Arc<DebugSink>, level: LevelFilter) -> Result<()> {
    let console = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .parse_default_env()
        .build();
    let logger = SinkLogger {
        console,
        sink,
        level,
    };
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| Error::custom(format!("installing debug log sink: {e}")))?;
    log::set_max_level(level);
    Ok(())
}
