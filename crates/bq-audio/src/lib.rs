//! Desktop audio engine for bqstream.
//!
//! Presents the default cpal output device as a buffer-queue engine, so
//! streams opened through `bq-stream` play on real hardware.

mod cpal_engine;
mod error;
mod queue;

use std::sync::{Arc, OnceLock};

use bq_engine::SharedEngine;

pub use cpal_engine::CpalEngine;
pub use error::DeviceError;

/// The process-wide cpal engine, created on first use.
pub fn default_engine() -> Arc<SharedEngine> {
    static ENGINE: OnceLock<Arc<SharedEngine>> = OnceLock::new();
    Arc::clone(ENGINE.get_or_init(|| SharedEngine::new(Arc::new(CpalEngine::new()))))
}
