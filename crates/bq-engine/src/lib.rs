//! Native buffer-queue audio engine abstraction.
//!
//! A buffer-queue engine plays (or records into) fixed-size buffers the
//! client enqueues, and calls back on its own thread each time one has
//! been consumed. This crate defines that contract as traits, the
//! reference-counted process-wide engine handle, and a software engine
//! used for tests and offline runs.

mod engine;
mod result;
mod shared;
pub mod sim;

pub use engine::{
    AudioEngine, BufferQueue, BufferQueueHandler, QueueState, RegisterError, StreamObject, StreamSpec,
};
pub use result::{result_code_str, EngineError};
pub use shared::{EngineLease, SharedEngine};
