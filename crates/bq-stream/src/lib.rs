//! Stream adapter over a native buffer-queue engine.
//!
//! The engine pulls one fixed-size buffer at a time on its own thread; this
//! crate turns that into a stream the client drives with open, start, stop
//! and close, and tracks how many frames have moved.
//!
//! Two threads touch a stream. The client thread runs lifecycle calls under
//! a stream-wide lock. The engine thread runs the callback bridge, which
//! only ever touches atomics: the state cell, the frame counters and the
//! stop signal. Stops the bridge asks for are carried out by a small worker
//! thread per stream.

mod bridge;
mod buffered;
mod builder;
mod callback;
mod stream;

pub use bq_core::{
    AudioFormat, DataCallbackResult, DefaultStreamValues, Direction, SharingMode, StreamError, StreamState,
};
pub use builder::StreamBuilder;
pub use callback::DataCallback;
pub use stream::{AudioStream, STATE_POLL_INTERVAL_NANOS};

#[doc(hidden)]
pub mod bench_support {
    //! Exposes the bridge to benchmarks and allocation tests.
    pub use crate::bridge::{CallbackBridge, CallbackShared};
}
