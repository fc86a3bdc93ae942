//! Core value types for bqstream.
//!
//! Everything here is free of engine handles and threads: stream state,
//! error kinds, buffer sizing and the position estimator. The stream
//! adapter in `bq-stream` builds on these.

mod clock;
mod error;
mod position;
mod sizing;
mod state;
mod types;

pub use clock::sleep_for_nanos;
pub use error::{Result, StreamError};
pub use position::{frames_from_millis, MonotonicCounter};
pub use sizing::{
    configure_buffer_sizes, high_latency_buffer_frames, BufferGeometry, SizingRequest,
    BUFFER_QUEUE_LENGTH, HIGH_LATENCY_BUFFER_MILLIS,
};
pub use state::{AtomicStreamState, StreamState};
pub use types::{
    AudioFormat, DataCallbackResult, DefaultStreamValues, Direction, SharingMode,
    MILLIS_PER_SECOND, NANOS_PER_MILLISECOND, NANOS_PER_SECOND, UNSPECIFIED,
};
