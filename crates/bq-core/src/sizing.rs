//! Buffer sizing policy.
//!
//! Decides how many frames the engine moves per burst, how many the client
//! callback sees, and how deep the engine queue is allowed to get. The
//! engine delivers whole bursts, so one callback always covers exactly one
//! burst.

use tracing::{debug, error};

use crate::error::{Result, StreamError};
use crate::types::{MILLIS_PER_SECOND, UNSPECIFIED};

/// Number of bursts the engine queue holds when the adapter manages depth.
pub const BUFFER_QUEUE_LENGTH: i32 = 2;

/// Length of the buffer used when the caller asked for no particular latency.
pub const HIGH_LATENCY_BUFFER_MILLIS: i32 = 20;

/// Inputs to [`configure_buffer_sizes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizingRequest {
    /// Requested frames per callback, or `UNSPECIFIED`.
    pub frames_per_callback: i32,
    pub bytes_per_frame: i32,
    /// Burst size the platform uses when the caller expressed no preference.
    pub default_frames_per_burst: i32,
    /// True when a FIFO sits between client and engine and owns the depth.
    pub using_fifo: bool,
}

/// Resolved buffer sizes for an open stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferGeometry {
    pub frames_per_burst: i32,
    pub frames_per_callback: i32,
    pub bytes_per_callback: i32,
    /// Engine queue capacity. Zero when a FIFO owns the depth.
    pub buffer_capacity_in_frames: i32,
    pub buffer_size_in_frames: i32,
}

/// Compute the buffer geometry for a stream.
///
/// Fails with `InvalidFormat` if a callback buffer would hold no bytes, and
/// with `OutOfRange` if the queue capacity overflows an `i32`.
pub fn configure_buffer_sizes(request: SizingRequest) -> Result<BufferGeometry> {
    let mut geometry = BufferGeometry::default();

    if request.frames_per_callback != UNSPECIFIED {
        // An explicit callback size must be honoured exactly.
        geometry.frames_per_burst = request.frames_per_callback;
    } else {
        geometry.frames_per_burst = request.default_frames_per_burst;
    }
    geometry.frames_per_callback = geometry.frames_per_burst;
    debug!(
        frames_per_burst = geometry.frames_per_burst,
        frames_per_callback = geometry.frames_per_callback,
        requested = request.frames_per_callback,
        "configured burst size"
    );

    geometry.bytes_per_callback = geometry
        .frames_per_callback
        .checked_mul(request.bytes_per_frame)
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| {
            error!(
                frames_per_callback = geometry.frames_per_callback,
                bytes_per_frame = request.bytes_per_frame,
                "callback buffer has no bytes, bad format?"
            );
            StreamError::InvalidFormat
        })?;

    if !request.using_fifo {
        geometry.buffer_capacity_in_frames =
            queue_capacity_in_frames(geometry.frames_per_burst, BUFFER_QUEUE_LENGTH)?;
        geometry.buffer_size_in_frames = geometry.buffer_capacity_in_frames;
    }

    Ok(geometry)
}

/// `frames_per_burst * queue_length`, or `OutOfRange` if that does not fit.
pub(crate) fn queue_capacity_in_frames(frames_per_burst: i32, queue_length: i32) -> Result<i32> {
    match frames_per_burst.checked_mul(queue_length) {
        Some(capacity) if capacity > 0 => Ok(capacity),
        _ => {
            error!(frames_per_burst, queue_length, "numeric overflow computing queue capacity");
            Err(StreamError::OutOfRange)
        }
    }
}

/// Frames in a [`HIGH_LATENCY_BUFFER_MILLIS`] buffer at `sample_rate`.
pub fn high_latency_buffer_frames(sample_rate: i32) -> i32 {
    let frames = i64::from(HIGH_LATENCY_BUFFER_MILLIS) * i64::from(sample_rate) / MILLIS_PER_SECOND;
    i32::try_from(frames).unwrap_or(i32::MAX)
}
