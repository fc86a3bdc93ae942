//! Error kinds surfaced by stream operations.

use thiserror::Error;

use crate::state::StreamState;

/// Error returned by stream operations.
///
/// Native engine result codes never reach callers directly; anything that
/// is not one of the specific kinds below collapses to `Internal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream has already been closed.
    #[error("stream is closed")]
    Closed,
    /// The native engine failed to initialize or hand out an interface.
    #[error("internal engine error")]
    Internal,
    /// Buffer geometry resolved to zero or negative bytes.
    #[error("invalid format: callback buffer would have no bytes")]
    InvalidFormat,
    /// A size computation overflowed.
    #[error("value out of range")]
    OutOfRange,
    /// The state did not change within the allotted time.
    #[error("timed out")]
    Timeout,
    /// The operation is not valid in the current state.
    #[error("operation not valid in state {0:?}")]
    InvalidState(StreamState),
    /// The device went away; only close is valid.
    #[error("stream disconnected")]
    Disconnected,
    /// The operation does not apply to this stream's mode or direction.
    #[error("operation not implemented for this stream")]
    Unimplemented,
    /// A configuration value was negative.
    #[error("invalid argument")]
    InvalidArgument,
}

pub type Result<T> = core::result::Result<T, StreamError>;
