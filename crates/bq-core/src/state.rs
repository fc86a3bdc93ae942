//! Stream lifecycle state and its lock-free cell.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    #[default]
    Uninitialized = 0,
    Open,
    Starting,
    Started,
    Stopping,
    Stopped,
    Closing,
    Closed,
    Disconnected,
}

impl StreamState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Open,
            2 => StreamState::Starting,
            3 => StreamState::Started,
            4 => StreamState::Stopping,
            5 => StreamState::Stopped,
            6 => StreamState::Closing,
            7 => StreamState::Closed,
            8 => StreamState::Disconnected,
            _ => StreamState::Uninitialized,
        }
    }
}

/// Stream state shared between the client thread and the engine callback.
///
/// Lifecycle calls write it while holding the stream lock; the callback
/// thread only ever moves a running stream to `Disconnected`, and readers
/// never take the lock.
#[derive(Debug, Default)]
pub struct AtomicStreamState(AtomicU8);

impl AtomicStreamState {
    pub const fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `current` to `new` if nothing else changed it first.
    pub fn transition(&self, current: StreamState, new: StreamState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
