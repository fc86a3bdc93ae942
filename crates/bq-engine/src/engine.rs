//! Engine, stream object and buffer-queue traits.

use std::sync::Arc;

use bq_core::{AudioFormat, Direction};

use crate::result::EngineError;

/// Parameters for a native stream object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub direction: Direction,
    pub sample_rate: i32,
    pub channel_count: i32,
    pub format: AudioFormat,
    /// Size of every buffer the client will enqueue.
    pub bytes_per_buffer: i32,
    /// Maximum number of buffers queued at once.
    pub queue_length: i32,
}

impl StreamSpec {
    pub fn bytes_per_frame(&self) -> i32 {
        self.channel_count * self.format.bytes_per_sample()
    }
}

/// Process-wide native engine.
pub trait AudioEngine: Send + Sync {
    /// Bring the engine up. Called once per `SharedEngine` reference cycle.
    fn realize(&self) -> Result<(), EngineError>;

    /// Release engine-level resources.
    fn shutdown(&self);

    /// Create a stream object. Each stream owns its object exclusively.
    fn create_stream(&self, spec: &StreamSpec) -> Result<Box<dyn StreamObject>, EngineError>;

    /// Preferred burst size, if the platform reports one.
    fn default_frames_per_burst(&self) -> Option<i32> {
        None
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Per-stream native object.
pub trait StreamObject: Send {
    /// Obtain the buffer-queue interface of this object.
    fn buffer_queue(&self) -> Result<Arc<dyn BufferQueue>, EngineError>;

    /// Start or stop consuming buffers.
    fn set_running(&self, running: bool) -> Result<(), EngineError>;

    /// Elapsed play/record time in milliseconds. Wraps at `u32::MAX`.
    fn position_millis(&self) -> Result<u32, EngineError>;

    /// Destroy the object. Its buffer queue stops calling back before this returns.
    fn destroy(self: Box<Self>);
}

/// Snapshot of a buffer queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueState {
    /// Buffers currently queued.
    pub count: u32,
    /// Total buffers completed so far.
    pub index: u32,
}

/// Queue of fixed-size buffers owned by a stream object.
pub trait BufferQueue: Send + Sync {
    /// Queue `buffer`. The engine copies it before the next completion.
    ///
    /// For recording queues only the length matters; the captured bytes are
    /// delivered through [`BufferQueueHandler::on_buffer_complete`].
    fn enqueue(&self, buffer: &[u8]) -> Result<(), EngineError>;

    fn state(&self) -> Result<QueueState, EngineError>;

    /// Drop all queued buffers.
    fn clear(&self) -> Result<(), EngineError>;

    /// Install the completion handler. Fails if one is already installed,
    /// handing the rejected handler back.
    fn register_callback(&self, handler: Box<dyn BufferQueueHandler>) -> Result<(), RegisterError>;

    /// Remove the handler and hand it back, waiting out any callback in flight.
    fn unregister_callback(&self) -> Option<Box<dyn BufferQueueHandler>>;
}

/// A handler the queue refused to install.
pub struct RegisterError {
    pub error: EngineError,
    pub handler: Box<dyn BufferQueueHandler>,
}

impl std::fmt::Debug for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterError").field("error", &self.error).finish_non_exhaustive()
    }
}

/// Receiver of buffer-queue events. Runs on the engine's thread, except
/// for [`prime`](BufferQueueHandler::prime).
pub trait BufferQueueHandler: Send {
    /// Queue the first buffer before the queue starts running. Called on
    /// the client thread while the handler is not registered.
    fn prime(&mut self, queue: &dyn BufferQueue) -> Result<(), EngineError>;

    /// A queued buffer finished. `captured` holds the recorded bytes for
    /// input queues and is empty for output queues.
    fn on_buffer_complete(&mut self, queue: &dyn BufferQueue, captured: &[u8]);

    /// The device backing the stream went away.
    fn on_device_lost(&mut self) {}
}
