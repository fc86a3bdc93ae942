//! Buffer-queue callback bridge.
//!
//! Runs on the engine's thread every time a queued buffer completes. It
//! hands the single callback buffer to the client, gives it back to the
//! engine and advances the frame counter. Everything it shares with the
//! client thread is atomic; the stream lock is out of its reach.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;

use bq_core::{AtomicStreamState, BufferGeometry, DataCallbackResult, Direction, StreamState};
use bq_engine::{BufferQueue, BufferQueueHandler, EngineError};

use crate::callback::DataCallback;

/// State the bridge shares with the client thread. All lock-free.
#[derive(Debug, Default)]
pub struct CallbackShared {
    pub(crate) state: AtomicStreamState,
    frames_read: AtomicI64,
    frames_written: AtomicI64,
    pub(crate) stop: StopSignal,
}

impl CallbackShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn frames_read(&self) -> i64 {
        self.frames_read.load(Ordering::Acquire)
    }

    pub fn frames_written(&self) -> i64 {
        self.frames_written.load(Ordering::Acquire)
    }

    /// Stop requests raised since the stream opened.
    pub fn stop_requests(&self) -> u32 {
        self.stop.requests.load(Ordering::Acquire)
    }
}

/// Stop requests from the engine thread to the stop worker.
///
/// Raising a request is a flag swap plus an unpark, so it never blocks.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    pending: AtomicBool,
    client_error: AtomicBool,
    device_lost: AtomicBool,
    requests: AtomicU32,
    worker: OnceLock<Thread>,
}

impl StopSignal {
    pub(crate) fn set_worker(&self, worker: Thread) {
        let _ = self.worker.set(worker);
    }

    /// Raise a stop request. Returns false if one is already pending.
    pub(crate) fn request(&self, client_error: bool) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if client_error {
            self.client_error.store(true, Ordering::Release);
        }
        self.requests.fetch_add(1, Ordering::AcqRel);
        self.wake();
        true
    }

    pub(crate) fn device_lost(&self) {
        self.device_lost.store(true, Ordering::Release);
        self.wake();
    }

    /// Take the pending request, if any. `Some(true)` if the client reported an error.
    pub(crate) fn take(&self) -> Option<bool> {
        if self.pending.swap(false, Ordering::AcqRel) {
            Some(self.client_error.swap(false, Ordering::AcqRel))
        } else {
            None
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn take_device_lost(&self) -> bool {
        self.device_lost.swap(false, Ordering::AcqRel)
    }

    /// Forget a request that a direct stop already satisfied.
    pub(crate) fn clear(&self) {
        self.pending.store(false, Ordering::Release);
        self.client_error.store(false, Ordering::Release);
    }

    pub(crate) fn wake(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }
}

/// Connects the engine's buffer-complete events to the client callback.
pub struct CallbackBridge {
    direction: Direction,
    frames_per_callback: i32,
    /// The one buffer every callback reuses. Allocated at open.
    buffer: Box<[u8]>,
    callback: Box<dyn DataCallback>,
    shared: Arc<CallbackShared>,
}

impl CallbackBridge {
    pub fn new(
        direction: Direction,
        geometry: &BufferGeometry,
        callback: Box<dyn DataCallback>,
        shared: Arc<CallbackShared>,
    ) -> Self {
        let bytes = usize::try_from(geometry.bytes_per_callback).unwrap_or(0);
        Self {
            direction,
            frames_per_callback: geometry.frames_per_callback,
            buffer: vec![0u8; bytes].into_boxed_slice(),
            callback,
            shared,
        }
    }

    pub fn bytes_per_callback(&self) -> usize {
        self.buffer.len()
    }

    /// Handle one completed buffer.
    ///
    /// `captured` carries recorded bytes for input streams and is ignored
    /// for output streams.
    pub fn process(&mut self, queue: &dyn BufferQueue, captured: &[u8]) {
        if self.direction == Direction::Input {
            let n = captured.len().min(self.buffer.len());
            self.buffer[..n].copy_from_slice(&captured[..n]);
            self.buffer[n..].fill(0);
        }

        let result = self.callback.on_audio_ready(&mut self.buffer, self.frames_per_callback);
        let stop = match result {
            DataCallbackResult::Continue => {
                let enqueued = queue.enqueue(&self.buffer).is_ok();
                let counter = match self.direction {
                    Direction::Input => &self.shared.frames_read,
                    Direction::Output => &self.shared.frames_written,
                };
                counter.fetch_add(i64::from(self.frames_per_callback), Ordering::AcqRel);
                !enqueued
            }
            DataCallbackResult::Stop | DataCallbackResult::Error => true,
        };

        if stop {
            self.shared.stop.request(result == DataCallbackResult::Error);
        }
    }
}

impl BufferQueueHandler for CallbackBridge {
    fn prime(&mut self, queue: &dyn BufferQueue) -> Result<(), EngineError> {
        match self.direction {
            // Fill the first buffer so playback starts with client data.
            Direction::Output => {
                self.process(queue, &[]);
                Ok(())
            }
            Direction::Input => queue.enqueue(&self.buffer),
        }
    }

    fn on_buffer_complete(&mut self, queue: &dyn BufferQueue, captured: &[u8]) {
        self.process(queue, captured);
    }

    fn on_device_lost(&mut self) {
        let state = &self.shared.state;
        if state.transition(StreamState::Started, StreamState::Disconnected)
            || state.transition(StreamState::Starting, StreamState::Disconnected)
        {
            self.shared.stop.device_lost();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bq_engine::{QueueState, RegisterError};
    use parking_lot::Mutex;

    /// Records every enqueue; can be told to reject them.
    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl BufferQueue for RecordingQueue {
        fn enqueue(&self, buffer: &[u8]) -> Result<(), EngineError> {
            if self.fail.load(Ordering::Acquire) {
                return Err(EngineError::BufferInsufficient);
            }
            self.enqueued.lock().push(buffer.to_vec());
            Ok(())
        }

        fn state(&self) -> Result<QueueState, EngineError> {
            Ok(QueueState {
                count: self.enqueued.lock().len() as u32,
                index: 0,
            })
        }

        fn clear(&self) -> Result<(), EngineError> {
            self.enqueued.lock().clear();
            Ok(())
        }

        fn register_callback(&self, _handler: Box<dyn BufferQueueHandler>) -> Result<(), RegisterError> {
            Ok(())
        }

        fn unregister_callback(&self) -> Option<Box<dyn BufferQueueHandler>> {
            None
        }
    }

    fn geometry(frames: i32, bytes_per_frame: i32) -> BufferGeometry {
        BufferGeometry {
            frames_per_burst: frames,
            frames_per_callback: frames,
            bytes_per_callback: frames * bytes_per_frame,
            buffer_capacity_in_frames: frames * 2,
            buffer_size_in_frames: frames * 2,
        }
    }

    fn bridge_with<F>(direction: Direction, callback: F) -> (CallbackBridge, Arc<CallbackShared>)
    where
        F: FnMut(&mut [u8], i32) -> DataCallbackResult + Send + 'static,
    {
        let shared = Arc::new(CallbackShared::new());
        let bridge = CallbackBridge::new(direction, &geometry(64, 4), Box::new(callback), shared.clone());
        (bridge, shared)
    }

    #[test]
    fn continue_counts_frames_exactly() {
        let (mut bridge, shared) = bridge_with(Direction::Output, |_, _| DataCallbackResult::Continue);
        let queue = RecordingQueue::default();
        for _ in 0..25 {
            bridge.process(&queue, &[]);
        }
        assert_eq!(shared.frames_written(), 25 * 64);
        assert_eq!(shared.frames_read(), 0);
        assert_eq!(queue.enqueued.lock().len(), 25);
        assert_eq!(shared.stop_requests(), 0);
    }

    #[test]
    fn input_counts_frames_read() {
        let (mut bridge, shared) = bridge_with(Direction::Input, |_, _| DataCallbackResult::Continue);
        let queue = RecordingQueue::default();
        for _ in 0..3 {
            bridge.process(&queue, &[7; 256]);
        }
        assert_eq!(shared.frames_read(), 3 * 64);
        assert_eq!(shared.frames_written(), 0);
    }

    #[test]
    fn client_sees_frame_count_and_fills_buffer() {
        let (mut bridge, _) = bridge_with(Direction::Output, |audio, frames| {
            assert_eq!(frames, 64);
            assert_eq!(audio.len(), 256);
            audio.fill(0x5a);
            DataCallbackResult::Continue
        });
        let queue = RecordingQueue::default();
        bridge.process(&queue, &[]);
        assert_eq!(queue.enqueued.lock()[0], vec![0x5a; 256]);
    }

    #[test]
    fn input_copies_captured_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (mut bridge, _) = bridge_with(Direction::Input, move |audio, _| {
            sink.lock().extend_from_slice(audio);
            DataCallbackResult::Continue
        });
        let queue = RecordingQueue::default();
        bridge.process(&queue, &[3; 100]);
        let seen = seen.lock();
        assert_eq!(seen.len(), 256);
        assert!(seen[..100].iter().all(|&b| b == 3));
        assert!(seen[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stop_requests_once_and_skips_enqueue() {
        let (mut bridge, shared) = bridge_with(Direction::Output, |_, _| DataCallbackResult::Stop);
        let queue = RecordingQueue::default();
        bridge.process(&queue, &[]);
        assert_eq!(shared.stop_requests(), 1);
        assert!(queue.enqueued.lock().is_empty());
        assert_eq!(shared.frames_written(), 0);

        // A tail callback before the stop lands does not raise a second request.
        bridge.process(&queue, &[]);
        assert_eq!(shared.stop_requests(), 1);
        assert_eq!(shared.stop.take(), Some(false));
    }

    #[test]
    fn error_stops_like_stop_but_is_flagged() {
        let (mut bridge, shared) = bridge_with(Direction::Output, |_, _| DataCallbackResult::Error);
        let queue = RecordingQueue::default();
        bridge.process(&queue, &[]);
        assert_eq!(shared.stop_requests(), 1);
        assert!(queue.enqueued.lock().is_empty());
        assert_eq!(shared.stop.take(), Some(true));
        assert_eq!(shared.stop.take(), None);
    }

    #[test]
    fn failed_enqueue_requests_stop() {
        let (mut bridge, shared) = bridge_with(Direction::Output, |_, _| DataCallbackResult::Continue);
        let queue = RecordingQueue::default();
        queue.fail.store(true, Ordering::Release);
        bridge.process(&queue, &[]);
        assert_eq!(shared.stop_requests(), 1);
        assert_eq!(shared.frames_written(), 64);
    }

    #[test]
    fn prime_input_enqueues_without_callback() {
        let (mut bridge, shared) = bridge_with(Direction::Input, |_, _| {
            panic!("input priming must not run the client callback")
        });
        let queue = RecordingQueue::default();
        bridge.prime(&queue).unwrap();
        assert_eq!(queue.enqueued.lock().len(), 1);
        assert_eq!(shared.frames_read(), 0);
    }

    #[test]
    fn device_loss_only_from_running() {
        let (mut bridge, shared) = bridge_with(Direction::Output, |_, _| DataCallbackResult::Continue);
        shared.state.set(StreamState::Stopped);
        bridge.on_device_lost();
        assert_eq!(shared.state(), StreamState::Stopped);
        assert!(!shared.stop.take_device_lost());

        shared.state.set(StreamState::Started);
        bridge.on_device_lost();
        assert_eq!(shared.state(), StreamState::Disconnected);
        assert!(shared.stop.take_device_lost());
    }
}
