//! Stream lifecycle.
//!
//! `open → start → stop → close`, plus position queries and the polling
//! wait for state changes. Lifecycle calls serialize on one stream-wide
//! lock; methods ending in `_l` expect it held. The callback bridge never
//! sees that lock, which is why the state cell and frame counters live in
//! [`CallbackShared`] as atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bq_core::{
    frames_from_millis, sleep_for_nanos, AudioFormat, BufferGeometry, Direction, MonotonicCounter,
    Result, StreamError, StreamState, NANOS_PER_MILLISECOND,
};
use bq_engine::{BufferQueue, BufferQueueHandler, EngineLease, StreamObject};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::bridge::CallbackShared;
use crate::buffered::BufferedIo;

/// Sleep slice of [`AudioStream::wait_for_state_change`] and of blocking
/// FIFO reads and writes. A latency/wake-up tradeoff, not a guarantee.
pub const STATE_POLL_INTERVAL_NANOS: i64 = 20 * NANOS_PER_MILLISECOND;

/// Resolved, immutable attributes of an open stream.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamAttributes {
    pub direction: Direction,
    pub sample_rate: i32,
    pub channel_count: i32,
    pub format: AudioFormat,
    pub bytes_per_frame: i32,
    pub geometry: BufferGeometry,
}

/// Engine resources owned by an open stream. Guarded by the stream lock.
pub(crate) struct EngineResources {
    pub lease: Option<EngineLease>,
    pub object: Option<Box<dyn StreamObject>>,
    pub queue: Option<Arc<dyn BufferQueue>>,
    /// The bridge while it is not lent to the engine.
    pub handler: Option<Box<dyn BufferQueueHandler>>,
}

pub(crate) struct StreamCore {
    pub attributes: StreamAttributes,
    pub shared: Arc<CallbackShared>,
    pub buffered: Option<BufferedIo>,
    resources: Mutex<EngineResources>,
    /// Engine time in milliseconds, widened to 64 bits. Separate from the
    /// stream lock so position queries never wait on a lifecycle call.
    position: Mutex<MonotonicCounter>,
    worker_exit: AtomicBool,
}

impl StreamCore {
    pub(crate) fn new(
        attributes: StreamAttributes,
        shared: Arc<CallbackShared>,
        buffered: Option<BufferedIo>,
        resources: EngineResources,
    ) -> Self {
        Self {
            attributes,
            shared,
            buffered,
            resources: Mutex::new(resources),
            position: Mutex::new(MonotonicCounter::new()),
            worker_exit: AtomicBool::new(false),
        }
    }

    fn state(&self) -> StreamState {
        self.shared.state.get()
    }

    fn set_state(&self, state: StreamState) {
        debug!(from = ?self.state(), to = ?state, "stream state");
        self.shared.state.set(state);
    }

    fn start_l(&self, res: &mut EngineResources) -> Result<()> {
        match self.state() {
            StreamState::Open | StreamState::Stopped => {}
            StreamState::Starting | StreamState::Started => return Ok(()),
            StreamState::Closed => return Err(StreamError::Closed),
            StreamState::Disconnected => return Err(StreamError::Disconnected),
            other => return Err(StreamError::InvalidState(other)),
        }
        let (Some(object), Some(queue)) = (res.object.as_ref(), res.queue.clone()) else {
            return Err(StreamError::Internal);
        };
        let Some(mut handler) = res.handler.take() else {
            error!("callback bridge is missing, stream cannot start");
            return Err(StreamError::Internal);
        };

        let previous = self.state();
        self.set_state(StreamState::Starting);
        self.shared.stop.clear();

        if let Err(err) = handler.prime(&*queue) {
            error!(result = err.as_str(), "failed to enqueue initial buffer");
            res.handler = Some(handler);
            self.set_state(previous);
            return Err(StreamError::Internal);
        }
        if let Err(rejected) = queue.register_callback(handler) {
            error!(result = rejected.error.as_str(), "failed to register buffer queue callback");
            res.handler = Some(rejected.handler);
            let _ = queue.clear();
            self.set_state(previous);
            return Err(StreamError::Internal);
        }
        if let Err(err) = object.set_running(true) {
            error!(result = err.as_str(), "engine refused to start");
            res.handler = queue.unregister_callback();
            let _ = queue.clear();
            self.set_state(previous);
            return Err(StreamError::Internal);
        }

        // Device loss may already have moved us on from Starting.
        self.shared.state.transition(StreamState::Starting, StreamState::Started);
        info!(direction = ?self.attributes.direction, "stream started");
        Ok(())
    }

    fn stop_l(&self, res: &mut EngineResources) -> Result<()> {
        match self.state() {
            StreamState::Starting | StreamState::Started => {}
            StreamState::Open | StreamState::Stopping | StreamState::Stopped => return Ok(()),
            StreamState::Closed => return Err(StreamError::Closed),
            StreamState::Disconnected => return Err(StreamError::Disconnected),
            other => return Err(StreamError::InvalidState(other)),
        }
        self.set_state(StreamState::Stopping);
        self.halt_engine_l(res);
        if let Some(queue) = res.queue.as_ref() {
            if let Err(err) = queue.clear() {
                warn!(result = err.as_str(), "failed to clear buffer queue");
            }
        }
        self.shared.stop.clear();
        // A device loss that raced the stop wins.
        self.shared.state.transition(StreamState::Stopping, StreamState::Stopped);
        info!(direction = ?self.attributes.direction, "stream stopped");
        Ok(())
    }

    /// Stop the engine and take the bridge back. One more callback may be
    /// in flight; unregistering waits for it.
    fn halt_engine_l(&self, res: &mut EngineResources) {
        if let Some(object) = res.object.as_ref() {
            if let Err(err) = object.set_running(false) {
                warn!(result = err.as_str(), "engine refused to stop");
            }
        }
        if let Some(queue) = res.queue.as_ref() {
            if let Some(handler) = queue.unregister_callback() {
                res.handler = Some(handler);
            }
        }
    }

    fn close_l(&self, res: &mut EngineResources) -> Result<()> {
        if self.state() == StreamState::Closed {
            return Err(StreamError::Closed);
        }
        self.set_state(StreamState::Closing);

        if let Some(buffered) = self.buffered.as_ref() {
            buffered.close();
        }

        self.on_before_destroy_l(res);
        if let Some(object) = res.object.take() {
            object.destroy();
        }
        self.on_after_destroy_l(res);

        res.queue = None;
        if let Some(lease) = res.lease.take() {
            lease.release();
        }

        self.set_state(StreamState::Closed);
        info!(direction = ?self.attributes.direction, "stream closed");
        Ok(())
    }

    fn on_before_destroy_l(&self, res: &mut EngineResources) {
        self.halt_engine_l(res);
    }

    fn on_after_destroy_l(&self, res: &mut EngineResources) {
        // Drops the bridge, its callback buffer and the client callback.
        res.handler = None;
    }

    /// Carry out a stop the bridge requested. Runs on the stop worker.
    ///
    /// The request is taken under the stream lock, so a direct stop or
    /// restart that got there first has already cleared it.
    fn handle_stop_request(&self) {
        let mut res = self.resources.lock();
        let Some(client_error) = self.shared.stop.take() else {
            return;
        };
        if client_error {
            warn!("data callback reported an error, stopping stream");
        } else {
            debug!("data callback asked to stop");
        }
        match self.stop_l(&mut res) {
            Ok(()) | Err(StreamError::Closed) | Err(StreamError::Disconnected) => {}
            Err(err) => warn!(%err, "requested stop failed"),
        }
    }
}

fn run_stop_worker(core: Arc<StreamCore>) {
    loop {
        std::thread::park();
        if core.worker_exit.load(Ordering::Acquire) {
            break;
        }
        if core.shared.stop.is_pending() {
            core.handle_stop_request();
        }
        if core.shared.stop.take_device_lost() {
            warn!(direction = ?core.attributes.direction, "audio device lost, stream disconnected");
        }
    }
}

/// An open buffer-queue audio stream.
///
/// Created by [`StreamBuilder::open_stream`](crate::StreamBuilder::open_stream).
/// Dropping an unclosed stream closes it.
pub struct AudioStream {
    core: Arc<StreamCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioStream {
    /// Finish opening: start the stop worker. Closes the stream on failure.
    pub(crate) fn launch(core: StreamCore) -> Result<Self> {
        let core = Arc::new(core);
        let worker_core = Arc::clone(&core);
        let spawned = std::thread::Builder::new()
            .name("bq-stream-stop".into())
            .spawn(move || run_stop_worker(worker_core));
        match spawned {
            Ok(handle) => {
                core.shared.stop.set_worker(handle.thread().clone());
                core.set_state(StreamState::Open);
                Ok(Self {
                    core,
                    worker: Mutex::new(Some(handle)),
                })
            }
            Err(err) => {
                error!(%err, "failed to spawn stop worker");
                let mut res = core.resources.lock();
                let _ = core.close_l(&mut res);
                Err(StreamError::Internal)
            }
        }
    }

    /// Start the engine pulling buffers. No-op if already started.
    pub fn start(&self) -> Result<()> {
        let mut res = self.core.resources.lock();
        self.core.start_l(&mut res)
    }

    /// Same as [`start`](Self::start); the transition completes before it returns.
    pub fn request_start(&self) -> Result<()> {
        self.start()
    }

    /// Stop the engine and wait for the bridge to be idle.
    pub fn stop(&self) -> Result<()> {
        let mut res = self.core.resources.lock();
        self.core.stop_l(&mut res)
    }

    /// Ask the stop worker to stop the stream and return at once.
    pub fn request_stop(&self) -> Result<()> {
        match self.state() {
            StreamState::Closed | StreamState::Closing => Err(StreamError::Closed),
            StreamState::Disconnected => Err(StreamError::Disconnected),
            _ => {
                self.core.shared.stop.request(false);
                Ok(())
            }
        }
    }

    /// Tear the stream down. A second close returns `Closed`.
    pub fn close(&self) -> Result<()> {
        self.shutdown_worker();
        let mut res = self.core.resources.lock();
        self.core.close_l(&mut res)
    }

    fn shutdown_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            self.core.worker_exit.store(true, Ordering::Release);
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("stop worker panicked");
            }
        }
    }

    /// Wait until the state differs from `current_state`.
    ///
    /// Polls the state without the stream lock, sleeping at most
    /// [`STATE_POLL_INTERVAL_NANOS`] per round. A non-positive timeout
    /// checks exactly once. Returns `Timeout` with the last observed state
    /// if nothing changed in time.
    pub fn wait_for_state_change(
        &self,
        current_state: StreamState,
        timeout_nanos: i64,
    ) -> (Result<()>, StreamState) {
        let mut time_left = timeout_nanos;
        loop {
            let state = self.core.shared.state.get();
            if state != current_state {
                return (Ok(()), state);
            }
            if time_left <= 0 {
                return (Err(StreamError::Timeout), state);
            }
            let sleep = STATE_POLL_INTERVAL_NANOS.min(time_left);
            sleep_for_nanos(sleep);
            time_left -= sleep;
        }
    }

    /// Write frames in FIFO mode. See [`StreamBuilder`](crate::StreamBuilder)
    /// for when a stream has a FIFO.
    pub fn write(&self, data: &[u8], timeout_nanos: i64) -> Result<i32> {
        self.check_io()?.write(data, timeout_nanos)
    }

    /// Read frames in FIFO mode.
    pub fn read(&self, data: &mut [u8], timeout_nanos: i64) -> Result<i32> {
        self.check_io()?.read(data, timeout_nanos)
    }

    fn check_io(&self) -> Result<&BufferedIo> {
        match self.state() {
            StreamState::Closed | StreamState::Closing => return Err(StreamError::Closed),
            StreamState::Disconnected => return Err(StreamError::Disconnected),
            _ => {}
        }
        self.core.buffered.as_ref().ok_or(StreamError::Unimplemented)
    }

    /// Estimated frames the engine has played or recorded.
    ///
    /// Derived from the engine's elapsed-time counter, assuming it ran at
    /// the stream's sample rate the whole time. While a lifecycle call holds
    /// the stream lock this reports the last known position.
    pub fn frames_processed_by_server(&self) -> i64 {
        let mut position = self.core.position.lock();
        if let Some(res) = self.core.resources.try_lock() {
            if let Some(object) = res.object.as_ref() {
                match object.position_millis() {
                    Ok(millis) => {
                        position.update32(millis);
                    }
                    Err(err) => debug!(result = err.as_str(), "position query failed"),
                }
            }
        }
        frames_from_millis(position.get(), self.core.attributes.sample_rate)
    }

    /// Buffers currently queued in the engine, or -1 if that is unknown.
    pub fn buffer_depth(&self) -> i32 {
        let res = self.core.resources.lock();
        match res.queue.as_ref().map(|queue| queue.state()) {
            Some(Ok(state)) => i32::try_from(state.count).unwrap_or(i32::MAX),
            _ => -1,
        }
    }

    pub fn state(&self) -> StreamState {
        self.core.shared.state.get()
    }

    pub fn direction(&self) -> Direction {
        self.core.attributes.direction
    }

    pub fn sample_rate(&self) -> i32 {
        self.core.attributes.sample_rate
    }

    pub fn channel_count(&self) -> i32 {
        self.core.attributes.channel_count
    }

    pub fn format(&self) -> AudioFormat {
        self.core.attributes.format
    }

    pub fn bytes_per_frame(&self) -> i32 {
        self.core.attributes.bytes_per_frame
    }

    pub fn frames_per_burst(&self) -> i32 {
        self.core.attributes.geometry.frames_per_burst
    }

    pub fn frames_per_callback(&self) -> i32 {
        self.core.attributes.geometry.frames_per_callback
    }

    pub fn buffer_capacity_in_frames(&self) -> i32 {
        self.core.attributes.geometry.buffer_capacity_in_frames
    }

    pub fn buffer_size_in_frames(&self) -> i32 {
        self.core.attributes.geometry.buffer_size_in_frames
    }

    /// Frames the bridge has delivered from the engine to the client.
    pub fn frames_read(&self) -> i64 {
        self.core.shared.frames_read()
    }

    /// Frames the bridge has handed from the client to the engine.
    pub fn frames_written(&self) -> i64 {
        self.core.shared.frames_written()
    }

    /// FIFO under/overruns. Always 0 for streams with a data callback.
    pub fn xrun_count(&self) -> i32 {
        self.core.buffered.as_ref().map_or(0, BufferedIo::xrun_count)
    }

    /// True if the stream moves data through a FIFO rather than a callback.
    pub fn uses_fifo(&self) -> bool {
        self.core.buffered.is_some()
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        if self.state() != StreamState::Closed {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("state", &self.state())
            .field("attributes", &self.core.attributes)
            .finish()
    }
}
