//! Software buffer-queue engine.
//!
//! Behaves like a device-backed engine without touching hardware: buffers
//! are copied on enqueue and completed either by an explicit
//! [`SimEngine::pump`] (manual pacing) or by a per-stream thread at the
//! rate real audio would drain (realtime pacing). Faults can be injected
//! for every step a real engine may fail.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bq_core::{Direction, NANOS_PER_SECOND};
use heapless::Deque;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{
    AudioEngine, BufferQueue, BufferQueueHandler, QueueState, RegisterError, StreamObject, StreamSpec,
};
use crate::result::EngineError;

/// Deepest queue a simulated stream accepts.
pub const MAX_QUEUE_DEPTH: usize = 8;

/// How simulated buffers complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pacing {
    /// Only when [`SimEngine::pump`] or [`SimQueue::complete_one`] is called.
    Manual,
    /// On a background thread, one buffer per buffer duration.
    Realtime,
}

/// Simulated engine.
pub struct SimEngine {
    pacing: Pacing,
    frames_per_burst: i32,
    realized: AtomicBool,
    fail_realize: AtomicBool,
    fail_buffer_queue: AtomicBool,
    realize_count: AtomicUsize,
    shutdown_count: AtomicUsize,
    destroyed_count: Arc<AtomicUsize>,
    queues: Mutex<Vec<Weak<SimQueue>>>,
}

impl SimEngine {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            frames_per_burst: 192,
            realized: AtomicBool::new(false),
            fail_realize: AtomicBool::new(false),
            fail_buffer_queue: AtomicBool::new(false),
            realize_count: AtomicUsize::new(0),
            shutdown_count: AtomicUsize::new(0),
            destroyed_count: Arc::new(AtomicUsize::new(0)),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn manual() -> Self {
        Self::new(Pacing::Manual)
    }

    pub fn realtime() -> Self {
        Self::new(Pacing::Realtime)
    }

    /// Burst size reported as the platform default.
    pub fn with_frames_per_burst(mut self, frames: i32) -> Self {
        self.frames_per_burst = frames;
        self
    }

    pub fn set_fail_realize(&self, fail: bool) {
        self.fail_realize.store(fail, Ordering::Release);
    }

    /// Make `buffer_queue()` fail on streams created from now on.
    pub fn set_fail_buffer_queue(&self, fail: bool) {
        self.fail_buffer_queue.store(fail, Ordering::Release);
    }

    pub fn is_realized(&self) -> bool {
        self.realized.load(Ordering::Acquire)
    }

    pub fn realize_count(&self) -> usize {
        self.realize_count.load(Ordering::Acquire)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdown_count.load(Ordering::Acquire)
    }

    /// Stream objects destroyed so far.
    pub fn destroyed_count(&self) -> usize {
        self.destroyed_count.load(Ordering::Acquire)
    }

    /// Queues of streams that have not been destroyed.
    pub fn queues(&self) -> Vec<Arc<SimQueue>> {
        let mut queues = self.queues.lock();
        queues.retain(|q| q.strong_count() > 0);
        queues
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|q| !q.is_destroyed())
            .collect()
    }

    /// Queue of the most recently created live stream.
    pub fn last_queue(&self) -> Option<Arc<SimQueue>> {
        self.queues().pop()
    }

    /// Complete up to `buffers` buffers on every live queue. Returns how many completed.
    pub fn pump(&self, buffers: usize) -> usize {
        let mut completed = 0;
        for queue in self.queues() {
            for _ in 0..buffers {
                if !queue.complete_one() {
                    break;
                }
                completed += 1;
            }
        }
        completed
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::manual()
    }
}

impl AudioEngine for SimEngine {
    fn realize(&self) -> Result<(), EngineError> {
        if self.fail_realize.load(Ordering::Acquire) {
            return Err(EngineError::ResourceError);
        }
        self.realized.store(true, Ordering::Release);
        self.realize_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn shutdown(&self) {
        self.realized.store(false, Ordering::Release);
        self.shutdown_count.fetch_add(1, Ordering::AcqRel);
    }

    fn create_stream(&self, spec: &StreamSpec) -> Result<Box<dyn StreamObject>, EngineError> {
        if !self.is_realized() {
            return Err(EngineError::PreconditionsViolated);
        }
        let depth = usize::try_from(spec.queue_length).unwrap_or(0);
        if spec.sample_rate <= 0
            || spec.bytes_per_frame() <= 0
            || spec.bytes_per_buffer <= 0
            || !(1..=MAX_QUEUE_DEPTH).contains(&depth)
        {
            return Err(EngineError::ParameterInvalid);
        }

        let queue = Arc::new(SimQueue::new(spec, depth));
        self.queues.lock().push(Arc::downgrade(&queue));
        debug!(?spec, pacing = ?self.pacing, "created simulated stream");

        Ok(Box::new(SimStream {
            queue,
            pacing: self.pacing,
            fail_buffer_queue: self.fail_buffer_queue.load(Ordering::Acquire),
            worker: Mutex::new(None),
            destroyed_count: Arc::clone(&self.destroyed_count),
        }))
    }

    fn default_frames_per_burst(&self) -> Option<i32> {
        Some(self.frames_per_burst)
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

struct Ring {
    buffers: Vec<Vec<u8>>,
    lengths: Deque<usize, MAX_QUEUE_DEPTH>,
    head: usize,
}

/// Buffer queue of a simulated stream.
pub struct SimQueue {
    direction: Direction,
    sample_rate: i32,
    bytes_per_frame: i32,
    bytes_per_buffer: usize,
    ring: Mutex<Ring>,
    /// Last completed buffer: played bytes for output, captured bytes for input.
    scratch: Mutex<Vec<u8>>,
    handler: Mutex<Option<Box<dyn BufferQueueHandler>>>,
    running: AtomicBool,
    destroyed: AtomicBool,
    fail_enqueue: AtomicBool,
    position_frames: AtomicI64,
    completed: AtomicU32,
    starved: AtomicU32,
}

impl SimQueue {
    fn new(spec: &StreamSpec, depth: usize) -> Self {
        let bytes_per_buffer = spec.bytes_per_buffer as usize;
        Self {
            direction: spec.direction,
            sample_rate: spec.sample_rate,
            bytes_per_frame: spec.bytes_per_frame(),
            bytes_per_buffer,
            ring: Mutex::new(Ring {
                buffers: (0..depth).map(|_| Vec::with_capacity(bytes_per_buffer)).collect(),
                lengths: Deque::new(),
                head: 0,
            }),
            scratch: Mutex::new(Vec::with_capacity(bytes_per_buffer)),
            handler: Mutex::new(None),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            fail_enqueue: AtomicBool::new(false),
            position_frames: AtomicI64::new(0),
            completed: AtomicU32::new(0),
            starved: AtomicU32::new(0),
        }
    }

    /// Complete the oldest queued buffer and run the handler.
    ///
    /// Returns false if the stream is not running or nothing was queued.
    pub fn complete_one(&self) -> bool {
        if !self.is_running() || self.is_destroyed() {
            return false;
        }
        let mut scratch = self.scratch.lock();
        let len = {
            let mut ring = self.ring.lock();
            let Some(len) = ring.lengths.pop_front() else {
                self.starved.fetch_add(1, Ordering::AcqRel);
                return false;
            };
            let index = ring.head;
            let next = (index + 1) % ring.buffers.len();
            ring.head = next;
            scratch.clear();
            match self.direction {
                Direction::Output => scratch.extend_from_slice(&ring.buffers[index][..len]),
                Direction::Input => {
                    let seq = self.completed.load(Ordering::Acquire) as u8;
                    scratch.extend((0..len).map(|i| seq.wrapping_add(i as u8)));
                }
            }
            len
        };

        let frames = len as i64 / i64::from(self.bytes_per_frame);
        self.position_frames.fetch_add(frames, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::AcqRel);

        let mut handler = self.handler.lock();
        if let Some(handler) = handler.as_mut() {
            let captured: &[u8] = match self.direction {
                Direction::Input => &scratch[..],
                Direction::Output => &[],
            };
            handler.on_buffer_complete(self, captured);
        }
        true
    }

    /// Report device loss to the handler and stop consuming buffers.
    pub fn signal_device_lost(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handler) = self.handler.lock().as_mut() {
            handler.on_device_lost();
        }
    }

    /// Make every following enqueue fail.
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::Release);
    }

    pub fn set_position_frames(&self, frames: i64) {
        self.position_frames.store(frames, Ordering::Release);
    }

    /// Bytes of the most recently completed buffer.
    pub fn last_buffer(&self) -> Vec<u8> {
        self.scratch.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn completed_count(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Completions that found the queue empty.
    pub fn starved_count(&self) -> u32 {
        self.starved.load(Ordering::Acquire)
    }

    fn buffer_nanos(&self) -> i64 {
        let frames = self.bytes_per_buffer as i64 / i64::from(self.bytes_per_frame);
        frames * NANOS_PER_SECOND / i64::from(self.sample_rate)
    }
}

impl BufferQueue for SimQueue {
    fn enqueue(&self, buffer: &[u8]) -> Result<(), EngineError> {
        if self.fail_enqueue.load(Ordering::Acquire) {
            return Err(EngineError::IoError);
        }
        if buffer.is_empty() || buffer.len() > self.bytes_per_buffer {
            return Err(EngineError::ParameterInvalid);
        }
        let mut ring = self.ring.lock();
        let depth = ring.buffers.len();
        if ring.lengths.len() >= depth {
            return Err(EngineError::BufferInsufficient);
        }
        let index = (ring.head + ring.lengths.len()) % depth;
        let slot = &mut ring.buffers[index];
        slot.clear();
        if self.direction == Direction::Output {
            slot.extend_from_slice(buffer);
        }
        ring.lengths
            .push_back(buffer.len())
            .map_err(|_| EngineError::BufferInsufficient)
    }

    fn state(&self) -> Result<QueueState, EngineError> {
        Ok(QueueState {
            count: self.ring.lock().lengths.len() as u32,
            index: self.completed.load(Ordering::Acquire),
        })
    }

    fn clear(&self) -> Result<(), EngineError> {
        let mut ring = self.ring.lock();
        ring.lengths.clear();
        ring.head = 0;
        Ok(())
    }

    fn register_callback(&self, handler: Box<dyn BufferQueueHandler>) -> Result<(), RegisterError> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(RegisterError {
                error: EngineError::PreconditionsViolated,
                handler,
            });
        }
        *slot = Some(handler);
        Ok(())
    }

    fn unregister_callback(&self) -> Option<Box<dyn BufferQueueHandler>> {
        self.handler.lock().take()
    }
}

struct SimStream {
    queue: Arc<SimQueue>,
    pacing: Pacing,
    fail_buffer_queue: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
    destroyed_count: Arc<AtomicUsize>,
}

impl SimStream {
    fn spawn_worker(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let queue = Arc::clone(&self.queue);
        let handle = std::thread::Builder::new()
            .name("bq-sim-engine".into())
            .spawn(move || run_realtime(queue))
            .map_err(|err| {
                warn!(%err, "failed to spawn simulated engine thread");
                EngineError::ResourceError
            })?;
        *worker = Some(handle);
        Ok(())
    }
}

fn run_realtime(queue: Arc<SimQueue>) {
    let period = Duration::from_nanos(queue.buffer_nanos().max(1) as u64);
    while !queue.is_destroyed() {
        if queue.is_running() {
            queue.complete_one();
            std::thread::sleep(period);
        } else {
            std::thread::park_timeout(Duration::from_millis(5));
        }
    }
}

impl StreamObject for SimStream {
    fn buffer_queue(&self) -> Result<Arc<dyn BufferQueue>, EngineError> {
        if self.fail_buffer_queue {
            return Err(EngineError::FeatureUnsupported);
        }
        let queue: Arc<dyn BufferQueue> = self.queue.clone();
        Ok(queue)
    }

    fn set_running(&self, running: bool) -> Result<(), EngineError> {
        if self.queue.is_destroyed() {
            return Err(EngineError::PreconditionsViolated);
        }
        if running && self.pacing == Pacing::Realtime {
            self.spawn_worker()?;
        }
        self.queue.running.store(running, Ordering::Release);
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.thread().unpark();
        }
        Ok(())
    }

    fn position_millis(&self) -> Result<u32, EngineError> {
        let frames = self.queue.position_frames.load(Ordering::Acquire);
        Ok((frames * 1000 / i64::from(self.queue.sample_rate)) as u32)
    }

    fn destroy(self: Box<Self>) {
        self.queue.running.store(false, Ordering::Release);
        self.queue.destroyed.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
        // A manual pump racing with destroy finishes its callback before this returns.
        drop(self.queue.handler.lock().take());
        self.destroyed_count.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bq_core::AudioFormat;

    fn spec(direction: Direction) -> StreamSpec {
        StreamSpec {
            direction,
            sample_rate: 48_000,
            channel_count: 2,
            format: AudioFormat::I16,
            bytes_per_buffer: 16,
            queue_length: 2,
        }
    }

    fn realized() -> SimEngine {
        let engine = SimEngine::manual();
        engine.realize().unwrap();
        engine
    }

    struct Counting(Arc<AtomicUsize>);

    impl BufferQueueHandler for Counting {
        fn prime(&mut self, _queue: &dyn BufferQueue) -> Result<(), EngineError> {
            Ok(())
        }

        fn on_buffer_complete(&mut self, _queue: &dyn BufferQueue, _captured: &[u8]) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn create_requires_realize() {
        let engine = SimEngine::manual();
        assert_eq!(
            engine.create_stream(&spec(Direction::Output)).err(),
            Some(EngineError::PreconditionsViolated)
        );
    }

    #[test]
    fn rejects_bad_spec() {
        let engine = realized();
        let mut bad = spec(Direction::Output);
        bad.queue_length = MAX_QUEUE_DEPTH as i32 + 1;
        assert_eq!(engine.create_stream(&bad).err(), Some(EngineError::ParameterInvalid));
        let mut bad = spec(Direction::Output);
        bad.format = AudioFormat::Unspecified;
        assert_eq!(engine.create_stream(&bad).err(), Some(EngineError::ParameterInvalid));
    }

    #[test]
    fn queue_is_bounded() {
        let engine = realized();
        let stream = engine.create_stream(&spec(Direction::Output)).unwrap();
        let queue = stream.buffer_queue().unwrap();
        queue.enqueue(&[1; 16]).unwrap();
        queue.enqueue(&[2; 16]).unwrap();
        assert_eq!(queue.enqueue(&[3; 16]), Err(EngineError::BufferInsufficient));
        assert_eq!(queue.state().unwrap().count, 2);
        assert_eq!(queue.enqueue(&[0; 17]), Err(EngineError::ParameterInvalid));
        queue.clear().unwrap();
        assert_eq!(queue.state().unwrap().count, 0);
    }

    #[test]
    fn completes_in_order_when_running() {
        let engine = realized();
        let stream = engine.create_stream(&spec(Direction::Output)).unwrap();
        let queue = stream.buffer_queue().unwrap();
        queue.enqueue(&[1; 16]).unwrap();
        queue.enqueue(&[2; 16]).unwrap();

        assert_eq!(engine.pump(1), 0, "not running yet");
        stream.set_running(true).unwrap();

        let sim = engine.last_queue().unwrap();
        assert!(sim.complete_one());
        assert_eq!(sim.last_buffer(), vec![1; 16]);
        assert!(sim.complete_one());
        assert_eq!(sim.last_buffer(), vec![2; 16]);
        assert!(!sim.complete_one());
        assert_eq!(sim.starved_count(), 1);
        // 32 bytes at 4 bytes per frame = 8 frames, well under one millisecond.
        assert_eq!(stream.position_millis().unwrap(), 0);
        sim.set_position_frames(48_000);
        assert_eq!(stream.position_millis().unwrap(), 1000);
    }

    #[test]
    fn handler_runs_per_completion() {
        let engine = realized();
        let stream = engine.create_stream(&spec(Direction::Input)).unwrap();
        let queue = stream.buffer_queue().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        queue.register_callback(Box::new(Counting(count.clone()))).unwrap();
        let rejected = queue
            .register_callback(Box::new(Counting(count.clone())))
            .unwrap_err();
        assert_eq!(rejected.error, EngineError::PreconditionsViolated);

        queue.enqueue(&[0; 16]).unwrap();
        stream.set_running(true).unwrap();
        assert_eq!(engine.pump(4), 1);
        assert_eq!(count.load(Ordering::Acquire), 1);
        assert!(queue.unregister_callback().is_some());
        assert!(queue.unregister_callback().is_none());
    }

    #[test]
    fn destroy_drops_handler_and_stops_pumping() {
        let engine = realized();
        let stream = engine.create_stream(&spec(Direction::Output)).unwrap();
        let queue = stream.buffer_queue().unwrap();
        queue.register_callback(Box::new(Counting(Arc::default()))).unwrap();
        let sim = engine.last_queue().unwrap();

        stream.destroy();
        assert!(sim.is_destroyed());
        assert!(!sim.has_handler());
        assert_eq!(engine.destroyed_count(), 1);
        assert!(engine.queues().is_empty());
    }

    #[test]
    fn buffer_queue_fault() {
        let engine = realized();
        engine.set_fail_buffer_queue(true);
        let stream = engine.create_stream(&spec(Direction::Output)).unwrap();
        assert_eq!(stream.buffer_queue().err(), Some(EngineError::FeatureUnsupported));
    }

    #[test]
    fn realtime_pacing_drains_queue() {
        let engine = SimEngine::realtime();
        engine.realize().unwrap();
        let mut s = spec(Direction::Output);
        s.sample_rate = 8_000;
        let stream = engine.create_stream(&s).unwrap();
        let queue = stream.buffer_queue().unwrap();
        queue.enqueue(&[5; 16]).unwrap();
        stream.set_running(true).unwrap();

        let sim = engine.last_queue().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sim.completed_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sim.completed_count(), 1);
        stream.destroy();
    }
}
