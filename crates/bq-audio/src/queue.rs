//! Buffer queue over a byte ring drained by the cpal data callback.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use bq_core::AudioFormat;
use bq_engine::{BufferQueue, BufferQueueHandler, EngineError, QueueState, RegisterError};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::warn;

/// Queued buffers waiting for the device, plus the handler that refills them.
pub(crate) struct CpalQueue {
    format: AudioFormat,
    bytes_per_frame: usize,
    bytes_per_buffer: usize,
    depth: u32,
    producer: Mutex<HeapProd<u8>>,
    consumer: Mutex<HeapCons<u8>>,
    handler: Mutex<Option<Box<dyn BufferQueueHandler>>>,
    /// Buffers enqueued and not yet fully played.
    queued: AtomicU32,
    completed: AtomicU32,
    running: AtomicBool,
    played_frames: AtomicI64,
}

/// Render-side bookkeeping owned by the data callback.
#[derive(Debug, Default)]
pub(crate) struct RenderCursor {
    /// Bytes of the current buffer already played.
    consumed: usize,
    /// Played bytes short of a whole frame.
    played_bytes: usize,
}

impl CpalQueue {
    pub(crate) fn new(format: AudioFormat, bytes_per_frame: usize, bytes_per_buffer: usize, depth: u32) -> Self {
        let (producer, consumer) = HeapRb::<u8>::new(bytes_per_buffer * depth as usize).split();
        Self {
            format,
            bytes_per_frame,
            bytes_per_buffer,
            depth,
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            handler: Mutex::new(None),
            queued: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            running: AtomicBool::new(false),
            played_frames: AtomicI64::new(0),
        }
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn played_frames(&self) -> i64 {
        self.played_frames.load(Ordering::Acquire)
    }

    /// Fill `out` from the queue, reporting each buffer as soon as it has
    /// been played so the handler's refill lands in the same period.
    ///
    /// Runs on the device thread. Plays silence while stopped, while the
    /// client holds the ring for a clear, and after an underrun.
    pub(crate) fn render<T: Copy>(
        &self,
        out: &mut [T],
        cursor: &mut RenderCursor,
        silence: T,
        convert: fn(f32) -> T,
    ) {
        let sample_bytes = self.format.bytes_per_sample() as usize;
        if !self.running.load(Ordering::Acquire) || sample_bytes == 0 {
            out.fill(silence);
            return;
        }

        let mut filled = 0usize;
        while filled < out.len() {
            let Some(mut consumer) = self.consumer.try_lock() else {
                break;
            };
            let mut played = 0usize;
            while filled < out.len() && cursor.consumed < self.bytes_per_buffer {
                let Some(sample) = read_sample(&mut *consumer, self.format, sample_bytes) else {
                    break;
                };
                out[filled] = convert(sample);
                filled += 1;
                played += sample_bytes;
                cursor.consumed += sample_bytes;
            }
            // The handler enqueues into this ring; it must not find it locked.
            drop(consumer);

            cursor.played_bytes += played;
            let frames = cursor.played_bytes / self.bytes_per_frame;
            cursor.played_bytes %= self.bytes_per_frame;
            self.played_frames.fetch_add(frames as i64, Ordering::AcqRel);

            if cursor.consumed < self.bytes_per_buffer {
                break;
            }
            cursor.consumed -= self.bytes_per_buffer;
            self.complete_one();
        }
        out[filled..].fill(silence);
    }

    fn complete_one(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.completed.fetch_add(1, Ordering::AcqRel);
        // Skip the handler if the client is swapping it out; the stream is stopping.
        if let Some(mut handler) = self.handler.try_lock() {
            if let Some(handler) = handler.as_mut() {
                handler.on_buffer_complete(self, &[]);
            }
        }
    }

    /// The device went away. Called from the cpal error callback.
    pub(crate) fn device_lost(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handler) = self.handler.lock().as_mut() {
            handler.on_device_lost();
        }
    }

    /// Drop the handler after the device stream is gone.
    pub(crate) fn release_handler(&self) {
        drop(self.handler.lock().take());
    }
}

fn read_sample(consumer: &mut HeapCons<u8>, format: AudioFormat, sample_bytes: usize) -> Option<f32> {
    if sample_bytes == 0 || consumer.occupied_len() < sample_bytes {
        return None;
    }
    let mut bytes = [0u8; 4];
    consumer.pop_slice(&mut bytes[..sample_bytes]);
    match format {
        AudioFormat::I16 => Some(f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32768.0),
        AudioFormat::F32 => Some(f32::from_le_bytes(bytes)),
        AudioFormat::Unspecified => None,
    }
}

pub(crate) fn f32_to_i16(v: f32) -> i16 {
    let v = v.clamp(-1.0, 1.0);
    (v * i16::MAX as f32) as i16
}

impl BufferQueue for CpalQueue {
    fn enqueue(&self, buffer: &[u8]) -> Result<(), EngineError> {
        if buffer.is_empty() || buffer.len() > self.bytes_per_buffer {
            return Err(EngineError::ParameterInvalid);
        }
        if self.queued.load(Ordering::Acquire) >= self.depth {
            return Err(EngineError::BufferInsufficient);
        }
        let mut producer = self.producer.lock();
        if producer.vacant_len() < self.bytes_per_buffer {
            return Err(EngineError::BufferInsufficient);
        }
        producer.push_slice(buffer);
        // Short buffers are padded so completions stay aligned to whole buffers.
        for _ in buffer.len()..self.bytes_per_buffer {
            let _ = producer.try_push(0);
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn state(&self) -> Result<QueueState, EngineError> {
        Ok(QueueState {
            count: self.queued.load(Ordering::Acquire),
            index: self.completed.load(Ordering::Acquire),
        })
    }

    fn clear(&self) -> Result<(), EngineError> {
        let mut consumer = self.consumer.lock();
        let dropped = consumer.occupied_len();
        consumer.skip(dropped);
        self.queued.store(0, Ordering::Release);
        Ok(())
    }

    fn register_callback(&self, handler: Box<dyn BufferQueueHandler>) -> Result<(), RegisterError> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            warn!("buffer queue already has a handler");
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Refill {
        completions: Arc<AtomicU32>,
        buffer: Vec<u8>,
    }

    impl BufferQueueHandler for Refill {
        fn prime(&mut self, queue: &dyn BufferQueue) -> Result<(), EngineError> {
            queue.enqueue(&self.buffer)
        }

        fn on_buffer_complete(&mut self, queue: &dyn BufferQueue, _captured: &[u8]) {
            self.completions.fetch_add(1, Ordering::AcqRel);
            let _ = queue.enqueue(&self.buffer);
        }
    }

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn stopped_queue_plays_silence() {
        let queue = CpalQueue::new(AudioFormat::I16, 4, 16, 2);
        queue.enqueue(&i16_bytes(&[1000; 8])).unwrap();
        let mut out = [1.0f32; 8];
        queue.render(&mut out, &mut RenderCursor::default(), 0.0, |v| v);
        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(queue.state().unwrap().count, 1);
    }

    #[test]
    fn render_converts_and_completes_buffers() {
        let queue = CpalQueue::new(AudioFormat::I16, 4, 8, 2);
        let completions = Arc::new(AtomicU32::new(0));
        let mut handler = Refill {
            completions: completions.clone(),
            buffer: i16_bytes(&[16384, -16384, 16384, -16384]),
        };
        handler.prime(&queue).unwrap();
        queue.register_callback(Box::new(handler)).unwrap();
        queue.set_running(true);

        let mut cursor = RenderCursor::default();
        let mut out = [0i16; 8];
        queue.render(&mut out, &mut cursor, 0, f32_to_i16);
        assert_eq!(out[0], f32_to_i16(0.5));
        assert_eq!(out[1], f32_to_i16(-0.5));
        // The refill queued by the first completion plays in the same period.
        assert_eq!(out[4], f32_to_i16(0.5));
        assert_eq!(out[7], f32_to_i16(-0.5));
        assert_eq!(completions.load(Ordering::Acquire), 2);
        assert_eq!(queue.played_frames(), 4);
        assert_eq!(queue.state().unwrap().count, 1);
    }

    #[test]
    fn device_period_longer_than_a_buffer_has_no_gaps() {
        // 192 stereo i16 frames per buffer, 512 frames per device period.
        let queue = CpalQueue::new(AudioFormat::I16, 4, 192 * 4, 2);
        let completions = Arc::new(AtomicU32::new(0));
        let mut handler = Refill {
            completions: completions.clone(),
            buffer: i16_bytes(&[8192; 384]),
        };
        handler.prime(&queue).unwrap();
        queue.register_callback(Box::new(handler)).unwrap();
        queue.set_running(true);

        let mut cursor = RenderCursor::default();
        for period in 1..=3 {
            let mut out = [0i16; 512 * 2];
            queue.render(&mut out, &mut cursor, 0, f32_to_i16);
            assert!(out.iter().all(|&v| v != 0), "silence in period {}", period);
            assert_eq!(queue.played_frames(), 512 * period);
        }
        assert_eq!(completions.load(Ordering::Acquire), 8);
    }

    #[test]
    fn underrun_pads_with_silence() {
        let queue = CpalQueue::new(AudioFormat::F32, 4, 8, 2);
        queue.enqueue(&0.25f32.to_le_bytes()).unwrap();
        queue.set_running(true);
        let mut out = [9.0f32; 6];
        queue.render(&mut out, &mut RenderCursor::default(), 0.0, |v| v);
        assert_eq!(out[0], 0.25);
        assert!(out[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn enqueue_respects_depth_and_clear_empties() {
        let queue = CpalQueue::new(AudioFormat::I16, 4, 8, 2);
        queue.enqueue(&[0; 8]).unwrap();
        queue.enqueue(&[0; 8]).unwrap();
        assert_eq!(queue.enqueue(&[0; 8]), Err(EngineError::BufferInsufficient));
        assert_eq!(queue.enqueue(&[]), Err(EngineError::ParameterInvalid));
        queue.clear().unwrap();
        assert_eq!(queue.state().unwrap().count, 0);
        queue.enqueue(&[0; 8]).unwrap();
    }

    #[test]
    fn second_handler_is_handed_back() {
        let queue = CpalQueue::new(AudioFormat::I16, 4, 8, 2);
        let make = || Refill {
            completions: Arc::new(AtomicU32::new(0)),
            buffer: vec![0; 8],
        };
        queue.register_callback(Box::new(make())).unwrap();
        let rejected = queue.register_callback(Box::new(make())).unwrap_err();
        assert_eq!(rejected.error, EngineError::PreconditionsViolated);
        assert!(queue.unregister_callback().is_some());
    }
}
