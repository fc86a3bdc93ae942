//! Buffered I/O layer for streams opened without a data callback.
//!
//! A byte FIFO sits between the client and the callback bridge. The client
//! writes (output) or reads (input) whole frames with a timeout; the
//! bridge drains or fills the FIFO one callback buffer at a time. The FIFO
//! is single-producer single-consumer, so the engine side never locks.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bq_core::{sleep_for_nanos, DataCallbackResult, Direction, Result, StreamError};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::callback::DataCallback;
use crate::stream::STATE_POLL_INTERVAL_NANOS;

#[derive(Debug)]
struct FifoShared {
    closed: AtomicBool,
    xruns: AtomicI32,
    bytes_per_frame: usize,
}

enum ClientEnd {
    Writer(HeapProd<u8>),
    Reader(HeapCons<u8>),
}

/// Client side of the FIFO.
pub(crate) struct BufferedIo {
    shared: Arc<FifoShared>,
    client: Mutex<ClientEnd>,
}

impl BufferedIo {
    /// Create the FIFO and the data callback that serves the bridge from it.
    pub(crate) fn open(
        direction: Direction,
        capacity_in_frames: i32,
        bytes_per_frame: i32,
    ) -> Result<(Self, Box<dyn DataCallback>)> {
        let capacity_bytes = capacity_in_frames
            .checked_mul(bytes_per_frame)
            .filter(|bytes| *bytes > 0)
            .ok_or(StreamError::OutOfRange)? as usize;

        let shared = Arc::new(FifoShared {
            closed: AtomicBool::new(false),
            xruns: AtomicI32::new(0),
            bytes_per_frame: bytes_per_frame as usize,
        });
        let (producer, consumer) = HeapRb::<u8>::new(capacity_bytes).split();

        let (client, engine): (ClientEnd, Box<dyn DataCallback>) = match direction {
            Direction::Output => (
                ClientEnd::Writer(producer),
                Box::new(FifoDrain {
                    shared: shared.clone(),
                    consumer,
                }),
            ),
            Direction::Input => (
                ClientEnd::Reader(consumer),
                Box::new(FifoFill {
                    shared: shared.clone(),
                    producer,
                }),
            ),
        };

        let io = Self {
            shared,
            client: Mutex::new(client),
        };
        Ok((io, engine))
    }

    pub(crate) fn xrun_count(&self) -> i32 {
        self.shared.xruns.load(Ordering::Acquire)
    }

    /// Stop accepting client I/O. Safe to call repeatedly and while the
    /// engine is still running a tail callback.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Write whole frames, waiting up to `timeout_nanos` for room.
    ///
    /// Returns the frames written. A positive timeout that expires before
    /// anything was written is `Timeout`; a partial write is not an error.
    pub(crate) fn write(&self, data: &[u8], timeout_nanos: i64) -> Result<i32> {
        let mut client = self.client.lock();
        let ClientEnd::Writer(producer) = &mut *client else {
            return Err(StreamError::Unimplemented);
        };
        let bpf = self.shared.bytes_per_frame;
        self.transfer(data.len(), timeout_nanos, |done| {
            let room = producer.vacant_len() / bpf * bpf;
            let end = (done + room).min(data.len());
            producer.push_slice(&data[done..end])
        })
    }

    /// Read whole frames, waiting up to `timeout_nanos` for data.
    pub(crate) fn read(&self, data: &mut [u8], timeout_nanos: i64) -> Result<i32> {
        let mut client = self.client.lock();
        let ClientEnd::Reader(consumer) = &mut *client else {
            return Err(StreamError::Unimplemented);
        };
        let bpf = self.shared.bytes_per_frame;
        let len = data.len();
        self.transfer(len, timeout_nanos, |done| {
            let available = consumer.occupied_len() / bpf * bpf;
            let end = (done + available).min(len);
            consumer.pop_slice(&mut data[done..end])
        })
    }

    fn transfer(
        &self,
        len: usize,
        timeout_nanos: i64,
        mut step: impl FnMut(usize) -> usize,
    ) -> Result<i32> {
        let bpf = self.shared.bytes_per_frame;
        if len % bpf != 0 {
            return Err(StreamError::InvalidArgument);
        }
        let mut done = 0;
        let mut time_left = timeout_nanos;
        loop {
            if self.is_closed() {
                return Err(StreamError::Closed);
            }
            done += step(done);
            if done == len || time_left <= 0 {
                break;
            }
            let sleep = STATE_POLL_INTERVAL_NANOS.min(time_left);
            sleep_for_nanos(sleep);
            time_left -= sleep;
        }

        if done == 0 && len > 0 && timeout_nanos > 0 {
            return Err(StreamError::Timeout);
        }
        Ok((done / bpf) as i32)
    }
}

/// Output: the bridge pulls client-written frames out of the FIFO.
struct FifoDrain {
    shared: Arc<FifoShared>,
    consumer: HeapCons<u8>,
}

impl DataCallback for FifoDrain {
    fn on_audio_ready(&mut self, audio: &mut [u8], _num_frames: i32) -> DataCallbackResult {
        let read = self.consumer.pop_slice(audio);
        if read < audio.len() {
            // Underrun: play silence for the part the client did not supply.
            audio[read..].fill(0);
            self.shared.xruns.fetch_add(1, Ordering::AcqRel);
        }
        DataCallbackResult::Continue
    }
}

/// Input: the bridge pushes captured frames into the FIFO.
struct FifoFill {
    shared: Arc<FifoShared>,
    producer: HeapProd<u8>,
}

impl DataCallback for FifoFill {
    fn on_audio_ready(&mut self, audio: &mut [u8], _num_frames: i32) -> DataCallbackResult {
        let written = self.producer.push_slice(audio);
        if written < audio.len() {
            // Overrun: the client is not reading fast enough, drop the rest.
            self.shared.xruns.fetch_add(1, Ordering::AcqRel);
        }
        DataCallbackResult::Continue
    }
}
