//! End-to-end stream tests against the simulated engine.
//!
//! Manual pacing drives exact buffer counts; realtime pacing runs the
//! bridge on its own thread the way a device would.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bq_engine::sim::SimEngine;
use bq_engine::SharedEngine;
use bq_stream::{AudioStream, DataCallbackResult, Direction, StreamBuilder, StreamError, StreamState};

const MILLIS: i64 = 1_000_000;

fn manual() -> (Arc<SimEngine>, Arc<SharedEngine>) {
    let sim = Arc::new(SimEngine::manual());
    let shared = SharedEngine::new(sim.clone());
    (sim, shared)
}

fn continue_stream(shared: &Arc<SharedEngine>) -> AudioStream {
    StreamBuilder::new(shared.clone())
        .sample_rate(44_100)
        .frames_per_callback(128)
        .data_callback(|audio: &mut [u8], _: i32| {
            audio.fill(1);
            DataCallbackResult::Continue
        })
        .open_stream()
        .unwrap()
}

#[test]
fn streams_share_one_engine() {
    let (sim, shared) = manual();
    let a = continue_stream(&shared);
    let b = continue_stream(&shared);
    assert_eq!(sim.realize_count(), 1);
    assert_eq!(shared.open_count(), 2);

    a.close().unwrap();
    assert_eq!(sim.shutdown_count(), 0);
    b.close().unwrap();
    assert_eq!(sim.shutdown_count(), 1);
    assert_eq!(sim.destroyed_count(), 2);
}

#[test]
fn counters_and_position_follow_the_engine() {
    let (sim, shared) = manual();
    let stream = continue_stream(&shared);
    stream.start().unwrap();
    assert_eq!(sim.pump(99), 99);
    assert_eq!(stream.frames_written(), 100 * 128);

    sim.last_queue().unwrap().set_position_frames(44_100);
    assert_eq!(stream.frames_processed_by_server(), 44_100);

    stream.stop().unwrap();
    // Nothing moves while stopped.
    assert_eq!(sim.pump(5), 0);
    assert_eq!(stream.frames_written(), 100 * 128);
}

#[test]
fn close_twice_and_queries_after_close() {
    let (sim, shared) = manual();
    let stream = continue_stream(&shared);
    stream.start().unwrap();
    stream.close().unwrap();
    assert_eq!(stream.close(), Err(StreamError::Closed));
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(stream.buffer_depth(), -1);
    assert_eq!(stream.sample_rate(), 44_100);
    assert_eq!(sim.destroyed_count(), 1);
}

#[test]
fn wait_returns_within_one_poll_slice_of_the_change() {
    let (_sim, shared) = manual();
    let stream = Arc::new(continue_stream(&shared));
    let starter = stream.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        starter.start().unwrap();
    });

    let begin = Instant::now();
    let (result, state) = stream.wait_for_state_change(StreamState::Open, 2_000 * MILLIS);
    let elapsed = begin.elapsed();
    handle.join().unwrap();

    assert_eq!(result, Ok(()));
    assert!(matches!(state, StreamState::Starting | StreamState::Started));
    assert!(elapsed >= Duration::from_millis(30));
    assert!(elapsed < Duration::from_millis(30 + 20 + 200));
}

#[test]
fn stop_from_callback_under_realtime_pacing() {
    let sim = Arc::new(SimEngine::realtime());
    let shared = SharedEngine::new(sim.clone());
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let stream = StreamBuilder::new(shared)
        .sample_rate(48_000)
        .frames_per_callback(96)
        .data_callback(move |_: &mut [u8], _: i32| {
            if seen.fetch_add(1, Ordering::AcqRel) < 10 {
                DataCallbackResult::Continue
            } else {
                DataCallbackResult::Stop
            }
        })
        .open_stream()
        .unwrap();

    stream.start().unwrap();
    let mut state = stream.state();
    let deadline = Instant::now() + Duration::from_secs(3);
    while state != StreamState::Stopped && Instant::now() < deadline {
        state = stream.wait_for_state_change(state, 100 * MILLIS).1;
    }
    assert_eq!(state, StreamState::Stopped);
    assert_eq!(stream.frames_written(), 10 * 96);
    assert_eq!(calls.load(Ordering::Acquire), 11);
    stream.close().unwrap();
}

#[test]
fn failed_open_leaves_nothing_behind() {
    let (sim, shared) = manual();
    sim.set_fail_buffer_queue(true);
    let err = StreamBuilder::new(shared.clone())
        .data_callback(|_: &mut [u8], _: i32| DataCallbackResult::Continue)
        .open_stream()
        .unwrap_err();
    assert_eq!(err, StreamError::Internal);
    assert_eq!(shared.open_count(), 0);
    assert_eq!(sim.destroyed_count(), 1);
    assert!(sim.queues().is_empty());
}

#[test]
fn disconnect_is_sticky_until_close() {
    let (sim, shared) = manual();
    let stream = continue_stream(&shared);
    stream.start().unwrap();
    sim.last_queue().unwrap().signal_device_lost();
    let (result, state) = stream.wait_for_state_change(StreamState::Started, 0);
    assert_eq!(result, Ok(()));
    assert_eq!(state, StreamState::Disconnected);
    assert_eq!(stream.start(), Err(StreamError::Disconnected));
    stream.close().unwrap();
    assert_eq!(shared.open_count(), 0);
}

#[test]
fn fifo_input_reads_captured_frames() {
    let (sim, shared) = manual();
    let stream = StreamBuilder::new(shared)
        .direction(Direction::Input)
        .sample_rate(16_000)
        .channel_count(1)
        .frames_per_callback(4)
        .open_stream()
        .unwrap();
    assert!(stream.uses_fifo());

    stream.start().unwrap();
    assert_eq!(sim.pump(1), 1);
    let mut data = [0u8; 8];
    assert_eq!(stream.read(&mut data, 0), Ok(4));
    assert_eq!(data, [0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(stream.frames_read(), 4);

    // Nothing new captured: a bounded read times out.
    assert_eq!(stream.read(&mut data, 25 * MILLIS), Err(StreamError::Timeout));
    assert_eq!(stream.write(&data, 0), Err(StreamError::Unimplemented));
}

#[test]
fn fifo_output_underrun_counts_xruns() {
    let (sim, shared) = manual();
    let stream = StreamBuilder::new(shared)
        .sample_rate(16_000)
        .channel_count(1)
        .frames_per_callback(4)
        .open_stream()
        .unwrap();
    stream.start().unwrap();
    sim.pump(3);
    assert_eq!(sim.last_queue().unwrap().last_buffer(), vec![0; 8]);
    assert!(stream.xrun_count() >= 3);
}
