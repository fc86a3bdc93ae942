//! CPAL-based buffer-queue engine.
//!
//! cpal streams are not `Send`, so each stream object owns a device thread
//! that builds the cpal stream, keeps it alive, and plays or pauses it on
//! command. The cpal data callback drains the stream's [`CpalQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bq_core::{AudioFormat, Direction};
use bq_engine::{AudioEngine, BufferQueue, EngineError, StreamObject, StreamSpec};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info, warn};

use crate::error::DeviceError;
use crate::queue::{f32_to_i16, CpalQueue, RenderCursor};

/// Maximum time cpal may block waiting for the device on a callback.
const CALLBACK_TIMEOUT: Duration = Duration::from_millis(200);

/// Engine backed by the host's default output device.
#[derive(Debug, Default)]
pub struct CpalEngine {
    realized: AtomicBool,
}

impl CpalEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioEngine for CpalEngine {
    fn realize(&self) -> Result<(), EngineError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            let err = DeviceError::NoDevice;
            error!(%err, host = ?host.id(), "cannot realize audio engine");
            EngineError::from(&err)
        })?;
        let name = device.name().unwrap_or_else(|_| "<unknown>".into());
        info!(host = ?host.id(), device = %name, "using default output device");
        self.realized.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        self.realized.store(false, Ordering::Release);
    }

    fn create_stream(&self, spec: &StreamSpec) -> Result<Box<dyn StreamObject>, EngineError> {
        if !self.realized.load(Ordering::Acquire) {
            return Err(EngineError::PreconditionsViolated);
        }
        if spec.direction == Direction::Input {
            warn!("recording is not supported by the cpal engine");
            return Err(EngineError::FeatureUnsupported);
        }
        if spec.format == AudioFormat::Unspecified {
            return Err(EngineError::ContentUnsupported);
        }
        let bytes_per_frame = usize::try_from(spec.bytes_per_frame()).unwrap_or(0);
        let bytes_per_buffer = usize::try_from(spec.bytes_per_buffer).unwrap_or(0);
        let depth = u32::try_from(spec.queue_length).unwrap_or(0);
        let channels = u16::try_from(spec.channel_count).unwrap_or(0);
        let sample_rate = u32::try_from(spec.sample_rate).unwrap_or(0);
        if bytes_per_frame == 0 || bytes_per_buffer == 0 || depth == 0 || channels == 0 || sample_rate == 0 {
            return Err(EngineError::ParameterInvalid);
        }

        let queue = Arc::new(CpalQueue::new(spec.format, bytes_per_frame, bytes_per_buffer, depth));
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let device_queue = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name("bq-cpal-device".into())
            .spawn(move || run_device(device_queue, config, ready_tx, command_rx))
            .map_err(|err| {
                error!(%err, "failed to spawn device thread");
                EngineError::ResourceError
            })?;

        let ready = ready_rx.recv().unwrap_or(Err(DeviceError::ThreadGone));
        if let Err(err) = ready {
            error!(%err, ?spec, "failed to open output stream");
            let _ = thread.join();
            return Err(EngineError::from(&err));
        }
        debug!(?spec, "created cpal stream");

        Ok(Box::new(CpalStream {
            queue,
            sample_rate: spec.sample_rate,
            commands,
            thread: Some(thread),
        }))
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

enum Command {
    SetRunning(bool, SyncSender<Result<(), DeviceError>>),
    Shutdown,
}

/// Device thread: owns the cpal stream for its whole life.
fn run_device(
    queue: Arc<CpalQueue>,
    config: cpal::StreamConfig,
    ready: SyncSender<Result<(), DeviceError>>,
    commands: Receiver<Command>,
) {
    let stream = match build_stream(&queue, &config) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            Command::SetRunning(running, reply) => {
                queue.set_running(running);
                let result = if running {
                    stream.play().map_err(DeviceError::from)
                } else {
                    stream.pause().map_err(DeviceError::from)
                };
                let _ = reply.send(result);
            }
            Command::Shutdown => break,
        }
    }
    queue.set_running(false);
    drop(stream);
}

fn build_stream(queue: &Arc<CpalQueue>, config: &cpal::StreamConfig) -> Result<cpal::Stream, DeviceError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(DeviceError::NoDevice)?;
    let sample_format = device.default_output_config()?.sample_format();

    let error_queue = Arc::clone(queue);
    let on_error = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            warn!("output device is no longer available");
            error_queue.device_lost();
        }
        other => warn!(err = %other, "audio stream error"),
    };

    let data_queue = Arc::clone(queue);
    let mut cursor = RenderCursor::default();
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                data_queue.render(data, &mut cursor, 0.0, |v| v)
            },
            on_error,
            Some(CALLBACK_TIMEOUT),
        )?,
        cpal::SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                data_queue.render(data, &mut cursor, 0, f32_to_i16)
            },
            on_error,
            Some(CALLBACK_TIMEOUT),
        )?,
        other => return Err(DeviceError::SampleFormat(other)),
    };
    Ok(stream)
}

/// Stream object whose cpal stream lives on a device thread.
struct CpalStream {
    queue: Arc<CpalQueue>,
    sample_rate: i32,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl StreamObject for CpalStream {
    fn buffer_queue(&self) -> Result<Arc<dyn BufferQueue>, EngineError> {
        let queue: Arc<dyn BufferQueue> = self.queue.clone();
        Ok(queue)
    }

    fn set_running(&self, running: bool) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.commands
            .send(Command::SetRunning(running, reply_tx))
            .map_err(|_| EngineError::from(&DeviceError::ThreadGone))?;
        match reply_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(%err, running, "device refused state change");
                Err(EngineError::from(&err))
            }
            Err(_) => Err(EngineError::from(&DeviceError::ThreadGone)),
        }
    }

    fn position_millis(&self) -> Result<u32, EngineError> {
        let millis = self.queue.played_frames() * 1000 / i64::from(self.sample_rate);
        Ok(millis as u32)
    }

    fn destroy(mut self: Box<Self>) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("device thread panicked");
            }
        }
        // The cpal stream is gone; no callback can reach the handler now.
        self.queue.release_handler();
    }
}
