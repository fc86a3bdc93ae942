//! Stream configuration and the open path.

use std::sync::Arc;

use bq_core::{
    configure_buffer_sizes, high_latency_buffer_frames, AudioFormat, BufferGeometry,
    DefaultStreamValues, Direction, Result, SharingMode, SizingRequest,
    StreamError, BUFFER_QUEUE_LENGTH, UNSPECIFIED,
};
use bq_engine::{SharedEngine, StreamSpec};
use tracing::{error, info, warn};

use crate::bridge::{CallbackBridge, CallbackShared};
use crate::buffered::BufferedIo;
use crate::callback::DataCallback;
use crate::stream::{AudioStream, EngineResources, StreamAttributes, StreamCore};

/// Bursts a FIFO holds at minimum, on top of the high-latency floor.
const FIFO_MIN_BURSTS: i32 = 4;

/// Builds an [`AudioStream`] on a shared engine.
///
/// Integer attributes left at 0 are resolved when the stream opens. A
/// builder without a data callback opens a stream that moves audio through
/// [`AudioStream::write`] or [`AudioStream::read`] instead.
pub struct StreamBuilder {
    engine: Arc<SharedEngine>,
    direction: Direction,
    sample_rate: i32,
    channel_count: i32,
    format: AudioFormat,
    frames_per_callback: i32,
    device_id: i32,
    sharing_mode: SharingMode,
    session_id: i32,
    defaults: DefaultStreamValues,
    callback: Option<Box<dyn DataCallback>>,
}

impl StreamBuilder {
    pub fn new(engine: Arc<SharedEngine>) -> Self {
        Self {
            engine,
            direction: Direction::Output,
            sample_rate: UNSPECIFIED,
            channel_count: UNSPECIFIED,
            format: AudioFormat::Unspecified,
            frames_per_callback: UNSPECIFIED,
            device_id: UNSPECIFIED,
            sharing_mode: SharingMode::Shared,
            session_id: UNSPECIFIED,
            defaults: DefaultStreamValues::default(),
            callback: None,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn sample_rate(mut self, sample_rate: i32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn channel_count(mut self, channel_count: i32) -> Self {
        self.channel_count = channel_count;
        self
    }

    pub fn format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    /// Frames per callback. 0 lets the engine pick its burst size.
    pub fn frames_per_callback(mut self, frames: i32) -> Self {
        self.frames_per_callback = frames;
        self
    }

    /// Not honoured by buffer-queue engines; logged when set.
    pub fn device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Not honoured by buffer-queue engines; logged when set.
    pub fn sharing_mode(mut self, mode: SharingMode) -> Self {
        self.sharing_mode = mode;
        self
    }

    /// Not honoured by buffer-queue engines; logged when set.
    pub fn session_id(mut self, session_id: i32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Values substituted for unspecified attributes.
    pub fn defaults(mut self, defaults: DefaultStreamValues) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn data_callback(mut self, callback: impl DataCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Open the stream. On failure nothing stays allocated and the engine
    /// reference taken for the stream is released.
    pub fn open_stream(self) -> Result<AudioStream> {
        if self.sample_rate < 0 || self.channel_count < 0 || self.frames_per_callback < 0 {
            error!(
                sample_rate = self.sample_rate,
                channel_count = self.channel_count,
                frames_per_callback = self.frames_per_callback,
                "negative stream attribute"
            );
            return Err(StreamError::InvalidArgument);
        }
        self.log_unsupported_attributes();

        let lease = self.engine.acquire().map_err(|err| {
            error!(result = err.as_str(), "could not acquire audio engine");
            StreamError::Internal
        })?;
        let engine = Arc::clone(lease.engine());

        let sample_rate = resolve(self.sample_rate, self.defaults.sample_rate);
        let channel_count = resolve(self.channel_count, self.defaults.channel_count);
        let format = match self.format {
            AudioFormat::Unspecified => AudioFormat::I16,
            format => format,
        };
        let bytes_per_frame = channel_count
            .checked_mul(format.bytes_per_sample())
            .filter(|bytes| *bytes > 0)
            .ok_or(StreamError::InvalidFormat)?;

        let default_frames_per_burst = engine
            .default_frames_per_burst()
            .filter(|frames| *frames > 0)
            .unwrap_or(self.defaults.frames_per_burst);
        let using_fifo = self.callback.is_none();
        let mut geometry = configure_buffer_sizes(SizingRequest {
            frames_per_callback: self.frames_per_callback,
            bytes_per_frame,
            default_frames_per_burst,
            using_fifo,
        })?;

        let (buffered, callback) = match self.callback {
            Some(callback) => (None, callback),
            None => {
                let capacity = fifo_capacity_in_frames(&geometry, sample_rate)?;
                geometry.buffer_capacity_in_frames = capacity;
                geometry.buffer_size_in_frames = capacity;
                let (io, drain) = BufferedIo::open(self.direction, capacity, bytes_per_frame)?;
                (Some(io), drain)
            }
        };

        let shared = Arc::new(CallbackShared::new());
        let bridge = CallbackBridge::new(self.direction, &geometry, callback, Arc::clone(&shared));

        let spec = StreamSpec {
            direction: self.direction,
            sample_rate,
            channel_count,
            format,
            bytes_per_buffer: geometry.bytes_per_callback,
            queue_length: BUFFER_QUEUE_LENGTH,
        };
        let object = engine.create_stream(&spec).map_err(|err| {
            error!(result = err.as_str(), ?spec, "failed to create engine stream");
            StreamError::Internal
        })?;
        let queue = match object.buffer_queue() {
            Ok(queue) => queue,
            Err(err) => {
                error!(result = err.as_str(), "failed to get buffer queue interface");
                object.destroy();
                return Err(StreamError::Internal);
            }
        };

        info!(
            engine = engine.name(),
            direction = ?self.direction,
            sample_rate,
            channel_count,
            ?format,
            frames_per_burst = geometry.frames_per_burst,
            buffer_capacity_in_frames = geometry.buffer_capacity_in_frames,
            fifo = using_fifo,
            "stream opened"
        );

        let attributes = StreamAttributes {
            direction: self.direction,
            sample_rate,
            channel_count,
            format,
            bytes_per_frame,
            geometry,
        };
        let resources = EngineResources {
            lease: Some(lease),
            object: Some(object),
            queue: Some(queue),
            handler: Some(Box::new(bridge)),
        };
        AudioStream::launch(StreamCore::new(attributes, shared, buffered, resources))
    }

    fn log_unsupported_attributes(&self) {
        if self.device_id != UNSPECIFIED {
            warn!(device_id = self.device_id, "device selection is not supported, using the default device");
        }
        if self.sharing_mode != SharingMode::Shared {
            warn!(mode = ?self.sharing_mode, "only shared mode is supported");
        }
        if self.session_id != UNSPECIFIED {
            warn!(session_id = self.session_id, "session id is not supported, ignoring it");
        }
    }
}

fn resolve(requested: i32, default: i32) -> i32 {
    if requested == UNSPECIFIED {
        default
    } else {
        requested
    }
}

/// At least one high-latency buffer, and never fewer than a few bursts.
fn fifo_capacity_in_frames(geometry: &BufferGeometry, sample_rate: i32) -> Result<i32> {
    let bursts = geometry
        .frames_per_burst
        .checked_mul(FIFO_MIN_BURSTS)
        .ok_or(StreamError::OutOfRange)?;
    Ok(high_latency_buffer_frames(sample_rate).max(bursts))
}

impl std::fmt::Debug for StreamBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuilder")
            .field("engine", &self.engine)
            .field("direction", &self.direction)
            .field("sample_rate", &self.sample_rate)
            .field("channel_count", &self.channel_count)
            .field("format", &self.format)
            .field("frames_per_callback", &self.frames_per_callback)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
