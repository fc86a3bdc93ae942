//! Plain stream attribute types.

/// Sentinel for an integer stream attribute the caller left open.
pub const UNSPECIFIED: i32 = 0;

pub const MILLIS_PER_SECOND: i64 = 1_000;
pub const NANOS_PER_MILLISECOND: i64 = 1_000_000;
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Data flow direction of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Frames flow from the client to the device.
    #[default]
    Output,
    /// Frames flow from the device to the client.
    Input,
}

/// Sample encoding of one channel of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    /// Resolve to the platform default (`I16`).
    #[default]
    Unspecified,
    I16,
    F32,
}

impl AudioFormat {
    /// Bytes per sample, or 0 if the format is unresolved.
    pub const fn bytes_per_sample(self) -> i32 {
        match self {
            AudioFormat::Unspecified => 0,
            AudioFormat::I16 => 2,
            AudioFormat::F32 => 4,
        }
    }
}

/// How the device is shared with other streams. Only `Shared` is honoured
/// by buffer-queue engines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SharingMode {
    Exclusive,
    #[default]
    Shared,
}

/// Return value of a client data callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataCallbackResult {
    /// Keep the stream running; the buffer is handed to the engine.
    Continue,
    /// Stop the stream after this buffer.
    Stop,
    /// The client hit an error; the stream is stopped.
    Error,
}

/// Values substituted for unspecified attributes when a stream opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultStreamValues {
    pub sample_rate: i32,
    pub channel_count: i32,
    pub frames_per_burst: i32,
}

impl DefaultStreamValues {
    pub const fn new() -> Self {
        Self {
            sample_rate: 48_000,
            channel_count: 2,
            frames_per_burst: 192,
        }
    }
}

impl Default for DefaultStreamValues {
    fn default() -> Self {
        Self::new()
    }
}
