//! Device errors and their engine result codes.

use bq_engine::EngineError;
use thiserror::Error;

/// Failure talking to the host audio API.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no default output device")]
    NoDevice,

    #[error("failed to query default output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to play output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("failed to pause output stream: {0}")]
    PauseStream(#[from] cpal::PauseStreamError),

    #[error("unsupported device sample format: {0:?}")]
    SampleFormat(cpal::SampleFormat),

    #[error("device thread is gone")]
    ThreadGone,
}

impl From<&DeviceError> for EngineError {
    fn from(err: &DeviceError) -> Self {
        match err {
            DeviceError::NoDevice | DeviceError::DefaultConfig(_) => EngineError::ResourceError,
            DeviceError::BuildStream(cpal::BuildStreamError::DeviceNotAvailable)
            | DeviceError::PlayStream(cpal::PlayStreamError::DeviceNotAvailable)
            | DeviceError::PauseStream(cpal::PauseStreamError::DeviceNotAvailable) => {
                EngineError::ResourceLost
            }
            DeviceError::BuildStream(cpal::BuildStreamError::StreamConfigNotSupported)
            | DeviceError::SampleFormat(_) => EngineError::ContentUnsupported,
            DeviceError::BuildStream(cpal::BuildStreamError::InvalidArgument) => {
                EngineError::ParameterInvalid
            }
            DeviceError::BuildStream(_) | DeviceError::PlayStream(_) | DeviceError::PauseStream(_) => {
                EngineError::IoError
            }
            DeviceError::ThreadGone => EngineError::InternalError,
        }
    }
}
