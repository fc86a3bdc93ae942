//! Client data callback.

use bq_core::DataCallbackResult;

/// Produces (output) or consumes (input) one callback buffer of audio.
///
/// Runs on the engine's thread with a hard deadline: no blocking, no
/// allocation, no I/O.
pub trait DataCallback: Send {
    /// `audio` holds `num_frames` interleaved frames.
    fn on_audio_ready(&mut self, audio: &mut [u8], num_frames: i32) -> DataCallbackResult;
}

impl<F> DataCallback for F
where
    F: FnMut(&mut [u8], i32) -> DataCallbackResult + Send,
{
    fn on_audio_ready(&mut self, audio: &mut [u8], num_frames: i32) -> DataCallbackResult {
        self(audio, num_frames)
    }
}
