//! bqstream CLI: play a test tone through a buffer-queue stream.
//!
//! Usage:
//!   cargo run --bin bq-cli -- --engine sim --seconds 2
//!   cargo run --bin bq-cli -- --engine cpal --frequency 880 --fifo
//!
//! Logging follows `RUST_LOG`, e.g. `RUST_LOG=bq_stream=debug`.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bq_engine::sim::SimEngine;
use bq_engine::SharedEngine;
use bq_stream::{
    AudioFormat, AudioStream, DataCallback, DataCallbackResult, DefaultStreamValues, StreamBuilder, StreamState,
};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Parser)]
#[command(name = "bq-cli")]
#[command(about = "Play a sine tone through a buffer-queue audio stream", long_about = None)]
struct Cli {
    /// Engine that consumes the buffers
    #[arg(long, value_enum, default_value_t = EngineKind::Sim)]
    engine: EngineKind,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,

    /// Playback length in seconds
    #[arg(long, default_value_t = 2.0)]
    seconds: f32,

    /// Sample rate in Hz (0 = engine default)
    #[arg(long, default_value_t = 0)]
    sample_rate: i32,

    /// Channel count (0 = engine default)
    #[arg(long, default_value_t = 0)]
    channels: i32,

    /// Frames per callback (0 = engine burst size)
    #[arg(long, default_value_t = 0)]
    frames_per_callback: i32,

    /// Sample format
    #[arg(long, value_enum, default_value_t = SampleFormat::I16)]
    format: SampleFormat,

    /// Write through the stream FIFO instead of using a data callback
    #[arg(long)]
    fifo: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// Software engine paced by the wall clock
    Sim,
    /// Default output device via cpal
    Cpal,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SampleFormat {
    I16,
    F32,
}

impl From<SampleFormat> for AudioFormat {
    fn from(format: SampleFormat) -> Self {
        match format {
            SampleFormat::I16 => AudioFormat::I16,
            SampleFormat::F32 => AudioFormat::F32,
        }
    }
}

/// Interleaved sine generator. Writes the same sample to every channel.
struct SineTone {
    phase: f32,
    step: f32,
    channels: usize,
    format: AudioFormat,
    frames_left: i64,
}

impl SineTone {
    fn new(frequency: f32, sample_rate: i32, channels: i32, format: AudioFormat, frames: i64) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * frequency / sample_rate as f32,
            channels: channels.max(1) as usize,
            format,
            frames_left: frames,
        }
    }

    fn fill(&mut self, audio: &mut [u8]) {
        let sample_bytes = self.format.bytes_per_sample() as usize;
        for frame in audio.chunks_exact_mut(sample_bytes * self.channels) {
            let value = self.phase.sin() * 0.25;
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
            for sample in frame.chunks_exact_mut(sample_bytes) {
                match self.format {
                    AudioFormat::F32 => sample.copy_from_slice(&value.to_le_bytes()),
                    _ => sample.copy_from_slice(&((value * i16::MAX as f32) as i16).to_le_bytes()),
                }
            }
        }
    }
}

impl DataCallback for SineTone {
    fn on_audio_ready(&mut self, audio: &mut [u8], num_frames: i32) -> DataCallbackResult {
        if self.frames_left <= 0 {
            audio.fill(0);
            return DataCallbackResult::Stop;
        }
        self.fill(audio);
        self.frames_left -= i64::from(num_frames);
        DataCallbackResult::Continue
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), bq_stream::StreamError> {
    let engine = match cli.engine {
        EngineKind::Sim => SharedEngine::new(Arc::new(SimEngine::realtime())),
        EngineKind::Cpal => bq_audio::default_engine(),
    };

    let (mut builder, sample_rate, channels) = tone_builder(cli, engine);

    if !cli.fifo {
        let total_frames = (cli.seconds.max(0.0) * sample_rate as f32) as i64;
        builder = builder.data_callback(SineTone::new(
            cli.frequency,
            sample_rate,
            channels,
            cli.format.into(),
            total_frames,
        ));
    }
    let stream = builder.open_stream()?;

    println!("Engine:   {:?}", cli.engine);
    println!("Rate:     {} Hz", stream.sample_rate());
    println!("Channels: {}", stream.channel_count());
    println!("Format:   {:?}", stream.format());
    println!("Burst:    {} frames", stream.frames_per_burst());
    println!("Capacity: {} frames", stream.buffer_capacity_in_frames());
    println!("Mode:     {}", if stream.uses_fifo() { "fifo" } else { "callback" });
    println!();

    stream.start()?;
    if stream.uses_fifo() {
        write_tone(cli, &stream)?;
    } else {
        wait_until_stopped(&stream, cli.seconds);
    }

    stream.stop()?;
    println!(
        "\rDone. {} frames written, {} processed, {} xruns",
        stream.frames_written(),
        stream.frames_processed_by_server(),
        stream.xrun_count()
    );
    stream.close()
}

/// Builder with the rate and channel count pinned, so a tone laid out
/// before open matches the stream that opens.
fn tone_builder(cli: &Cli, engine: Arc<SharedEngine>) -> (StreamBuilder, i32, i32) {
    let defaults = DefaultStreamValues::new();
    let sample_rate = if cli.sample_rate > 0 { cli.sample_rate } else { defaults.sample_rate };
    let channels = if cli.channels > 0 { cli.channels } else { defaults.channel_count };
    let builder = StreamBuilder::new(engine)
        .sample_rate(sample_rate)
        .channel_count(channels)
        .frames_per_callback(cli.frames_per_callback)
        .format(cli.format.into())
        .defaults(defaults);
    (builder, sample_rate, channels)
}

fn write_tone(cli: &Cli, stream: &AudioStream) -> Result<(), bq_stream::StreamError> {
    let mut tone = SineTone::new(
        cli.frequency,
        stream.sample_rate(),
        stream.channel_count(),
        stream.format(),
        i64::MAX,
    );
    let total_frames = (cli.seconds.max(0.0) * stream.sample_rate() as f32) as i64;
    let chunk_frames = stream.frames_per_burst().max(1);
    let mut chunk = vec![0u8; (chunk_frames * stream.bytes_per_frame()) as usize];

    let mut written = 0i64;
    while written < total_frames {
        tone.fill(&mut chunk);
        let mut offset = 0;
        while offset < chunk.len() {
            let frames = stream.write(&chunk[offset..], NANOS_PER_SECOND)?;
            offset += frames as usize * stream.bytes_per_frame() as usize;
        }
        written += i64::from(chunk_frames);
        report(stream);
    }
    // Let the FIFO drain before stopping.
    std::thread::sleep(Duration::from_millis(50));
    Ok(())
}

fn wait_until_stopped(stream: &AudioStream, seconds: f32) {
    let deadline = Instant::now() + Duration::from_secs_f32(seconds.max(0.0) + 1.0);
    while Instant::now() < deadline {
        let (result, state) = stream.wait_for_state_change(StreamState::Started, 100_000_000);
        report(stream);
        if result.is_ok() && state != StreamState::Started {
            break;
        }
    }
}

fn report(stream: &AudioStream) {
    print!(
        "\rState: {:?} | Written: {} | Position: {} | Queued: {}",
        stream.state(),
        stream.frames_written(),
        stream.frames_processed_by_server(),
        stream.buffer_depth()
    );
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_layout_matches_the_opened_stream() {
        for args in [
            vec!["bq-cli"],
            vec!["bq-cli", "--sample-rate", "22050", "--channels", "1", "--format", "f32"],
        ] {
            let cli = Cli::parse_from(args);
            let engine = SharedEngine::new(Arc::new(SimEngine::manual()));
            let (builder, sample_rate, channels) = tone_builder(&cli, engine);
            let stream = builder.open_stream().unwrap();
            assert_eq!(stream.sample_rate(), sample_rate);
            assert_eq!(stream.channel_count(), channels);
            stream.close().unwrap();
        }
    }
}
