//! Codec backend boundary.
//!
//! The stream engine only talks to containers and codecs through
//! [`DecodeBackend`] and [`EncodeBackend`]. Real implementations live in the
//! submodules; tests script their own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::config::{OpenMode, StreamOptions};
use crate::format::{SampleFormat, StreamDescriptor, TimeBase};
use crate::frame::{Frame, Packet};

mod symphonia_reader;
mod wav_writer;

pub use symphonia_reader::SymphoniaReader;
pub use wav_writer::WavWriter;

/// Outcome of a backend call that did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendError {
    /// Nothing available right now; call again (after feeding more input).
    Retry,
    /// The stream (or encoder) is fully drained.
    EndOfStream,
    /// Any other failure. Non-fatal for the pipeline but reported.
    Failed { code: i32, message: String },
}

impl BackendError {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        BackendError::Failed {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Retry => write!(f, "try again"),
            BackendError::EndOfStream => write!(f, "end of stream"),
            BackendError::Failed { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Parameters of an opened source.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    /// Native layout of decoded samples.
    pub descriptor: StreamDescriptor,
    pub native_format: SampleFormat,
    /// Stream index of the selected audio track.
    pub audio_stream: u32,
    /// Time base of packet timestamps.
    pub time_base: TimeBase,
    pub duration_us: Option<i64>,
    pub bit_rate: Option<u32>,
    pub codec: Option<String>,
    pub container: Option<String>,
    /// Container and stream tags (stream tags win on conflicts).
    pub metadata: BTreeMap<String, String>,
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} Hz, {} ch, {}",
            self.codec.as_deref().unwrap_or("unknown codec"),
            self.descriptor.sample_rate,
            self.descriptor.channels,
            self.native_format.name(),
        )?;
        if let Some(container) = &self.container {
            write!(f, " ({container})")?;
        }
        if let Some(us) = self.duration_us {
            write!(f, ", {:.2}s", us as f64 / 1_000_000.0)?;
        }
        if let Some(bps) = self.bit_rate {
            write!(f, ", {} kbps", bps / 1000)?;
        }
        for (key, value) in &self.metadata {
            write!(f, "\n{key}: {value}")?;
        }
        Ok(())
    }
}

/// Demuxer + decoder for one audio stream.
pub trait DecodeBackend: Send {
    fn info(&self) -> &SourceInfo;

    /// Next packet from any stream of the container.
    fn next_packet(&mut self) -> BackendResult<Packet>;

    /// Decode one packet. `Ok(None)` means the packet produced no audio.
    fn decode(&mut self, packet: Packet) -> BackendResult<Option<Frame>>;

    /// Pull a frame still buffered inside the decoder after the container is
    /// exhausted. `Ok(None)` once empty.
    fn drain(&mut self) -> BackendResult<Option<Frame>>;

    /// Seek so that decoding restarts at or before `target_us`.
    ///
    /// Returns the position actually reached, in microseconds.
    fn seek(&mut self, target_us: i64) -> BackendResult<i64>;

    /// Discard decoder state (after seeks or restarts).
    fn flush(&mut self);
}

/// Encoder input requirements.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderFormat {
    /// Layout the encoder accepts (little-endian).
    pub descriptor: StreamDescriptor,
    pub format: SampleFormat,
    /// Samples per channel in every frame but the last.
    pub frame_samples: usize,
    /// Time base of frame and packet timestamps on the encoder side.
    pub time_base: TimeBase,
    pub bit_rate: u32,
}

/// Encoder + muxer for one audio stream.
pub trait EncodeBackend: Send {
    fn format(&self) -> &EncoderFormat;

    /// Queue a frame for encoding. `None` signals end of stream.
    fn send_frame(&mut self, frame: Option<Frame>) -> BackendResult<()>;

    /// Next encoded packet. [`BackendError::Retry`] when more input is
    /// needed, [`BackendError::EndOfStream`] once flushed and drained.
    fn receive_packet(&mut self) -> BackendResult<Packet>;

    /// Time base of the container stream packets are muxed into.
    fn stream_time_base(&self) -> TimeBase;

    /// Mux one packet whose timestamps are in [`EncodeBackend::stream_time_base`].
    fn write_packet(&mut self, packet: Packet) -> Result<()>;

    /// Finalize the container (trailer, metadata).
    fn finish(&mut self) -> Result<()>;
}

/// Open `path` for decoding with the default backend.
pub fn open_reader(path: &Path) -> Result<Box<dyn DecodeBackend>> {
    reject_network_source(path)?;
    Ok(Box::new(SymphoniaReader::open(path)?))
}

/// Create `path` for encoding with a backend chosen from its extension.
pub fn create_writer(path: &Path, options: &StreamOptions) -> Result<Box<dyn EncodeBackend>> {
    reject_network_source(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("wav") | Some("wave") => {
            let requested = options.descriptor(OpenMode::Write);
            let pcm = wav_writer::pcm_bit_rate(&requested);
            if let Some(bit_rate) = options.bit_rate.filter(|b| *b != pcm) {
                return Err(anyhow!(
                    "WAV output is uncompressed at {pcm} bps, cannot encode at {bit_rate} bps"
                ));
            }
            Ok(Box::new(WavWriter::create(
                path,
                &requested,
                options.comment.clone(),
            )?))
        }
        Some(other) => Err(anyhow!("no encoder available for .{other} output")),
        None => Err(anyhow!("cannot deduce output format from {}", path.display())),
    }
}

fn reject_network_source(path: &Path) -> Result<()> {
    let s = path.to_string_lossy();
    if s.contains("://") {
        return Err(anyhow!("network sources are not supported: {s}"));
    }
    Ok(())
}
