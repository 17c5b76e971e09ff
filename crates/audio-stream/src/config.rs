use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

use crate::format::{SampleFormat, StreamDescriptor};

/// Playback tuning parameters shared by the resample/sink/worker stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target sink queue duration.
    pub buffer_seconds: f32,
    /// Frames handed to the sink per worker iteration.
    pub buffer_frames: usize,
    /// Output device substring (default device when unset).
    pub device: Option<String>,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 0.5,
            buffer_frames: 2048,
            device: None,
        }
    }
}

/// Direction a stream is opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Options recognized when a stream is opened.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Bits per sample of the caller-side byte stream.
    pub depth: u16,
    pub rate: u32,
    pub channels: u16,
    /// Float samples (forces 32-bit unless 64 is requested).
    pub floatp: bool,
    pub unsigned: bool,
    pub big_endian: bool,
    /// When `false` (read mode only) the source's native layout is adopted.
    pub resample: bool,
    /// Requested encoder bit rate in bits per second (write mode). `None`
    /// lets the encoder pick; uncompressed encoders only accept their own.
    pub bit_rate: Option<u32>,
    /// Metadata written to the container (write mode).
    pub comment: BTreeMap<String, String>,
    /// Restarts after the end of the source (`-1` = forever).
    pub loops: i32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            depth: 16,
            rate: 44_100,
            channels: 2,
            floatp: false,
            unsigned: false,
            big_endian: false,
            resample: true,
            bit_rate: None,
            comment: BTreeMap::new(),
            loops: -1,
        }
    }
}

impl StreamOptions {
    pub fn with_format(mut self, rate: u32, channels: u16, depth: u16) -> Self {
        self.rate = rate;
        self.channels = channels;
        self.depth = depth;
        self
    }

    pub fn with_float(mut self, floatp: bool) -> Self {
        self.floatp = floatp;
        self
    }

    pub fn with_loops(mut self, loops: i32) -> Self {
        self.loops = loops;
        self
    }

    pub fn with_resample(mut self, resample: bool) -> Self {
        self.resample = resample;
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    pub fn with_comment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.comment.insert(key.into(), value.into());
        self
    }

    /// Reject option combinations that cannot be honored in `mode`.
    pub fn validate(&self, mode: OpenMode) -> Result<()> {
        if self.rate == 0 {
            return Err(anyhow!("sample rate must be positive"));
        }
        if self.channels == 0 {
            return Err(anyhow!("channel count must be positive"));
        }
        if self.loops < -1 {
            return Err(anyhow!("loops must be -1 (infinite) or >= 0, got {}", self.loops));
        }
        if mode == OpenMode::Write && !self.resample {
            return Err(anyhow!(
                "resample=false adopts the source format and is only valid when reading"
            ));
        }
        SampleFormat::from_descriptor(&self.descriptor(mode))?;
        Ok(())
    }

    /// Caller-side descriptor implied by these options.
    ///
    /// Floats are 32-bit unless 64 was requested; writers treat depths below
    /// 16 bits as unsigned.
    pub fn descriptor(&self, mode: OpenMode) -> StreamDescriptor {
        let bit_depth = if self.floatp && self.depth != 64 {
            32
        } else {
            self.depth
        };
        let is_unsigned = if mode == OpenMode::Write && bit_depth < 16 {
            true
        } else {
            self.unsigned && !self.floatp
        };
        StreamDescriptor {
            sample_rate: self.rate,
            channels: self.channels,
            bit_depth,
            is_float: self.floatp,
            is_unsigned,
            is_big_endian: self.big_endian,
        }
    }
}
