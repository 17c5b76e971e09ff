use serde::{Deserialize, Serialize};

/// Output (or input, for writers) sample layout requested by the caller.
///
/// Samples are always interleaved. `bit_depth` is the width of one sample,
/// `is_float` selects IEEE floats of that width.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StreamDescriptor {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample (8, 16, 24, 32 or 64).
    pub bit_depth: u16,
    /// IEEE float samples.
    pub is_float: bool,
    /// Unsigned integer samples (ignored for floats).
    pub is_unsigned: bool,
    /// Big-endian byte order.
    pub is_big_endian: bool,
}

impl StreamDescriptor {
    /// Signed little-endian integer PCM.
    pub fn pcm(sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
            is_float: false,
            is_unsigned: false,
            is_big_endian: false,
        }
    }

    /// 32-bit float little-endian PCM.
    pub fn float(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth: 32,
            is_float: true,
            is_unsigned: false,
            is_big_endian: false,
        }
    }

    /// Bytes taken by one sample of one channel.
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bit_depth).div_ceil(8)
    }

    /// Bytes taken by one interleaved frame (all channels).
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    /// Bytes of audio per second of playback.
    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_frame() as u64 * u64::from(self.sample_rate)
    }
}

impl Default for StreamDescriptor {
    fn default() -> Self {
        Self::pcm(44_100, 2, 16)
    }
}

/// Coarse playback state owned by the controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No worker running.
    #[default]
    Stopped,
    /// Worker running and emitting decoded audio.
    Playing,
    /// Worker running and emitting silence.
    Paused,
}

/// Requests sent from the controlling context to the playback worker.
///
/// `Get*` requests are answered with exactly one [`ControlResponse`];
/// `Set*` requests are fire-and-forget.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    GetPosition,
    SetPosition(i64),
    GetLoops,
    SetLoops(i32),
    GetLoopCount,
}

impl ControlRequest {
    /// Whether the worker answers this request.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            ControlRequest::GetPosition | ControlRequest::GetLoops | ControlRequest::GetLoopCount
        )
    }
}

/// Responses returned by the playback worker for `Get*` requests.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlResponse {
    /// Stream position in microseconds.
    Position(i64),
    /// Requested loop count (`-1` = infinite).
    Loops(i32),
    /// Number of restarts performed so far.
    LoopCount(u32),
}

/// Reason why the playback worker stopped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped.
    Stopped,
}

/// Snapshot of the flags a controlling context may read at any time.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    /// File currently opened by the controller.
    pub filename: Option<String>,
    /// Controller state.
    pub state: PlaybackState,
    /// `true` while the worker is running.
    pub playing: bool,
    /// `true` when output is muted by pause.
    pub paused: bool,
    /// Last worker error, if any.
    pub error: Option<String>,
    /// Stream length in microseconds (`0` when unknown).
    pub length_us: i64,
    /// Human-readable description of the opened stream.
    pub info: String,
    /// Why the last worker run ended.
    pub end_reason: Option<PlaybackEndReason>,
}
