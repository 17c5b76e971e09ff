//! Streaming audio transcoding and playback.
//!
//! [`StreamReader`] decodes any supported file into raw interleaved PCM of a
//! caller-chosen layout, [`StreamWriter`] encodes such bytes into a file, and
//! [`AudioPlayer`] drives a reader into an output device on a worker thread.

pub mod backend;
pub mod config;
pub mod control;
pub mod device;
pub mod format;
pub mod frame;
pub mod player;
pub mod queue;
pub mod resample;
pub mod sink;
pub mod status;
pub mod stream;

#[cfg(test)]
mod testing;

pub use audio_stream_types::{
    ControlRequest, ControlResponse, PlaybackEndReason, PlaybackState, PlayerStatus,
    StreamDescriptor,
};
pub use config::{PlaybackConfig, StreamOptions};
pub use control::ControlError;
pub use player::{AudioPlayer, Whence};
pub use stream::{StreamReader, StreamWriter};
