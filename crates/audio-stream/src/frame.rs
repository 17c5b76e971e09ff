//! Packets and frames exchanged between pipeline stages.
//!
//! Both are moved by value from the stage that produced them into the next
//! stage, which drops them once consumed.

use crate::format::SampleFormat;

/// Compressed, timestamped unit of demuxed data.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Container stream (track) the packet belongs to.
    pub stream: u32,
    /// Presentation timestamp in the stream's time base.
    pub pts: i64,
    /// Duration in the stream's time base (`0` when unknown).
    pub duration: u64,
    pub data: Box<[u8]>,
}

impl Packet {
    pub fn new(stream: u32, pts: i64, duration: u64, data: impl Into<Box<[u8]>>) -> Self {
        Self {
            stream,
            pts,
            duration,
            data: data.into(),
        }
    }
}

/// Raw sample storage of a [`Frame`]. Bytes are always little-endian.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleData {
    /// One buffer per channel.
    Planar(Vec<Vec<u8>>),
    /// Samples alternate per channel.
    Interleaved(Vec<u8>),
}

/// Decoded (or pre-encode) audio for a fixed number of samples per channel.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Presentation timestamp in the producing stage's time base.
    pub pts: i64,
    pub sample_rate: u32,
    pub channels: usize,
    pub format: SampleFormat,
    /// Samples per channel.
    pub samples: usize,
    pub data: SampleData,
}

impl Frame {
    /// Build a frame from interleaved little-endian bytes.
    ///
    /// A trailing partial frame in `bytes` is ignored by `samples`.
    pub fn interleaved(
        pts: i64,
        sample_rate: u32,
        channels: usize,
        format: SampleFormat,
        bytes: Vec<u8>,
    ) -> Self {
        let stride = channels.max(1) * format.bytes();
        Self {
            pts,
            sample_rate,
            channels,
            format,
            samples: bytes.len() / stride,
            data: SampleData::Interleaved(bytes),
        }
    }

    /// Build a frame from per-channel little-endian buffers.
    pub fn planar(pts: i64, sample_rate: u32, format: SampleFormat, planes: Vec<Vec<u8>>) -> Self {
        let samples = planes
            .iter()
            .map(|p| p.len() / format.bytes())
            .min()
            .unwrap_or(0);
        Self {
            pts,
            sample_rate,
            channels: planes.len(),
            format,
            samples,
            data: SampleData::Planar(planes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0 || self.channels == 0
    }

    pub fn is_planar(&self) -> bool {
        matches!(self.data, SampleData::Planar(_))
    }

    /// Interleave the frame's samples into a flat byte buffer without
    /// converting the sample format.
    pub fn into_interleaved_bytes(self) -> Vec<u8> {
        let width = self.format.bytes();
        match self.data {
            SampleData::Interleaved(mut bytes) => {
                bytes.truncate(self.samples * self.channels * width);
                bytes
            }
            SampleData::Planar(planes) => {
                let mut out = Vec::with_capacity(self.samples * planes.len() * width);
                for s in 0..self.samples {
                    let at = s * width;
                    for plane in &planes {
                        out.extend_from_slice(&plane[at..at + width]);
                    }
                }
                out
            }
        }
    }

    /// Normalized `f32` samples, one `Vec` per channel.
    pub fn to_f32_planes(&self) -> Vec<Vec<f32>> {
        let width = self.format.bytes();
        match &self.data {
            SampleData::Planar(planes) => planes
                .iter()
                .map(|plane| {
                    plane
                        .chunks_exact(width)
                        .take(self.samples)
                        .map(|b| self.format.read_sample(b, false))
                        .collect()
                })
                .collect(),
            SampleData::Interleaved(bytes) => {
                let mut planes = vec![Vec::with_capacity(self.samples); self.channels];
                let stride = width * self.channels;
                for frame in bytes.chunks_exact(stride).take(self.samples) {
                    for (ch, plane) in planes.iter_mut().enumerate() {
                        let at = ch * width;
                        plane.push(self.format.read_sample(&frame[at..at + width], false));
                    }
                }
                planes
            }
        }
    }
}
