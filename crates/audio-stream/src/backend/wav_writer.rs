//! WAV encoder/muxer on top of `hound`.
//!
//! PCM needs no real encoding step, so frames are turned into packets
//! one-to-one and handed back through the same send/receive cycle a
//! compressing codec would use. Tags are appended as a RIFF `LIST/INFO`
//! chunk once the data chunk is finalized.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::{BackendError, BackendResult, EncodeBackend, EncoderFormat};
use crate::format::{SampleFormat, StreamDescriptor, TimeBase};
use crate::frame::{Frame, Packet};

const FRAME_SAMPLES: usize = 1024;

pub struct WavWriter {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    path: PathBuf,
    format: EncoderFormat,
    metadata: BTreeMap<String, String>,
    pending: VecDeque<Packet>,
    flushed: bool,
}

impl WavWriter {
    /// Create `path`, choosing the closest PCM layout WAV can hold for
    /// `requested`.
    pub fn create(
        path: &Path,
        requested: &StreamDescriptor,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self> {
        let format = wav_sample_format(requested);
        let spec = hound::WavSpec {
            channels: requested.channels,
            sample_rate: requested.sample_rate,
            bits_per_sample: format.bits(),
            sample_format: if format.is_float() {
                hound::SampleFormat::Float
            } else {
                hound::SampleFormat::Int
            },
        };
        let writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("create {:?}", path))?;

        let descriptor = format.descriptor(requested.sample_rate, requested.channels);
        let bit_rate = pcm_bit_rate(requested);
        tracing::debug!(
            path = %path.display(),
            rate_hz = requested.sample_rate,
            channels = requested.channels,
            format = format.name(),
            "wav writer created"
        );

        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            format: EncoderFormat {
                descriptor,
                format,
                frame_samples: FRAME_SAMPLES,
                time_base: TimeBase::per_sample(requested.sample_rate),
                bit_rate,
            },
            metadata,
            pending: VecDeque::new(),
            flushed: false,
        })
    }
}

impl EncodeBackend for WavWriter {
    fn format(&self) -> &EncoderFormat {
        &self.format
    }

    fn send_frame(&mut self, frame: Option<Frame>) -> BackendResult<()> {
        if self.flushed {
            return Err(BackendError::EndOfStream);
        }
        let Some(frame) = frame else {
            self.flushed = true;
            return Ok(());
        };
        if frame.channels != usize::from(self.format.descriptor.channels) {
            return Err(BackendError::failed(
                -22,
                format!(
                    "frame has {} channels, encoder expects {}",
                    frame.channels, self.format.descriptor.channels
                ),
            ));
        }
        let pts = frame.pts;
        let samples = frame.samples as u64;
        let target = self.format.format;
        let data = if frame.format == target {
            frame.into_interleaved_bytes()
        } else {
            let planes = frame.to_f32_planes();
            let mut out = Vec::with_capacity(frame.samples * frame.channels * target.bytes());
            for s in 0..frame.samples {
                for plane in &planes {
                    target.write_sample(plane[s], false, &mut out);
                }
            }
            out
        };
        self.pending.push_back(Packet::new(0, pts, samples, data));
        Ok(())
    }

    fn receive_packet(&mut self) -> BackendResult<Packet> {
        match self.pending.pop_front() {
            Some(packet) => Ok(packet),
            None if self.flushed => Err(BackendError::EndOfStream),
            None => Err(BackendError::Retry),
        }
    }

    fn stream_time_base(&self) -> TimeBase {
        self.format.time_base
    }

    fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("wav writer already finished"))?;
        match self.format.format {
            SampleFormat::U8 => {
                // hound stores 8-bit WAV as unsigned but takes signed input.
                for b in packet.data.iter() {
                    writer.write_sample((i16::from(*b) - 128) as i8)?;
                }
            }
            SampleFormat::S16 => {
                for c in packet.data.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([c[0], c[1]]))?;
                }
            }
            SampleFormat::S24 => {
                for c in packet.data.chunks_exact(3) {
                    writer.write_sample(i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8)?;
                }
            }
            SampleFormat::S32 => {
                for c in packet.data.chunks_exact(4) {
                    writer.write_sample(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
                }
            }
            SampleFormat::F32 => {
                for c in packet.data.chunks_exact(4) {
                    writer.write_sample(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
                }
            }
            other => return Err(anyhow!("wav writer cannot store {}", other.name())),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        writer.finalize().context("finalize wav")?;
        if !self.metadata.is_empty() {
            append_info_chunk(&self.path, &self.metadata)?;
        }
        Ok(())
    }
}

/// PCM layout used to store `requested` in a WAV file.
fn wav_sample_format(requested: &StreamDescriptor) -> SampleFormat {
    if requested.is_float {
        return SampleFormat::F32;
    }
    match requested.bit_depth {
        0..=8 => SampleFormat::U8,
        9..=16 => SampleFormat::S16,
        17..=24 => SampleFormat::S24,
        _ => SampleFormat::S32,
    }
}

/// Bits per second of `requested` once stored as WAV PCM.
pub(super) fn pcm_bit_rate(requested: &StreamDescriptor) -> u32 {
    let descriptor = wav_sample_format(requested).descriptor(requested.sample_rate, requested.channels);
    u32::try_from(descriptor.bytes_per_second() * 8).unwrap_or(u32::MAX)
}

/// RIFF INFO id for a tag key, if one exists.
fn info_id(key: &str) -> Option<&'static [u8; 4]> {
    let id = match key.to_ascii_lowercase().as_str() {
        "title" => b"INAM",
        "artist" => b"IART",
        "album" | "product" => b"IPRD",
        "comment" => b"ICMT",
        "date" | "year" => b"ICRD",
        "genre" => b"IGNR",
        "copyright" => b"ICOP",
        "encoder" | "software" => b"ISFT",
        "track" | "tracknumber" => b"ITRK",
        _ => return None,
    };
    Some(id)
}

/// Append a `LIST/INFO` chunk to a finalized WAV file and fix the RIFF size.
fn append_info_chunk(path: &Path, metadata: &BTreeMap<String, String>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(b"INFO");
    for (key, value) in metadata {
        let Some(id) = info_id(key) else {
            tracing::debug!(key = %key, "no RIFF INFO id for tag; skipped");
            continue;
        };
        let mut text = value.as_bytes().to_vec();
        text.push(0);
        body.extend_from_slice(id);
        body.extend_from_slice(&(text.len() as u32).to_le_bytes());
        body.extend_from_slice(&text);
        if text.len() % 2 == 1 {
            body.push(0);
        }
    }
    if body.len() == 4 {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("reopen {:?}", path))?;
    let mut end = file.seek(SeekFrom::End(0))?;
    if end % 2 == 1 {
        file.write_all(&[0])?;
        end += 1;
    }
    file.write_all(b"LIST")?;
    file.write_all(&(body.len() as u32).to_le_bytes())?;
    file.write_all(&body)?;
    let riff_size = end + 8 + body.len() as u64 - 8;
    let riff_size = u32::try_from(riff_size).map_err(|_| anyhow!("wav file too large"))?;
    file.seek(SeekFrom::Start(4))?;
    file.write_all(&riff_size.to_le_bytes())?;
    file.flush()?;
    Ok(())
}
