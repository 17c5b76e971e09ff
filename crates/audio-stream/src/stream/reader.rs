//! Pull-based decoding stream with fixed-size reads.
//!
//! Each [`StreamReader::read`] call assembles exactly the requested number
//! of bytes from decoded, converted audio: leftovers from the previous call
//! come first, then new packets are pulled until the request is covered.
//! At the end of the source the reader either restarts (loops left) or pads
//! the final chunk with silence.

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::backend::{self, BackendError, DecodeBackend, SourceInfo};
use crate::config::{OpenMode, StreamOptions};
use crate::control::ControlTarget;
use crate::format::{SampleFormat, StreamDescriptor, pad_with_silence};
use crate::frame::Frame;
use crate::resample::Resampler;

/// Rubato input chunk used by the read path.
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Consecutive demuxer retries tolerated before the source counts as ended.
const RETRY_LIMIT: usize = 64;

pub struct StreamReader {
    backend: Option<Box<dyn DecodeBackend>>,
    info: SourceInfo,
    descriptor: StreamDescriptor,
    format: SampleFormat,
    resample: bool,
    resampler: Resampler,
    carry: Vec<u8>,
    padded: usize,
    position_us: i64,
    loops: i32,
    loop_count: u32,
    pending_seek: Option<i64>,
}

impl StreamReader {
    /// Open `path` with the default decode backend.
    pub fn open(path: &Path, options: &StreamOptions) -> Result<Self> {
        options.validate(OpenMode::Read)?;
        let backend = backend::open_reader(path)?;
        Self::from_backend(backend, options)
    }

    /// Wrap an already opened backend.
    ///
    /// With `options.resample == false` the source's native layout becomes
    /// the output layout.
    pub fn from_backend(backend: Box<dyn DecodeBackend>, options: &StreamOptions) -> Result<Self> {
        options.validate(OpenMode::Read)?;
        let info = backend.info().clone();
        let descriptor = if options.resample {
            options.descriptor(OpenMode::Read)
        } else {
            info.native_format
                .descriptor(info.descriptor.sample_rate, info.descriptor.channels)
        };
        let format = SampleFormat::from_descriptor(&descriptor)?;
        let resampler = Resampler::new(
            info.descriptor.sample_rate,
            descriptor,
            RESAMPLE_CHUNK_FRAMES,
        )?;

        tracing::info!(
            src_rate_hz = info.descriptor.sample_rate,
            src_channels = info.descriptor.channels,
            rate_hz = descriptor.sample_rate,
            channels = descriptor.channels,
            format = format.name(),
            loops = options.loops,
            "stream opened for reading"
        );

        Ok(Self {
            backend: Some(backend),
            info,
            descriptor,
            format,
            resample: options.resample,
            resampler,
            carry: Vec::new(),
            padded: 0,
            position_us: 0,
            loops: options.loops,
            loop_count: 0,
            pending_seek: None,
        })
    }

    /// Read exactly `size` bytes of converted audio.
    ///
    /// Returns fewer bytes only once the source is exhausted and no loops
    /// remain: the final chunk is padded with silence, later calls return an
    /// empty buffer.
    pub fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut backend = self
            .backend
            .take()
            .ok_or_else(|| anyhow!("read on a closed stream"))?;
        let result = self.read_from(backend.as_mut(), size);
        self.backend = Some(backend);
        result
    }

    fn read_from(&mut self, backend: &mut dyn DecodeBackend, size: usize) -> Result<Vec<u8>> {
        if let Some(target) = self.pending_seek.take() {
            self.seek_now(backend, target);
        }
        self.padded = 0;
        let mut data = std::mem::take(&mut self.carry);
        if size == 0 {
            self.carry = data;
            return Ok(Vec::new());
        }

        let mut retries = 0;
        while data.len() < size {
            let packet = match backend.next_packet() {
                Ok(packet) => {
                    retries = 0;
                    packet
                }
                Err(BackendError::Retry) if retries < RETRY_LIMIT => {
                    retries += 1;
                    tracing::trace!(retries, "demuxer asked to retry");
                    continue;
                }
                Err(e) => {
                    match e {
                        BackendError::Failed { .. } => {
                            tracing::warn!("demux error, treating as end of source: {e}")
                        }
                        BackendError::Retry => {
                            tracing::warn!(retries, "demuxer never delivered, treating as end of source")
                        }
                        BackendError::EndOfStream => {}
                    }
                    self.drain(backend, &mut data)?;
                    self.end_of_source(&mut data, size);
                    break;
                }
            };
            if packet.stream != self.info.audio_stream {
                continue;
            }
            self.position_us = self.info.time_base.to_micros(packet.pts);
            match backend.decode(packet) {
                Ok(Some(frame)) => self.append(frame, &mut data)?,
                Ok(None) | Err(BackendError::Retry) | Err(BackendError::EndOfStream) => {}
                Err(e) => tracing::warn!("decode error: {e}"),
            }
        }

        if data.len() > size {
            self.carry = data.split_off(size);
        }
        Ok(data)
    }

    /// Flush the decoder and the resampler into `data`.
    fn drain(&mut self, backend: &mut dyn DecodeBackend, data: &mut Vec<u8>) -> Result<()> {
        loop {
            match backend.drain() {
                Ok(Some(frame)) => self.append(frame, data)?,
                Ok(None) | Err(BackendError::Retry) | Err(BackendError::EndOfStream) => break,
                Err(e) => {
                    tracing::warn!("decoder drain error: {e}");
                    break;
                }
            }
        }
        data.extend(self.resampler.convert(None)?);
        Ok(())
    }

    /// Apply the loop policy once the source is exhausted.
    fn end_of_source(&mut self, data: &mut Vec<u8>, size: usize) {
        let exhausted = self.loops != -1 && i64::from(self.loop_count) >= i64::from(self.loops);
        if exhausted && data.is_empty() {
            return;
        }
        let audio = data.len();
        pad_with_silence(data, size, self.format, self.descriptor.is_big_endian);
        self.padded = data.len() - audio;
        if exhausted {
            return;
        }
        self.loop_count += 1;
        self.pending_seek = Some(0);
        tracing::debug!(loop_count = self.loop_count, "restarting source");
    }

    fn append(&mut self, frame: Frame, data: &mut Vec<u8>) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        if self.is_passthrough(&frame) {
            data.extend(frame.into_interleaved_bytes());
        } else {
            data.extend(self.resampler.convert(Some(&frame))?);
        }
        Ok(())
    }

    fn is_passthrough(&self, frame: &Frame) -> bool {
        !self.resample
            && !self.descriptor.is_big_endian
            && frame.format == self.format
            && frame.channels == usize::from(self.descriptor.channels)
            && frame.sample_rate == self.descriptor.sample_rate
    }

    fn seek_now(&mut self, backend: &mut dyn DecodeBackend, target_us: i64) {
        match backend.seek(target_us) {
            Ok(reached) => {
                backend.flush();
                self.resampler.reset();
                self.position_us = reached;
                tracing::debug!(target_us, reached_us = reached, "seeked");
            }
            Err(e) => tracing::warn!(target_us, "seek failed: {e}"),
        }
    }

    /// Silence bytes at the end of the most recent read's result.
    pub fn padding(&self) -> usize {
        self.padded
    }

    /// Position of the most recently decoded packet, in microseconds.
    pub fn position(&self) -> i64 {
        self.position_us
    }

    /// Schedule a seek; it runs at the start of the next [`StreamReader::read`].
    ///
    /// Audio already converted for the old position is dropped. Loop
    /// restarts keep it, so the tail of one pass is not lost.
    pub fn set_position(&mut self, us: i64) {
        self.carry.clear();
        self.pending_seek = Some(us.max(0));
    }

    pub fn loops(&self) -> i32 {
        self.loops
    }

    /// Change the restart budget (`-1` = forever). Other negative values are
    /// ignored.
    pub fn set_loops(&mut self, loops: i32) {
        if loops < -1 {
            tracing::warn!(loops, "invalid loop count ignored");
            return;
        }
        self.loops = loops;
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Source length in microseconds (`0` when unknown).
    pub fn length(&self) -> i64 {
        self.info.duration_us.unwrap_or(0)
    }

    /// Layout of the bytes returned by [`StreamReader::read`].
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Release the backend. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            tracing::debug!("stream reader closed");
        }
        self.carry = Vec::new();
        self.pending_seek = None;
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }
}

impl ControlTarget for StreamReader {
    fn position(&self) -> i64 {
        StreamReader::position(self)
    }

    fn set_position(&mut self, us: i64) {
        StreamReader::set_position(self, us)
    }

    fn loops(&self) -> i32 {
        StreamReader::loops(self)
    }

    fn set_loops(&mut self, loops: i32) {
        StreamReader::set_loops(self, loops)
    }

    fn loop_count(&self) -> u32 {
        StreamReader::loop_count(self)
    }
}
