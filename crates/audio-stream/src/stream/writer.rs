//! Push-based encoding stream.
//!
//! Callers hand over raw interleaved bytes in their own layout. Bytes are
//! accumulated until a full encode frame is available, converted into the
//! encoder's input layout and fed to the encoder; every packet it emits is
//! muxed right away.

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::backend::{self, BackendError, EncodeBackend, EncoderFormat};
use crate::config::{OpenMode, StreamOptions};
use crate::format::{SampleFormat, StreamDescriptor, rescale};
use crate::frame::Frame;
use crate::resample::Resampler;

const RESAMPLE_CHUNK_FRAMES: usize = 1024;

pub struct StreamWriter {
    backend: Option<Box<dyn EncodeBackend>>,
    descriptor: StreamDescriptor,
    format: SampleFormat,
    encoder: EncoderFormat,
    resampler: Resampler,
    /// Caller bytes not yet encoded (always less than one encode frame).
    acc: Vec<u8>,
    /// Converted bytes waiting for a full encoder frame.
    staged: Vec<u8>,
    /// Running sample counter used as the encoder-side pts.
    next_pts: i64,
    frame_bytes: usize,
}

impl StreamWriter {
    /// Create `path` with an encoder picked from its extension.
    pub fn create(path: &Path, options: &StreamOptions) -> Result<Self> {
        options.validate(OpenMode::Write)?;
        let backend = backend::create_writer(path, options)?;
        Self::from_backend(backend, options)
    }

    pub fn from_backend(backend: Box<dyn EncodeBackend>, options: &StreamOptions) -> Result<Self> {
        options.validate(OpenMode::Write)?;
        let descriptor = options.descriptor(OpenMode::Write);
        let format = SampleFormat::from_descriptor(&descriptor)?;
        let encoder = backend.format().clone();
        if encoder.frame_samples == 0 {
            return Err(anyhow!("encoder reported a zero frame size"));
        }
        let resampler = Resampler::new(
            descriptor.sample_rate,
            encoder.descriptor,
            RESAMPLE_CHUNK_FRAMES,
        )?;
        let frame_bytes = encoder.frame_samples * descriptor.bytes_per_frame();

        tracing::info!(
            rate_hz = descriptor.sample_rate,
            channels = descriptor.channels,
            format = format.name(),
            encoder_format = encoder.format.name(),
            frame_samples = encoder.frame_samples,
            bit_rate = encoder.bit_rate,
            "stream opened for writing"
        );

        Ok(Self {
            backend: Some(backend),
            descriptor,
            format,
            encoder,
            resampler,
            acc: Vec::new(),
            staged: Vec::new(),
            next_pts: 0,
            frame_bytes,
        })
    }

    /// Queue `bytes` for encoding.
    ///
    /// Returns how many accumulated bytes were encoded by this call: a
    /// multiple of [`StreamWriter::frame_bytes`], `0` while less than one
    /// encode frame is buffered.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut backend = self
            .backend
            .take()
            .ok_or_else(|| anyhow!("write on a closed stream"))?;
        let result = self.write_to(backend.as_mut(), bytes);
        self.backend = Some(backend);
        result
    }

    fn write_to(&mut self, backend: &mut dyn EncodeBackend, bytes: &[u8]) -> Result<usize> {
        self.acc.extend_from_slice(bytes);
        let mut consumed = 0;
        while self.acc.len() >= self.frame_bytes {
            let chunk: Vec<u8> = self.acc.drain(..self.frame_bytes).collect();
            let converted = self.resampler.convert_interleaved(
                Some(&chunk),
                self.format,
                usize::from(self.descriptor.channels),
                self.descriptor.is_big_endian,
            )?;
            self.stage(backend, converted, false)?;
            consumed += self.frame_bytes;
        }
        Ok(consumed)
    }

    /// Append converted bytes and send every full encoder frame. With
    /// `last`, a short trailing frame is sent as well.
    fn stage(&mut self, backend: &mut dyn EncodeBackend, converted: Vec<u8>, last: bool) -> Result<()> {
        self.staged.extend(converted);
        let stride = self.encoder.descriptor.bytes_per_frame();
        let full = self.encoder.frame_samples * stride;
        while self.staged.len() >= full || (last && self.staged.len() >= stride) {
            let take = full.min(self.staged.len() / stride * stride);
            let bytes: Vec<u8> = self.staged.drain(..take).collect();
            let frame = Frame::interleaved(
                self.next_pts,
                self.encoder.descriptor.sample_rate,
                usize::from(self.encoder.descriptor.channels),
                self.encoder.format,
                bytes,
            );
            self.next_pts += frame.samples as i64;
            self.send(backend, Some(frame))?;
        }
        Ok(())
    }

    fn send(&mut self, backend: &mut dyn EncodeBackend, frame: Option<Frame>) -> Result<()> {
        match backend.send_frame(frame.clone()) {
            Ok(()) => {}
            Err(BackendError::Retry) => {
                // Encoder wants its output drained first.
                self.drain_packets(backend)?;
                if let Err(e) = backend.send_frame(frame) {
                    tracing::warn!("encode error: {e}");
                }
            }
            Err(e) => tracing::warn!("encode error: {e}"),
        }
        self.drain_packets(backend)
    }

    /// Mux every packet the encoder has ready.
    fn drain_packets(&mut self, backend: &mut dyn EncodeBackend) -> Result<()> {
        let stream_tb = backend.stream_time_base();
        loop {
            let mut packet = match backend.receive_packet() {
                Ok(p) => p,
                Err(BackendError::Retry) | Err(BackendError::EndOfStream) => return Ok(()),
                Err(e) => {
                    tracing::warn!("encoder output error: {e}");
                    return Ok(());
                }
            };
            packet.pts = rescale(packet.pts, self.encoder.time_base, stream_tb);
            packet.duration =
                rescale(packet.duration as i64, self.encoder.time_base, stream_tb).max(0) as u64;
            backend.write_packet(packet)?;
        }
    }

    /// Encode what is left, flush the encoder and finalize the container.
    /// Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        if self.backend.is_none() {
            return Ok(());
        }
        while self.write(&[])? > 0 {}
        let Some(mut backend) = self.backend.take() else {
            return Ok(());
        };

        let rest = std::mem::take(&mut self.acc);
        let mut converted = self.resampler.convert_interleaved(
            Some(&rest),
            self.format,
            usize::from(self.descriptor.channels),
            self.descriptor.is_big_endian,
        )?;
        converted.extend(self.resampler.convert_interleaved(
            None,
            self.format,
            usize::from(self.descriptor.channels),
            self.descriptor.is_big_endian,
        )?);
        self.stage(backend.as_mut(), converted, true)?;
        self.send(backend.as_mut(), None)?;
        backend.finish()?;
        tracing::debug!(samples = self.next_pts, "stream writer closed");
        Ok(())
    }

    /// Caller bytes that make up one encode frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Layout expected from callers of [`StreamWriter::write`].
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn encoder_format(&self) -> &EncoderFormat {
        &self.encoder
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("stream writer close failed: {e:#}");
        }
    }
}
