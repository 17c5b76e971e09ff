//! CPAL-backed audio sink.
//!
//! Bytes written by the worker are converted to `f32` at the device rate and
//! channel count and pushed into a bounded [`SampleQueue`]. The
//! real-time callback drains the queue without blocking and fills underruns
//! with silence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};

use super::AudioSink;
use crate::config::PlaybackConfig;
use crate::device::{pick_device, pick_output_config};
use crate::format::{SampleFormat, StreamDescriptor};
use crate::queue::{SampleQueue, capacity_for};
use crate::resample::{Resampler, deinterleave};

pub struct CpalSink {
    _stream: cpal::Stream,
    queue: Arc<SampleQueue>,
    input: StreamDescriptor,
    input_format: SampleFormat,
    resampler: Resampler,
    buffer_size: usize,
    drain_timeout: Duration,
}

impl CpalSink {
    /// Open the configured (or default) output device for `input` audio.
    pub fn open(input: &StreamDescriptor, config: &PlaybackConfig) -> Result<Self> {
        let input_format = SampleFormat::from_descriptor(input)?;
        let host = cpal::default_host();
        let device = pick_device(&host, config.device.as_deref())?;
        let supported = pick_output_config(&device, input.sample_rate)?;
        let stream_config: cpal::StreamConfig = supported.config();
        let device_rate = stream_config.sample_rate;
        let device_channels = stream_config.channels;

        let capacity = capacity_for(device_rate, usize::from(device_channels), config.buffer_seconds);
        let queue = Arc::new(SampleQueue::new(usize::from(device_channels), capacity));

        let resampler = Resampler::new(
            input.sample_rate,
            StreamDescriptor::float(device_rate, device_channels),
            config.chunk_frames,
        )?;
        if input.sample_rate == device_rate {
            tracing::info!(rate_hz = device_rate, "resample skipped");
        } else {
            tracing::info!(from_hz = input.sample_rate, rate_hz = device_rate, "resampling");
        }

        let stream = build_output_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            &queue,
            config.refill_max_frames,
        )?;
        stream.play()?;

        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz = device_rate,
            channels = device_channels,
            format = ?supported.sample_format(),
            "output stream started"
        );

        Ok(Self {
            _stream: stream,
            queue,
            input: *input,
            input_format,
            resampler,
            buffer_size: config.buffer_frames.max(1) * input.bytes_per_frame(),
            drain_timeout: Duration::from_secs_f32(config.buffer_seconds.max(0.0) + 1.0),
        })
    }

    fn push(&mut self, samples: &[f32]) -> Result<()> {
        self.queue.push(samples);
        if self.queue.is_closed() {
            return Err(anyhow!("output stream closed"));
        }
        Ok(())
    }
}

impl AudioSink for CpalSink {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let planes = deinterleave(
            data,
            self.input_format,
            usize::from(self.input.channels),
            self.input.is_big_endian,
        );
        let samples = self.resampler.process(Some(planes))?;
        self.push(&samples)?;
        Ok(data.len())
    }

    fn drain(&mut self) -> Result<()> {
        let tail = self.resampler.process(None)?;
        self.push(&tail)?;
        if !self.queue.wait_drained(self.drain_timeout) {
            tracing::warn!(
                queued_frames = self.queue.queued_frames(),
                "output did not drain in time"
            );
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Build a CPAL output stream that plays `queue`.
///
/// `queue` carries interleaved `f32` samples already at the device rate and
/// channel count.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    refill_max_frames: usize,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, refill_max_frames),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, refill_max_frames),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, refill_max_frames),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, refill_max_frames),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
///
/// The callback never waits on the queue; a device error closes the queue so
/// the next sink write fails.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    refill_max_frames: usize,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let refill_max_frames = refill_max_frames.max(1);
    let queue_cb = queue.clone();
    let queue_err = queue.clone();
    let mut local: Vec<f32> = Vec::new();
    let mut pos = 0usize;

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let mut i = 0;
            while i < data.len() {
                if pos >= local.len() {
                    pos = 0;
                    match queue_cb.try_pop(refill_max_frames) {
                        Some(v) => local = v,
                        None => {
                            local.clear();
                            for s in &mut data[i..] {
                                *s = <T as cpal::Sample>::from_sample::<f32>(0.0);
                            }
                            return;
                        }
                    }
                }
                let n = (local.len() - pos).min(data.len() - i);
                for k in 0..n {
                    data[i + k] = <T as cpal::Sample>::from_sample::<f32>(local[pos + k]);
                }
                pos += n;
                i += n;
            }
        },
        move |err| {
            tracing::warn!("stream error: {err}");
            queue_err.close();
        },
        None,
    )?;

    Ok(stream)
}
