//! Sample-format, channel-layout and rate conversion.
//!
//! [`Resampler`] takes decoded audio in any [`SampleFormat`] and channel
//! count and produces interleaved bytes in a fixed output layout. Rate
//! conversion uses Rubato's sinc resampler in fixed-size input chunks; the
//! partial chunk left over between calls is kept until more input arrives or
//! the stream is flushed.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::format::{SampleFormat, StreamDescriptor, rescale_up};
use crate::frame::Frame;

/// Converter from one decoded layout into the caller's byte layout.
pub struct Resampler {
    in_rate: u32,
    out: StreamDescriptor,
    out_format: SampleFormat,
    chunk_frames: usize,
    rate: Option<RateStage>,
    total_in: u64,
    total_out: u64,
    flushed: bool,
}

/// Rubato state for a rate change.
struct RateStage {
    inner: Box<dyn rubato::Resampler<f32> + Send>,
    channels: usize,
    chunk: usize,
    /// Interleaved input not yet processed (less than one chunk).
    pending: Vec<f32>,
    out_buf: Vec<f32>,
    /// Leading output frames still to discard.
    delay_left: usize,
}

impl RateStage {
    fn new(in_rate: u32, out_rate: u32, channels: usize, chunk: usize) -> Result<Self> {
        let f_ratio = out_rate as f64 / in_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let inner: Box<dyn rubato::Resampler<f32> + Send> = Box::new(
            Async::<f32>::new_sinc(f_ratio, 1.1, &params, chunk, channels, FixedAsync::Input)
                .map_err(|e| anyhow!("resampler init: {e}"))?,
        );
        let max_out = inner
            .output_frames_max()
            .max(rescale_up(chunk as u64, u64::from(out_rate), u64::from(in_rate)) as usize + 16);
        let delay_left = inner.output_delay();
        Ok(Self {
            inner,
            channels,
            chunk,
            pending: Vec::with_capacity(chunk * channels),
            out_buf: vec![0.0; max_out * channels],
            delay_left,
        })
    }

    /// Run one full chunk from the front of `pending`, appending produced
    /// frames (minus any remaining leading delay) to `out`.
    fn run_chunk(&mut self, out: &mut Vec<f32>) -> Result<usize> {
        let want = self.chunk * self.channels;
        let input = InterleavedSlice::new(&self.pending[..want], self.channels, self.chunk)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
        let cap = self.out_buf.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.out_buf, self.channels, cap)
            .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };
        let (_nbr_in, nbr_out) = self
            .inner
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;
        self.pending.drain(..want);

        let skip = self.delay_left.min(nbr_out);
        self.delay_left -= skip;
        let produced = nbr_out - skip;
        out.extend_from_slice(&self.out_buf[skip * self.channels..nbr_out * self.channels]);
        Ok(produced)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
        self.delay_left = self.inner.output_delay();
    }
}

impl Resampler {
    /// Build a converter from `in_rate` audio into `out`.
    ///
    /// `chunk_frames` is the Rubato input chunk size used when rates differ.
    pub fn new(in_rate: u32, out: StreamDescriptor, chunk_frames: usize) -> Result<Self> {
        if in_rate == 0 || out.sample_rate == 0 || out.channels == 0 {
            return Err(anyhow!(
                "invalid resampler layout: {in_rate} Hz -> {} Hz, {} ch",
                out.sample_rate,
                out.channels
            ));
        }
        let out_format = SampleFormat::from_descriptor(&out)?;
        let chunk_frames = chunk_frames.max(1);
        let rate = if in_rate == out.sample_rate {
            None
        } else {
            tracing::debug!(from_hz = in_rate, to_hz = out.sample_rate, "resampling");
            Some(RateStage::new(
                in_rate,
                out.sample_rate,
                usize::from(out.channels),
                chunk_frames,
            )?)
        };
        Ok(Self {
            in_rate,
            out,
            out_format,
            chunk_frames,
            rate,
            total_in: 0,
            total_out: 0,
            flushed: false,
        })
    }

    pub fn output(&self) -> &StreamDescriptor {
        &self.out
    }

    pub fn output_format(&self) -> SampleFormat {
        self.out_format
    }

    pub fn input_rate(&self) -> u32 {
        self.in_rate
    }

    /// Convert one decoded frame, or flush buffered input when `frame` is
    /// `None`. May return an empty buffer.
    pub fn convert(&mut self, frame: Option<&Frame>) -> Result<Vec<u8>> {
        let planes = match frame {
            Some(frame) => {
                self.follow_input_rate(frame.sample_rate)?;
                Some(frame.to_f32_planes())
            }
            None => None,
        };
        let samples = self.process(planes)?;
        Ok(self.encode(&samples))
    }

    /// Convert interleaved bytes in `format` at the input rate.
    /// `None` flushes.
    pub fn convert_interleaved(
        &mut self,
        bytes: Option<&[u8]>,
        format: SampleFormat,
        channels: usize,
        big_endian: bool,
    ) -> Result<Vec<u8>> {
        let planes = bytes.map(|b| deinterleave(b, format, channels, big_endian));
        let samples = self.process(planes)?;
        Ok(self.encode(&samples))
    }

    /// Core conversion on normalized planes; returns interleaved `f32` in the
    /// output rate and channel count.
    pub fn process(&mut self, planes: Option<Vec<Vec<f32>>>) -> Result<Vec<f32>> {
        let Some(planes) = planes else {
            return self.flush();
        };
        if self.flushed {
            // Input after a flush starts a fresh stream.
            self.reset();
        }
        let out_channels = usize::from(self.out.channels);
        let mapped = map_channels(&planes, out_channels);
        let frames = mapped.len() / out_channels;
        self.total_in += frames as u64;

        let Some(stage) = self.rate.as_mut() else {
            self.total_out += frames as u64;
            return Ok(mapped);
        };

        stage.pending.extend_from_slice(&mapped);
        let mut out = Vec::new();
        while stage.pending.len() >= stage.chunk * stage.channels {
            let produced = stage.run_chunk(&mut out)?;
            self.total_out += produced as u64;
        }
        Ok(out)
    }

    /// Emit everything still buffered. Idempotent: a second flush returns
    /// nothing.
    fn flush(&mut self) -> Result<Vec<f32>> {
        if self.flushed {
            return Ok(Vec::new());
        }
        self.flushed = true;
        let Some(stage) = self.rate.as_mut() else {
            return Ok(Vec::new());
        };

        let expected = rescale_up(
            self.total_in,
            u64::from(self.out.sample_rate),
            u64::from(self.in_rate),
        );
        let channels = stage.channels;
        let mut out = Vec::new();
        let mut idle_rounds = 0;
        while self.total_out < expected && idle_rounds < 4 {
            stage.pending.resize(stage.chunk * channels, 0.0);
            let mut chunk_out = Vec::new();
            let produced = stage.run_chunk(&mut chunk_out)?;
            if produced == 0 {
                idle_rounds += 1;
                continue;
            }
            let keep = (produced as u64).min(expected - self.total_out) as usize;
            out.extend_from_slice(&chunk_out[..keep * channels]);
            self.total_out += keep as u64;
        }
        stage.pending.clear();
        Ok(out)
    }

    /// Drop all buffered input and filter state (after a seek).
    pub fn reset(&mut self) {
        if let Some(stage) = self.rate.as_mut() {
            stage.reset();
        }
        self.total_in = 0;
        self.total_out = 0;
        self.flushed = false;
    }

    /// Rebuild the rate stage if the decoder changed its output rate.
    fn follow_input_rate(&mut self, rate: u32) -> Result<()> {
        if rate == 0 || rate == self.in_rate {
            return Ok(());
        }
        tracing::info!(from_hz = self.in_rate, to_hz = rate, "input rate changed");
        self.in_rate = rate;
        self.rate = if rate == self.out.sample_rate {
            None
        } else {
            Some(RateStage::new(
                rate,
                self.out.sample_rate,
                usize::from(self.out.channels),
                self.chunk_frames,
            )?)
        };
        self.total_in = 0;
        self.total_out = 0;
        Ok(())
    }

    fn encode(&self, samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * self.out_format.bytes());
        for &s in samples {
            self.out_format.write_sample(s, self.out.is_big_endian, &mut out);
        }
        out
    }
}

/// Split interleaved bytes into normalized planes. A trailing partial frame
/// is ignored.
pub fn deinterleave(
    bytes: &[u8],
    format: SampleFormat,
    channels: usize,
    big_endian: bool,
) -> Vec<Vec<f32>> {
    let channels = channels.max(1);
    let width = format.bytes();
    let frames = bytes.len() / (width * channels);
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for frame in bytes.chunks_exact(width * channels) {
        for (ch, plane) in planes.iter_mut().enumerate() {
            plane.push(format.read_sample(&frame[ch * width..], big_endian));
        }
    }
    planes
}

/// Interleave `planes` into `dst_channels` channels.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
fn map_channels(planes: &[Vec<f32>], dst_channels: usize) -> Vec<f32> {
    let src_channels = planes.len();
    let frames = planes.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * dst_channels);
    if src_channels == 0 {
        out.resize(frames * dst_channels, 0.0);
        return out;
    }
    for i in 0..frames {
        for dst_ch in 0..dst_channels {
            let v = match (src_channels, dst_channels) {
                (2, 1) => 0.5 * (planes[0][i] + planes[1][i]),
                _ => planes[dst_ch.min(src_channels - 1)][i],
            };
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_frame(rate: u32, planes: &[&[i16]]) -> Frame {
        let planes = planes
            .iter()
            .map(|p| p.iter().flat_map(|v| v.to_le_bytes()).collect())
            .collect();
        Frame::planar(0, rate, SampleFormat::S16, planes)
    }

    fn s16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn same_rate_converts_layout_only() {
        let mut r = Resampler::new(8_000, StreamDescriptor::pcm(8_000, 2, 16), 256).unwrap();
        let out = r.convert(Some(&s16_frame(8_000, &[&[100, -200]]))).unwrap();
        assert_eq!(s16(&out), vec![100, 100, -200, -200]);
        assert!(r.convert(None).unwrap().is_empty());
    }

    #[test]
    fn stereo_downmix_averages() {
        let mut r = Resampler::new(8_000, StreamDescriptor::pcm(8_000, 1, 16), 256).unwrap();
        let out = r.convert(Some(&s16_frame(8_000, &[&[100, 0], &[300, 0]]))).unwrap();
        assert_eq!(s16(&out), vec![200, 0]);
    }

    #[test]
    fn big_endian_output_swaps_bytes() {
        let mut d = StreamDescriptor::pcm(8_000, 1, 16);
        d.is_big_endian = true;
        let mut r = Resampler::new(8_000, d, 256).unwrap();
        let out = r.convert(Some(&s16_frame(8_000, &[&[0x0102]]))).unwrap();
        assert_eq!(out, vec![0x01, 0x02]);
    }

    #[test]
    fn rate_change_flush_yields_expected_length() {
        let mut r = Resampler::new(48_000, StreamDescriptor::pcm(44_100, 2, 16), 1024).unwrap();
        let input: Vec<i16> = (0..4_800).map(|i| ((i % 100) * 100) as i16).collect();
        let frame = s16_frame(48_000, &[&input, &input]);

        let mut total = r.convert(Some(&frame)).unwrap().len();
        total += r.convert(None).unwrap().len();
        // 4800 frames at 48k -> 4410 frames at 44.1k, 4 bytes per frame.
        assert_eq!(total, 4_410 * 4);
        assert!(r.convert(None).unwrap().is_empty());
    }

    #[test]
    fn reset_discards_pending_input() {
        let mut r = Resampler::new(48_000, StreamDescriptor::pcm(44_100, 1, 16), 1024).unwrap();
        let input = vec![1_000i16; 500];
        assert!(r.convert(Some(&s16_frame(48_000, &[&input]))).unwrap().is_empty());
        r.reset();
        assert!(r.convert(None).unwrap().is_empty());
    }

    #[test]
    fn interleaved_input_is_accepted() {
        let mut r = Resampler::new(8_000, StreamDescriptor::float(8_000, 1), 256).unwrap();
        let bytes: Vec<u8> = [16_384i16, -16_384]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let out = r
            .convert_interleaved(Some(&bytes), SampleFormat::S16, 1, false)
            .unwrap();
        let floats: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, vec![0.5, -0.5]);
    }

    #[test]
    fn rejects_zero_rates() {
        assert!(Resampler::new(0, StreamDescriptor::default(), 256).is_err());
    }

    #[test]
    fn deinterleave_ignores_partial_frames() {
        let bytes = [0u8, 0x40, 0, 0xc0, 0xff];
        let planes = deinterleave(&bytes, SampleFormat::S16, 2, false);
        assert_eq!(planes, vec![vec![0.5], vec![-0.5]]);
    }
}
