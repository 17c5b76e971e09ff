//! Symphonia-backed demuxer/decoder.
//!
//! Probes the container, selects the first decodable track and hands out
//! packets and planar frames in the track's native sample layout.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, MetadataRevision};
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use symphonia::core::units::Time;

use super::{BackendError, BackendResult, DecodeBackend, SourceInfo};
use crate::format::{SampleFormat, TimeBase};
use crate::frame::{Frame, Packet};

/// Demuxer + decoder over any Symphonia [`MediaSource`].
pub struct SymphoniaReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    info: SourceInfo,
}

impl SymphoniaReader {
    /// Open a local file, using its extension as a probe hint.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let byte_len = file.metadata().ok().map(|m| m.len());

        let mut hint = Hint::new();
        let ext = path.extension().and_then(|e| e.to_str());
        if let Some(ext) = ext {
            hint.with_extension(ext);
        }

        let mut reader = Self::from_media_source(Box::new(file), hint)?;
        reader.info.container = ext.map(|e| e.to_ascii_uppercase());
        if let (Some(len), Some(us)) = (byte_len, reader.info.duration_us) {
            if us > 0 {
                let bps = u128::from(len) * 8 * 1_000_000 / us as u128;
                reader.info.bit_rate = u32::try_from(bps).ok();
            }
        }
        Ok(reader)
    }

    /// Probe `source` and prepare a decoder for its first audio track.
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let mut probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe media source")?;

        let mut metadata = BTreeMap::new();
        if let Some(meta) = probed.metadata.get() {
            if let Some(rev) = meta.current() {
                collect_tags(rev, &mut metadata);
            }
        }

        let mut format = probed.format;
        if let Some(rev) = format.metadata().current() {
            collect_tags(rev, &mut metadata);
        }

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
            .ok_or_else(|| anyhow!("No audio stream was found"))?;

        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;
        let channels = codec_params
            .channels
            .map(|c| c.count())
            .filter(|c| *c > 0)
            .ok_or_else(|| anyhow!("Unknown channels"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("create decoder")?;

        let native_format = native_format_from_params(&codec_params);
        let time_base = codec_params
            .time_base
            .map(|tb| TimeBase::new(tb.numer, tb.denom))
            .unwrap_or_else(|| TimeBase::per_sample(rate));

        let info = SourceInfo {
            descriptor: native_format.descriptor(rate, channels as u16),
            native_format,
            audio_stream: track_id,
            time_base,
            duration_us: duration_us_from_codec_params(&codec_params),
            bit_rate: None,
            codec: codec_name_from_params(&codec_params),
            container: None,
            metadata,
        };

        tracing::debug!(
            track = track_id,
            rate_hz = rate,
            channels,
            format = native_format.name(),
            "probed source"
        );

        Ok(Self {
            format,
            decoder,
            info,
        })
    }
}

impl DecodeBackend for SymphoniaReader {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_packet(&mut self) -> BackendResult<Packet> {
        match self.format.next_packet() {
            Ok(p) => {
                let stream = p.track_id();
                let pts = i64::try_from(p.ts()).unwrap_or(i64::MAX);
                let duration = p.dur();
                Ok(Packet::new(stream, pts, duration, p.data))
            }
            Err(e) => Err(map_error(e)),
        }
    }

    fn decode(&mut self, packet: Packet) -> BackendResult<Option<Frame>> {
        let pts = packet.pts;
        let packet = symphonia::core::formats::Packet::new_from_boxed_slice(
            packet.stream,
            pts.max(0) as u64,
            packet.duration,
            packet.data,
        );
        match self.decoder.decode(&packet) {
            Ok(buf) => Ok(frame_from_buffer(buf, pts)),
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                Err(BackendError::Retry)
            }
            Err(e) => Err(map_error(e)),
        }
    }

    fn drain(&mut self) -> BackendResult<Option<Frame>> {
        // Symphonia decoders emit everything they can per packet.
        Ok(None)
    }

    fn seek(&mut self, target_us: i64) -> BackendResult<i64> {
        let us = target_us.max(0) as u64;
        let time = Time::new(us / 1_000_000, (us % 1_000_000) as f64 / 1_000_000.0);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.info.audio_stream),
                },
            )
            .map_err(map_error)?;
        let actual = i64::try_from(seeked.actual_ts).unwrap_or(i64::MAX);
        Ok(self.info.time_base.to_micros(actual))
    }

    fn flush(&mut self) {
        self.decoder.reset();
    }
}

/// Translate Symphonia errors into backend outcomes.
fn map_error(err: SymphoniaError) -> BackendError {
    match err {
        SymphoniaError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            BackendError::EndOfStream
        }
        SymphoniaError::ResetRequired => BackendError::EndOfStream,
        SymphoniaError::IoError(e) => {
            BackendError::failed(e.raw_os_error().map(|c| -c).unwrap_or(-5), e.to_string())
        }
        SymphoniaError::DecodeError(msg) => BackendError::failed(-22, msg),
        SymphoniaError::SeekError(kind) => BackendError::failed(-29, format!("seek: {kind:?}")),
        SymphoniaError::Unsupported(msg) => BackendError::failed(-95, msg),
        SymphoniaError::LimitError(msg) => BackendError::failed(-7, msg),
    }
}

fn collect_tags(rev: &MetadataRevision, out: &mut BTreeMap<String, String>) {
    for tag in rev.tags() {
        let key = tag.key.replace('_', " ");
        out.insert(key, tag.value.to_string());
    }
}

/// Convert a decoded buffer into a planar frame in its native layout.
///
/// Layouts the rest of the pipeline does not carry are widened to `s32`.
fn frame_from_buffer(buf: AudioBufferRef<'_>, pts: i64) -> Option<Frame> {
    if buf.frames() == 0 {
        return None;
    }
    let frame = match buf {
        AudioBufferRef::U8(b) => planar(&*b, pts, SampleFormat::U8, |s, out| out.push(s)),
        AudioBufferRef::S8(b) => planar(&*b, pts, SampleFormat::S8, |s, out| out.push(s as u8)),
        AudioBufferRef::U16(b) => planar(&*b, pts, SampleFormat::U16, |s, out| {
            out.extend_from_slice(&s.to_le_bytes())
        }),
        AudioBufferRef::S16(b) => planar(&*b, pts, SampleFormat::S16, |s, out| {
            out.extend_from_slice(&s.to_le_bytes())
        }),
        AudioBufferRef::U24(b) => planar(&*b, pts, SampleFormat::S32, |s, out| {
            let centered = (s.inner() as i32 - 0x80_0000) << 8;
            out.extend_from_slice(&centered.to_le_bytes())
        }),
        AudioBufferRef::S24(b) => planar(&*b, pts, SampleFormat::S24, |s, out| {
            out.extend_from_slice(&s.inner().to_le_bytes()[..3])
        }),
        AudioBufferRef::U32(b) => planar(&*b, pts, SampleFormat::U32, |s, out| {
            out.extend_from_slice(&s.to_le_bytes())
        }),
        AudioBufferRef::S32(b) => planar(&*b, pts, SampleFormat::S32, |s, out| {
            out.extend_from_slice(&s.to_le_bytes())
        }),
        AudioBufferRef::F32(b) => planar(&*b, pts, SampleFormat::F32, |s, out| {
            out.extend_from_slice(&s.to_le_bytes())
        }),
        AudioBufferRef::F64(b) => planar(&*b, pts, SampleFormat::F64, |s, out| {
            out.extend_from_slice(&s.to_le_bytes())
        }),
    };
    Some(frame)
}

fn planar<S: Sample>(
    buf: &AudioBuffer<S>,
    pts: i64,
    format: SampleFormat,
    mut put: impl FnMut(S, &mut Vec<u8>),
) -> Frame {
    let channels = buf.spec().channels.count();
    let planes = (0..channels)
        .map(|ch| {
            let mut out = Vec::with_capacity(buf.frames() * format.bytes());
            for &s in buf.chan(ch) {
                put(s, &mut out);
            }
            out
        })
        .collect();
    Frame::planar(pts, buf.spec().rate, format, planes)
}

/// Best-effort guess of the layout the decoder will produce.
fn native_format_from_params(params: &CodecParameters) -> SampleFormat {
    use symphonia::core::codecs::*;
    use symphonia::core::sample::SampleFormat as Native;

    if let Some(native) = params.sample_format {
        return match native {
            Native::U8 => SampleFormat::U8,
            Native::U16 => SampleFormat::U16,
            Native::U24 => SampleFormat::S32,
            Native::U32 => SampleFormat::U32,
            Native::S8 => SampleFormat::S8,
            Native::S16 => SampleFormat::S16,
            Native::S24 => SampleFormat::S24,
            Native::S32 => SampleFormat::S32,
            Native::F32 => SampleFormat::F32,
            Native::F64 => SampleFormat::F64,
        };
    }
    match params.codec {
        CODEC_TYPE_MP1 | CODEC_TYPE_MP2 | CODEC_TYPE_MP3 | CODEC_TYPE_AAC | CODEC_TYPE_VORBIS
        | CODEC_TYPE_OPUS => SampleFormat::F32,
        _ => match params.bits_per_sample.or(params.bits_per_coded_sample) {
            Some(bits) if bits <= 16 => SampleFormat::S16,
            Some(bits) if bits <= 24 => SampleFormat::S24,
            Some(_) => SampleFormat::S32,
            None => SampleFormat::S16,
        },
    }
}

/// Best-effort duration in microseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_us_from_codec_params(codec_params: &CodecParameters) -> Option<i64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    i64::try_from(u128::from(frames) * 1_000_000 / u128::from(rate)).ok()
}

/// Best-effort codec label used in stream info.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_U8 => "PCM_U8",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    #[test]
    fn duration_us_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_us_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_us_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(44_100);
        params.n_frames = Some(132_300);
        assert_eq!(duration_us_from_codec_params(&params), Some(3_000_000));
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC".to_string()));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_name_from_params(&params), Some("PCM_S16".to_string()));
        assert!(codec_name_from_params(&CodecParameters::new()).is_none());
    }

    #[test]
    fn native_format_prefers_declared_sample_format() {
        let mut params = CodecParameters::new();
        params.sample_format = Some(symphonia::core::sample::SampleFormat::S24);
        assert_eq!(native_format_from_params(&params), SampleFormat::S24);
    }

    #[test]
    fn native_format_falls_back_to_codec_and_bits() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_MP3;
        assert_eq!(native_format_from_params(&params), SampleFormat::F32);

        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        params.bits_per_sample = Some(16);
        assert_eq!(native_format_from_params(&params), SampleFormat::S16);
        params.bits_per_sample = Some(24);
        assert_eq!(native_format_from_params(&params), SampleFormat::S24);
    }

    #[test]
    fn seek_lands_at_or_before_the_target() {
        let path = crate::testing::temp_path("symphonia-seek.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..16_000 {
            w.write_sample((i % 1_000) as i16).unwrap();
        }
        w.finalize().unwrap();

        let mut reader = SymphoniaReader::open(&path).unwrap();
        let target = 1_250_000;
        let reached = reader.seek(target).unwrap();
        assert!(reached <= target, "overshot to {reached}");
        assert!(reached > target - 1_000_000);

        let packet = reader.next_packet().unwrap();
        assert_eq!(reader.info().time_base.to_micros(packet.pts), reached);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn map_error_treats_eof_as_end_of_stream() {
        let eof = SymphoniaError::IoError(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert_eq!(map_error(eof), BackendError::EndOfStream);
        match map_error(SymphoniaError::DecodeError("bad frame")) {
            BackendError::Failed { code, message } => {
                assert_eq!(code, -22);
                assert_eq!(message, "bad frame");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
