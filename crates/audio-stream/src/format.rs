//! Sample layouts and time bases.
//!
//! A [`StreamDescriptor`] is what callers ask for; a [`SampleFormat`] is the
//! resolved byte layout of one sample. All conversions go through normalized
//! `f32` (`-1.0..1.0`), the same intermediate the decode/resample stages use.

use anyhow::{Result, anyhow};

pub use audio_stream_types::StreamDescriptor;

/// Byte layout of a single sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S8,
    U16,
    S16,
    /// Packed 3-byte signed integer.
    S24,
    U32,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    /// Resolve the sample layout described by `desc`.
    ///
    /// Returns an error for combinations no stage can produce (for example
    /// 16-bit floats or unsigned 24-bit).
    pub fn from_descriptor(desc: &StreamDescriptor) -> Result<Self> {
        let format = match (desc.is_float, desc.is_unsigned, desc.bit_depth) {
            (true, _, 32) => SampleFormat::F32,
            (true, _, 64) => SampleFormat::F64,
            (false, true, 8) => SampleFormat::U8,
            (false, false, 8) => SampleFormat::S8,
            (false, true, 16) => SampleFormat::U16,
            (false, false, 16) => SampleFormat::S16,
            (false, false, 24) => SampleFormat::S24,
            (false, true, 32) => SampleFormat::U32,
            (false, false, 32) => SampleFormat::S32,
            (float, unsigned, depth) => {
                return Err(anyhow!(
                    "unsupported sample format: depth={depth} float={float} unsigned={unsigned}"
                ));
            }
        };
        Ok(format)
    }

    /// Descriptor for this layout at `sample_rate`/`channels` (little-endian).
    pub fn descriptor(self, sample_rate: u32, channels: u16) -> StreamDescriptor {
        StreamDescriptor {
            sample_rate,
            channels,
            bit_depth: self.bits(),
            is_float: self.is_float(),
            is_unsigned: self.is_unsigned(),
            is_big_endian: false,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::S8 => 1,
            SampleFormat::U16 | SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::U32 | SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    pub fn bits(self) -> u16 {
        self.bytes() as u16 * 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32 | SampleFormat::F64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, SampleFormat::U8 | SampleFormat::U16 | SampleFormat::U32)
    }

    /// Short label used in logs and stream info.
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S8 => "s8",
            SampleFormat::U16 => "u16",
            SampleFormat::S16 => "s16",
            SampleFormat::S24 => "s24",
            SampleFormat::U32 => "u32",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
        }
    }

    /// Bytes of one silent sample.
    ///
    /// Zero for signed and float layouts, mid-scale for unsigned ones.
    pub fn silence(self, big_endian: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes());
        self.write_sample(0.0, big_endian, &mut out);
        out
    }

    /// Decode one sample starting at `bytes[0]` into normalized `f32`.
    ///
    /// `bytes` must hold at least [`SampleFormat::bytes`] bytes.
    pub fn read_sample(self, bytes: &[u8], big_endian: bool) -> f32 {
        let width = self.bytes();
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(&bytes[..width]);
        if big_endian {
            raw[..width].reverse();
        }
        match self {
            SampleFormat::U8 => (f32::from(raw[0]) - 128.0) / 128.0,
            SampleFormat::S8 => f32::from(raw[0] as i8) / 128.0,
            SampleFormat::U16 => {
                (f32::from(u16::from_le_bytes([raw[0], raw[1]])) - 32_768.0) / 32_768.0
            }
            SampleFormat::S16 => f32::from(i16::from_le_bytes([raw[0], raw[1]])) / 32_768.0,
            SampleFormat::S24 => {
                let v = i32::from_le_bytes([0, raw[0], raw[1], raw[2]]) >> 8;
                v as f32 / 8_388_608.0
            }
            SampleFormat::U32 => {
                let v = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                ((f64::from(v) - 2_147_483_648.0) / 2_147_483_648.0) as f32
            }
            SampleFormat::S32 => {
                let v = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                (f64::from(v) / 2_147_483_648.0) as f32
            }
            SampleFormat::F32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            SampleFormat::F64 => f64::from_le_bytes(raw) as f32,
        }
    }

    /// Encode one normalized sample and append it to `out`.
    ///
    /// Integer layouts clamp to their range.
    pub fn write_sample(self, value: f32, big_endian: bool, out: &mut Vec<u8>) {
        let start = out.len();
        let v = f64::from(if value.is_finite() { value } else { 0.0 });
        match self {
            SampleFormat::U8 => out.push((v * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8),
            SampleFormat::S8 => out.push((v * 128.0).round().clamp(-128.0, 127.0) as i8 as u8),
            SampleFormat::U16 => {
                let s = (v * 32_768.0 + 32_768.0).round().clamp(0.0, 65_535.0) as u16;
                out.extend_from_slice(&s.to_le_bytes());
            }
            SampleFormat::S16 => {
                let s = (v * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
                out.extend_from_slice(&s.to_le_bytes());
            }
            SampleFormat::S24 => {
                let s = (v * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                out.extend_from_slice(&s.to_le_bytes()[..3]);
            }
            SampleFormat::U32 => {
                let s = (v * 2_147_483_648.0 + 2_147_483_648.0)
                    .round()
                    .clamp(0.0, 4_294_967_295.0) as u32;
                out.extend_from_slice(&s.to_le_bytes());
            }
            SampleFormat::S32 => {
                let s = (v * 2_147_483_648.0)
                    .round()
                    .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                out.extend_from_slice(&s.to_le_bytes());
            }
            SampleFormat::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            SampleFormat::F64 => out.extend_from_slice(&v.to_le_bytes()),
        }
        if big_endian {
            out[start..].reverse();
        }
    }
}

/// Pad `buf` with silence until it is `len` bytes long.
///
/// The silence pattern stays aligned to sample boundaries counted from the
/// start of `buf`.
pub fn pad_with_silence(buf: &mut Vec<u8>, len: usize, format: SampleFormat, big_endian: bool) {
    if buf.len() >= len {
        return;
    }
    let pattern = format.silence(big_endian);
    if pattern.iter().all(|b| *b == 0) {
        buf.resize(len, 0);
        return;
    }
    let width = pattern.len();
    while buf.len() < len {
        let idx = buf.len() % width;
        buf.push(pattern[idx]);
    }
}

/// Rational time unit: one tick is `num / den` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

/// Microsecond time base used for positions and lengths.
pub const MICROS: TimeBase = TimeBase {
    num: 1,
    den: 1_000_000,
};

impl TimeBase {
    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num: num.max(1),
            den: den.max(1),
        }
    }

    /// One tick per sample at `sample_rate`.
    pub fn per_sample(sample_rate: u32) -> Self {
        Self::new(1, sample_rate)
    }

    /// Convert `ts` ticks to microseconds.
    pub fn to_micros(self, ts: i64) -> i64 {
        rescale(ts, self, MICROS)
    }

    /// Convert microseconds to ticks of this time base.
    pub fn from_micros(self, us: i64) -> i64 {
        rescale(us, MICROS, self)
    }
}

/// Rescale `ts` from one time base to another, rounding to nearest
/// (halves away from zero).
pub fn rescale(ts: i64, from: TimeBase, to: TimeBase) -> i64 {
    let num = i128::from(ts) * i128::from(from.num) * i128::from(to.den);
    let den = i128::from(from.den) * i128::from(to.num);
    let half = den / 2;
    let q = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    q.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// `ceil(value * mul / div)` on unsigned counts.
pub fn rescale_up(value: u64, mul: u64, div: u64) -> u64 {
    if div == 0 {
        return 0;
    }
    let v = u128::from(value) * u128::from(mul);
    v.div_ceil(u128::from(div)).min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_formats_from_descriptors() {
        let d = StreamDescriptor::pcm(44_100, 2, 16);
        assert_eq!(SampleFormat::from_descriptor(&d).unwrap(), SampleFormat::S16);

        let d = StreamDescriptor::float(48_000, 2);
        assert_eq!(SampleFormat::from_descriptor(&d).unwrap(), SampleFormat::F32);

        let mut d = StreamDescriptor::pcm(8_000, 1, 8);
        d.is_unsigned = true;
        assert_eq!(SampleFormat::from_descriptor(&d).unwrap(), SampleFormat::U8);
    }

    #[test]
    fn rejects_unsupported_formats() {
        let mut d = StreamDescriptor::pcm(44_100, 2, 16);
        d.is_float = true;
        assert!(SampleFormat::from_descriptor(&d).is_err());

        let mut d = StreamDescriptor::pcm(44_100, 2, 24);
        d.is_unsigned = true;
        assert!(SampleFormat::from_descriptor(&d).is_err());
    }

    #[test]
    fn silence_is_mid_scale_for_unsigned() {
        assert_eq!(SampleFormat::S16.silence(false), vec![0, 0]);
        assert_eq!(SampleFormat::U8.silence(false), vec![0x80]);
        assert_eq!(SampleFormat::U16.silence(false), vec![0x00, 0x80]);
        assert_eq!(SampleFormat::U16.silence(true), vec![0x80, 0x00]);
    }

    #[test]
    fn sample_conversion_preserves_values() {
        for format in [
            SampleFormat::S16,
            SampleFormat::S24,
            SampleFormat::S32,
            SampleFormat::U16,
            SampleFormat::F32,
            SampleFormat::F64,
        ] {
            for big_endian in [false, true] {
                let mut buf = Vec::new();
                format.write_sample(0.5, big_endian, &mut buf);
                assert_eq!(buf.len(), format.bytes());
                let back = format.read_sample(&buf, big_endian);
                assert!((back - 0.5).abs() < 1e-3, "{format:?} gave {back}");
            }
        }
    }

    #[test]
    fn integer_writes_clamp() {
        let mut buf = Vec::new();
        SampleFormat::S16.write_sample(4.0, false, &mut buf);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), i16::MAX);
        buf.clear();
        SampleFormat::S16.write_sample(-4.0, false, &mut buf);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), i16::MIN);
    }

    #[test]
    fn pad_with_silence_keeps_pattern_aligned() {
        let mut buf = vec![0x10, 0x20];
        pad_with_silence(&mut buf, 6, SampleFormat::U16, false);
        assert_eq!(buf, vec![0x10, 0x20, 0x00, 0x80, 0x00, 0x80]);

        let mut buf = vec![1u8; 3];
        pad_with_silence(&mut buf, 8, SampleFormat::S16, false);
        assert_eq!(&buf[3..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn time_base_conversions() {
        let tb = TimeBase::per_sample(44_100);
        assert_eq!(tb.to_micros(44_100), 1_000_000);
        assert_eq!(tb.to_micros(22_050), 500_000);
        assert_eq!(tb.from_micros(2_000_000), 88_200);
        assert_eq!(TimeBase::new(1, 1000).to_micros(-5), -5_000);
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        let from = TimeBase::per_sample(48_000);
        let to = TimeBase::new(1, 1000);
        assert_eq!(rescale(1_024, from, to), 21);
        assert_eq!(rescale(1_032, from, to), 22);
        assert_eq!(rescale(-1_032, from, to), -22);
    }

    #[test]
    fn rescale_up_rounds_up() {
        assert_eq!(rescale_up(1024, 44_100, 48_000), 941);
        assert_eq!(rescale_up(0, 44_100, 48_000), 0);
        assert_eq!(rescale_up(10, 1, 0), 0);
    }
}
