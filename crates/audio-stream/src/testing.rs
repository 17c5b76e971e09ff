//! Scripted backends and sinks shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::backend::{
    BackendError, BackendResult, DecodeBackend, EncodeBackend, EncoderFormat, SourceInfo,
};
use crate::format::{SampleFormat, TimeBase};
use crate::frame::{Frame, Packet};
use crate::sink::AudioSink;

/// Unique path under the system temp dir.
pub(crate) fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "audio-stream-{}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        name
    ))
}

/// Decoder producing a deterministic s16 ramp in 160-frame packets.
pub(crate) struct MockSource {
    info: SourceInfo,
    channels: usize,
    total: usize,
    packet_frames: usize,
    cursor: usize,
    foreign: bool,
    foreign_due: bool,
    failing_packet: Option<usize>,
    retrying_packet: Option<usize>,
    failing_seeks: bool,
    decoded: usize,
    retries_per_packet: usize,
    retries_left: usize,
    empty_packets: bool,
    empty_due: bool,
    drain_frames: usize,
}

impl MockSource {
    pub(crate) fn new(rate: u32, channels: u16, total_frames: usize) -> Self {
        let time_base = TimeBase::per_sample(rate);
        Self {
            info: SourceInfo {
                descriptor: SampleFormat::S16.descriptor(rate, channels),
                native_format: SampleFormat::S16,
                audio_stream: 0,
                time_base,
                duration_us: Some(time_base.to_micros(total_frames as i64)),
                bit_rate: Some(rate * u32::from(channels) * 16),
                codec: Some("PCM_S16".to_string()),
                container: Some("MOCK".to_string()),
                metadata: BTreeMap::new(),
            },
            channels: usize::from(channels),
            total: total_frames,
            packet_frames: 160,
            cursor: 0,
            foreign: false,
            foreign_due: false,
            failing_packet: None,
            retrying_packet: None,
            failing_seeks: false,
            decoded: 0,
            retries_per_packet: 0,
            retries_left: 0,
            empty_packets: false,
            empty_due: false,
            drain_frames: 0,
        }
    }

    /// Interleave a packet of another stream after every audio packet.
    pub(crate) fn with_foreign_packets(mut self) -> Self {
        self.foreign = true;
        self
    }

    /// Make the `index`-th decode call fail.
    pub(crate) fn with_failing_packet(mut self, index: usize) -> Self {
        self.failing_packet = Some(index);
        self
    }

    /// Make the `index`-th decode call ask to be retried.
    pub(crate) fn with_retrying_packet(mut self, index: usize) -> Self {
        self.retrying_packet = Some(index);
        self
    }

    /// Answer `Retry` `n` times before every packet.
    pub(crate) fn with_demux_retries(mut self, n: usize) -> Self {
        self.retries_per_packet = n;
        self.retries_left = n;
        self
    }

    /// Follow every audio packet with an empty one on the same stream.
    pub(crate) fn with_empty_packets(mut self) -> Self {
        self.empty_packets = true;
        self
    }

    /// Hold back `frames` more ramp frames, released one packet at a time by
    /// `drain` once the container is exhausted.
    pub(crate) fn with_drain_frames(mut self, frames: usize) -> Self {
        self.drain_frames = frames;
        self
    }

    fn ramp(&self, range: Range<usize>) -> Vec<u8> {
        let mut data = Vec::with_capacity(range.len() * self.channels * 2);
        for i in range {
            for _ in 0..self.channels {
                data.extend_from_slice(&Self::sample(i).to_le_bytes());
            }
        }
        data
    }

    pub(crate) fn with_failing_seeks(mut self) -> Self {
        self.failing_seeks = true;
        self
    }

    /// Sample value of frame `i` (same on every channel, never zero).
    pub(crate) fn sample(i: usize) -> i16 {
        ((i % 2_000) as i16 + 1) * 3
    }

    /// Little-endian bytes of mono frames `range`.
    pub(crate) fn sample_bytes(range: Range<usize>) -> Vec<u8> {
        range.flat_map(|i| Self::sample(i).to_le_bytes()).collect()
    }
}

impl DecodeBackend for MockSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_packet(&mut self) -> BackendResult<Packet> {
        if self.foreign_due {
            self.foreign_due = false;
            return Ok(Packet::new(1, 0, 0, vec![0xab; 7]));
        }
        if self.empty_due {
            self.empty_due = false;
            return Ok(Packet::new(0, self.cursor as i64, 0, Vec::new()));
        }
        if self.cursor >= self.total {
            return Err(BackendError::EndOfStream);
        }
        if self.retries_left > 0 {
            self.retries_left -= 1;
            return Err(BackendError::Retry);
        }
        self.retries_left = self.retries_per_packet;
        let start = self.cursor;
        let end = (start + self.packet_frames).min(self.total);
        let data = self.ramp(start..end);
        self.cursor = end;
        self.foreign_due = self.foreign;
        self.empty_due = self.empty_packets;
        Ok(Packet::new(0, start as i64, (end - start) as u64, data))
    }

    fn decode(&mut self, packet: Packet) -> BackendResult<Option<Frame>> {
        let index = self.decoded;
        self.decoded += 1;
        if self.failing_packet == Some(index) {
            return Err(BackendError::failed(-22, "corrupt packet"));
        }
        if self.retrying_packet == Some(index) {
            return Err(BackendError::Retry);
        }
        Ok(Some(Frame::interleaved(
            packet.pts,
            self.info.descriptor.sample_rate,
            self.channels,
            SampleFormat::S16,
            packet.data.into_vec(),
        )))
    }

    fn drain(&mut self) -> BackendResult<Option<Frame>> {
        if self.drain_frames == 0 {
            return Ok(None);
        }
        let start = self.total;
        let end = start + self.drain_frames.min(self.packet_frames);
        self.drain_frames -= end - start;
        self.total = end;
        self.cursor = end;
        Ok(Some(Frame::interleaved(
            start as i64,
            self.info.descriptor.sample_rate,
            self.channels,
            SampleFormat::S16,
            self.ramp(start..end),
        )))
    }

    fn seek(&mut self, target_us: i64) -> BackendResult<i64> {
        if self.failing_seeks {
            return Err(BackendError::failed(-29, "source is not seekable"));
        }
        let frame = (self.info.time_base.from_micros(target_us).max(0) as usize).min(self.total);
        let aligned = frame / self.packet_frames * self.packet_frames;
        self.cursor = aligned;
        self.foreign_due = false;
        Ok(self.info.time_base.to_micros(aligned as i64))
    }

    fn flush(&mut self) {}
}

/// Everything a [`MockEncoder`] was asked to do.
#[derive(Debug, Default)]
pub(crate) struct EncoderLog {
    /// `(pts, samples)` of every frame sent.
    pub frames: Vec<(i64, usize)>,
    /// `(pts, duration)` of every packet muxed, in the stream time base.
    pub packets: Vec<(i64, u64)>,
    pub end_signalled: bool,
    pub finished: usize,
    /// Sends refused with `Retry`.
    pub retries: usize,
}

/// PCM "encoder" with a 1/1000 container time base.
pub(crate) struct MockEncoder {
    format: EncoderFormat,
    queue: VecDeque<Packet>,
    flushed: bool,
    busy_sends: bool,
    busy: bool,
    log: Arc<Mutex<EncoderLog>>,
}

impl MockEncoder {
    pub(crate) fn new(
        rate: u32,
        channels: u16,
        frame_samples: usize,
    ) -> (Self, Arc<Mutex<EncoderLog>>) {
        let log = Arc::new(Mutex::new(EncoderLog::default()));
        let descriptor = SampleFormat::S16.descriptor(rate, channels);
        let encoder = Self {
            format: EncoderFormat {
                descriptor,
                format: SampleFormat::S16,
                frame_samples,
                time_base: TimeBase::per_sample(rate),
                bit_rate: rate * u32::from(channels) * 16,
            },
            queue: VecDeque::new(),
            flushed: false,
            busy_sends: false,
            busy: false,
            log: log.clone(),
        };
        (encoder, log)
    }

    /// Refuse every other `send_frame` with `Retry`.
    pub(crate) fn with_busy_sends(mut self) -> Self {
        self.busy_sends = true;
        self
    }
}

impl EncodeBackend for MockEncoder {
    fn format(&self) -> &EncoderFormat {
        &self.format
    }

    fn send_frame(&mut self, frame: Option<Frame>) -> BackendResult<()> {
        let mut log = self.log.lock().unwrap();
        if self.busy_sends {
            self.busy = !self.busy;
            if self.busy {
                log.retries += 1;
                return Err(BackendError::Retry);
            }
        }
        match frame {
            Some(frame) => {
                log.frames.push((frame.pts, frame.samples));
                let pts = frame.pts;
                let samples = frame.samples as u64;
                self.queue
                    .push_back(Packet::new(0, pts, samples, frame.into_interleaved_bytes()));
            }
            None => {
                log.end_signalled = true;
                self.flushed = true;
            }
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> BackendResult<Packet> {
        match self.queue.pop_front() {
            Some(p) => Ok(p),
            None if self.flushed => Err(BackendError::EndOfStream),
            None => Err(BackendError::Retry),
        }
    }

    fn stream_time_base(&self) -> TimeBase {
        TimeBase::new(1, 1000)
    }

    fn write_packet(&mut self, packet: Packet) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .packets
            .push((packet.pts, packet.duration));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.log.lock().unwrap().finished += 1;
        Ok(())
    }
}

/// Sink that records every write and paces itself like a device would.
pub(crate) struct RecordingSink {
    buffer_size: usize,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_after: Option<usize>,
    pace: Duration,
    query_delay: Duration,
}

impl RecordingSink {
    pub(crate) fn new(buffer_size: usize) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (Self::sharing(buffer_size, writes.clone()), writes)
    }

    /// Sink appending to an existing log, so several runs share one record.
    pub(crate) fn sharing(buffer_size: usize, writes: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
        Self {
            buffer_size,
            writes,
            fail_after: None,
            pace: Duration::from_millis(1),
            query_delay: Duration::ZERO,
        }
    }

    /// Fail every write once the log holds `n` entries.
    pub(crate) fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Stall in `buffer_size`, like a device that takes a while to report.
    pub(crate) fn slow_buffer_query(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }
}

impl AudioSink for RecordingSink {
    fn buffer_size(&self) -> usize {
        std::thread::sleep(self.query_delay);
        self.buffer_size
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        {
            let mut writes = self.writes.lock().unwrap();
            if self.fail_after.is_some_and(|n| writes.len() >= n) {
                return Err(anyhow!("device disappeared"));
            }
            writes.push(data.to_vec());
        }
        std::thread::sleep(self.pace);
        Ok(data.len())
    }
}
