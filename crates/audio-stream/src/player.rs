//! Playback controller.
//!
//! [`AudioPlayer`] owns one worker thread at a time. The worker exclusively
//! owns the [`StreamReader`] and the [`AudioSink`]; the controller only
//! touches the shared [`PlayerStatusState`] flags and the control channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use audio_stream_types::{PlaybackEndReason, PlaybackState, PlayerStatus};

use crate::config::{PlaybackConfig, StreamOptions};
use crate::control::{ControlClient, ControlError, ControlRequest, ControlServer, control_channel};
use crate::format::{SampleFormat, StreamDescriptor, pad_with_silence};
use crate::sink::{AudioSink, CpalSink};
use crate::status::PlayerStatusState;
use crate::stream::StreamReader;

/// Opens the reader for a path. Runs on the controlling thread for the
/// first run after `open` and on the worker thread for restarts.
pub type SourceFactory = dyn Fn(&Path, &StreamOptions) -> Result<StreamReader> + Send + Sync;

/// Opens the sink for the reader's output layout. Always runs on the worker
/// thread, so sinks need not be `Send`.
pub type SinkFactory =
    dyn Fn(&StreamDescriptor, &PlaybackConfig) -> Result<Box<dyn AudioSink>> + Send + Sync;

/// Reference point for [`AudioPlayer::seek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the stream.
    Start,
    /// Relative to the current position.
    Current,
    /// `offset` before the end of the stream.
    End,
}

struct Session {
    join: JoinHandle<()>,
    control: ControlClient,
}

pub struct AudioPlayer {
    config: PlaybackConfig,
    open_source: Arc<SourceFactory>,
    open_sink: Arc<SinkFactory>,
    status: Arc<PlayerStatusState>,
    path: Option<PathBuf>,
    options: StreamOptions,
    prepared: Option<StreamReader>,
    session: Option<Session>,
}

impl AudioPlayer {
    /// Player on the default decode backend and CPAL output.
    pub fn new(config: PlaybackConfig) -> Self {
        Self::with_factories(
            config,
            Arc::new(|path: &Path, options: &StreamOptions| -> Result<StreamReader> {
                StreamReader::open(path, options)
            }),
            Arc::new(|descriptor: &StreamDescriptor, config: &PlaybackConfig| -> Result<Box<dyn AudioSink>> {
                Ok(Box::new(CpalSink::open(descriptor, config)?) as Box<dyn AudioSink>)
            }),
        )
    }

    pub fn with_factories(
        config: PlaybackConfig,
        open_source: Arc<SourceFactory>,
        open_sink: Arc<SinkFactory>,
    ) -> Self {
        Self {
            config,
            open_source,
            open_sink,
            status: PlayerStatusState::shared(),
            path: None,
            options: StreamOptions::default(),
            prepared: None,
            session: None,
        }
    }

    /// Open `path` and start the worker muted.
    ///
    /// Audio is heard after the next [`AudioPlayer::play`].
    pub fn open(&mut self, path: impl AsRef<Path>, options: StreamOptions) -> Result<()> {
        let path = path.as_ref();
        self.stop();
        self.path = None;
        self.prepared = None;

        let reader = (self.open_source)(path, &options)
            .with_context(|| format!("open {:?}", path))?;
        self.status.reset(
            Some(path.display().to_string()),
            reader.length(),
            reader.info().to_string(),
        );
        tracing::info!(path = %path.display(), "opened");

        self.path = Some(path.to_path_buf());
        self.options = options;
        self.prepared = Some(reader);

        self.pause();
        self.play()
    }

    /// Start the worker (when stopped) or resume output (when paused).
    pub fn play(&mut self) -> Result<()> {
        if self.is_running() {
            self.status.set_paused(false);
            return Ok(());
        }
        self.reap();

        let path = self
            .path
            .clone()
            .ok_or_else(|| anyhow!("no file opened"))?;
        let reader = match self.prepared.take() {
            Some(reader) => reader,
            None => (self.open_source)(&path, &self.options)
                .with_context(|| format!("open {:?}", path))?,
        };

        let (control, server) = control_channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let status = self.status.clone();
        let open_sink = self.open_sink.clone();
        let config = self.config.clone();

        self.status.begin_run();
        self.status.set_playing(true);

        let join = thread::Builder::new()
            .name("stream-player".to_string())
            .spawn(move || {
                let mut worker = match open_sink(reader.descriptor(), &config)
                    .map(|sink| Worker::new(reader, sink, server))
                    .and_then(|mut worker| worker.prime(&status).map(|()| worker))
                {
                    Ok(worker) => worker,
                    Err(e) => {
                        status.set_error(format!("{e:#}"));
                        status.finish(PlaybackEndReason::Error);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                worker.run(&status);
            })
            .context("spawn playback worker")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e.context("open audio output"));
            }
            Err(_) => {
                let _ = join.join();
                self.status.set_playing(false);
                return Err(anyhow!("playback worker exited before starting"));
            }
        }

        tracing::info!(paused = self.status.is_paused(), "playback started");
        self.session = Some(Session { join, control });
        Ok(())
    }

    /// Mute output; the worker keeps running and emits silence.
    pub fn pause(&mut self) {
        self.status.set_paused(true);
    }

    /// Ask the worker to exit and wait for it.
    pub fn stop(&mut self) {
        self.status.set_playing(false);
        self.reap();
        self.status.set_paused(false);
    }

    /// Join a finished (or stopping) worker.
    fn reap(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session.control);
            if session.join.join().is_err() {
                tracing::warn!("playback worker panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.session.is_some() && self.status.is_playing()
    }

    pub fn state(&self) -> PlaybackState {
        if !self.is_running() {
            PlaybackState::Stopped
        } else if self.status.is_paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }

    fn control(&self, request: ControlRequest) -> Result<&ControlClient, ControlError> {
        match &self.session {
            Some(session) if self.status.is_playing() => Ok(&session.control),
            _ => {
                tracing::warn!(?request, "not playing");
                Err(ControlError::NotPlaying)
            }
        }
    }

    /// Current position in microseconds.
    pub fn position(&self) -> Result<i64, ControlError> {
        self.control(ControlRequest::GetPosition)?.position()
    }

    /// Seek to `us`; applied at the worker's next read.
    pub fn set_position(&self, us: i64) -> Result<(), ControlError> {
        let request = ControlRequest::SetPosition(us.max(0));
        self.control(request)?.request(request).map(|_| ())
    }

    pub fn loops(&self) -> Result<i32, ControlError> {
        self.control(ControlRequest::GetLoops)?.loops()
    }

    pub fn set_loops(&self, loops: i32) -> Result<(), ControlError> {
        let request = ControlRequest::SetLoops(loops);
        self.control(request)?.request(request).map(|_| ())
    }

    pub fn loop_count(&self) -> Result<u32, ControlError> {
        self.control(ControlRequest::GetLoopCount)?.loop_count()
    }

    /// Seek relative to `whence`.
    pub fn seek(&self, offset: i64, whence: Whence) -> Result<(), ControlError> {
        let target = match whence {
            Whence::Start => offset,
            Whence::Current => self.position()? + offset,
            Whence::End => self.length() - offset,
        };
        self.set_position(target)
    }

    /// Alias for [`AudioPlayer::position`].
    pub fn tell(&self) -> Result<i64, ControlError> {
        self.position()
    }

    pub fn playing(&self) -> bool {
        self.status.is_playing()
    }

    pub fn paused(&self) -> bool {
        self.status.is_paused()
    }

    pub fn error(&self) -> Option<String> {
        self.status.error()
    }

    /// Stream length in microseconds (`0` when unknown).
    pub fn length(&self) -> i64 {
        self.status.length_us()
    }

    pub fn info(&self) -> String {
        self.status.info()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn status(&self) -> PlayerStatus {
        let mut snapshot = self.status.snapshot();
        snapshot.state = self.state();
        snapshot
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-side pipeline: owns the reader, the sink and the control server.
struct Worker {
    reader: StreamReader,
    sink: Box<dyn AudioSink>,
    server: ControlServer,
    size: usize,
    format: SampleFormat,
    big_endian: bool,
    silence: Vec<u8>,
}

impl Worker {
    fn new(reader: StreamReader, sink: Box<dyn AudioSink>, server: ControlServer) -> Self {
        let size = sink.buffer_size().max(1);
        let descriptor = *reader.descriptor();
        let format = SampleFormat::from_descriptor(&descriptor).unwrap_or(SampleFormat::S16);
        let mut silence = Vec::with_capacity(size);
        pad_with_silence(&mut silence, size, format, descriptor.is_big_endian);
        Self {
            reader,
            sink,
            server,
            size,
            format,
            big_endian: descriptor.is_big_endian,
            silence,
        }
    }

    /// Emit the first buffer of silence of a paused start, before the
    /// controller can unpause.
    fn prime(&mut self, status: &PlayerStatusState) -> Result<()> {
        if status.is_paused() {
            self.sink.write(&self.silence)?;
        }
        Ok(())
    }

    /// One sink buffer per iteration, then at most one control request.
    fn run(mut self, status: &PlayerStatusState) {
        let mut reason = PlaybackEndReason::Stopped;
        while status.is_playing() {
            let result = if status.is_paused() {
                self.sink.write(&self.silence)
            } else {
                match self.reader.read(self.size) {
                    Ok(buf) if buf.is_empty() => {
                        reason = PlaybackEndReason::Eof;
                        break;
                    }
                    Ok(mut buf) => {
                        pad_with_silence(&mut buf, self.size, self.format, self.big_endian);
                        self.sink.write(&buf)
                    }
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                tracing::warn!("playback error: {e:#}");
                status.set_error(format!("{e:#}"));
                reason = PlaybackEndReason::Error;
                break;
            }
            self.server.service_one(&mut self.reader);
        }

        if reason == PlaybackEndReason::Eof {
            if let Err(e) = self.sink.drain() {
                tracing::warn!("sink drain failed: {e:#}");
            }
        }
        self.reader.close();
        status.finish(reason);
        tracing::info!(?reason, "playback worker finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::testing::{MockSource, RecordingSink};

    const BUFFER: usize = 256;

    type Writes = Arc<Mutex<Vec<Vec<u8>>>>;

    fn player_with(frames: usize, sink_fail_after: Option<usize>) -> (AudioPlayer, Writes) {
        player_with_sink(frames, move |sink| match sink_fail_after {
            Some(n) => sink.failing_after(n),
            None => sink,
        })
    }

    /// Player over a `frames`-long mock source; paths named `missing*` fail
    /// to open.
    fn player_with_sink(
        frames: usize,
        tune: impl Fn(RecordingSink) -> RecordingSink + Send + Sync + 'static,
    ) -> (AudioPlayer, Writes) {
        let writes: Writes = Arc::new(Mutex::new(Vec::new()));
        let sink_writes = writes.clone();
        let player = AudioPlayer::with_factories(
            PlaybackConfig::default(),
            Arc::new(move |path: &Path, options: &StreamOptions| -> Result<StreamReader> {
                if path.to_string_lossy().starts_with("missing") {
                    return Err(anyhow!("No such file"));
                }
                StreamReader::from_backend(Box::new(MockSource::new(8_000, 1, frames)), options)
            }),
            Arc::new(move |_d: &StreamDescriptor, _c: &PlaybackConfig| -> Result<Box<dyn AudioSink>> {
                let sink = tune(RecordingSink::sharing(BUFFER, sink_writes.clone()));
                Ok(Box::new(sink) as Box<dyn AudioSink>)
            }),
        );
        (player, writes)
    }

    fn options() -> StreamOptions {
        StreamOptions::default().with_format(8_000, 1, 16)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn open_starts_paused_and_emits_silence_first() {
        let (mut player, writes) = player_with(80_000, None);
        player.open("mock.wav", options().with_loops(0)).unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);

        player.pause();
        player.play().unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        wait_for(|| {
            writes
                .lock()
                .unwrap()
                .iter()
                .any(|w| w.iter().any(|b| *b != 0))
        });
        player.stop();

        let writes = writes.lock().unwrap();
        assert_eq!(writes[0].len(), BUFFER);
        assert!(writes[0].iter().all(|b| *b == 0));
        assert_eq!(player.state(), PlaybackState::Stopped);
    }

    #[test]
    fn silence_leads_even_when_the_device_is_slow_to_answer() {
        for _ in 0..20 {
            let (mut player, writes) =
                player_with_sink(80_000, |sink| sink.slow_buffer_query(Duration::from_millis(2)));
            player.open("mock.wav", options().with_loops(0)).unwrap();
            player.pause();
            player.play().unwrap();
            wait_for(|| !writes.lock().unwrap().is_empty());
            player.stop();

            let writes = writes.lock().unwrap();
            assert!(writes[0].iter().all(|b| *b == 0), "first buffer carried audio");
        }
    }

    #[test]
    fn failed_open_forgets_the_previous_file() {
        let (mut player, _writes) = player_with(80_000, None);
        player.open("mock.wav", options()).unwrap();
        assert_eq!(player.filename(), Some(Path::new("mock.wav")));

        assert!(player.open("missing.wav", options()).is_err());
        assert_eq!(player.filename(), None);
        assert_eq!(player.state(), PlaybackState::Stopped);
        let err = player.play().unwrap_err();
        assert!(err.to_string().contains("no file opened"));
    }

    #[test]
    fn set_loops_then_get_loops_over_the_channel() {
        let (mut player, _writes) = player_with(80_000, None);
        player.open("mock.wav", options()).unwrap();
        player.set_loops(3).unwrap();
        assert_eq!(player.loops(), Ok(3));
        assert_eq!(player.loop_count(), Ok(0));
        player.stop();
    }

    #[test]
    fn accessors_fail_fast_when_stopped() {
        let (player, _writes) = player_with(100, None);
        assert_eq!(player.position(), Err(ControlError::NotPlaying));
        assert_eq!(player.loops(), Err(ControlError::NotPlaying));
        assert_eq!(player.set_loops(1), Err(ControlError::NotPlaying));
        assert!(!player.playing());
    }

    #[test]
    fn worker_ends_at_end_of_source() {
        let (mut player, writes) = player_with(1_000, None);
        player.open("mock.wav", options().with_loops(1)).unwrap();
        player.play().unwrap();
        wait_for(|| !player.playing());

        let status = player.status();
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Eof));
        assert_eq!(status.state, PlaybackState::Stopped);
        assert!(status.error.is_none());

        let writes = writes.lock().unwrap();
        assert!(writes.iter().all(|w| w.len() == BUFFER));
        assert_eq!(player.position(), Err(ControlError::NotPlaying));
    }

    #[test]
    fn sink_errors_are_reported_in_status() {
        let (mut player, _writes) = player_with(80_000, Some(3));
        player.open("mock.wav", options()).unwrap();
        player.play().unwrap();
        wait_for(|| !player.playing());

        assert_eq!(player.error().as_deref(), Some("device disappeared"));
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
    }

    #[test]
    fn seek_moves_the_worker_position() {
        let (mut player, _writes) = player_with(80_000, None);
        player.open("mock.wav", options()).unwrap();
        player.play().unwrap();
        player.seek(5_000_000, Whence::Start).unwrap();
        wait_for(|| player.position().map(|p| p >= 5_000_000).unwrap_or(false));
        player.stop();
    }

    #[test]
    fn seek_from_end_uses_length() {
        let (mut player, _writes) = player_with(80_000, None);
        player.open("mock.wav", options()).unwrap();
        assert_eq!(player.length(), 10_000_000);
        player.pause();
        player.seek(2_000_000, Whence::End).unwrap();
        player.play().unwrap();
        wait_for(|| player.position().map(|p| p >= 8_000_000).unwrap_or(false));
        player.stop();
    }

    #[test]
    fn stop_then_play_restarts_from_the_beginning() {
        let (mut player, _writes) = player_with(80_000, None);
        player.open("mock.wav", options()).unwrap();
        player.play().unwrap();
        player.seek(5_000_000, Whence::Start).unwrap();
        wait_for(|| player.position().map(|p| p >= 5_000_000).unwrap_or(false));
        player.stop();
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Stopped));

        player.play().unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(player.position().unwrap() < 5_000_000);
        player.stop();
    }

    #[test]
    fn open_reports_source_errors() {
        let mut player = AudioPlayer::with_factories(
            PlaybackConfig::default(),
            Arc::new(|_p: &Path, _o: &StreamOptions| -> Result<StreamReader> {
                Err(anyhow!("No audio stream was found"))
            }),
            Arc::new(|_d: &StreamDescriptor, _c: &PlaybackConfig| -> Result<Box<dyn AudioSink>> {
                Ok(Box::new(RecordingSink::new(BUFFER).0) as Box<dyn AudioSink>)
            }),
        );
        let err = player.open("missing.wav", options()).unwrap_err();
        assert!(format!("{err:#}").contains("No audio stream"));
        assert_eq!(player.state(), PlaybackState::Stopped);
    }

    #[test]
    fn open_reports_sink_errors() {
        let mut player = AudioPlayer::with_factories(
            PlaybackConfig::default(),
            Arc::new(|_p: &Path, options: &StreamOptions| -> Result<StreamReader> {
                StreamReader::from_backend(Box::new(MockSource::new(8_000, 1, 100)), options)
            }),
            Arc::new(|_d: &StreamDescriptor, _c: &PlaybackConfig| -> Result<Box<dyn AudioSink>> {
                Err(anyhow!("No default output device"))
            }),
        );
        let err = player.open("mock.wav", options()).unwrap_err();
        assert!(format!("{err:#}").contains("No default output device"));
        assert!(!player.playing());
        assert!(player.error().is_some());
    }
}
