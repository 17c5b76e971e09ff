use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use audio_stream_types::{PlaybackEndReason, PlaybackState, PlayerStatus};

/// Playback flags shared between the controller and its worker.
///
/// Every field is independently settable; readers get a best-effort view and
/// never need multi-field consistency.
#[derive(Debug, Default)]
pub struct PlayerStatusState {
    /// Worker loop keeps running while set. Cleared by `stop()` or by the
    /// worker itself when it ends.
    playing: AtomicBool,
    /// Worker emits silence instead of reading while set.
    paused: AtomicBool,
    /// Stream length in microseconds (`0` when unknown).
    length_us: AtomicI64,
    filename: Mutex<Option<String>>,
    error: Mutex<Option<String>>,
    info: Mutex<String>,
    end_reason: Mutex<Option<PlaybackEndReason>>,
}

impl PlayerStatusState {
    /// Create a shared status store.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn length_us(&self) -> i64 {
        self.length_us.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|g| g.clone())
    }

    pub fn info(&self) -> String {
        self.info.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn filename(&self) -> Option<String> {
        self.filename.lock().ok().and_then(|g| g.clone())
    }

    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        self.end_reason.lock().ok().and_then(|g| *g)
    }

    /// Forget the previous stream and describe a newly opened one.
    pub fn reset(&self, filename: Option<String>, length_us: i64, info: String) {
        self.playing.store(false, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        self.length_us.store(length_us.max(0), Ordering::Relaxed);
        if let Ok(mut g) = self.filename.lock() {
            *g = filename;
        }
        if let Ok(mut g) = self.info.lock() {
            *g = info;
        }
        self.begin_run();
    }

    /// Clear per-run fields before a worker starts.
    pub fn begin_run(&self) {
        if let Ok(mut g) = self.error.lock() {
            *g = None;
        }
        if let Ok(mut g) = self.end_reason.lock() {
            *g = None;
        }
    }

    pub fn set_error(&self, message: String) {
        if let Ok(mut g) = self.error.lock() {
            *g = Some(message);
        }
    }

    /// Record why the worker ended and clear the playing flag.
    pub fn finish(&self, reason: PlaybackEndReason) {
        if let Ok(mut g) = self.end_reason.lock() {
            *g = Some(reason);
        }
        self.playing.store(false, Ordering::Relaxed);
    }

    /// Return a serializable snapshot.
    pub fn snapshot(&self) -> PlayerStatus {
        let playing = self.is_playing();
        let paused = self.is_paused();
        let state = match (playing, paused) {
            (false, _) => PlaybackState::Stopped,
            (true, true) => PlaybackState::Paused,
            (true, false) => PlaybackState::Playing,
        };
        PlayerStatus {
            filename: self.filename(),
            state,
            playing,
            paused,
            error: self.error(),
            length_us: self.length_us(),
            info: self.info(),
            end_reason: self.end_reason(),
        }
    }
}
