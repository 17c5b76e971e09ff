//! Bounded `f32` sample queue between the playback worker and the device
//! callback.
//!
//! The worker side blocks while the queue is full. The callback side never
//! blocks and plays silence when nothing is queued.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const PUSH_WAIT: Duration = Duration::from_millis(50);

/// Interleaved samples at the device rate and channel count.
///
/// The closed flag shares the sample mutex, so a producer never misses a close.
pub struct SampleQueue {
    channels: usize,
    capacity: usize,
    state: Mutex<QueueState>,
    changed: Condvar,
}

#[derive(Default)]
struct QueueState {
    samples: VecDeque<f32>,
    closed: bool,
}

/// Capacity in samples holding `seconds` of audio at `rate_hz`.
///
/// A non-finite or non-positive duration means half a second.
pub fn capacity_for(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let seconds = match seconds {
        s if s.is_finite() && s > 0.0 => s,
        _ => 0.5,
    };
    let frames = (f64::from(rate_hz) * f64::from(seconds)).ceil() as usize;
    frames.max(1).saturating_mul(channels.max(1))
}

impl SampleQueue {
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: channels.max(1),
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, QueueState>,
        timeout: Duration,
    ) -> MutexGuard<'a, QueueState> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn queued_frames(&self) -> usize {
        self.state().samples.len() / self.channels
    }

    /// Refuse further samples and wake every waiter.
    pub fn close(&self) {
        self.state().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Append `samples`, waiting for room as needed.
    ///
    /// Whatever is left when the queue closes is dropped.
    pub fn push(&self, mut samples: &[f32]) {
        while !samples.is_empty() {
            let mut state = self.state();
            while state.samples.len() >= self.capacity && !state.closed {
                state = self.wait(state, PUSH_WAIT);
            }
            if state.closed {
                return;
            }
            let take = (self.capacity - state.samples.len()).min(samples.len());
            let (head, rest) = samples.split_at(take);
            state.samples.extend(head);
            samples = rest;
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Take up to `max_frames` whole frames, or `None` when under one frame
    /// is queued.
    pub fn try_pop(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut state = self.state();
        let frames = (state.samples.len() / self.channels).min(max_frames);
        if frames == 0 {
            return None;
        }
        let out = state.samples.drain(..frames * self.channels).collect();
        drop(state);
        self.changed.notify_all();
        Some(out)
    }

    /// Wait for the callback to consume everything queued.
    ///
    /// `false` when the queue closed or `timeout` elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while !state.samples.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            if state.closed || left.is_zero() {
                return false;
            }
            state = self.wait(state, left);
        }
        true
    }
}
