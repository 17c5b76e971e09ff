//! Request/response channel between a controlling context and the playback
//! worker.
//!
//! The worker polls once per loop iteration and answers `Get*` requests
//! synchronously; the client blocks only for those. Requests are strictly
//! sequential: a client must consume a response before sending again.

use std::fmt;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

pub use audio_stream_types::{ControlRequest, ControlResponse};

/// Why a control operation produced no value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// No worker is running.
    NotPlaying,
    /// The worker went away before answering.
    Disconnected,
    /// The worker answered with the wrong kind of response.
    UnexpectedResponse,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::NotPlaying => write!(f, "not playing"),
            ControlError::Disconnected => write!(f, "playback worker disconnected"),
            ControlError::UnexpectedResponse => write!(f, "unexpected control response"),
        }
    }
}

impl std::error::Error for ControlError {}

/// State the worker exposes through the channel.
pub trait ControlTarget {
    /// Current position in microseconds.
    fn position(&self) -> i64;
    /// Schedule a seek to `us`.
    fn set_position(&mut self, us: i64);
    fn loops(&self) -> i32;
    fn set_loops(&mut self, loops: i32);
    fn loop_count(&self) -> u32;
}

/// Controller end of the channel.
pub struct ControlClient {
    requests: Sender<ControlRequest>,
    responses: Receiver<ControlResponse>,
}

/// Worker end of the channel.
pub struct ControlServer {
    requests: Receiver<ControlRequest>,
    responses: Sender<ControlResponse>,
}

/// Create a connected client/server pair.
pub fn control_channel() -> (ControlClient, ControlServer) {
    let (req_tx, req_rx) = crossbeam_channel::unbounded();
    let (resp_tx, resp_rx) = crossbeam_channel::unbounded();
    (
        ControlClient {
            requests: req_tx,
            responses: resp_rx,
        },
        ControlServer {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

impl ControlClient {
    /// Send `request`; for `Get*` requests wait for the single response.
    pub fn request(&self, request: ControlRequest) -> Result<Option<ControlResponse>, ControlError> {
        self.requests
            .send(request)
            .map_err(|_| ControlError::Disconnected)?;
        if !request.expects_response() {
            return Ok(None);
        }
        self.responses
            .recv()
            .map(Some)
            .map_err(|_| ControlError::Disconnected)
    }

    pub fn position(&self) -> Result<i64, ControlError> {
        match self.request(ControlRequest::GetPosition)? {
            Some(ControlResponse::Position(us)) => Ok(us),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    pub fn loops(&self) -> Result<i32, ControlError> {
        match self.request(ControlRequest::GetLoops)? {
            Some(ControlResponse::Loops(n)) => Ok(n),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    pub fn loop_count(&self) -> Result<u32, ControlError> {
        match self.request(ControlRequest::GetLoopCount)? {
            Some(ControlResponse::LoopCount(n)) => Ok(n),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }
}

impl ControlServer {
    /// Service at most one pending request without blocking.
    ///
    /// Returns `false` when nothing was pending.
    pub fn service_one(&self, target: &mut dyn ControlTarget) -> bool {
        let request = match self.requests.try_recv() {
            Ok(r) => r,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return false,
        };
        tracing::debug!(?request, "control request");
        let response = match request {
            ControlRequest::GetPosition => Some(ControlResponse::Position(target.position())),
            ControlRequest::SetPosition(us) => {
                target.set_position(us);
                None
            }
            ControlRequest::GetLoops => Some(ControlResponse::Loops(target.loops())),
            ControlRequest::SetLoops(n) => {
                target.set_loops(n);
                None
            }
            ControlRequest::GetLoopCount => Some(ControlResponse::LoopCount(target.loop_count())),
        };
        if let Some(response) = response {
            if self.responses.send(response).is_err() {
                tracing::debug!("control client gone; response dropped");
            }
        }
        true
    }
}
