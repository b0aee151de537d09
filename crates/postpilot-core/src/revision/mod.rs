//! Revision progress state machine.
//!
//! `RevisionMachine` is a plain reducer: every input, whether a decoded frame
//! or a user action, is a `RevisionMsg`, and `apply` returns the UI-facing
//! change it caused. `RevisionSession` feeds it from a live stream.

mod session;

pub use session::{AbortHandle, ActiveRevisions, RevisionSession};

use tracing::{debug, warn};

use crate::errors::{ApiError, ConsoleError, FailureReason};
use crate::model::{RevisionProgress, RevisionResult};
use crate::sse::StreamFrame;

/// Message shown when the connection drops mid-revision.
pub const TRANSPORT_FAILURE_MESSAGE: &str =
    "Lost connection to the revision service. Please try again.";

const DEFAULT_SERVER_FAILURE_MESSAGE: &str = "Revision failed";

/// Lifecycle of one revision attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RevisionState {
    #[default]
    Idle,
    Streaming {
        progress: RevisionProgress,
    },
    Succeeded {
        result: RevisionResult,
    },
    Failed {
        reason: FailureReason,
    },
}

impl RevisionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming { .. } => "streaming",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    /// Progress to display, only while streaming.
    pub fn progress(&self) -> Option<&RevisionProgress> {
        match self {
            Self::Streaming { progress } => Some(progress),
            _ => None,
        }
    }
}

/// Input to the reducer.
#[derive(Clone, Debug, PartialEq)]
pub enum RevisionMsg {
    /// User asked for a revision.
    Start,
    /// A decoded frame arrived.
    Frame(StreamFrame),
    /// The request failed before the stream was established.
    RequestFailed(ApiError),
    /// Reading the stream failed.
    TransportError(String),
    /// The stream closed.
    StreamEnded,
    /// The stream was aborted by the caller.
    Cancel,
    /// User keeps the result (after it was persisted).
    Accept,
    /// User drops the result to request a new revision.
    ReviseAgain,
    /// User drops the result.
    Discard,
}

impl RevisionMsg {
    fn action_name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Accept => "accept",
            Self::ReviseAgain => "revise again",
            Self::Discard => "discard",
            Self::Frame(_) => "frame",
            Self::RequestFailed(_) => "request failed",
            Self::TransportError(_) => "transport error",
            Self::StreamEnded => "stream ended",
            Self::Cancel => "cancel",
        }
    }
}

/// Change produced by one applied message.
#[derive(Clone, Debug, PartialEq)]
pub enum RevisionUpdate {
    Started(RevisionProgress),
    Progress(RevisionProgress),
    Completed(RevisionResult),
    Failed(FailureReason),
    /// Back to `Idle` after accept, revise again or discard.
    Reset,
}

impl RevisionUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RevisionMachine {
    state: RevisionState,
}

impl RevisionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &RevisionState {
        &self.state
    }

    /// The hosting dialog must not close while a stream is being consumed.
    pub fn can_close(&self) -> bool {
        !matches!(self.state, RevisionState::Streaming { .. })
    }

    /// Applies one message.
    ///
    /// Stream-side messages never fail: outside `Streaming` they are ignored
    /// and `Ok(None)` is returned. User actions issued in a state that does not
    /// accept them fail with `ConsoleError::InvalidTransition`.
    pub fn apply(&mut self, msg: RevisionMsg) -> Result<Option<RevisionUpdate>, ConsoleError> {
        let streaming = matches!(self.state, RevisionState::Streaming { .. });
        match msg {
            RevisionMsg::Start => {
                if self.state != RevisionState::Idle {
                    return Err(self.invalid(&RevisionMsg::Start));
                }
                let progress = RevisionProgress::starting();
                self.state = RevisionState::Streaming {
                    progress: progress.clone(),
                };
                Ok(Some(RevisionUpdate::Started(progress)))
            }
            RevisionMsg::Frame(frame) if streaming => Ok(self.on_frame(frame)),
            RevisionMsg::RequestFailed(err) if streaming => {
                let reason = if matches!(err, ApiError::Transport(_)) {
                    warn!(event = "revision.request_failed", domain = "revision", code = err.code(), error = %err);
                    FailureReason::Transport(TRANSPORT_FAILURE_MESSAGE.to_string())
                } else {
                    FailureReason::Server(err.to_string())
                };
                Ok(Some(self.fail(reason)))
            }
            RevisionMsg::TransportError(message) if streaming => {
                warn!(event = "revision.transport_failed", domain = "revision", error = %message);
                Ok(Some(self.fail(FailureReason::Transport(
                    TRANSPORT_FAILURE_MESSAGE.to_string(),
                ))))
            }
            RevisionMsg::StreamEnded if streaming => Ok(Some(self.fail(FailureReason::Incomplete))),
            RevisionMsg::Cancel if streaming => Ok(Some(self.fail(FailureReason::Cancelled))),
            RevisionMsg::Frame(_)
            | RevisionMsg::RequestFailed(_)
            | RevisionMsg::TransportError(_)
            | RevisionMsg::StreamEnded
            | RevisionMsg::Cancel => {
                debug!(
                    event = "revision.message_ignored",
                    domain = "revision",
                    state = self.state.name(),
                    message = msg.action_name()
                );
                Ok(None)
            }
            RevisionMsg::Accept => match self.state {
                RevisionState::Succeeded { .. } => Ok(Some(self.reset())),
                _ => Err(self.invalid(&RevisionMsg::Accept)),
            },
            RevisionMsg::ReviseAgain | RevisionMsg::Discard => {
                if self.state.is_terminal() {
                    Ok(Some(self.reset()))
                } else {
                    Err(self.invalid(&msg))
                }
            }
        }
    }

    fn on_frame(&mut self, frame: StreamFrame) -> Option<RevisionUpdate> {
        match frame.event_type.as_str() {
            "progress" => match serde_json::from_value::<RevisionProgress>(frame.payload) {
                Ok(progress) if progress.is_consistent() => {
                    self.state = RevisionState::Streaming {
                        progress: progress.clone(),
                    };
                    Some(RevisionUpdate::Progress(progress))
                }
                Ok(progress) => {
                    warn!(
                        event = "revision.progress_dropped",
                        domain = "revision",
                        step = progress.step,
                        total = progress.total,
                        "progress step exceeds total"
                    );
                    None
                }
                Err(e) => {
                    warn!(event = "revision.progress_dropped", domain = "revision", error = %e);
                    None
                }
            },
            "complete" => match serde_json::from_value::<RevisionResult>(frame.payload) {
                Ok(result) => {
                    self.state = RevisionState::Succeeded {
                        result: result.clone(),
                    };
                    Some(RevisionUpdate::Completed(result))
                }
                Err(e) => Some(self.fail(FailureReason::Protocol(e.to_string()))),
            },
            "error" => {
                let detail = frame
                    .payload
                    .get("detail")
                    .or_else(|| frame.payload.get("message"))
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(DEFAULT_SERVER_FAILURE_MESSAGE);
                Some(self.fail(FailureReason::Server(detail.to_string())))
            }
            other => {
                debug!(event = "revision.frame_ignored", domain = "revision", event_type = other);
                None
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) -> RevisionUpdate {
        self.state = RevisionState::Failed {
            reason: reason.clone(),
        };
        RevisionUpdate::Failed(reason)
    }

    fn reset(&mut self) -> RevisionUpdate {
        self.state = RevisionState::Idle;
        RevisionUpdate::Reset
    }

    fn invalid(&self, msg: &RevisionMsg) -> ConsoleError {
        ConsoleError::InvalidTransition {
            action: msg.action_name(),
            state: self.state.name(),
        }
    }
}
