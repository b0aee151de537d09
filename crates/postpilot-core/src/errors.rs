use crate::model::{PostId, ResourceId};

/// Failure of a single remote call made against the console backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Missing or expired credentials (401).
    #[error("authentication failed: {detail}")]
    Unauthorized { detail: String },
    /// Authenticated but not allowed (403).
    #[error("permission denied: {detail}")]
    Forbidden { detail: String },
    /// Resource does not exist (404).
    #[error("not found: {detail}")]
    NotFound { detail: String },
    /// Request was rejected by server-side validation (400/422).
    #[error("validation error: {detail}")]
    Validation { detail: String },
    /// Any other non-2xx response.
    #[error("server error ({status}): {detail}")]
    Server { status: u16, detail: String },
    /// The request did not complete (connect failure, timeout, dropped body).
    #[error("network error: {0}")]
    Transport(String),
    /// A 2xx response whose body could not be decoded.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Maps a non-success status and its response body to an error.
    ///
    /// The body is expected to be `{"detail": "..."}`; anything else is used
    /// verbatim (or replaced by the status reason when empty).
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = extract_detail(body).unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                default_reason(status).to_string()
            } else {
                trimmed.to_string()
            }
        });
        match status {
            401 => Self::Unauthorized { detail },
            403 => Self::Forbidden { detail },
            404 => Self::NotFound { detail },
            400 | 422 => Self::Validation { detail },
            _ => Self::Server { status, detail },
        }
    }

    /// True when the request may have reached the server even though the
    /// client saw a failure.
    pub fn outcome_is_ambiguous(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Decode(_))
            || matches!(self, Self::Server { status, .. } if *status >= 500)
    }

    /// Short classification code used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "api.auth.401",
            Self::Forbidden { .. } => "api.forbidden.403",
            Self::NotFound { .. } => "api.not_found.404",
            Self::Validation { .. } => "api.validation",
            Self::Server { .. } => "api.server_error",
            Self::Transport(_) => "api.transport",
            Self::Decode(_) => "api.decode",
        }
    }
}

fn extract_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(s) => Some(s.clone()),
        // FastAPI-style validation errors carry a list of objects with `msg`.
        serde_json::Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            if messages.is_empty() {
                None
            } else {
                Some(messages.join("; "))
            }
        }
        other => Some(other.to_string()),
    }
}

fn default_reason(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        422 => "unprocessable entity",
        500..=599 => "internal server error",
        _ => "request failed",
    }
}

/// A single SSE block that could not be turned into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The `data:` field was not valid JSON.
    #[error("malformed `{event_type}` payload: {message}")]
    MalformedPayload { event_type: String, message: String },
}

/// Item-level error of a decoded frame stream.
///
/// `Decode` items are recoverable and the stream continues after them;
/// `Transport` is the last item the stream yields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Reading the response body failed; no further frames will arrive.
    #[error("stream transport failed: {0}")]
    Transport(String),
    /// One frame was garbage; decoding continues.
    #[error(transparent)]
    Decode(#[from] FrameError),
}

impl StreamError {
    /// Returns true if the stream ends after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Why a revision attempt ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// The server sent an `error` event or rejected the request.
    #[error("{0}")]
    Server(String),
    /// The connection broke before a terminal event.
    #[error("{0}")]
    Transport(String),
    /// The server sent a terminal event that could not be interpreted.
    #[error("invalid revision response: {0}")]
    Protocol(String),
    /// The stream closed cleanly but never sent `complete` or `error`.
    #[error("revision stream ended before completion")]
    Incomplete,
    /// The caller aborted the stream.
    #[error("revision cancelled")]
    Cancelled,
}

/// Top-level error type for the public console API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A remote call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The revision attempt reached `Failed`.
    #[error("revision failed: {0}")]
    RevisionFailed(FailureReason),
    /// A user action was issued in a state that does not accept it.
    #[error("cannot {action} while revision is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
    /// Another stream is already running for the same post.
    #[error("a revision is already streaming for post {0}")]
    AlreadyStreaming(PostId),
    /// A toggle for the same resource has not settled yet.
    #[error("a toggle is already in flight for {0}")]
    TogglePending(ResourceId),
    /// Internal invariant violation (for example a dropped channel).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConsoleError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<FailureReason> for ConsoleError {
    fn from(value: FailureReason) -> Self {
        ConsoleError::RevisionFailed(value)
    }
}
