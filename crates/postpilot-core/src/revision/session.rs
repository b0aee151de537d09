use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{RevisionMachine, RevisionMsg, RevisionState, RevisionUpdate};
use crate::api::{PostStore, RevisionTransport};
use crate::errors::{ConsoleError, StreamError};
use crate::model::{PostId, RevisionResult};
use crate::sse::frame_stream;

/// Handle used to abort a streaming revision.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// The pending request is dropped and the session ends in
    /// `Failed { Cancelled }`. Has no effect once a terminal frame was read.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Posts that currently have a revision stream open.
///
/// Shared between sessions so that at most one stream runs per post.
#[derive(Clone, Default)]
pub struct ActiveRevisions {
    inner: Arc<DashMap<PostId, uuid::Uuid>>,
}

impl ActiveRevisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_streaming(&self, post: &PostId) -> bool {
        self.inner.contains_key(post)
    }

    fn try_acquire(&self, post: &PostId, attempt_id: uuid::Uuid) -> Result<RevisionLock, ConsoleError> {
        match self.inner.entry(post.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConsoleError::AlreadyStreaming(post.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(attempt_id);
                Ok(RevisionLock {
                    registry: Arc::clone(&self.inner),
                    post: post.clone(),
                    attempt_id,
                })
            }
        }
    }
}

struct RevisionLock {
    registry: Arc<DashMap<PostId, uuid::Uuid>>,
    post: PostId,
    attempt_id: uuid::Uuid,
}

impl Drop for RevisionLock {
    fn drop(&mut self) {
        self.registry
            .remove_if(&self.post, |_, owner| *owner == self.attempt_id);
    }
}

/// Drives a `RevisionMachine` for one post from a live revision stream.
///
/// A background task reads and decodes the stream and forwards each frame as
/// a `RevisionMsg`; `next_update()` applies them to the machine in arrival
/// order.
pub struct RevisionSession {
    post: PostId,
    transport: Arc<dyn RevisionTransport>,
    posts: Arc<dyn PostStore>,
    active: ActiveRevisions,
    machine: RevisionMachine,
    buffer_capacity: usize,
    inbox: Option<mpsc::Receiver<RevisionMsg>>,
    abort: Option<AbortHandle>,
    lock: Option<RevisionLock>,
    attempt_id: Option<uuid::Uuid>,
}

impl RevisionSession {
    pub fn new(
        post: PostId,
        transport: Arc<dyn RevisionTransport>,
        posts: Arc<dyn PostStore>,
        active: ActiveRevisions,
    ) -> Self {
        Self {
            post,
            transport,
            posts,
            active,
            machine: RevisionMachine::new(),
            buffer_capacity: crate::config::DEFAULT_STREAM_BUFFER,
            inbox: None,
            abort: None,
            lock: None,
            attempt_id: None,
        }
    }

    /// Sets the bounded buffer between the stream reader and the session.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub fn post(&self) -> &PostId {
        &self.post
    }

    pub fn state(&self) -> &RevisionState {
        self.machine.state()
    }

    /// False while streaming; the stream has no cooperative stop signal other
    /// than `cancel()`.
    pub fn can_close(&self) -> bool {
        self.machine.can_close()
    }

    /// Starts a revision with the user's feedback.
    pub async fn start(&mut self, feedback: impl Into<String>) -> Result<AbortHandle, ConsoleError> {
        let feedback = feedback.into();
        if feedback.trim().is_empty() {
            return Err(ConsoleError::Validation(
                "revision feedback must not be empty".into(),
            ));
        }
        if self.state() != &RevisionState::Idle {
            return Err(ConsoleError::InvalidTransition {
                action: "start",
                state: self.state().name(),
            });
        }

        let attempt_id = uuid::Uuid::new_v4();
        let lock = self.active.try_acquire(&self.post, attempt_id)?;
        self.machine.apply(RevisionMsg::Start)?;

        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort = AbortHandle { tx: abort_tx };

        info!(
            event = "revision.started",
            domain = "revision",
            post_id = %self.post,
            attempt_id = %attempt_id,
            feedback_len = feedback.len() as u64
        );
        tokio::spawn(pump_stream(
            Arc::clone(&self.transport),
            self.post.clone(),
            feedback,
            attempt_id,
            tx,
            abort_rx,
        ));

        self.inbox = Some(rx);
        self.abort = Some(abort.clone());
        self.lock = Some(lock);
        self.attempt_id = Some(attempt_id);
        Ok(abort)
    }

    /// Aborts the running stream, if any.
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Waits for the next state change caused by the stream.
    ///
    /// Returns `None` once the attempt reached a terminal state (after that
    /// update was returned) or when no stream is running.
    pub async fn next_update(&mut self) -> Option<RevisionUpdate> {
        loop {
            let inbox = self.inbox.as_mut()?;
            // A closed channel without a terminal message means the reader died.
            let msg = inbox.recv().await.unwrap_or(RevisionMsg::StreamEnded);
            match self.machine.apply(msg) {
                Ok(Some(update)) => {
                    if update.is_terminal() {
                        self.end_attempt(&update);
                    }
                    return Some(update);
                }
                Ok(None) => {
                    if !matches!(self.machine.state(), RevisionState::Streaming { .. }) {
                        self.inbox = None;
                    }
                }
                Err(err) => {
                    warn!(event = "revision.message_rejected", domain = "revision", error = %err);
                }
            }
        }
    }

    /// Consumes the stream to its end and returns the outcome.
    pub async fn finish(&mut self) -> Result<RevisionResult, ConsoleError> {
        while self.next_update().await.is_some() {}
        match self.machine.state() {
            RevisionState::Succeeded { result } => Ok(result.clone()),
            RevisionState::Failed { reason } => Err(ConsoleError::RevisionFailed(reason.clone())),
            other => Err(ConsoleError::InvalidTransition {
                action: "finish",
                state: other.name(),
            }),
        }
    }

    /// Persists the revised content, then returns to `Idle`.
    ///
    /// If saving fails the session stays in `Succeeded` so the user can retry.
    pub async fn accept(&mut self) -> Result<RevisionResult, ConsoleError> {
        let RevisionState::Succeeded { result } = self.machine.state() else {
            return Err(ConsoleError::InvalidTransition {
                action: "accept",
                state: self.state().name(),
            });
        };
        let result = result.clone();
        if let Err(err) = self.posts.save_revision(&self.post, &result).await {
            warn!(
                event = "revision.save_failed",
                domain = "revision",
                post_id = %self.post,
                code = err.code(),
                error = %err
            );
            return Err(err.into());
        }
        self.machine.apply(RevisionMsg::Accept)?;
        info!(event = "revision.accepted", domain = "revision", post_id = %self.post);
        Ok(result)
    }

    /// Drops the result (or failure) so a new revision can be started.
    pub fn revise_again(&mut self) -> Result<(), ConsoleError> {
        self.machine.apply(RevisionMsg::ReviseAgain).map(|_| ())
    }

    /// Drops the result without persisting it.
    pub fn discard(&mut self) -> Result<(), ConsoleError> {
        self.machine.apply(RevisionMsg::Discard).map(|_| ())
    }

    fn end_attempt(&mut self, update: &RevisionUpdate) {
        let outcome = match update {
            RevisionUpdate::Completed(_) => "completed",
            _ => "failed",
        };
        debug!(
            event = "revision.finished",
            domain = "revision",
            post_id = %self.post,
            attempt_id = ?self.attempt_id,
            outcome
        );
        self.inbox = None;
        self.abort = None;
        self.lock = None;
        self.attempt_id = None;
    }
}

async fn pump_stream(
    transport: Arc<dyn RevisionTransport>,
    post: PostId,
    feedback: String,
    attempt_id: uuid::Uuid,
    tx: mpsc::Sender<RevisionMsg>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let opened = tokio::select! {
        _ = aborted(&mut abort_rx) => {
            let _ = tx.send(RevisionMsg::Cancel).await;
            return;
        }
        opened = transport.open_revision_stream(&post, &feedback) => opened,
    };
    let body = match opened {
        Ok(body) => body,
        Err(err) => {
            let _ = tx.send(RevisionMsg::RequestFailed(err)).await;
            return;
        }
    };

    let mut frames = Box::pin(frame_stream(body));
    let mut seq = 0_u64;
    loop {
        tokio::select! {
            _ = aborted(&mut abort_rx) => {
                debug!(event = "revision.aborted", domain = "revision", attempt_id = %attempt_id, frames = seq);
                let _ = tx.send(RevisionMsg::Cancel).await;
                return;
            }
            next = frames.next() => {
                let msg = match next {
                    Some(Ok(frame)) => {
                        debug!(event = "revision.frame", domain = "revision", attempt_id = %attempt_id, seq, event_type = %frame.event_type);
                        seq = seq.saturating_add(1);
                        RevisionMsg::Frame(frame)
                    }
                    Some(Err(StreamError::Decode(err))) => {
                        warn!(event = "revision.frame_dropped", domain = "revision", attempt_id = %attempt_id, error = %err);
                        continue;
                    }
                    Some(Err(StreamError::Transport(message))) => RevisionMsg::TransportError(message),
                    None => RevisionMsg::StreamEnded,
                };
                let terminal = match &msg {
                    RevisionMsg::Frame(frame) => matches!(frame.event_type.as_str(), "complete" | "error"),
                    _ => true,
                };
                if tx.send(msg).await.is_err() || terminal {
                    return;
                }
            }
        }
    }
}

/// Resolves once an abort was requested; never resolves if every handle is gone.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
