//! Client core for the postpilot content console.
//!
//! Two flows live here:
//! - AI revisions of a post, streamed as server-sent events and folded into a
//!   `RevisionState` by `RevisionSession`.
//! - Optimistic activate/deactivate toggles (`OptimisticToggle`) that keep a
//!   shared `QueryCache` consistent with the server even when the toggle
//!   request reports an error it did not actually suffer.
//!
//! # Streaming a revision
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postpilot_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ConsoleError> {
//! let client = Arc::new(ConsoleClient::from_env()?);
//! let mut session = RevisionSession::new(
//!     PostId::new("post_42"),
//!     client.clone(),
//!     client,
//!     ActiveRevisions::new(),
//! );
//!
//! session.start("Shorter intro, friendlier tone").await?;
//! while let Some(update) = session.next_update().await {
//!     if let RevisionUpdate::Progress(progress) = update {
//!         println!("{}/{}", progress.step, progress.total);
//!     }
//! }
//! let revised = session.accept().await?;
//! println!("{}", revised.excerpt);
//! # Ok(())
//! # }
//! ```

/// Remote-call contracts implemented by the HTTP client and by test doubles.
pub mod api;
/// Keyed resource cache with change events.
pub mod cache;
/// Client configuration.
pub mod config;
/// Public error types.
pub mod errors;
/// reqwest implementation of the remote-call contracts.
pub mod http;
/// Identifiers and wire types.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Revision progress state machine and the session driving it.
pub mod revision;
/// Server-sent-event frame decoding.
pub mod sse;
/// Optimistic toggle controller.
pub mod toggle;

pub use api::{PostStore, RevisionTransport, ToggleApi};
pub use cache::{CacheEvent, QueryCache};
pub use config::ClientConfig;
pub use errors::{ApiError, ConsoleError, FailureReason, FrameError, StreamError};
pub use http::ConsoleClient;
pub use model::{PostId, ResourceId, RevisionProgress, RevisionResult, Schedule, Toggleable};
pub use observability::{LogOutput, LogSettings, init_observability, init_observability_with};
pub use revision::{
    AbortHandle, ActiveRevisions, RevisionMachine, RevisionMsg, RevisionSession, RevisionState,
    RevisionUpdate,
};
pub use sse::{FrameDecoder, StreamFrame};
pub use toggle::{
    OptimisticToggle, PendingMutation, RequestOutcome, ToggleConfig, ToggleNotice, ToggleOutcome,
    ToggleTicket,
};
