//! Common imports for console clients.
pub use crate::{
    AbortHandle, ActiveRevisions, ApiError, ClientConfig, ConsoleClient, ConsoleError,
    OptimisticToggle, PostId, QueryCache, ResourceId, RevisionProgress, RevisionResult,
    RevisionSession, RevisionState, RevisionUpdate, Schedule, ToggleNotice, ToggleOutcome,
    Toggleable,
};
