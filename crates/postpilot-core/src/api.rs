use crate::errors::ApiError;
use crate::model::{PostId, ResourceId, RevisionResult};
use crate::sse::ByteStream;

/// Opens the server-sent-event stream that drives one AI revision.
#[async_trait::async_trait]
pub trait RevisionTransport: Send + Sync {
    /// Starts a revision of `post` and returns the raw response body.
    ///
    /// Errors returned here happen before any frame was read (connect
    /// failure, non-2xx status).
    async fn open_revision_stream(
        &self,
        post: &PostId,
        feedback: &str,
    ) -> Result<ByteStream, ApiError>;
}

/// Persists an accepted revision through the regular post update endpoint.
#[async_trait::async_trait]
pub trait PostStore: Send + Sync {
    async fn save_revision(&self, post: &PostId, result: &RevisionResult) -> Result<(), ApiError>;
}

/// Remote side of a boolean toggle on resources of type `T`.
#[async_trait::async_trait]
pub trait ToggleApi<T>: Send + Sync {
    /// Requests `is_active = active` and returns the updated resource.
    async fn set_active(&self, id: &ResourceId, active: bool) -> Result<T, ApiError>;

    /// Reads the authoritative current state.
    async fn fetch(&self, id: &ResourceId) -> Result<T, ApiError>;
}
