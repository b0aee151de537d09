//! reqwest-backed client for the content API.

use futures::StreamExt as _;
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::{PostStore, RevisionTransport, ToggleApi};
use crate::config::ClientConfig;
use crate::errors::{ApiError, ConsoleError};
use crate::model::{PostId, ResourceId, RevisionResult, Toggleable};
use crate::sse::ByteStream;

const EVENT_STREAM: &str = "text/event-stream";

/// HTTP client for posts, revisions and toggleable resources.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct ConsoleClient {
    client: reqwest::Client,
    base: Url,
    config: ClientConfig,
}

impl ConsoleClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConsoleError> {
        config.validate()?;
        let base = Url::parse(&config.base_url)
            .map_err(|e| ConsoleError::Config(format!("invalid base url {:?}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(ConsoleError::Config(format!(
                "base url {:?} cannot carry a path",
                config.base_url
            )));
        }
        // The overall timeout is applied per request: revision streams stay
        // open for as long as generation takes.
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| ConsoleError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base,
            config,
        })
    }

    pub fn from_env() -> Result<Self, ConsoleError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `cannot_be_a_base` was rejected in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.endpoint(segments);
        debug!(event = "http.request", domain = "http", method = %method, url = %url);
        let builder = self.client.request(method, url);
        match self.config.api_token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status.as_u16(), &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(builder.timeout(self.config.timeout)).await?;
        let body = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    ApiError::Transport(err.to_string())
}

#[async_trait::async_trait]
impl RevisionTransport for ConsoleClient {
    async fn open_revision_stream(
        &self,
        post: &PostId,
        feedback: &str,
    ) -> Result<ByteStream, ApiError> {
        let builder = self
            .request(Method::POST, &["posts", post.as_str(), "revise"])
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM))
            .json(&serde_json::json!({ "feedback": feedback }));
        let response = self.send(builder).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| e.to_string()));
        Ok(Box::pin(bytes))
    }
}

#[async_trait::async_trait]
impl PostStore for ConsoleClient {
    async fn save_revision(&self, post: &PostId, result: &RevisionResult) -> Result<(), ApiError> {
        let builder = self
            .request(Method::PATCH, &["posts", post.as_str()])
            .json(result)
            .timeout(self.config.timeout);
        // The updated post in the body is not needed; the caller keeps its copy.
        self.send(builder).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T> ToggleApi<T> for ConsoleClient
where
    T: Toggleable + DeserializeOwned,
{
    async fn set_active(&self, id: &ResourceId, active: bool) -> Result<T, ApiError> {
        let action = if active { "activate" } else { "deactivate" };
        let builder = self.request(Method::PATCH, &[T::COLLECTION, id.as_str(), action]);
        self.send_json(builder).await
    }

    async fn fetch(&self, id: &ResourceId) -> Result<T, ApiError> {
        let builder = self.request(Method::GET, &[T::COLLECTION, id.as_str()]);
        self.send_json(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ConsoleClient {
        ConsoleClient::new(ClientConfig::new(base)).expect("client")
    }

    #[test]
    fn endpoint_appends_segments_to_base_path() {
        let client = client("http://localhost:8000/api/v1/");
        assert_eq!(
            client.endpoint(&["posts", "p1", "revise"]).as_str(),
            "http://localhost:8000/api/v1/posts/p1/revise"
        );
    }

    #[test]
    fn endpoint_escapes_ids() {
        let client = client("http://localhost:8000");
        assert_eq!(
            client.endpoint(&["schedules", "a/b"]).as_str(),
            "http://localhost:8000/schedules/a%2Fb"
        );
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let err = ConsoleClient::new(ClientConfig::new("ftp://nope")).expect_err("rejected");
        assert!(matches!(err, ConsoleError::Config(_)));
    }
}
