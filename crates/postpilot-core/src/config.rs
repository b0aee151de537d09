use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConsoleError;
use crate::toggle::ToggleConfig;

/// Default capacity of the channel between a stream pump and its session.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Configuration for the console API client and the controllers built on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the content API, e.g. `https://api.example.com/api/v1`.
    pub base_url: String,
    /// Bearer token sent with every request when set.
    pub api_token: Option<String>,
    /// Timeout for non-streaming requests and for connecting a stream.
    pub timeout: Duration,
    /// Wait after a successful toggle before re-fetching the resource.
    pub settle_delay: Duration,
    /// Wait after a failed toggle before checking whether it applied.
    pub verify_delay: Duration,
    /// Frames buffered between the network task and the session.
    pub stream_buffer_capacity: usize,
}

impl ClientConfig {
    /// Creates a config with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            timeout: Duration::from_secs(120),
            settle_delay: Duration::from_millis(1000),
            verify_delay: Duration::from_millis(1000),
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Builds a config from `POSTPILOT_*` environment variables.
    ///
    /// - `POSTPILOT_API_URL` (required)
    /// - `POSTPILOT_API_TOKEN`
    /// - `POSTPILOT_TIMEOUT_SECS` (default 120)
    /// - `POSTPILOT_SETTLE_DELAY_MS` (default 1000)
    /// - `POSTPILOT_VERIFY_DELAY_MS` (default 1000)
    pub fn from_env() -> Result<Self, ConsoleError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConsoleError> {
        let base_url = lookup("POSTPILOT_API_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConsoleError::Config("missing POSTPILOT_API_URL".into()))?;
        let mut config = Self::new(base_url.trim());
        config.api_token = lookup("POSTPILOT_API_TOKEN").filter(|v| !v.trim().is_empty());
        if let Some(secs) = parse_var::<u64>(&lookup, "POSTPILOT_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "POSTPILOT_SETTLE_DELAY_MS")? {
            config.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "POSTPILOT_VERIFY_DELAY_MS")? {
            config.verify_delay = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets the bearer token.
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Overrides the HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    /// Rejects values the client cannot work with.
    pub fn validate(&self) -> Result<(), ConsoleError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConsoleError::Config(format!(
                "base url must start with http:// or https://, got {:?}",
                self.base_url
            )));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(ConsoleError::Config(
                "stream buffer capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Delays for the optimistic toggle controller.
    pub fn toggle_config(&self) -> ToggleConfig {
        ToggleConfig {
            settle_delay: self.settle_delay,
            verify_delay: self.verify_delay,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConsoleError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConsoleError::Config(format!("invalid {key}={raw:?}: {e}"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let config =
            ClientConfig::from_lookup(lookup(&[("POSTPILOT_API_URL", "http://localhost:8000/api/v1")]))
                .expect("config");
        assert_eq!(config.api_token, None);
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.verify_delay, Duration::from_secs(1));
        assert_eq!(config.stream_buffer_capacity, DEFAULT_STREAM_BUFFER);
    }

    #[test]
    fn env_overrides_are_parsed() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("POSTPILOT_API_URL", "https://api.example.com"),
            ("POSTPILOT_API_TOKEN", "tok"),
            ("POSTPILOT_TIMEOUT_SECS", "5"),
            ("POSTPILOT_SETTLE_DELAY_MS", "250"),
            ("POSTPILOT_VERIFY_DELAY_MS", " 1500 "),
        ]))
        .expect("config");
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.toggle_config().settle_delay, Duration::from_millis(250));
        assert_eq!(config.toggle_config().verify_delay, Duration::from_millis(1500));
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let err = ClientConfig::from_lookup(lookup(&[])).expect_err("missing url");
        assert!(matches!(err, ConsoleError::Config(msg) if msg.contains("POSTPILOT_API_URL")));
    }

    #[test]
    fn unparsable_number_names_the_variable() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("POSTPILOT_API_URL", "http://localhost"),
            ("POSTPILOT_VERIFY_DELAY_MS", "soon"),
        ]))
        .expect_err("bad number");
        assert!(matches!(err, ConsoleError::Config(msg) if msg.contains("POSTPILOT_VERIFY_DELAY_MS")));
    }

    #[test]
    fn validate_rejects_non_http_urls() {
        assert!(ClientConfig::new("localhost:8000").validate().is_err());
        assert!(
            ClientConfig::new("http://x")
                .stream_buffer_capacity(0)
                .validate()
                .is_err()
        );
    }
}
