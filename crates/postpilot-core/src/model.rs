use std::fmt;

use chrono::{DateTime, Utc};

/// Identifier of a blog post (the revision target).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PostId(pub String);

impl PostId {
    /// Creates a post id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a toggleable resource (for example a schedule).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    /// Creates a resource id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Number of server-side stages in a revision: "revise", then "polish".
pub const REVISION_STAGES: u32 = 2;

/// Progress of a running revision as reported by the server.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RevisionProgress {
    pub step: u32,
    pub total: u32,
    #[serde(default)]
    pub message: Option<String>,
}

impl RevisionProgress {
    /// Progress shown between `start` and the first `progress` frame.
    pub fn starting() -> Self {
        Self {
            step: 0,
            total: REVISION_STAGES,
            message: Some("Starting...".to_string()),
        }
    }

    /// Returns true if `step` does not exceed `total`.
    pub fn is_consistent(&self) -> bool {
        self.step <= self.total
    }
}

/// Revised post body produced by a successful revision.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RevisionResult {
    pub content: String,
    pub excerpt: String,
}

/// A remote resource carrying a boolean active flag.
pub trait Toggleable: Clone + Send + Sync + 'static {
    /// Path segment of the collection, e.g. `schedules`.
    const COLLECTION: &'static str;

    fn resource_id(&self) -> ResourceId;
    fn is_active(&self) -> bool;
    fn set_active(&mut self, active: bool);
}

/// Publishing schedule as returned by `GET /schedules/{id}`.
///
/// `next_run_at` is recomputed by the server whenever the schedule is
/// activated or deactivated; the client never predicts it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Schedule {
    pub id: ResourceId,
    #[serde(default)]
    pub name: String,
    pub is_active: bool,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Server fields this client does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Toggleable for Schedule {
    const COLLECTION: &'static str = "schedules";

    fn resource_id(&self) -> ResourceId {
        self.id.clone()
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_progress_has_two_stages() {
        let progress = RevisionProgress::starting();
        assert_eq!(progress.step, 0);
        assert_eq!(progress.total, 2);
        assert_eq!(progress.message.as_deref(), Some("Starting..."));
    }

    #[test]
    fn schedule_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "id": "sch_1",
            "name": "Weekly",
            "is_active": false,
            "next_run_at": "2026-10-19T09:00:00Z",
            "timezone": "Europe/Paris"
        });
        let schedule: Schedule = serde_json::from_value(raw).expect("schedule");
        assert_eq!(schedule.resource_id(), ResourceId::new("sch_1"));
        assert!(!schedule.is_active());
        assert_eq!(
            schedule.extra.get("timezone").and_then(|v| v.as_str()),
            Some("Europe/Paris")
        );
    }
}
