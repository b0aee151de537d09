//! Optimistic toggling of a boolean flag on a remote resource.
//!
//! `toggle` flips the cached flag before the request is sent. Once the
//! request settles the cache is reconciled with the server. A failed request
//! is not trusted as a failed mutation: the resource is re-fetched after
//! `verify_delay` and the flip is only reverted if the server disagrees.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ToggleApi;
use crate::cache::QueryCache;
use crate::errors::{ApiError, ConsoleError};
use crate::model::{ResourceId, Toggleable};

const NOTICE_CAPACITY: usize = 64;

/// Delays used while reconciling a toggle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToggleConfig {
    /// Wait after a successful toggle before re-fetching server-computed fields.
    pub settle_delay: Duration,
    /// Wait after a failed toggle before checking whether it landed anyway.
    pub verify_delay: Duration,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            verify_delay: Duration::from_secs(1),
        }
    }
}

/// What is known about the request behind a pending mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Unknown,
    Success,
    Failure,
}

/// Bookkeeping for one in-flight toggle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMutation {
    pub resource_id: ResourceId,
    pub previous_value: bool,
    pub predicted_value: bool,
    pub request_outcome: RequestOutcome,
}

/// Final result of a toggle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The request succeeded.
    Confirmed { active: bool },
    /// The request reported an error but the server state shows it applied.
    RecoveredAfterError { active: bool },
    /// The toggle did not apply; the cache holds the server (or previous) value.
    Reverted { active: bool, error: ApiError },
}

impl ToggleOutcome {
    /// Flag value held by the cache once reconciliation finished.
    pub fn active(&self) -> bool {
        match self {
            Self::Confirmed { active }
            | Self::RecoveredAfterError { active }
            | Self::Reverted { active, .. } => *active,
        }
    }
}

/// User-facing notification emitted when a toggle settles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToggleNotice {
    Success {
        resource_id: ResourceId,
        message: String,
    },
    Error {
        resource_id: ResourceId,
        error: ApiError,
    },
}

/// Handle to a toggle's reconciliation.
///
/// Dropping the ticket does not stop reconciliation.
pub struct ToggleTicket {
    resource_id: ResourceId,
    handle: JoinHandle<ToggleOutcome>,
}

impl ToggleTicket {
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Waits until the cache has been reconciled.
    pub async fn settled(self) -> Result<ToggleOutcome, ConsoleError> {
        self.handle.await.map_err(|e| {
            ConsoleError::protocol_msg(format!(
                "toggle reconciliation for {} did not complete: {e}",
                self.resource_id
            ))
        })
    }
}

struct Shared<T> {
    api: Arc<dyn ToggleApi<T>>,
    cache: QueryCache<T>,
    pending: DashMap<ResourceId, PendingMutation>,
    notices: broadcast::Sender<ToggleNotice>,
    config: ToggleConfig,
}

/// Optimistic toggle controller for resources of type `T`.
pub struct OptimisticToggle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for OptimisticToggle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Toggleable> OptimisticToggle<T> {
    pub fn new(api: Arc<dyn ToggleApi<T>>, cache: QueryCache<T>, config: ToggleConfig) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                api,
                cache,
                pending: DashMap::new(),
                notices,
                config,
            }),
        }
    }

    pub fn cache(&self) -> &QueryCache<T> {
        &self.shared.cache
    }

    /// Subscribes to success/error notices for settled toggles.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<ToggleNotice> {
        self.shared.notices.subscribe()
    }

    /// Returns the in-flight mutation for `id`, if any.
    pub fn pending(&self, id: &ResourceId) -> Option<PendingMutation> {
        self.shared.pending.get(id).map(|entry| entry.clone())
    }

    /// Flips the flag of `id` from `current`.
    ///
    /// The cached resource is updated before this returns; the remote call
    /// and reconciliation continue in a background task. Requires a tokio
    /// runtime.
    pub fn toggle(&self, id: &ResourceId, current: bool) -> Result<ToggleTicket, ConsoleError> {
        let predicted = !current;
        match self.shared.pending.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ConsoleError::TogglePending(id.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingMutation {
                    resource_id: id.clone(),
                    previous_value: current,
                    predicted_value: predicted,
                    request_outcome: RequestOutcome::Unknown,
                });
            }
        }

        if !self
            .shared
            .cache
            .update(id, |resource| resource.set_active(predicted))
        {
            debug!(
                event = "toggle.not_cached",
                domain = "toggle",
                resource_id = %id
            );
        }
        info!(
            event = "toggle.started",
            domain = "toggle",
            resource_id = %id,
            previous = current,
            predicted
        );

        let handle = tokio::spawn(reconcile(Arc::clone(&self.shared), id.clone(), current, predicted));
        Ok(ToggleTicket {
            resource_id: id.clone(),
            handle,
        })
    }
}

impl<T: Toggleable> Shared<T> {
    fn mark(&self, id: &ResourceId, outcome: RequestOutcome) {
        if let Some(mut entry) = self.pending.get_mut(id) {
            entry.request_outcome = outcome;
        }
    }

    fn notify(&self, notice: ToggleNotice) {
        let _ = self.notices.send(notice);
    }

    /// Re-reads the resource after a confirmed toggle to pick up fields the
    /// server recomputed (for example the next run time).
    async fn refresh(&self, id: &ResourceId) {
        match self.api.fetch(id).await {
            // A newer toggle owns the cache entry now.
            Ok(_) if self.pending.contains_key(id) => {
                debug!(event = "toggle.refresh_skipped", domain = "toggle", resource_id = %id);
            }
            Ok(fresh) => self.cache.write(id.clone(), fresh),
            Err(err) => {
                warn!(
                    event = "toggle.refresh_failed",
                    domain = "toggle",
                    resource_id = %id,
                    code = err.code(),
                    error = %err
                );
                self.cache.invalidate(id);
            }
        }
    }
}

async fn reconcile<T: Toggleable>(
    shared: Arc<Shared<T>>,
    id: ResourceId,
    previous: bool,
    predicted: bool,
) -> ToggleOutcome {
    let err = match shared.api.set_active(&id, predicted).await {
        Ok(updated) => {
            shared.mark(&id, RequestOutcome::Success);
            let active = updated.is_active();
            shared.cache.write(id.clone(), updated);
            shared.pending.remove(&id);
            info!(event = "toggle.confirmed", domain = "toggle", resource_id = %id, active);
            shared.notify(ToggleNotice::Success {
                resource_id: id.clone(),
                message: success_message(active),
            });

            tokio::time::sleep(shared.config.settle_delay).await;
            shared.refresh(&id).await;
            return ToggleOutcome::Confirmed { active };
        }
        Err(err) => err,
    };

    shared.mark(&id, RequestOutcome::Failure);
    warn!(
        event = "toggle.request_failed",
        domain = "toggle",
        resource_id = %id,
        code = err.code(),
        ambiguous = err.outcome_is_ambiguous(),
        error = %err,
        verify_delay_ms = shared.config.verify_delay.as_millis() as u64
    );
    tokio::time::sleep(shared.config.verify_delay).await;

    let outcome = match shared.api.fetch(&id).await {
        Ok(fresh) if fresh.is_active() == predicted => {
            shared.cache.write(id.clone(), fresh);
            info!(event = "toggle.recovered_after_error", domain = "toggle", resource_id = %id, active = predicted);
            shared.notify(ToggleNotice::Success {
                resource_id: id.clone(),
                message: success_message(predicted),
            });
            ToggleOutcome::RecoveredAfterError { active: predicted }
        }
        Ok(fresh) => {
            let active = fresh.is_active();
            shared.cache.write(id.clone(), fresh);
            info!(event = "toggle.reverted", domain = "toggle", resource_id = %id, active);
            shared.notify(ToggleNotice::Error {
                resource_id: id.clone(),
                error: err.clone(),
            });
            ToggleOutcome::Reverted { active, error: err }
        }
        Err(fetch_err) => {
            warn!(
                event = "toggle.verify_failed",
                domain = "toggle",
                resource_id = %id,
                code = fetch_err.code(),
                error = %fetch_err
            );
            shared.cache.update(&id, |resource| resource.set_active(previous));
            shared.cache.invalidate(&id);
            shared.notify(ToggleNotice::Error {
                resource_id: id.clone(),
                error: err.clone(),
            });
            ToggleOutcome::Reverted {
                active: previous,
                error: err,
            }
        }
    };
    shared.pending.remove(&id);
    outcome
}

fn success_message(active: bool) -> String {
    if active { "Activated" } else { "Deactivated" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEvent;
    use crate::model::Schedule;
    use chrono::{TimeZone as _, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedApi {
        set_results: Mutex<VecDeque<(Duration, Result<Schedule, ApiError>)>>,
        fetch_results: Mutex<VecDeque<Result<Schedule, ApiError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn on_set(self, result: Result<Schedule, ApiError>) -> Self {
            self.on_set_after(Duration::ZERO, result)
        }

        fn on_set_after(self, latency: Duration, result: Result<Schedule, ApiError>) -> Self {
            self.set_results
                .lock()
                .expect("lock")
                .push_back((latency, result));
            self
        }

        fn on_fetch(self, result: Result<Schedule, ApiError>) -> Self {
            self.fetch_results.lock().expect("lock").push_back(result);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl ToggleApi<Schedule> for ScriptedApi {
        async fn set_active(&self, id: &ResourceId, active: bool) -> Result<Schedule, ApiError> {
            self.calls
                .lock()
                .expect("lock")
                .push(format!("set {id} {active}"));
            let (latency, result) = self
                .set_results
                .lock()
                .expect("lock")
                .pop_front()
                .expect("unexpected set_active call");
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        }

        async fn fetch(&self, id: &ResourceId) -> Result<Schedule, ApiError> {
            self.calls.lock().expect("lock").push(format!("fetch {id}"));
            self.fetch_results
                .lock()
                .expect("lock")
                .pop_front()
                .expect("unexpected fetch call")
        }
    }

    fn schedule(active: bool, next_run_hour: Option<u32>) -> Schedule {
        Schedule {
            id: ResourceId::new("sch_1"),
            name: "Weekly digest".into(),
            is_active: active,
            cron: Some("0 9 * * 1".into()),
            next_run_at: next_run_hour
                .map(|h| Utc.with_ymd_and_hms(2026, 10, 19, h, 0, 0).unwrap()),
            extra: Default::default(),
        }
    }

    fn controller(api: ScriptedApi) -> (OptimisticToggle<Schedule>, Arc<ScriptedApi>) {
        let api = Arc::new(api);
        let cache: QueryCache<Schedule> = QueryCache::new();
        cache.write(ResourceId::new("sch_1"), schedule(false, None));
        let remote: Arc<dyn ToggleApi<Schedule>> = api.clone();
        let toggle = OptimisticToggle::new(remote, cache, ToggleConfig::default());
        (toggle, api)
    }

    fn id() -> ResourceId {
        ResourceId::new("sch_1")
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_value_is_visible_before_the_request_settles() {
        let (toggle, _api) = controller(
            ScriptedApi::default()
                .on_set(Ok(schedule(true, Some(9))))
                .on_fetch(Ok(schedule(true, Some(9)))),
        );
        let mut events = toggle.cache().subscribe();

        let ticket = toggle.toggle(&id(), false).expect("toggle");
        assert!(toggle.cache().get(&id()).expect("cached").is_active);
        assert_eq!(events.try_recv().expect("event"), CacheEvent::Written(id()));
        assert_eq!(
            toggle.pending(&id()),
            Some(PendingMutation {
                resource_id: id(),
                previous_value: false,
                predicted_value: true,
                request_outcome: RequestOutcome::Unknown,
            })
        );
        assert!(matches!(
            toggle.toggle(&id(), true),
            Err(ConsoleError::TogglePending(_))
        ));

        ticket.settled().await.expect("settled");
    }

    #[tokio::test(start_paused = true)]
    async fn success_confirms_and_refetches_server_fields() {
        let (toggle, api) = controller(
            ScriptedApi::default()
                .on_set(Ok(schedule(true, None)))
                .on_fetch(Ok(schedule(true, Some(9)))),
        );
        let mut notices = toggle.subscribe_notices();

        let outcome = toggle
            .toggle(&id(), false)
            .expect("toggle")
            .settled()
            .await
            .expect("settled");

        assert_eq!(outcome, ToggleOutcome::Confirmed { active: true });
        assert_eq!(toggle.pending(&id()), None);
        let cached = toggle.cache().get(&id()).expect("cached");
        assert!(cached.is_active);
        assert!(cached.next_run_at.is_some());
        assert_eq!(api.calls(), vec!["set sch_1 true", "fetch sch_1"]);
        assert!(matches!(
            notices.try_recv().expect("notice"),
            ToggleNotice::Success { message, .. } if message == "Activated"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn success_despite_error_is_not_surfaced() {
        let (toggle, _api) = controller(
            ScriptedApi::default()
                .on_set(Err(ApiError::Transport("operation timed out".into())))
                .on_fetch(Ok(schedule(true, Some(9)))),
        );
        let mut notices = toggle.subscribe_notices();

        let outcome = toggle
            .toggle(&id(), false)
            .expect("toggle")
            .settled()
            .await
            .expect("settled");

        assert_eq!(outcome, ToggleOutcome::RecoveredAfterError { active: true });
        assert!(toggle.cache().get(&id()).expect("cached").is_active);
        assert_eq!(toggle.pending(&id()), None);
        assert!(matches!(
            notices.try_recv().expect("notice"),
            ToggleNotice::Success { .. }
        ));
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn genuine_failure_reverts_and_surfaces_error() {
        let error = ApiError::Validation {
            detail: "schedule has no target blog".into(),
        };
        let (toggle, _api) = controller(
            ScriptedApi::default()
                .on_set(Err(error.clone()))
                .on_fetch(Ok(schedule(false, None))),
        );
        let mut notices = toggle.subscribe_notices();

        let outcome = toggle
            .toggle(&id(), false)
            .expect("toggle")
            .settled()
            .await
            .expect("settled");

        assert_eq!(
            outcome,
            ToggleOutcome::Reverted {
                active: false,
                error: error.clone()
            }
        );
        assert!(!toggle.cache().get(&id()).expect("cached").is_active);
        assert_eq!(toggle.pending(&id()), None);
        assert_eq!(
            notices.try_recv().expect("notice"),
            ToggleNotice::Error {
                resource_id: id(),
                error
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn verification_waits_for_the_configured_delay() {
        let (toggle, _api) = controller(
            ScriptedApi::default()
                .on_set(Err(ApiError::Transport("reset".into())))
                .on_fetch(Ok(schedule(true, None))),
        );
        let started = tokio::time::Instant::now();
        toggle
            .toggle(&id(), false)
            .expect("toggle")
            .settled()
            .await
            .expect("settled");
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verification_restores_previous_value() {
        let (toggle, _api) = controller(
            ScriptedApi::default()
                .on_set(Err(ApiError::Transport("reset".into())))
                .on_fetch(Err(ApiError::Transport("still offline".into()))),
        );

        let outcome = toggle
            .toggle(&id(), false)
            .expect("toggle")
            .settled()
            .await
            .expect("settled");

        assert!(matches!(
            outcome,
            ToggleOutcome::Reverted { active: false, error: ApiError::Transport(msg) } if msg == "reset"
        ));
        assert!(!toggle.cache().get(&id()).expect("cached").is_active);
        assert!(toggle.cache().is_stale(&id()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_after_success_invalidates() {
        let (toggle, _api) = controller(
            ScriptedApi::default()
                .on_set(Ok(schedule(true, None)))
                .on_fetch(Err(ApiError::from_status(500, ""))),
        );
        let outcome = toggle
            .toggle(&id(), false)
            .expect("toggle")
            .settled()
            .await
            .expect("settled");
        assert!(outcome.active());
        assert!(toggle.cache().get(&id()).expect("cached").is_active);
        assert!(toggle.cache().is_stale(&id()));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_refresh_does_not_overwrite_a_newer_toggle() {
        let (toggle, api) = controller(
            ScriptedApi::default()
                .on_set(Ok(schedule(true, None)))
                .on_set_after(Duration::from_secs(30), Ok(schedule(false, None)))
                .on_fetch(Ok(schedule(true, Some(9))))
                .on_fetch(Ok(schedule(false, None))),
        );

        let first = toggle.toggle(&id(), false).expect("first toggle");
        // Let the first request confirm so its pending entry is released.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(toggle.pending(&id()), None);

        let second = toggle.toggle(&id(), true).expect("second toggle");
        assert_eq!(
            first.settled().await.expect("first settled"),
            ToggleOutcome::Confirmed { active: true }
        );

        // The first refresh ran while the second request was in flight.
        assert_eq!(api.calls(), vec!["set sch_1 true", "set sch_1 false", "fetch sch_1"]);
        let cached = toggle.cache().get(&id()).expect("cached");
        assert!(!cached.is_active);
        assert!(cached.next_run_at.is_none());
        assert!(toggle.pending(&id()).is_some());

        assert_eq!(
            second.settled().await.expect("second settled"),
            ToggleOutcome::Confirmed { active: false }
        );
        assert!(!toggle.cache().get(&id()).expect("cached").is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_runs_after_ticket_is_dropped() {
        let (toggle, api) = controller(
            ScriptedApi::default()
                .on_set(Err(ApiError::Transport("reset".into())))
                .on_fetch(Ok(schedule(false, None))),
        );
        drop(toggle.toggle(&id(), false).expect("toggle"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(toggle.pending(&id()), None);
        assert!(!toggle.cache().get(&id()).expect("cached").is_active);
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_resources_toggle_concurrently() {
        let other = ResourceId::new("sch_2");
        let mut second = schedule(true, None);
        second.id = other.clone();
        let mut second_off = second.clone();
        second_off.is_active = false;

        let api = Arc::new(
            ScriptedApi::default()
                .on_set(Ok(schedule(true, None)))
                .on_set(Ok(second_off.clone()))
                .on_fetch(Ok(schedule(true, None)))
                .on_fetch(Ok(second_off)),
        );
        let cache: QueryCache<Schedule> = QueryCache::new();
        cache.write(id(), schedule(false, None));
        cache.write(other.clone(), second);
        let remote: Arc<dyn ToggleApi<Schedule>> = api.clone();
        let toggle = OptimisticToggle::new(remote, cache, ToggleConfig::default());

        let first_ticket = toggle.toggle(&id(), false).expect("first");
        let second_ticket = toggle.toggle(&other, true).expect("second");
        assert!(toggle.pending(&id()).is_some());
        assert!(toggle.pending(&other).is_some());
        assert!(!toggle.cache().get(&other).expect("cached").is_active);

        assert!(first_ticket.settled().await.expect("first settled").active());
        assert!(!second_ticket.settled().await.expect("second settled").active());
        assert_eq!(api.calls().len(), 4);
    }
}
