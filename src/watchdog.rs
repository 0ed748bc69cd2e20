//! Spot reclamation watchdog.
//!
//! One watchdog runs per spot request for the lifetime of its instance,
//! polling the request status on the provider's recommended interval. On
//! `marked-for-termination` it triggers the same termination sequence a
//! user-initiated shutdown uses — racing the provider's hard reclamation
//! deadline of roughly two minutes — and exits. If the request or its
//! instance has already disappeared, someone else cleaned up and the
//! watchdog exits silently.
//!
//! Watchdogs are supervised through a [`WatchdogRegistry`] keyed by
//! request id, which both guards against a second watchdog for the same
//! request and provides the cancellation point when a node is terminated
//! deliberately or the process shuts down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::provider::Provider;

/// The provider's documented recommended polling interval for spot
/// request status.
pub const SPOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Why a watchdog stopped polling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchdogOutcome {
    /// The provider flagged the capacity for reclamation while the
    /// instance was still running; termination must be triggered now.
    Reclaimed,
    /// The request or its instance no longer exists; nothing to do.
    Gone,
}

/// Errors raised by the watchdog registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WatchdogError {
    /// Exactly one watchdog may run per live spot request.
    #[error("a watchdog is already running for spot request {request_id}")]
    AlreadyWatching {
        /// Request id that is already being watched.
        request_id: String,
    },
}

/// Poller observing a single spot request.
#[derive(Clone, Debug)]
pub struct SpotWatchdog<P> {
    provider: P,
    request_id: String,
    poll_interval: Duration,
}

impl<P: Provider> SpotWatchdog<P> {
    /// Creates a watchdog for the given spot request.
    #[must_use]
    pub fn new(provider: P, request_id: impl Into<String>) -> Self {
        Self {
            provider,
            request_id: request_id.into(),
            poll_interval: SPOT_POLL_INTERVAL,
        }
    }

    /// Overrides the polling interval.
    ///
    /// This is primarily used by tests to keep polling scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The spot request this watchdog observes.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Polls until the request is reclaimed or gone. Observes the
    /// reclamation transition at most once; the caller reacts to
    /// [`WatchdogOutcome::Reclaimed`] by running the termination sequence.
    ///
    /// # Errors
    ///
    /// Returns the provider error when a status poll fails.
    pub async fn run(self) -> Result<WatchdogOutcome, P::Error> {
        loop {
            let Some(request) = self.provider.describe_spot_request(&self.request_id).await?
            else {
                tracing::debug!(request = %self.request_id, "spot request gone; watchdog exiting");
                return Ok(WatchdogOutcome::Gone);
            };

            if request.is_marked_for_termination() {
                if self.instance_running(request.instance_id.as_deref()).await? {
                    tracing::warn!(
                        request = %self.request_id,
                        "spot capacity marked for termination; triggering shutdown"
                    );
                    return Ok(WatchdogOutcome::Reclaimed);
                }
                tracing::debug!(
                    request = %self.request_id,
                    "marked for termination but instance already down; watchdog exiting"
                );
                return Ok(WatchdogOutcome::Gone);
            }

            if let Some(instance_id) = request.instance_id.as_deref() {
                if !self.instance_running(Some(instance_id)).await? {
                    tracing::debug!(
                        request = %self.request_id,
                        instance = %instance_id,
                        "instance no longer running; watchdog exiting"
                    );
                    return Ok(WatchdogOutcome::Gone);
                }
            }

            if request.is_terminal() {
                return Ok(WatchdogOutcome::Gone);
            }

            sleep(self.poll_interval).await;
        }
    }

    async fn instance_running(&self, instance_id: Option<&str>) -> Result<bool, P::Error> {
        let Some(instance_id) = instance_id else {
            return Ok(false);
        };
        let instance = self.provider.describe_instance(instance_id).await?;
        Ok(instance.is_some_and(|instance| instance.is_running()))
    }
}

#[derive(Debug)]
struct WatchdogEntry {
    instance_id: String,
    handle: JoinHandle<()>,
}

/// Supervises background watchdog tasks, one per spot request id.
#[derive(Debug, Default)]
pub struct WatchdogRegistry {
    entries: Mutex<HashMap<String, WatchdogEntry>>,
}

impl WatchdogRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, WatchdogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a supervised watchdog task. `on_reclaim` runs exactly once
    /// if the watchdog observes the reclamation transition.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::AlreadyWatching`] when a watchdog for the
    /// same request id is already registered.
    pub fn watch<P, F, Fut>(
        self: &Arc<Self>,
        watchdog: SpotWatchdog<P>,
        instance_id: &str,
        on_reclaim: F,
    ) -> Result<(), WatchdogError>
    where
        P: Provider + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let request_id = watchdog.request_id().to_owned();
        let mut entries = self.entries();
        if entries.contains_key(&request_id) {
            return Err(WatchdogError::AlreadyWatching { request_id });
        }

        let registry = Arc::clone(self);
        let task_request_id = request_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = watchdog.run().await;
            // Deregister before reacting: the termination sequence cancels
            // watchdogs by instance and must not abort its own task.
            registry.entries().remove(&task_request_id);
            match outcome {
                Ok(WatchdogOutcome::Reclaimed) => on_reclaim().await,
                Ok(WatchdogOutcome::Gone) => {}
                Err(err) => {
                    tracing::error!(
                        request = %task_request_id,
                        error = %err,
                        "spot watchdog failed"
                    );
                }
            }
        });
        entries.insert(
            request_id,
            WatchdogEntry {
                instance_id: instance_id.to_owned(),
                handle,
            },
        );
        Ok(())
    }

    /// Whether a watchdog is registered for the request id.
    #[must_use]
    pub fn is_watching(&self, request_id: &str) -> bool {
        self.entries().contains_key(request_id)
    }

    /// Aborts and removes the watchdog for a request id. Returns whether
    /// one was registered.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.entries().remove(request_id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts and removes any watchdog attached to the instance; used
    /// when a node is terminated deliberately so its watchdog cannot race
    /// the shutdown it would otherwise trigger.
    pub fn cancel_for_instance(&self, instance_id: &str) {
        let mut entries = self.entries();
        let matching: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.instance_id == instance_id)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        for request_id in matching {
            if let Some(entry) = entries.remove(&request_id) {
                entry.handle.abort();
            }
        }
    }

    /// Aborts every watchdog; the process-shutdown cancellation point.
    pub fn shutdown(&self) {
        for (_, entry) in self.entries().drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MARKED_FOR_TERMINATION, SpotRequest};
    use crate::test_support::{FAKE_ZONE, FakeProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAST: Duration = Duration::from_millis(1);

    fn marked(request_id: &str, instance_id: &str) -> SpotRequest {
        SpotRequest {
            id: request_id.to_owned(),
            state: String::from("active"),
            status_code: String::from(MARKED_FOR_TERMINATION),
            instance_id: Some(instance_id.to_owned()),
        }
    }

    fn fulfilled(request_id: &str, instance_id: &str) -> SpotRequest {
        SpotRequest {
            id: request_id.to_owned(),
            state: String::from("active"),
            status_code: String::from("fulfilled"),
            instance_id: Some(instance_id.to_owned()),
        }
    }

    #[tokio::test]
    async fn run_observes_reclamation_after_healthy_polls() {
        let provider = FakeProvider::new();
        let instance = provider.seed_instance("spotbox", FAKE_ZONE, "203.0.113.5");
        provider.script_spot_status("sir-9", Some(fulfilled("sir-9", &instance.id)));
        provider.script_spot_status("sir-9", Some(marked("sir-9", &instance.id)));

        let outcome = SpotWatchdog::new(provider, "sir-9")
            .with_poll_interval(FAST)
            .run()
            .await
            .expect("fake provider does not fail");
        assert_eq!(outcome, WatchdogOutcome::Reclaimed);
    }

    #[tokio::test]
    async fn run_exits_silently_when_request_vanishes() {
        let provider = FakeProvider::new();

        let outcome = SpotWatchdog::new(provider, "sir-gone")
            .with_poll_interval(FAST)
            .run()
            .await
            .expect("fake provider does not fail");
        assert_eq!(outcome, WatchdogOutcome::Gone);
    }

    #[tokio::test]
    async fn run_exits_silently_when_instance_already_terminated() {
        let provider = FakeProvider::new();
        let instance = provider.seed_instance("spotbox", FAKE_ZONE, "203.0.113.5");
        provider
            .terminate_instance(&instance.id)
            .await
            .expect("fake provider does not fail");
        provider.script_spot_status("sir-9", Some(marked("sir-9", &instance.id)));

        let outcome = SpotWatchdog::new(provider, "sir-9")
            .with_poll_interval(FAST)
            .run()
            .await
            .expect("fake provider does not fail");
        assert_eq!(outcome, WatchdogOutcome::Gone);
    }

    #[tokio::test]
    async fn registry_triggers_termination_exactly_once() {
        let provider = FakeProvider::new();
        let instance = provider.seed_instance("spotbox", FAKE_ZONE, "203.0.113.5");
        provider.script_spot_status("sir-9", Some(marked("sir-9", &instance.id)));

        let registry = Arc::new(WatchdogRegistry::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        let watchdog = SpotWatchdog::new(provider, "sir-9").with_poll_interval(FAST);
        registry
            .watch(watchdog, &instance.id, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("first watchdog registers");

        for _ in 0..200 {
            if !registry.is_watching("sir-9") {
                break;
            }
            sleep(FAST).await;
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(!registry.is_watching("sir-9"), "watchdog must deregister");
    }

    #[tokio::test]
    async fn registry_refuses_second_watchdog_for_same_request() {
        let provider = FakeProvider::new();
        let registry = Arc::new(WatchdogRegistry::new());

        let first = SpotWatchdog::new(provider.clone(), "sir-9").with_poll_interval(FAST);
        provider.script_spot_status("sir-9", Some(fulfilled("sir-9", "i-1")));
        registry
            .watch(first, "i-1", || async {})
            .expect("first watchdog registers");

        let second = SpotWatchdog::new(provider, "sir-9").with_poll_interval(FAST);
        let err = registry
            .watch(second, "i-1", || async {})
            .expect_err("duplicate watchdog must be refused");
        assert_eq!(
            err,
            WatchdogError::AlreadyWatching {
                request_id: String::from("sir-9")
            }
        );
    }

    #[tokio::test]
    async fn cancel_for_instance_aborts_the_watchdog() {
        let provider = FakeProvider::new();
        let registry = Arc::new(WatchdogRegistry::new());
        let instance = provider.seed_instance("spotbox", FAKE_ZONE, "203.0.113.5");
        provider.script_spot_status("sir-9", Some(fulfilled("sir-9", &instance.id)));
        let watchdog = SpotWatchdog::new(provider.clone(), "sir-9")
            .with_poll_interval(Duration::from_secs(60));
        registry
            .watch(watchdog, &instance.id, || async {})
            .expect("watchdog registers");
        assert!(registry.is_watching("sir-9"));

        registry.cancel_for_instance(&instance.id);
        assert!(!registry.is_watching("sir-9"));
    }
}
