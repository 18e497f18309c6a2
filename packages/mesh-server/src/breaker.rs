//! Per-service circuit breakers.
//!
//! One breaker exists per service name, created when the service is first
//! registered. An open breaker schedules a one-shot tokio timer that moves it
//! to half-open after `timeout_ms`. Every state transition bumps the entry's
//! generation, so a timer or probe permit issued under an older generation is
//! ignored when it fires or drops.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshkit_core::{
    BreakerCounts, CircuitBreakerConfig, CircuitBreakerConfigPatch, CircuitBreakerSnapshot,
    CircuitState, ClockSource,
};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::observer::MeshObserver;

struct BreakerEntry {
    snapshot: CircuitBreakerSnapshot,
    /// Pending open -> half-open transition.
    timer: Option<AbortHandle>,
    generation: u64,
    probes_in_flight: u32,
}

impl BreakerEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

type SharedEntry = Arc<Mutex<BreakerEntry>>;

/// Result of asking a breaker whether a call may proceed.
#[derive(Debug)]
pub enum Admission {
    /// The call may be dispatched. Hold the permit until the outcome is recorded.
    Allowed(BreakerPermit),
    /// The breaker is open, or half-open with its probe budget exhausted.
    Rejected(CircuitState),
}

/// Holds one half-open probe slot, released on drop.
///
/// Permits issued while the breaker is closed hold nothing.
#[derive(Debug)]
pub struct BreakerPermit {
    probe: Option<(SharedEntry, u64)>,
}

impl BreakerPermit {
    fn unguarded() -> Self {
        Self { probe: None }
    }

    /// Whether this permit occupies a half-open probe slot.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if let Some((entry, generation)) = self.probe.take() {
            let mut entry = entry.lock();
            if entry.generation == generation {
                entry.probes_in_flight = entry.probes_in_flight.saturating_sub(1);
            }
        }
    }
}

impl std::fmt::Debug for BreakerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerEntry")
            .field("snapshot", &self.snapshot)
            .field("generation", &self.generation)
            .field("probes_in_flight", &self.probes_in_flight)
            .finish_non_exhaustive()
    }
}

/// State shared with timer tasks.
struct Shared {
    clock: Arc<dyn ClockSource>,
    observer: Arc<dyn MeshObserver>,
}

impl Shared {
    fn transition(&self, entry: &mut BreakerEntry, to: CircuitState) -> CircuitState {
        let from = entry.snapshot.state;
        entry.snapshot.state = to;
        entry.generation += 1;
        entry.probes_in_flight = 0;
        from
    }

    fn announce(&self, service: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(service = %service, from = from.as_str(), "circuit breaker opened"),
            CircuitState::HalfOpen => info!(service = %service, "circuit breaker half-open"),
            CircuitState::Closed => info!(service = %service, from = from.as_str(), "circuit breaker closed"),
        }
        metrics::counter!(
            "meshkit_breaker_transitions_total",
            "service" => service.to_string(),
            "state" => to.as_str()
        )
        .increment(1);
        self.observer.on_circuit_transition(service, from, to);
    }

    fn to_half_open(&self, entry: &mut BreakerEntry) -> CircuitState {
        let from = self.transition(entry, CircuitState::HalfOpen);
        entry.timer = None;
        entry.snapshot.success_count = 0;
        entry.snapshot.half_open_at = Some(self.clock.now());
        from
    }
}

/// Registry of per-service circuit breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, SharedEntry>,
    defaults: CircuitBreakerConfig,
    shared: Arc<Shared>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(
        defaults: CircuitBreakerConfig,
        clock: Arc<dyn ClockSource>,
        observer: Arc<dyn MeshObserver>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            shared: Arc::new(Shared { clock, observer }),
        }
    }

    /// Creates a closed breaker with the default config unless one exists.
    pub fn ensure(&self, service: &str) {
        if self.breakers.contains_key(service) {
            return;
        }
        self.breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(BreakerEntry {
                snapshot: CircuitBreakerSnapshot::closed(service, self.defaults),
                timer: None,
                generation: 0,
                probes_in_flight: 0,
            }))
        });
    }

    fn entry(&self, service: &str) -> Option<SharedEntry> {
        self.breakers.get(service).map(|e| e.value().clone())
    }

    /// Moves an open breaker whose timeout has elapsed to half-open when no
    /// timer is pending, which happens when it opened outside a tokio runtime.
    ///
    /// Returns the previous state when it transitioned. The caller announces
    /// it after releasing the entry lock.
    fn expire_untimed(&self, entry: &mut BreakerEntry) -> Option<CircuitState> {
        if entry.snapshot.state != CircuitState::Open || entry.timer.is_some() {
            return None;
        }
        let opened_at = entry.snapshot.opened_at.unwrap_or(0);
        (self.shared.clock.now().saturating_sub(opened_at) >= entry.snapshot.config.timeout_ms)
            .then(|| self.shared.to_half_open(entry))
    }

    #[must_use]
    pub fn state(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        let entry = self.entry(service)?;
        let (snapshot, expired) = {
            let mut entry = entry.lock();
            let expired = self.expire_untimed(&mut entry);
            (entry.snapshot.clone(), expired)
        };
        if let Some(from) = expired {
            self.shared.announce(service, from, CircuitState::HalfOpen);
        }
        Some(snapshot)
    }

    /// Snapshots of every breaker, ordered by service name.
    #[must_use]
    pub fn all_states(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().filter_map(|name| self.state(name)).collect()
    }

    #[must_use]
    pub fn counts(&self) -> BreakerCounts {
        let states = self.all_states();
        BreakerCounts {
            total: states.len(),
            open: states
                .iter()
                .filter(|s| s.state == CircuitState::Open)
                .count(),
            half_open: states
                .iter()
                .filter(|s| s.state == CircuitState::HalfOpen)
                .count(),
        }
    }

    #[must_use]
    pub fn is_open(&self, service: &str) -> bool {
        self.state(service)
            .is_some_and(|s| s.state == CircuitState::Open)
    }

    /// Asks whether a call to `service` may be dispatched.
    ///
    /// Services without a breaker are always allowed.
    pub fn try_acquire(&self, service: &str) -> Admission {
        let Some(shared_entry) = self.entry(service) else {
            return Admission::Allowed(BreakerPermit::unguarded());
        };
        let (admission, expired) = {
            let mut entry = shared_entry.lock();
            let expired = self.expire_untimed(&mut entry);
            let admission = match entry.snapshot.state {
                CircuitState::Closed => Admission::Allowed(BreakerPermit::unguarded()),
                CircuitState::Open => Admission::Rejected(CircuitState::Open),
                CircuitState::HalfOpen
                    if entry.probes_in_flight >= entry.snapshot.config.half_open_requests =>
                {
                    Admission::Rejected(CircuitState::HalfOpen)
                }
                CircuitState::HalfOpen => {
                    entry.probes_in_flight += 1;
                    Admission::Allowed(BreakerPermit {
                        probe: Some((Arc::clone(&shared_entry), entry.generation)),
                    })
                }
            };
            (admission, expired)
        };
        if let Some(from) = expired {
            self.shared.announce(service, from, CircuitState::HalfOpen);
        }
        admission
    }

    /// Records a successful call. Returns `false` for an unknown service.
    pub fn record_success(&self, service: &str) -> bool {
        let Some(entry) = self.entry(service) else {
            return false;
        };
        let transition = {
            let mut entry = entry.lock();
            entry.snapshot.success_count = entry.snapshot.success_count.saturating_add(1);
            entry.snapshot.last_success = Some(self.shared.clock.now());

            if entry.snapshot.state == CircuitState::HalfOpen
                && entry.snapshot.success_count >= entry.snapshot.config.success_threshold
            {
                entry.snapshot.failure_count = 0;
                Some(self.shared.transition(&mut entry, CircuitState::Closed))
            } else {
                None
            }
        };
        if let Some(from) = transition {
            self.shared.announce(service, from, CircuitState::Closed);
        }
        true
    }

    /// Records a failed call. Returns `false` for an unknown service.
    ///
    /// Reaching the failure threshold while closed opens the breaker; any
    /// failure while half-open re-opens it and restarts the timer.
    pub fn record_failure(&self, service: &str) -> bool {
        let Some(shared_entry) = self.entry(service) else {
            return false;
        };
        let transition = {
            let mut entry = shared_entry.lock();
            let now = self.shared.clock.now();
            entry.snapshot.failure_count = entry.snapshot.failure_count.saturating_add(1);
            entry.snapshot.last_failure = Some(now);

            let should_open = match entry.snapshot.state {
                CircuitState::Closed => {
                    entry.snapshot.failure_count >= entry.snapshot.config.failure_threshold
                }
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if should_open {
                let from = self.shared.transition(&mut entry, CircuitState::Open);
                entry.snapshot.opened_at = Some(now);
                self.schedule_half_open(service, &shared_entry, &mut entry);
                Some(from)
            } else {
                None
            }
        };
        if let Some(from) = transition {
            self.shared.announce(service, from, CircuitState::Open);
        }
        true
    }

    fn schedule_half_open(&self, service: &str, shared_entry: &SharedEntry, entry: &mut BreakerEntry) {
        entry.cancel_timer();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: the transition happens lazily on the next read.
            return;
        };

        let generation = entry.generation;
        let delay = Duration::from_millis(entry.snapshot.config.timeout_ms);
        let weak = Arc::downgrade(shared_entry);
        let shared = Arc::clone(&self.shared);
        let service = service.to_string();

        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(entry) = weak.upgrade() else {
                return;
            };
            let from = {
                let mut entry = entry.lock();
                if entry.generation != generation || entry.snapshot.state != CircuitState::Open {
                    return;
                }
                shared.to_half_open(&mut entry)
            };
            shared.announce(&service, from, CircuitState::HalfOpen);
        });
        entry.timer = Some(task.abort_handle());
    }

    /// Forces the breaker closed with zeroed counters and cancels any pending
    /// timer. Returns `false` for an unknown service.
    pub fn reset(&self, service: &str) -> bool {
        let Some(entry) = self.entry(service) else {
            return false;
        };
        let from = {
            let mut entry = entry.lock();
            entry.cancel_timer();
            let from = self.shared.transition(&mut entry, CircuitState::Closed);
            entry.snapshot.failure_count = 0;
            entry.snapshot.success_count = 0;
            entry.snapshot.opened_at = None;
            entry.snapshot.half_open_at = None;
            from
        };
        info!(service = %service, "circuit breaker manually reset");
        if from != CircuitState::Closed {
            self.shared.announce(service, from, CircuitState::Closed);
        }
        true
    }

    /// Merges a partial config into the breaker's config. Counters and state
    /// are left alone. Returns `false` for an unknown service.
    pub fn configure(&self, service: &str, patch: &CircuitBreakerConfigPatch) -> bool {
        let Some(entry) = self.entry(service) else {
            return false;
        };
        entry.lock().snapshot.config.merge(patch);
        true
    }

    /// Aborts every pending half-open timer.
    pub fn shutdown(&self) {
        for entry in &self.breakers {
            entry.value().lock().cancel_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use meshkit_core::ManualClock;

    use super::*;
    use crate::observer::RecordingObserver;

    fn registry(clock: Arc<ManualClock>) -> (CircuitBreakerRegistry, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 1_000,
            half_open_requests: 2,
        };
        (
            CircuitBreakerRegistry::new(config, clock, observer.clone()),
            observer,
        )
    }

    fn trip(breakers: &CircuitBreakerRegistry, service: &str) {
        for _ in 0..3 {
            breakers.record_failure(service);
        }
    }

    #[test]
    fn unknown_service_reports_absent() {
        let (breakers, _) = registry(Arc::new(ManualClock::new(0)));
        assert!(breakers.state("billing").is_none());
        assert!(!breakers.reset("billing"));
        assert!(!breakers.configure("billing", &CircuitBreakerConfigPatch::default()));
        assert!(!breakers.record_failure("billing"));
        assert!(matches!(
            breakers.try_acquire("billing"),
            Admission::Allowed(_)
        ));
    }

    #[test]
    fn opens_at_failure_threshold() {
        let (breakers, observer) = registry(Arc::new(ManualClock::new(500)));
        breakers.ensure("billing");
        breakers.record_failure("billing");
        breakers.record_failure("billing");
        assert!(!breakers.is_open("billing"));
        breakers.record_failure("billing");

        let state = breakers.state("billing").unwrap();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.failure_count, 3);
        assert_eq!(state.opened_at, Some(500));
        assert!(matches!(
            breakers.try_acquire("billing"),
            Admission::Rejected(CircuitState::Open)
        ));
        assert_eq!(observer.entries(), vec!["circuit:billing:closed->open"]);
    }

    #[test]
    fn lazily_half_opens_without_runtime() {
        let clock = Arc::new(ManualClock::new(0));
        let (breakers, _) = registry(clock.clone());
        breakers.ensure("billing");
        trip(&breakers, "billing");

        clock.advance(999);
        assert!(breakers.is_open("billing"));
        clock.advance(1);
        let state = breakers.state("billing").unwrap();
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.half_open_at, Some(1_000));
        assert_eq!(state.success_count, 0);
    }

    #[test]
    fn counters_saturate_instead_of_overflowing() {
        let (breakers, _) = registry(Arc::new(ManualClock::new(0)));
        breakers.ensure("billing");
        breakers.configure(
            "billing",
            &CircuitBreakerConfigPatch {
                failure_threshold: Some(u32::MAX),
                ..CircuitBreakerConfigPatch::default()
            },
        );
        {
            let entry = breakers.entry("billing").unwrap();
            let mut entry = entry.lock();
            entry.snapshot.success_count = u32::MAX;
            entry.snapshot.failure_count = u32::MAX - 1;
        }
        breakers.record_success("billing");
        breakers.record_failure("billing");
        let state = breakers.state("billing").unwrap();
        assert_eq!(state.success_count, u32::MAX);
        assert_eq!(state.failure_count, u32::MAX);
        assert_eq!(state.state, CircuitState::Open);
    }

    /// Reads the breaker back from inside the transition callback.
    #[derive(Default)]
    struct ReadBack {
        breakers: Mutex<Option<Arc<CircuitBreakerRegistry>>>,
        seen: Mutex<Vec<CircuitState>>,
    }

    impl MeshObserver for ReadBack {
        fn on_circuit_transition(&self, service: &str, _from: CircuitState, _to: CircuitState) {
            let breakers = self.breakers.lock().clone();
            if let Some(state) = breakers.and_then(|b| b.state(service)) {
                self.seen.lock().push(state.state);
            }
        }
    }

    #[test]
    fn observer_may_read_state_during_lazy_half_open() {
        let clock = Arc::new(ManualClock::new(0));
        let observer = Arc::new(ReadBack::default());
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_ms: 10,
            ..CircuitBreakerConfig::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config,
            clock.clone(),
            observer.clone(),
        ));
        *observer.breakers.lock() = Some(Arc::clone(&breakers));
        breakers.ensure("billing");
        breakers.record_failure("billing");
        clock.advance(10);

        let (tx, rx) = std::sync::mpsc::channel();
        let reader = Arc::clone(&breakers);
        std::thread::spawn(move || {
            let _ = tx.send(reader.state("billing").map(|s| s.state));
        });
        let state = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("state() must not block on its own transition");
        assert_eq!(state, Some(CircuitState::HalfOpen));
        assert_eq!(
            *observer.seen.lock(),
            vec![CircuitState::Open, CircuitState::HalfOpen]
        );

        *observer.breakers.lock() = None;
    }

    #[test]
    fn half_open_probe_budget() {
        let clock = Arc::new(ManualClock::new(0));
        let (breakers, _) = registry(clock.clone());
        breakers.ensure("billing");
        trip(&breakers, "billing");
        clock.advance(1_000);

        let Admission::Allowed(p1) = breakers.try_acquire("billing") else {
            panic!("first probe rejected");
        };
        let Admission::Allowed(p2) = breakers.try_acquire("billing") else {
            panic!("second probe rejected");
        };
        assert!(p1.is_probe() && p2.is_probe());
        assert!(matches!(
            breakers.try_acquire("billing"),
            Admission::Rejected(CircuitState::HalfOpen)
        ));
        drop(p1);
        assert!(matches!(
            breakers.try_acquire("billing"),
            Admission::Allowed(_)
        ));
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let clock = Arc::new(ManualClock::new(0));
        let (breakers, observer) = registry(clock.clone());
        breakers.ensure("billing");
        trip(&breakers, "billing");
        clock.advance(1_000);
        assert_eq!(
            breakers.state("billing").unwrap().state,
            CircuitState::HalfOpen
        );

        breakers.record_success("billing");
        assert_eq!(
            breakers.state("billing").unwrap().state,
            CircuitState::HalfOpen
        );
        breakers.record_success("billing");
        let state = breakers.state("billing").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(
            observer.entries(),
            vec![
                "circuit:billing:closed->open",
                "circuit:billing:open->half-open",
                "circuit:billing:half-open->closed",
            ]
        );
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let clock = Arc::new(ManualClock::new(0));
        let (breakers, _) = registry(clock.clone());
        breakers.ensure("billing");
        trip(&breakers, "billing");
        clock.advance(1_000);
        assert!(!breakers.is_open("billing"));

        breakers.record_failure("billing");
        let state = breakers.state("billing").unwrap();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.opened_at, Some(1_000));
    }

    #[test]
    fn reset_and_configure() {
        let (breakers, _) = registry(Arc::new(ManualClock::new(0)));
        breakers.ensure("billing");
        breakers.record_failure("billing");
        assert!(breakers.configure(
            "billing",
            &CircuitBreakerConfigPatch {
                failure_threshold: Some(10),
                ..CircuitBreakerConfigPatch::default()
            }
        ));
        let state = breakers.state("billing").unwrap();
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.config.failure_threshold, 10);
        assert_eq!(state.config.timeout_ms, 1_000);

        trip(&breakers, "billing");
        trip(&breakers, "billing");
        trip(&breakers, "billing");
        assert!(breakers.is_open("billing"));
        assert!(breakers.reset("billing"));
        let state = breakers.state("billing").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.opened_at, None);
    }

    #[test]
    fn counts_by_state() {
        let (breakers, _) = registry(Arc::new(ManualClock::new(0)));
        breakers.ensure("a");
        breakers.ensure("b");
        trip(&breakers, "b");
        let counts = breakers.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.open, 1);
        assert_eq!(counts.half_open, 0);
        let names: Vec<_> = breakers
            .all_states()
            .into_iter()
            .map(|s| s.service_name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_moves_open_to_half_open() {
        let (breakers, observer) = registry(Arc::new(ManualClock::new(0)));
        breakers.ensure("billing");
        trip(&breakers, "billing");

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(breakers.is_open("billing"));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(
            breakers.state("billing").unwrap().state,
            CircuitState::HalfOpen
        );
        assert!(observer
            .entries()
            .contains(&"circuit:billing:open->half-open".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_reschedules_timer() {
        let (breakers, _) = registry(Arc::new(ManualClock::new(0)));
        breakers.ensure("billing");
        trip(&breakers, "billing");
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(
            breakers.state("billing").unwrap().state,
            CircuitState::HalfOpen
        );

        breakers.record_failure("billing");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(breakers.is_open("billing"));
        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(
            breakers.state("billing").unwrap().state,
            CircuitState::HalfOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_timer() {
        let (breakers, observer) = registry(Arc::new(ManualClock::new(0)));
        breakers.ensure("billing");
        trip(&breakers, "billing");
        breakers.reset("billing");
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(
            breakers.state("billing").unwrap().state,
            CircuitState::Closed
        );
        assert!(!observer
            .entries()
            .iter()
            .any(|e| e.ends_with("->half-open")));
    }
}
