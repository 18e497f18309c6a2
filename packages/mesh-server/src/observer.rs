//! Mesh lifecycle observer trait and composite implementation.
//!
//! Registry, breaker and metrics workers report state changes through a
//! [`MeshObserver`]. [`CompositeMeshObserver`] fans each notification out to
//! several observers.

use std::sync::Arc;

use meshkit_core::{CircuitState, InstanceStatus, MeshStatus, ServiceInstance};

/// Observer for mesh state changes.
///
/// All methods default to no-ops so implementations only override what they
/// care about. Called synchronously on the mutating path; implementations
/// must not block.
///
/// Used as `Arc<dyn MeshObserver>`.
pub trait MeshObserver: Send + Sync {
    /// Called after an instance is registered or replaced.
    fn on_registered(&self, _instance: &ServiceInstance) {}

    /// Called after an instance is removed.
    fn on_deregistered(&self, _service: &str, _instance_id: &str) {}

    /// Called when an instance's lifecycle status changes.
    fn on_status_changed(
        &self,
        _service: &str,
        _instance_id: &str,
        _from: InstanceStatus,
        _to: InstanceStatus,
    ) {
    }

    /// Called when a service's breaker changes state.
    fn on_circuit_transition(&self, _service: &str, _from: CircuitState, _to: CircuitState) {}

    /// Called on every metrics snapshot tick.
    fn on_metrics_snapshot(&self, _status: &MeshStatus) {}
}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeMeshObserver {
    observers: Vec<Arc<dyn MeshObserver>>,
}

impl CompositeMeshObserver {
    /// Creates a composite observer with the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn MeshObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn MeshObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl MeshObserver for CompositeMeshObserver {
    fn on_registered(&self, instance: &ServiceInstance) {
        for observer in &self.observers {
            observer.on_registered(instance);
        }
    }

    fn on_deregistered(&self, service: &str, instance_id: &str) {
        for observer in &self.observers {
            observer.on_deregistered(service, instance_id);
        }
    }

    fn on_status_changed(
        &self,
        service: &str,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) {
        for observer in &self.observers {
            observer.on_status_changed(service, instance_id, from, to);
        }
    }

    fn on_circuit_transition(&self, service: &str, from: CircuitState, to: CircuitState) {
        for observer in &self.observers {
            observer.on_circuit_transition(service, from, to);
        }
    }

    fn on_metrics_snapshot(&self, status: &MeshStatus) {
        for observer in &self.observers {
            observer.on_metrics_snapshot(status);
        }
    }
}

/// Observer that records every notification as a string. Test support.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub(crate) log: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub(crate) fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[cfg(test)]
impl MeshObserver for RecordingObserver {
    fn on_registered(&self, instance: &ServiceInstance) {
        self.log
            .lock()
            .push(format!("registered:{}/{}", instance.name, instance.id));
    }

    fn on_deregistered(&self, service: &str, instance_id: &str) {
        self.log
            .lock()
            .push(format!("deregistered:{service}/{instance_id}"));
    }

    fn on_status_changed(
        &self,
        service: &str,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) {
        self.log.lock().push(format!(
            "status:{service}/{instance_id}:{}->{}",
            from.as_str(),
            to.as_str()
        ));
    }

    fn on_circuit_transition(&self, service: &str, from: CircuitState, to: CircuitState) {
        self.log
            .lock()
            .push(format!("circuit:{service}:{}->{}", from.as_str(), to.as_str()));
    }

    fn on_metrics_snapshot(&self, status: &MeshStatus) {
        self.log
            .lock()
            .push(format!("snapshot:{}", status.instances));
    }
}
