//! Scripted in-memory runtime for tests

use super::live::{HealthStatus, LiveContainer, LiveState};
use super::{ProbeKind, ProbeResult, ProbeTarget, RuntimeApplier, RuntimeObserver, RuntimeProber};
use crate::error::EngineError;
use crate::lifecycle::CancelToken;
use crate::spec::Spec;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct MockState {
    live: LiveState,
    observe_results: VecDeque<Result<(), EngineError>>,
    apply_results: VecDeque<Result<(), EngineError>>,
    teardown_results: VecDeque<Result<(), EngineError>>,
    probes: HashMap<String, ProbeResult>,
    slow_probes: HashMap<String, Duration>,
    applied: Vec<Spec>,
    torn_down: Vec<Spec>,
    observe_calls: usize,
    apply_calls: usize,
    teardown_calls: usize,
    probe_calls: usize,
    converge: bool,
    cancel_on_observe: Option<CancelToken>,
    starting_observes: usize,
}

/// Runtime double. Successful applies converge the live state onto the
/// applied spec unless `converge(false)` is set.
pub struct MockRuntime {
    project: String,
    state: Mutex<MockState>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

/// Key a probe is scripted under, mirroring verification check ids
pub fn probe_key(target: &ProbeTarget, kind: &ProbeKind) -> String {
    match kind {
        ProbeKind::PortReachable {
            host_port,
            protocol,
            ..
        } => format!("port:{}:{}/{}", target.service, host_port, protocol),
        ProbeKind::VolumeMount { target: path, .. } => {
            format!("volume:{}:{}", target.service, path)
        }
        ProbeKind::Environment { .. } => format!("env:{}", target.service),
        ProbeKind::NetworkReachable { to_service, .. } => {
            format!("network:{}->{}", target.service, to_service)
        }
        ProbeKind::ResourceBaseline { .. } => format!("resources:{}", target.service),
        ProbeKind::Logs { .. } => format!("logs:{}", target.service),
    }
}

impl MockRuntime {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            state: Mutex::new(MockState {
                converge: true,
                ..Default::default()
            }),
            gate: Mutex::new(None),
        }
    }

    pub fn with_live(self, live: LiveState) -> Self {
        self.state.lock().unwrap().live = live;
        self
    }

    pub fn converge(self, converge: bool) -> Self {
        self.state.lock().unwrap().converge = converge;
        self
    }

    pub fn push_observe(&self, result: Result<(), EngineError>) {
        self.state.lock().unwrap().observe_results.push_back(result);
    }

    pub fn push_apply(&self, result: Result<(), EngineError>) {
        self.state.lock().unwrap().apply_results.push_back(result);
    }

    pub fn push_teardown(&self, result: Result<(), EngineError>) {
        self.state.lock().unwrap().teardown_results.push_back(result);
    }

    /// Request cancellation of `token` on every observation
    pub fn cancel_on_observe(&self, token: CancelToken) {
        self.state.lock().unwrap().cancel_on_observe = Some(token);
    }

    /// Report declared healthchecks as starting for the next `observes`
    /// observations
    pub fn settle_health_after(&self, observes: usize) {
        self.state.lock().unwrap().starting_observes = observes;
    }

    pub fn script_probe(&self, key: &str, result: ProbeResult) {
        self.state.lock().unwrap().probes.insert(key.to_string(), result);
    }

    pub fn slow_probe(&self, key: &str, delay: Duration) {
        self.state.lock().unwrap().slow_probes.insert(key.to_string(), delay);
    }

    /// Make the next apply wait. Returns (entered, release).
    pub fn hold_apply(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn live(&self) -> LiveState {
        self.state.lock().unwrap().live.clone()
    }

    pub fn applied(&self) -> Vec<Spec> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn torn_down(&self) -> Vec<Spec> {
        self.state.lock().unwrap().torn_down.clone()
    }

    pub fn observe_calls(&self) -> usize {
        self.state.lock().unwrap().observe_calls
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().unwrap().apply_calls
    }

    pub fn teardown_calls(&self) -> usize {
        self.state.lock().unwrap().teardown_calls
    }

    pub fn probe_calls(&self) -> usize {
        self.state.lock().unwrap().probe_calls
    }

    fn converge_onto(&self, state: &mut MockState, spec: Option<&Spec>) {
        let project = self.project.as_str();
        state
            .live
            .containers
            .retain(|c| c.project.as_deref() != Some(project));
        let Some(spec) = spec else {
            return;
        };
        for service in &spec.services {
            let mut container = LiveContainer::new(
                &service.effective_container_name(project),
                &service.image,
            )
            .project(project)
            .service(&service.name);
            if service.healthcheck.is_some() {
                container = container.health(HealthStatus::Healthy);
            }
            for binding in service.ports.iter().filter_map(|p| p.binding()) {
                if let Some(host_port) = binding.host_port {
                    container = container.publish(host_port, binding.protocol);
                }
            }
            state.live.containers.push(container);
        }
    }
}

#[async_trait]
impl RuntimeObserver for MockRuntime {
    async fn observe(&self) -> Result<LiveState, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.observe_calls += 1;
        if let Some(token) = &state.cancel_on_observe {
            let _ = token.cancel();
        }
        if let Some(Err(e)) = state.observe_results.pop_front() {
            return Err(e);
        }
        let mut live = state.live.clone();
        if state.starting_observes > 0 {
            state.starting_observes -= 1;
            for container in live.containers.iter_mut().filter(|c| c.health.is_some()) {
                container.health = Some(HealthStatus::Starting);
            }
        }
        Ok(live)
    }
}

#[async_trait]
impl RuntimeApplier for MockRuntime {
    async fn apply(&self, spec: &Spec) -> Result<(), EngineError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        state.apply_calls += 1;
        let result = state.apply_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.applied.push(spec.clone());
            if state.converge {
                self.converge_onto(&mut state, Some(spec));
            }
        }
        result
    }

    async fn teardown(&self, spec: &Spec) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.teardown_calls += 1;
        let result = state.teardown_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.torn_down.push(spec.clone());
            self.converge_onto(&mut state, None);
        }
        result
    }
}

#[async_trait]
impl RuntimeProber for MockRuntime {
    async fn probe(
        &self,
        target: &ProbeTarget,
        kind: &ProbeKind,
    ) -> Result<ProbeResult, EngineError> {
        let key = probe_key(target, kind);
        let (delay, scripted) = {
            let mut state = self.state.lock().unwrap();
            state.probe_calls += 1;
            (
                state.slow_probes.get(&key).copied(),
                state.probes.get(&key).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(scripted.unwrap_or_else(|| ProbeResult::pass(format!("{} ok", key))))
    }
}
