//! Lifecycle controller
//!
//! Drives specs through validate, back up, diff, conflict check, apply and
//! verify. Nothing touches the runtime before Applying; a failure while
//! applying restores the last snapshot when one exists.

use super::audit::{AuditTrail, OperationKind};
use super::cancel::CancelToken;
use super::operation::{Operation, OperationOutput};
use super::state::LifecycleState;
use crate::backup::{SnapshotRecord, SnapshotStore};
use crate::compose::ComposeParser;
use crate::config::ManagerConfig;
use crate::conflict::ConflictDetector;
use crate::diff::{self, DiffResult};
use crate::error::{EngineError, KeelError, Result};
use crate::runtime::{run_with_retry, ContainerRuntime, LiveState, RetryPolicy};
use crate::spec::Spec;
use crate::validate::{ValidationMode, ValidationReport, Validator};
use crate::verify::{VerificationOutcome, VerificationSuite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Terminal state of an operation plus its audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleResult {
    pub state: LifecycleState,
    pub audit: AuditTrail,
}

impl LifecycleResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Succeeded | LifecycleState::SucceededWithWarnings
        )
    }
}

/// State guarded by the apply lock
#[derive(Debug, Default)]
struct Deployment {
    applied: Option<Arc<Spec>>,
}

/// One operation's walk through the state machine
struct Run<'a> {
    project: &'a str,
    audit: AuditTrail,
}

impl<'a> Run<'a> {
    fn new(kind: OperationKind, project: &'a str, reason: Option<&str>) -> Self {
        Self {
            project,
            audit: AuditTrail::new(kind, project, reason),
        }
    }

    fn enter(&mut self, next: LifecycleState) -> Result<()> {
        let current = self.audit.state();
        if !current.can_transition_to(next) {
            return Err(KeelError::InvalidTransition(format!("{} -> {}", current, next)));
        }
        info!(
            "[{}] {} {}: {} -> {}",
            self.project, self.audit.operation, self.audit.id, current, next
        );
        self.audit.record(next);
        Ok(())
    }

    fn finish(
        mut self,
        state: LifecycleState,
        error: Option<KeelError>,
    ) -> Result<LifecycleResult> {
        if let Some(e) = error {
            self.audit.error = Some(e.to_string());
        }
        self.enter(state)?;
        self.audit.finished_at = Some(Utc::now());
        self.audit.emit();
        Ok(LifecycleResult {
            state,
            audit: self.audit,
        })
    }

    fn fail(self, error: KeelError) -> Result<LifecycleResult> {
        error!("[{}] {} failed: {}", self.project, self.audit.operation, error);
        self.finish(LifecycleState::Failed, Some(error))
    }
}

/// Owns the applied spec of one compose project and every change to it
pub struct Controller {
    project: String,
    detect_conflicts: bool,
    apply_policy: RetryPolicy,
    observe_policy: RetryPolicy,
    validator: Validator,
    detector: ConflictDetector,
    suite: VerificationSuite,
    health_wait: Duration,
    health_poll: Duration,
    store: Arc<dyn SnapshotStore>,
    runtime: Arc<dyn ContainerRuntime>,
    deployment: Mutex<Deployment>,
    published: RwLock<Option<Arc<Spec>>>,
}

impl Controller {
    pub fn new(
        config: &ManagerConfig,
        store: Arc<dyn SnapshotStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let suite = VerificationSuite::new(&config.project)
            .probe_timeout(config.probe_timeout())
            .log_window(config.log_window_lines)
            .fatal_patterns(config.fatal_log_patterns.clone())
            .baseline(config.baseline_cpu_percent, config.baseline_memory_percent);

        Self {
            project: config.project.clone(),
            detect_conflicts: config.detect_conflicts,
            apply_policy: config.apply_policy(),
            observe_policy: config.observe_policy(),
            validator: Validator::new(config.resource_ceiling.clone()),
            detector: ConflictDetector::new(&config.project, config.conflict_thresholds),
            suite,
            health_wait: config.health_wait(),
            health_poll: config.health_poll(),
            store,
            runtime,
            deployment: Mutex::new(Deployment::default()),
            published: RwLock::new(None),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Record `spec` as already applied, e.g. when resuming a project
    pub fn adopt(&self, spec: Spec) -> Result<()> {
        let mut deployment = self.lock()?;
        let spec = Arc::new(spec);
        deployment.applied = Some(spec.clone());
        self.publish(Some(spec));
        info!("[{}] Adopted applied spec", self.project);
        Ok(())
    }

    /// The applied spec. Does not wait for an in-flight operation.
    pub fn applied(&self) -> Option<Arc<Spec>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parse and validate a raw compose document
    pub fn propose(&self, raw: &str) -> Result<ValidationReport> {
        let spec = ComposeParser::parse_str(raw)?;
        let report = self.validator.validate(&spec, ValidationMode::Deploy);
        info!(
            "[{}] Proposed spec: {} error(s), {} warning(s)",
            self.project,
            report.errors.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Compare `spec` with the applied spec
    pub fn preview_diff(&self, spec: &Spec) -> DiffResult {
        let applied = self.applied();
        let empty = Spec::new();
        diff::diff(applied.as_deref().unwrap_or(&empty), spec)
    }

    /// How the running project differs from the applied spec, or `None`
    /// when nothing has been applied
    pub async fn drift(&self) -> Result<Option<DiffResult>> {
        let Some(applied) = self.applied() else {
            return Ok(None);
        };
        let live = self.observe().await?;
        let drift = diff::diff_live(&applied, &live, &self.project);
        info!("[{}] Drift: {}", self.project, drift.summary());
        Ok(Some(drift))
    }

    /// Stored snapshots, oldest first
    pub fn snapshots(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SnapshotRecord>> {
        self.store.list(since)?.collect()
    }

    pub async fn apply(&self, spec: Spec, reason: Option<&str>) -> Result<LifecycleResult> {
        self.apply_with_cancel(spec, reason, &CancelToken::new()).await
    }

    /// Apply `spec`, honouring `cancel` until the runtime is touched.
    ///
    /// Returns `OperationInFlight` without doing anything if another
    /// operation holds the project; every other outcome is a terminal
    /// [`LifecycleResult`].
    pub async fn apply_with_cancel(
        &self,
        spec: Spec,
        reason: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<LifecycleResult> {
        let mut deployment = self.lock()?;
        self.converge(&mut deployment, spec, OperationKind::Apply, reason, cancel)
            .await
    }

    /// Drive snapshot `snapshot_id` through the full apply pipeline
    pub async fn rollback(&self, snapshot_id: &str) -> Result<LifecycleResult> {
        let mut deployment = self.lock()?;
        let spec = self.store.restore(snapshot_id)?;
        let reason = format!("rollback to {}", snapshot_id);
        self.converge(
            &mut deployment,
            spec,
            OperationKind::Rollback,
            Some(&reason),
            &CancelToken::new(),
        )
        .await
    }

    /// Remove everything the applied spec created
    pub async fn teardown(&self, reason: Option<&str>) -> Result<LifecycleResult> {
        let mut deployment = self.lock()?;
        let mut run = Run::new(OperationKind::Teardown, &self.project, reason);
        let target = Spec::new();

        run.enter(LifecycleState::Validating)?;
        let report = self.validator.validate(&target, ValidationMode::TeardownOnly);
        let invalid = report.to_error();
        run.audit.validation = Some(report);
        if let Some(e) = invalid {
            return run.fail(e);
        }
        let Some(previous) = deployment.applied.clone() else {
            return run.fail(KeelError::NothingApplied(self.project.clone()));
        };

        run.enter(LifecycleState::BackingUp)?;
        match self.store.snapshot(&previous, reason) {
            Ok(record) => run.audit.snapshot_id = Some(record.id),
            Err(e) => return run.fail(e),
        }

        run.enter(LifecycleState::Diffing)?;
        run.audit.diff = Some(diff::diff(&previous, &target));

        run.enter(LifecycleState::Applying)?;
        let result = run_with_retry("teardown", &self.apply_policy, || {
            self.runtime.teardown(&previous)
        })
        .await;
        if let Err(e) = result {
            return self.recover(run, e).await;
        }

        deployment.applied = None;
        self.publish(None);
        run.finish(LifecycleState::Succeeded, None)
    }

    /// Dispatch a closed-set operation
    pub async fn execute(&self, operation: Operation) -> Result<OperationOutput> {
        Ok(match operation {
            Operation::Propose { raw } => OperationOutput::Propose(self.propose(&raw)?),
            Operation::Apply { spec, reason } => {
                OperationOutput::Apply(self.apply(spec, reason.as_deref()).await?)
            }
            Operation::Rollback { snapshot_id } => {
                OperationOutput::Rollback(self.rollback(&snapshot_id).await?)
            }
            Operation::PreviewDiff { spec } => {
                OperationOutput::PreviewDiff(self.preview_diff(&spec))
            }
            Operation::Teardown { reason } => {
                OperationOutput::Teardown(self.teardown(reason.as_deref()).await?)
            }
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Deployment>> {
        self.deployment
            .try_lock()
            .map_err(|_| KeelError::OperationInFlight(self.project.clone()))
    }

    fn publish(&self, spec: Option<Arc<Spec>>) {
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = spec;
    }

    async fn observe(&self) -> std::result::Result<LiveState, EngineError> {
        run_with_retry("observe", &self.observe_policy, || self.runtime.observe()).await
    }

    /// Observe until no declared healthcheck reports `starting` or the
    /// health wait runs out
    async fn observe_settled(&self, spec: &Spec) -> std::result::Result<LiveState, EngineError> {
        let deadline = tokio::time::Instant::now() + self.health_wait;
        loop {
            let live = self.observe().await?;
            let pending = self.suite.health_pending(spec, &live);
            let now = tokio::time::Instant::now();
            if pending.is_empty() || now >= deadline {
                return Ok(live);
            }
            debug!(
                "[{}] Waiting for healthchecks to settle: {}",
                self.project,
                pending.join(", ")
            );
            tokio::time::sleep(self.health_poll.min(deadline - now)).await;
        }
    }

    async fn converge(
        &self,
        deployment: &mut Deployment,
        spec: Spec,
        kind: OperationKind,
        reason: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<LifecycleResult> {
        let mut run = Run::new(kind, &self.project, reason);
        let previous = deployment.applied.clone();

        run.enter(LifecycleState::Validating)?;
        if cancel.is_cancelled() {
            return run.fail(KeelError::Cancelled(LifecycleState::Validating.to_string()));
        }
        let report = self.validator.validate(&spec, ValidationMode::Deploy);
        let mut warnings = report.has_warnings();
        let invalid = report.to_error();
        run.audit.validation = Some(report);
        if let Some(e) = invalid {
            return run.fail(e);
        }

        run.enter(LifecycleState::BackingUp)?;
        if cancel.is_cancelled() {
            return run.fail(KeelError::Cancelled(LifecycleState::BackingUp.to_string()));
        }
        if let Some(previous) = &previous {
            match self.store.snapshot(previous, reason) {
                Ok(record) => {
                    info!("[{}] Snapshot {} taken", self.project, record.id);
                    run.audit.snapshot_id = Some(record.id);
                }
                Err(e) => return run.fail(e),
            }
        }
        if cancel.is_cancelled() {
            return run.fail(KeelError::Cancelled(LifecycleState::BackingUp.to_string()));
        }

        run.enter(LifecycleState::Diffing)?;
        let empty = Spec::new();
        let delta = diff::diff(previous.as_deref().unwrap_or(&empty), &spec);
        info!("[{}] Changes: {}", self.project, delta.summary());
        run.audit.diff = Some(delta);

        if self.detect_conflicts {
            run.enter(LifecycleState::ConflictChecking)?;
            let live = match self.observe().await {
                Ok(live) => live,
                Err(e) => return run.fail(e.into()),
            };
            let report = self.detector.detect(&spec, &live, previous.as_deref());
            let blocking = report.to_error();
            warnings |= report.has_advisory();
            run.audit.conflicts = Some(report);
            if let Some(e) = blocking {
                return run.fail(e);
            }
        }

        if let Err(e) = cancel.commit(run.audit.state()) {
            return run.fail(e);
        }
        run.enter(LifecycleState::Applying)?;
        let result =
            run_with_retry("apply", &self.apply_policy, || self.runtime.apply(&spec)).await;
        if let Err(e) = result {
            return self.recover(run, e).await;
        }

        let spec = Arc::new(spec);
        deployment.applied = Some(spec.clone());
        self.publish(Some(spec.clone()));

        run.enter(LifecycleState::Verifying)?;
        let live = match self.observe_settled(&spec).await {
            Ok(live) => live,
            Err(e) => return run.fail(e.into()),
        };
        let report = self.suite.verify(&spec, &live, self.runtime.as_ref()).await;
        let outcome = report.outcome();
        let failed = report.failed().count();
        run.audit.verification = Some(report);

        match outcome {
            VerificationOutcome::Fail => run.fail(KeelError::Verification(failed)),
            VerificationOutcome::PassWithSkips | VerificationOutcome::PassWithWarnings => {
                run.finish(LifecycleState::SucceededWithWarnings, None)
            }
            VerificationOutcome::Pass if warnings => {
                run.finish(LifecycleState::SucceededWithWarnings, None)
            }
            VerificationOutcome::Pass => run.finish(LifecycleState::Succeeded, None),
        }
    }

    /// Restore the snapshot taken for this run after a failed apply or
    /// teardown. The applied spec is left as it was either way.
    async fn recover(&self, mut run: Run<'_>, cause: EngineError) -> Result<LifecycleResult> {
        error!("[{}] {} failed: {}", self.project, run.audit.operation, cause);
        let cause = KeelError::from(cause);

        let Some(snapshot_id) = run.audit.snapshot_id.clone() else {
            run.audit.unrecovered = true;
            run.audit.guidance = Some(format!(
                "No snapshot exists to roll back to. Inspect the project with \
                 `docker compose -p {} ps`, then apply a known-good spec or tear it down.",
                self.project
            ));
            return run.fail(cause);
        };

        let restored = match self.store.restore(&snapshot_id) {
            Ok(spec) => spec,
            Err(e) => {
                run.audit.unrecovered = true;
                run.audit.guidance = Some(format!(
                    "Snapshot {} could not be read ({}). Inspect the project with \
                     `docker compose -p {} ps` and apply a known-good spec.",
                    snapshot_id, e, self.project
                ));
                return run.fail(cause);
            }
        };

        warn!("[{}] Rolling back to snapshot {}", self.project, snapshot_id);
        let result = run_with_retry("rollback", &self.apply_policy, || {
            self.runtime.apply(&restored)
        })
        .await;
        match result {
            Ok(()) => {
                info!("[{}] Rolled back to snapshot {}", self.project, snapshot_id);
                run.finish(LifecycleState::RolledBack, Some(cause))
            }
            Err(e) => {
                run.audit.unrecovered = true;
                run.audit.guidance = Some(format!(
                    "Rolling back to snapshot {} failed: {}. Run `keel rollback {}` once \
                     the engine is healthy.",
                    snapshot_id, e, snapshot_id
                ));
                run.fail(cause)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MemorySnapshotStore;
    use crate::conflict::{ConflictKind, Severity};
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{LiveContainer, ProbeResult};
    use crate::spec::{Healthcheck, Protocol, RestartPolicy, ServiceDef};
    use crate::verify::CheckStatus;

    fn config() -> ManagerConfig {
        ManagerConfig {
            project: "shop".to_string(),
            retry_backoff_ms: 1,
            probe_timeout_secs: 2,
            health_poll_ms: 1,
            ..Default::default()
        }
    }

    fn service(name: &str, image: &str) -> ServiceDef {
        ServiceDef::new(name, image)
            .restart(RestartPolicy::UnlessStopped)
            .memory(256 * 1024 * 1024)
    }

    fn web_db() -> Spec {
        Spec::new()
            .with_service(service("web", "nginx:1.25").port("8080:80").depends_on("db"))
            .with_service(service("db", "postgres:16"))
    }

    fn web_v2() -> Spec {
        Spec::new()
            .with_service(service("web", "nginx:1.26").port("8080:80").depends_on("db"))
            .with_service(service("db", "postgres:16"))
    }

    struct Harness {
        runtime: Arc<MockRuntime>,
        store: Arc<MemorySnapshotStore>,
        controller: Controller,
    }

    fn harness_with(config: ManagerConfig, runtime: MockRuntime) -> Harness {
        let runtime = Arc::new(runtime);
        let store = Arc::new(MemorySnapshotStore::new());
        let controller = Controller::new(&config, store.clone(), runtime.clone());
        Harness {
            runtime,
            store,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(config(), MockRuntime::new("shop"))
    }

    /// Snapshot store whose writes always fail
    struct BrokenStore;

    impl SnapshotStore for BrokenStore {
        fn snapshot(&self, _spec: &Spec, _reason: Option<&str>) -> Result<SnapshotRecord> {
            Err(KeelError::Backup("disk full".to_string()))
        }

        fn restore(&self, id: &str) -> Result<Spec> {
            Err(KeelError::SnapshotNotFound(id.to_string()))
        }

        fn list(&self, _since: Option<DateTime<Utc>>) -> Result<crate::backup::SnapshotIter> {
            Ok(Box::new(std::iter::empty()))
        }

        fn prune(&self, _keep: usize) -> Result<usize> {
            Ok(0)
        }
    }

    /// Snapshot store that requests cancellation while writing
    struct CancellingStore {
        inner: MemorySnapshotStore,
        token: CancelToken,
    }

    impl SnapshotStore for CancellingStore {
        fn snapshot(&self, spec: &Spec, reason: Option<&str>) -> Result<SnapshotRecord> {
            self.token.cancel()?;
            self.inner.snapshot(spec, reason)
        }

        fn restore(&self, id: &str) -> Result<Spec> {
            self.inner.restore(id)
        }

        fn list(&self, since: Option<DateTime<Utc>>) -> Result<crate::backup::SnapshotIter> {
            self.inner.list(since)
        }

        fn prune(&self, keep: usize) -> Result<usize> {
            self.inner.prune(keep)
        }
    }

    #[tokio::test]
    async fn test_first_apply_succeeds() {
        let h = harness();
        let result = h.controller.apply(web_db(), Some("initial")).await.unwrap();

        assert_eq!(result.state, LifecycleState::Succeeded);
        assert_eq!(
            result.audit.states(),
            vec![
                LifecycleState::Idle,
                LifecycleState::Validating,
                LifecycleState::BackingUp,
                LifecycleState::Diffing,
                LifecycleState::ConflictChecking,
                LifecycleState::Applying,
                LifecycleState::Verifying,
                LifecycleState::Succeeded,
            ]
        );
        assert!(result.audit.snapshot_id.is_none());
        assert_eq!(result.audit.diff.as_ref().unwrap().added(), 2);
        assert_eq!(h.runtime.apply_calls(), 1);
        assert_eq!(h.controller.applied().as_deref(), Some(&web_db()));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_second_apply_snapshots_previous_spec() {
        let h = harness();
        h.controller.apply(web_db(), None).await.unwrap();
        let result = h.controller.apply(web_v2(), Some("bump nginx")).await.unwrap();

        assert_eq!(result.state, LifecycleState::Succeeded);
        let snapshot_id = result.audit.snapshot_id.clone().unwrap();
        assert_eq!(h.store.restore(&snapshot_id).unwrap(), web_db());
        assert_eq!(result.audit.diff.as_ref().unwrap().modified(), 1);
    }

    #[tokio::test]
    async fn test_noop_apply_still_snapshots() {
        let h = harness();
        h.controller.apply(web_db(), None).await.unwrap();
        let result = h.controller.apply(web_db(), None).await.unwrap();

        assert!(result.audit.diff.as_ref().unwrap().is_noop());
        assert!(result.audit.snapshot_id.is_some());
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_never_touches_runtime() {
        let runtime = Arc::new(MockRuntime::new("shop"));
        let controller = Controller::new(&config(), Arc::new(BrokenStore), runtime.clone());
        controller.adopt(web_db()).unwrap();

        let result = controller.apply(web_v2(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert!(result.audit.error.unwrap().contains("disk full"));
        assert_eq!(runtime.apply_calls(), 0);

        let result = controller.teardown(None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert_eq!(runtime.teardown_calls(), 0);
    }

    #[tokio::test]
    async fn test_port_held_by_unrelated_container_blocks_apply() {
        let live = LiveState {
            containers: vec![LiveContainer::new("legacy", "httpd:2").publish(8080, Protocol::Tcp)],
            ..Default::default()
        };
        let h = harness_with(config(), MockRuntime::new("shop").with_live(live));

        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        let conflicts = result.audit.conflicts.unwrap();
        assert_eq!(conflicts.conflicts.len(), 1);
        assert_eq!(conflicts.conflicts[0].kind, ConflictKind::PortInUse);
        assert_eq!(conflicts.conflicts[0].severity, Severity::Blocking);
        assert_eq!(conflicts.conflicts[0].entity, "web");
        assert_eq!(h.runtime.apply_calls(), 0);
        assert!(h.controller.applied().is_none());
    }

    #[tokio::test]
    async fn test_conflict_detection_can_be_disabled() {
        let live = LiveState {
            containers: vec![LiveContainer::new("legacy", "httpd:2").publish(8080, Protocol::Tcp)],
            ..Default::default()
        };
        let config = ManagerConfig {
            detect_conflicts: false,
            ..config()
        };
        let h = harness_with(config, MockRuntime::new("shop").with_live(live));

        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Succeeded);
        assert!(!result.audit.visited(LifecycleState::ConflictChecking));
        assert!(result.audit.conflicts.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_dependency_fails_without_rollback() {
        let h = harness();
        h.runtime
            .script_probe("network:web->db", ProbeResult::fail("getent: db: not found"));

        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert!(!result.audit.visited(LifecycleState::RolledBack));
        assert!(!result.audit.unrecovered);

        let report = result.audit.verification.unwrap();
        assert_eq!(report.get("network:web->db").unwrap().status, CheckStatus::Fail);
        assert_eq!(report.outcome(), VerificationOutcome::Fail);
        assert_eq!(h.runtime.apply_calls(), 1);
        assert_eq!(h.controller.applied().as_deref(), Some(&web_db()));
    }

    fn web_db_checked() -> Spec {
        let mut db = service("db", "postgres:16");
        db.healthcheck = Some(Healthcheck {
            test: vec!["CMD".to_string(), "pg_isready".to_string()],
            ..Default::default()
        });
        Spec::new()
            .with_service(service("web", "nginx:1.25").port("8080:80").depends_on("db"))
            .with_service(db)
    }

    #[tokio::test]
    async fn test_verification_waits_for_starting_healthchecks() {
        let h = harness();
        h.runtime.settle_health_after(3);

        let result = h.controller.apply(web_db_checked(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Succeeded);
        let report = result.audit.verification.unwrap();
        assert_eq!(report.get("health:db").unwrap().status, CheckStatus::Pass);
        // one observation for conflict checking, three while verifying
        assert_eq!(h.runtime.observe_calls(), 4);
    }

    #[tokio::test]
    async fn test_health_still_starting_after_wait_fails() {
        let config = ManagerConfig {
            health_wait_secs: 0,
            ..config()
        };
        let h = harness_with(config, MockRuntime::new("shop"));
        h.runtime.settle_health_after(100);

        let result = h.controller.apply(web_db_checked(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        let health = result.audit.verification.unwrap();
        let health = health.get("health:db").unwrap();
        assert_eq!(health.status, CheckStatus::Fail);
        assert_eq!(health.evidence, "healthcheck still starting");
    }

    #[tokio::test]
    async fn test_resource_baseline_breach_succeeds_with_warnings() {
        let h = harness();
        h.runtime
            .script_probe("resources:web", ProbeResult::fail("cpu 88.0% over 50%"));

        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::SucceededWithWarnings);
        let report = result.audit.verification.unwrap();
        assert_eq!(report.get("resources:web").unwrap().status, CheckStatus::Warn);
        assert_eq!(report.outcome(), VerificationOutcome::PassWithWarnings);
    }

    #[tokio::test]
    async fn test_drift_against_running_project() {
        let h = harness();
        assert!(h.controller.drift().await.unwrap().is_none());

        h.controller.apply(web_db(), None).await.unwrap();
        assert!(h.controller.drift().await.unwrap().unwrap().is_noop());

        let h = harness_with(config(), MockRuntime::new("shop").converge(false));
        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        let drift = h.controller.drift().await.unwrap().unwrap();
        assert_eq!(drift.added(), 2);
    }

    #[tokio::test]
    async fn test_cycle_is_reported_before_backup() {
        let h = harness();
        h.controller.adopt(web_db()).unwrap();
        let cyclic = Spec::new()
            .with_service(service("a", "busybox:1.36").depends_on("b"))
            .with_service(service("b", "busybox:1.36").depends_on("a"));

        let result = h.controller.apply(cyclic, None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert!(!result.audit.visited(LifecycleState::BackingUp));
        assert!(result.audit.error.unwrap().contains("a -> b"));
        assert!(h.store.is_empty());
        assert_eq!(h.runtime.apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_apply_failure_rolls_back_to_snapshot() {
        let h = harness();
        h.controller.adopt(web_db()).unwrap();
        h.runtime
            .push_apply(Err(EngineError::permanent("invalid reference format")));

        let result = h.controller.apply(web_v2(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::RolledBack);
        assert!(!result.audit.unrecovered);
        assert!(result.audit.error.is_some());
        assert_eq!(h.runtime.applied(), vec![web_db()]);
        assert_eq!(h.controller.applied().as_deref(), Some(&web_db()));
    }

    #[tokio::test]
    async fn test_apply_failure_without_snapshot_is_unrecovered() {
        let h = harness();
        h.runtime
            .push_apply(Err(EngineError::permanent("invalid reference format")));

        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert!(result.audit.unrecovered);
        assert!(result.audit.guidance.is_some());
        assert!(h.controller.applied().is_none());
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_previous_spec() {
        let h = harness();
        h.controller.adopt(web_db()).unwrap();
        h.runtime.push_apply(Err(EngineError::permanent("bad image")));
        h.runtime.push_apply(Err(EngineError::permanent("engine refused")));

        let result = h.controller.apply(web_v2(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert!(result.audit.unrecovered);
        assert!(result.audit.guidance.unwrap().contains("keel rollback"));
        assert_eq!(h.controller.applied().as_deref(), Some(&web_db()));
    }

    #[tokio::test]
    async fn test_transient_apply_errors_are_retried() {
        let h = harness();
        h.runtime.push_apply(Err(EngineError::transient("daemon busy")));
        h.runtime.push_apply(Err(EngineError::transient("daemon busy")));

        let result = h.controller.apply(web_db(), None).await.unwrap();
        assert_eq!(result.state, LifecycleState::Succeeded);
        assert_eq!(h.runtime.apply_calls(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_during_backup_prevents_apply() {
        let token = CancelToken::new();
        let runtime = Arc::new(MockRuntime::new("shop"));
        let store = Arc::new(CancellingStore {
            inner: MemorySnapshotStore::new(),
            token: token.clone(),
        });
        let controller = Controller::new(&config(), store, runtime.clone());
        controller.adopt(web_db()).unwrap();

        let result = controller
            .apply_with_cancel(web_v2(), None, &token)
            .await
            .unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert_eq!(
            result.audit.error.as_deref(),
            Some("Operation cancelled during backing up")
        );
        assert_eq!(runtime.apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_names_the_state_it_interrupted() {
        let token = CancelToken::new();
        let h = harness();
        h.controller.adopt(web_db()).unwrap();
        h.runtime.cancel_on_observe(token.clone());

        let result = h
            .controller
            .apply_with_cancel(web_v2(), None, &token)
            .await
            .unwrap();
        assert_eq!(result.state, LifecycleState::Failed);
        assert!(result.audit.visited(LifecycleState::ConflictChecking));
        assert_eq!(
            result.audit.error.as_deref(),
            Some("Operation cancelled during conflict checking")
        );
        assert_eq!(h.runtime.apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_after_commit_is_refused() {
        let h = harness();
        let (entered, release) = h.runtime.hold_apply();
        let token = CancelToken::new();

        let (result, refused) = tokio::join!(
            h.controller.apply_with_cancel(web_db(), None, &token),
            async {
                entered.notified().await;
                let refused = token.cancel();
                release.notify_one();
                refused
            }
        );

        assert!(matches!(refused, Err(KeelError::CancellationRefused(_))));
        assert_eq!(result.unwrap().state, LifecycleState::Succeeded);
    }

    #[tokio::test]
    async fn test_concurrent_apply_is_rejected() {
        let h = harness();
        let (entered, release) = h.runtime.hold_apply();

        let (first, (second, preview)) = tokio::join!(h.controller.apply(web_db(), None), async {
            entered.notified().await;
            let second = h.controller.apply(web_v2(), None).await;
            let preview = h.controller.preview_diff(&web_v2());
            release.notify_one();
            (second, preview)
        });

        assert!(matches!(second, Err(KeelError::OperationInFlight(_))));
        assert_eq!(preview.added(), 2);
        assert_eq!(first.unwrap().state, LifecycleState::Succeeded);
        assert_eq!(h.runtime.apply_calls(), 1);
    }

    #[tokio::test]
    async fn test_validation_warnings_succeed_with_warnings() {
        let h = harness();
        let spec = Spec::new().with_service(ServiceDef::new("cache", "redis"));

        let result = h.controller.apply(spec, None).await.unwrap();
        assert_eq!(result.state, LifecycleState::SucceededWithWarnings);
        assert!(result.audit.validation.unwrap().has_warnings());
    }

    #[tokio::test]
    async fn test_teardown_removes_applied_spec() {
        let h = harness();
        h.controller.apply(web_db(), None).await.unwrap();

        let result = h.controller.teardown(Some("decommission")).await.unwrap();
        assert_eq!(result.state, LifecycleState::Succeeded);
        assert!(result.audit.verification.is_none());
        assert!(result.audit.snapshot_id.is_some());
        assert_eq!(result.audit.diff.as_ref().unwrap().removed(), 2);
        assert_eq!(h.runtime.torn_down(), vec![web_db()]);
        assert!(h.controller.applied().is_none());
        assert!(h.runtime.live().containers.is_empty());

        let again = h.controller.teardown(None).await.unwrap();
        assert_eq!(again.state, LifecycleState::Failed);
        assert_eq!(h.runtime.teardown_calls(), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_reapplies_snapshot() {
        let h = harness();
        h.controller.adopt(web_db()).unwrap();
        h.runtime
            .push_teardown(Err(EngineError::permanent("network in use")));

        let result = h.controller.teardown(None).await.unwrap();
        assert_eq!(result.state, LifecycleState::RolledBack);
        assert_eq!(h.runtime.applied(), vec![web_db()]);
        assert_eq!(h.controller.applied().as_deref(), Some(&web_db()));
    }

    #[tokio::test]
    async fn test_rollback_applies_snapshot() {
        let h = harness();
        h.controller.apply(web_db(), None).await.unwrap();
        let upgrade = h.controller.apply(web_v2(), None).await.unwrap();
        let snapshot_id = upgrade.audit.snapshot_id.unwrap();

        let result = h.controller.rollback(&snapshot_id).await.unwrap();
        assert_eq!(result.state, LifecycleState::Succeeded);
        assert_eq!(result.audit.operation, OperationKind::Rollback);
        assert_eq!(h.controller.applied().as_deref(), Some(&web_db()));

        assert!(matches!(
            h.controller.rollback("20240101T000000Z-000099-abcdefabcdef").await,
            Err(KeelError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_dispatches_operations() {
        let h = harness();
        let raw = "services:\n  web:\n    image: nginx:1.25\n    restart: always\n";

        let output = h
            .controller
            .execute(Operation::Propose {
                raw: raw.to_string(),
            })
            .await
            .unwrap();
        match output {
            OperationOutput::Propose(report) => assert!(report.is_ok()),
            other => panic!("unexpected output {:?}", other),
        }

        let output = h
            .controller
            .execute(Operation::Apply {
                spec: web_db(),
                reason: None,
            })
            .await
            .unwrap();
        assert!(output.lifecycle().unwrap().is_success());

        let output = h
            .controller
            .execute(Operation::PreviewDiff { spec: web_db() })
            .await
            .unwrap();
        match output {
            OperationOutput::PreviewDiff(delta) => assert!(delta.is_noop()),
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(h.controller.snapshots(None).unwrap().len(), 0);
    }
}
