//! Lifecycle supervisor
//!
//! Drives every service of a topology through its state machine, starting
//! services once their dependencies are healthy and stopping them in reverse
//! dependency order.

pub mod board;
pub mod project;
pub mod state;
mod task;

pub use board::{ServiceStatus, StateBoard, StateChange};
pub use project::ProjectRecord;
pub use state::ServiceState;

use crate::compose::resolver;
use crate::compose::topology::{ServiceId, Topology};
use crate::error::{BerthError, Result};
use crate::runtime::{LogStream, Runtime};
use crate::settings::Settings;
use crate::storage::ResourceManager;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task::Context;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Supervisor of one project
pub struct Supervisor {
    ctx: Arc<Context>,
    /// Startup order
    order: Vec<ServiceId>,
    tasks: Mutex<Option<JoinSet<()>>>,
    started: Mutex<bool>,
}

impl Supervisor {
    /// Create a supervisor. Fails on a dependency cycle, before anything is
    /// touched.
    pub fn new(
        topology: Topology,
        runtime: Arc<dyn Runtime>,
        resources: Arc<ResourceManager>,
        settings: Settings,
        project_dir: PathBuf,
    ) -> Result<Self> {
        let order = resolver::order(&topology)?;
        let board = StateBoard::new(topology.services().iter().map(|s| s.name.as_str()));

        Ok(Self {
            ctx: Arc::new(Context {
                project: topology.name().to_string(),
                project_dir,
                topology,
                runtime,
                resources,
                board,
                settings,
                shutdown: CancellationToken::new(),
            }),
            order,
            tasks: Mutex::new(None),
            started: Mutex::new(false),
        })
    }

    /// Supervisor for services started by an earlier invocation, as listed
    /// in its project record. Only useful for [`Supervisor::shutdown`].
    pub fn attach(
        topology: Topology,
        runtime: Arc<dyn Runtime>,
        resources: Arc<ResourceManager>,
        settings: Settings,
        project_dir: PathBuf,
        record: &ProjectRecord,
    ) -> Result<Self> {
        let supervisor = Self::new(topology, runtime, resources, settings, project_dir)?;
        let topology = &supervisor.ctx.topology;

        let mut restored = 0;
        supervisor.ctx.board.update(|slots| {
            for status in &record.services {
                let id = match topology.find(&status.name) {
                    Ok(service) => service.id,
                    Err(_) => {
                        warn!("{} is no longer in the topology; leaving it alone", status.name);
                        continue;
                    }
                };
                let state = match (&status.handle, status.state) {
                    (Some(_), state) if state.is_running() || state == ServiceState::Stopping => {
                        ServiceState::Healthy
                    }
                    (_, ServiceState::Stopped) | (_, ServiceState::Failed) => status.state,
                    _ => continue,
                };
                slots.force(id, state, Some("restored from project record".to_string()));
                slots.get_mut(id).handle = status.handle.clone();
                restored += 1;
            }
        })?;
        info!("Attached to {} recorded service(s)", restored);

        Ok(supervisor)
    }

    pub fn topology(&self) -> &Topology {
        &self.ctx.topology
    }

    pub fn project(&self) -> &str {
        &self.ctx.project
    }

    /// State changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.ctx.board.subscribe()
    }

    /// Current status of every service, by name
    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        self.ctx.board.snapshot()
    }

    /// Recent state transitions, oldest first
    pub fn history(&self) -> Result<Vec<StateChange>> {
        self.ctx.board.history()
    }

    /// Token cancelled once shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Start every service and wait until each is healthy or has failed for
    /// good. Returns the first permanent failure in startup order.
    ///
    /// Services keep being supervised after this returns; call
    /// [`Supervisor::shutdown`] to stop them.
    pub async fn up(&self) -> Result<()> {
        {
            let mut started = self
                .started
                .lock()
                .map_err(|_| BerthError::Lock("Failed to lock supervisor".to_string()))?;
            if *started {
                return Err(BerthError::Internal("project is already up".to_string()));
            }
            *started = true;
        }

        self.ctx.resources.prepare(&self.ctx.topology)?;

        info!(
            "Starting {} service(s) of {}",
            self.order.len(),
            self.ctx.project
        );
        let mut tasks = JoinSet::new();
        for id in &self.order {
            tasks.spawn(task::supervise(self.ctx.clone(), *id));
        }
        *self.lock_tasks()? = Some(tasks);

        let statuses = self
            .ctx
            .board
            .wait_for(|slots| {
                (slots.halted() || slots.iter().all(ServiceStatus::is_settled))
                    .then(|| slots.iter().cloned().collect::<Vec<_>>())
            })
            .await?;

        self.outcome(&statuses)
    }

    fn outcome(&self, statuses: &[ServiceStatus]) -> Result<()> {
        // Failures first, then whatever they blocked
        let in_order = || self.order.iter().map(|id| &statuses[id.index()]);

        if let Some(failed) = in_order().find(|s| s.state == ServiceState::Failed) {
            let reason = failed.detail.clone().unwrap_or_else(|| "failed".to_string());
            return Err(if failed.attempts > 0 {
                BerthError::RetryExhausted {
                    service: failed.name.clone(),
                    attempts: failed.attempts,
                    reason,
                }
            } else {
                BerthError::ServiceFailed {
                    service: failed.name.clone(),
                    reason,
                }
            });
        }

        if let Some(down) = in_order().find(|s| s.state != ServiceState::Healthy) {
            return Err(BerthError::ServiceFailed {
                service: down.name.clone(),
                reason: down
                    .detail
                    .clone()
                    .unwrap_or_else(|| format!("ended {}", down.state)),
            });
        }

        info!("All services of {} are healthy", self.ctx.project);
        Ok(())
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, Option<JoinSet<()>>>> {
        self.tasks
            .lock()
            .map_err(|_| BerthError::Lock("Failed to lock supervisor tasks".to_string()))
    }

    /// Stop every service, dependents first. Tasks still running after the
    /// shutdown grace are aborted, their services killed and marked failed.
    ///
    /// Fails if any service could not be stopped cleanly.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down {}", self.ctx.project);
        self.ctx.board.halt()?;
        self.ctx.shutdown.cancel();

        let running = self.lock_tasks()?.take();
        let mut tasks = match running {
            Some(tasks) => tasks,
            None => {
                // attached, or never brought up
                let mut tasks = JoinSet::new();
                for id in self.order.iter().rev() {
                    tasks.spawn(task::stop_attached(self.ctx.clone(), *id));
                }
                tasks
            }
        };

        let grace = self.ctx.settings.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown grace of {:?} expired; aborting remaining tasks", grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.abandon_remaining().await?;
        }

        let failed: Vec<String> = self
            .status()?
            .into_iter()
            .filter(|s| s.stop_failed)
            .map(|s| s.name)
            .collect();

        if failed.is_empty() {
            info!("{} is down", self.ctx.project);
            Ok(())
        } else {
            Err(BerthError::ServiceFailed {
                service: failed.join(", "),
                reason: "did not stop cleanly".to_string(),
            })
        }
    }

    /// Kill whatever the aborted tasks left behind, dependents first
    async fn abandon_remaining(&self) -> Result<()> {
        let remaining = self.ctx.board.read(|slots| {
            self.order
                .iter()
                .rev()
                .filter(|id| {
                    let slot = slots.get(**id);
                    slot.handle.is_some()
                        || !matches!(slot.state, ServiceState::Stopped | ServiceState::Failed)
                })
                .map(|id| (*id, slots.get(*id).handle.clone()))
                .collect::<Vec<_>>()
        })?;

        for (id, handle) in remaining {
            let service = self.ctx.topology.service(id);
            if let Some(handle) = &handle {
                // no timeout: straight to the forced kill
                if let Err(e) = self.ctx.runtime.stop(handle, Duration::ZERO).await {
                    warn!("Forced stop of {}: {}", service.name, e);
                }
            }

            self.ctx.board.update(|slots| {
                if !matches!(slots.state(id), ServiceState::Stopped | ServiceState::Failed) {
                    slots.force(
                        id,
                        ServiceState::Failed,
                        Some("aborted after shutdown grace".to_string()),
                    );
                }
                let slot = slots.get_mut(id);
                slot.exhausted = true;
                slot.stop_failed = true;
                slot.handle = None;
            })?;

            if let Err(e) = self.ctx.resources.release(service) {
                warn!("Failed to release resources of {}: {}", service.name, e);
            }
        }
        Ok(())
    }

    /// Stream the output of a running service
    pub async fn logs(&self, service: &str, cancel: CancellationToken) -> Result<LogStream> {
        let id = self.ctx.topology.find(service)?.id;
        let handle = self
            .ctx
            .board
            .read(|slots| slots.get(id).handle.clone())?
            .ok_or_else(|| BerthError::Runtime(format!("{} is not running", service)))?;

        self.ctx.runtime.stream_logs(&handle, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use crate::runtime::fake::{Call, FakeRuntime};
    use crate::runtime::Health;
    use crate::storage::{SecretManager, StaticSecretProvider, VolumeManager};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn settings(dir: &Path) -> Settings {
        Settings {
            data_dir: dir.to_path_buf(),
            startup_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(2),
            probe_interval: Duration::from_millis(10),
            degraded_grace: Duration::from_millis(50),
            ..Settings::default()
        }
    }

    struct Harness {
        _temp: TempDir,
        runtime: FakeRuntime,
        resources: Arc<ResourceManager>,
        supervisor: Supervisor,
    }

    fn harness_with(yaml: &str, runtime: FakeRuntime, secrets: StaticSecretProvider) -> Harness {
        harness_tuned(yaml, runtime, secrets, |_| {})
    }

    fn harness_tuned(
        yaml: &str,
        runtime: FakeRuntime,
        secrets: StaticSecretProvider,
        tune: impl FnOnce(&mut Settings),
    ) -> Harness {
        let temp = tempdir().unwrap();
        let mut settings = settings(temp.path());
        tune(&mut settings);
        let topology = Topology::load(&ComposeParser::parse_str(yaml).unwrap()).unwrap();
        let resources = Arc::new(ResourceManager::new(
            VolumeManager::new(temp.path().join("volumes"), "test").unwrap(),
            SecretManager::new(
                Arc::new(secrets),
                temp.path().join("secrets"),
                temp.path().to_path_buf(),
            ),
        ));
        let supervisor = Supervisor::new(
            topology,
            Arc::new(runtime.clone()),
            resources.clone(),
            settings,
            temp.path().to_path_buf(),
        )
        .unwrap();

        Harness {
            _temp: temp,
            runtime,
            resources,
            supervisor,
        }
    }

    fn harness(yaml: &str, runtime: FakeRuntime) -> Harness {
        harness_with(yaml, runtime, StaticSecretProvider::new())
    }

    fn state(supervisor: &Supervisor, name: &str) -> ServiceState {
        supervisor
            .status()
            .unwrap()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap()
            .state
    }

    async fn wait_for_state(supervisor: &Supervisor, name: &str, wanted: ServiceState) {
        let id = supervisor.topology().find(name).unwrap().id;
        tokio::time::timeout(
            Duration::from_secs(5),
            supervisor
                .ctx
                .board
                .wait_for(|slots| (slots.state(id) == wanted).then_some(())),
        )
        .await
        .unwrap()
        .unwrap();
    }

    const CHAIN: &str = r#"
services:
  a:
    image: a
  b:
    image: b
    depends_on: [a]
"#;

    const FAN_OUT: &str = r#"
services:
  a:
    image: a
  b:
    image: b
    depends_on: [a]
  c:
    image: c
    depends_on: [a]
"#;

    #[tokio::test]
    async fn test_dependent_starts_after_dependency_is_healthy() {
        let runtime = FakeRuntime::new().health(
            "a",
            vec![Health::Unknown, Health::Unhealthy, Health::Healthy],
        );
        let h = harness(CHAIN, runtime);

        h.supervisor.up().await.unwrap();
        assert_eq!(state(&h.supervisor, "a"), ServiceState::Healthy);
        assert_eq!(state(&h.supervisor, "b"), ServiceState::Healthy);

        // a went through all three probes before b was started
        let calls = h.runtime.calls();
        let b_started = h.runtime.position(&Call::Start("b".to_string())).unwrap();
        assert!(h.runtime.position(&Call::Start("a".to_string())).unwrap() < b_started);
        assert_eq!(
            calls[..b_started]
                .iter()
                .filter(|c| **c == Call::Probe("a".to_string()))
                .count(),
            3
        );

        h.supervisor.shutdown().await.unwrap();
        assert_eq!(h.runtime.stopped(), vec!["b", "a"]);
        assert_eq!(state(&h.supervisor, "a"), ServiceState::Stopped);
        assert_eq!(state(&h.supervisor, "b"), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents() {
        let runtime = FakeRuntime::new().fail_always("a");
        let h = harness(FAN_OUT, runtime);

        let err = h.supervisor.up().await.unwrap_err();
        match err {
            BerthError::ServiceFailed { service, .. } => assert_eq!(service, "a"),
            other => panic!("unexpected error {:?}", other),
        }

        let status = h.supervisor.status().unwrap();
        assert_eq!(status[0].state, ServiceState::Failed);
        for dependent in &status[1..] {
            assert_eq!(dependent.state, ServiceState::Pending);
            assert!(dependent.blocked);
        }
        assert!(h.runtime.started().is_empty());

        h.supervisor.shutdown().await.unwrap();
        assert_eq!(state(&h.supervisor, "b"), ServiceState::Stopped);
        assert_eq!(state(&h.supervisor, "a"), ServiceState::Failed);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_anything_starts() {
        let temp = tempdir().unwrap();
        let yaml = r#"
services:
  a:
    image: a
    depends_on: [b]
  b:
    image: b
    depends_on: [a]
"#;
        let topology = Topology::load(&ComposeParser::parse_str(yaml).unwrap()).unwrap();
        let runtime = FakeRuntime::new();
        let resources = Arc::new(ResourceManager::new(
            VolumeManager::new(temp.path().join("volumes"), "test").unwrap(),
            SecretManager::new(
                Arc::new(StaticSecretProvider::new()),
                temp.path().join("secrets"),
                temp.path().to_path_buf(),
            ),
        ));

        let result = Supervisor::new(
            topology,
            Arc::new(runtime.clone()),
            resources,
            settings(temp.path()),
            temp.path().to_path_buf(),
        );
        match result {
            Err(BerthError::Cycle { participants }) => assert_eq!(participants, vec!["a", "b"]),
            _ => panic!("expected a cycle error"),
        }
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_external_secret_fails_before_any_start() {
        let yaml = r#"
services:
  db:
    image: postgres
    secrets: [db_password]
  web:
    image: nginx
secrets:
  db_password:
    external: true
"#;
        let h = harness(yaml, FakeRuntime::new());

        let err = h.supervisor.up().await.unwrap_err();
        assert!(matches!(err, BerthError::MissingExternalSecret(_)));
        assert!(h.runtime.calls().is_empty());
        assert_eq!(state(&h.supervisor, "web"), ServiceState::Pending);
    }

    #[tokio::test]
    async fn test_startup_timeout_fails_the_service() {
        let runtime = FakeRuntime::new().health("a", vec![Health::Unknown]);
        let h = harness(CHAIN, runtime);

        let err = h.supervisor.up().await.unwrap_err();
        match err {
            BerthError::ServiceFailed { service, reason } => {
                assert_eq!(service, "a");
                assert!(reason.contains("not healthy within"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        h.supervisor.shutdown().await.unwrap();
        assert_eq!(h.runtime.stopped(), vec!["a"]);
        assert_eq!(state(&h.supervisor, "b"), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_policy_retries_with_backoff() {
        let yaml = r#"
services:
  a:
    image: a
    deploy:
      restart_policy:
        condition: on-failure
        delay: 10ms
        max_attempts: 3
  b:
    image: b
    depends_on: [a]
"#;
        let runtime = FakeRuntime::new().fail_start("a", 2);
        let h = harness(yaml, runtime);

        h.supervisor.up().await.unwrap();
        let a = h
            .supervisor
            .status()
            .unwrap()
            .into_iter()
            .find(|s| s.name == "a")
            .unwrap();
        assert_eq!(a.state, ServiceState::Healthy);
        assert_eq!(a.attempts, 2);
        assert_eq!(h.runtime.started(), vec!["a", "b"]);

        let restarts = h
            .supervisor
            .history()
            .unwrap()
            .into_iter()
            .filter(|c| c.service == "a" && c.from == ServiceState::Failed)
            .count();
        assert_eq!(restarts, 2);

        h.supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_reported() {
        let yaml = r#"
services:
  a:
    image: a
    restart: on-failure:2
"#;
        let h = harness(yaml, FakeRuntime::new().fail_always("a"));

        match h.supervisor.up().await.unwrap_err() {
            BerthError::RetryExhausted {
                service, attempts, ..
            } => {
                assert_eq!(service, "a");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_cascades_to_dependents_first() {
        let yaml = r#"
services:
  a:
    image: a
  b:
    image: b
    depends_on: [a]
  c:
    image: c
    depends_on: [b]
  d:
    image: d
"#;
        let runtime = FakeRuntime::new();
        let h = harness(yaml, runtime.clone());
        h.supervisor.up().await.unwrap();
        let mut events = h.supervisor.subscribe();

        runtime.set_health("a", Health::Unhealthy);
        wait_for_state(&h.supervisor, "c", ServiceState::Stopped).await;
        wait_for_state(&h.supervisor, "b", ServiceState::Stopped).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while runtime.stopped().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // both dependents were told to stop before a's own teardown
        let stop_a = runtime.position(&Call::Stop("a".to_string())).unwrap();
        assert!(runtime.position(&Call::Stop("b".to_string())).unwrap() < stop_a);
        assert!(runtime.position(&Call::Stop("c".to_string())).unwrap() < stop_a);

        let mut saw_degraded = false;
        while let Ok(change) = events.try_recv() {
            if change.service == "a" && change.to == ServiceState::Degraded {
                saw_degraded = true;
            }
        }
        assert!(saw_degraded);
        assert_eq!(state(&h.supervisor, "a"), ServiceState::Failed);
        assert_eq!(state(&h.supervisor, "d"), ServiceState::Healthy);

        h.supervisor.shutdown().await.unwrap();
        assert_eq!(state(&h.supervisor, "d"), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_degraded_service_recovers() {
        let runtime = FakeRuntime::new();
        let h = harness(CHAIN, runtime.clone());
        h.supervisor.up().await.unwrap();

        runtime.set_health("a", Health::Unhealthy);
        wait_for_state(&h.supervisor, "a", ServiceState::Degraded).await;
        runtime.set_health("a", Health::Healthy);
        wait_for_state(&h.supervisor, "a", ServiceState::Healthy).await;
        assert_eq!(state(&h.supervisor, "b"), ServiceState::Healthy);

        h.supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_hanging_stop_marks_service_failed() {
        let runtime = FakeRuntime::new().hang_on_stop("b");
        let h = harness(CHAIN, runtime.clone());
        h.supervisor.up().await.unwrap();

        let err = h.supervisor.shutdown().await.unwrap_err();
        match err {
            BerthError::ServiceFailed { service, .. } => assert_eq!(service, "b"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(state(&h.supervisor, "b"), ServiceState::Failed);
        assert_eq!(state(&h.supervisor, "a"), ServiceState::Stopped);
        assert_eq!(runtime.stopped(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_expired_grace_kills_remaining_services() {
        let runtime = FakeRuntime::new().hang_on_stop("b");
        let h = harness_tuned(CHAIN, runtime.clone(), StaticSecretProvider::new(), |s| {
            s.stop_timeout = Duration::from_secs(2);
            s.shutdown_grace = Duration::from_millis(300);
        });
        h.supervisor.up().await.unwrap();

        let started = std::time::Instant::now();
        assert!(h.supervisor.shutdown().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(runtime.running().is_empty());
        assert!(runtime.stopped().contains(&"a".to_string()));
        for status in h.supervisor.status().unwrap() {
            assert_eq!(status.state, ServiceState::Failed);
            assert!(status.handle.is_none());
            assert!(status.stop_failed);
        }
    }

    #[tokio::test]
    async fn test_independent_services_start_concurrently() {
        let yaml = r#"
services:
  a:
    image: a
  b:
    image: b
"#;
        let runtime = FakeRuntime::new()
            .start_delay("a", Duration::from_millis(200))
            .start_delay("b", Duration::from_millis(200));
        let h = harness(yaml, runtime.clone());

        let started = std::time::Instant::now();
        h.supervisor.up().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(350), "up took {:?}", elapsed);
        assert_eq!(runtime.running(), vec!["a", "b"]);

        h.supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_references_follow_service_lifetime() {
        let yaml = r#"
services:
  influxdb:
    image: influxdb
    volumes:
      - influx-data:/var/lib/influxdb
  grafana:
    image: grafana
    depends_on: [influxdb]
    volumes:
      - influx-data:/data:ro
volumes:
  influx-data:
"#;
        let h = harness(yaml, FakeRuntime::new());
        h.supervisor.up().await.unwrap();
        assert_eq!(
            h.resources.volumes().ref_count("influx-data").unwrap(),
            2
        );

        h.supervisor.shutdown().await.unwrap();
        assert_eq!(
            h.resources.volumes().ref_count("influx-data").unwrap(),
            0
        );
        assert_eq!(
            h.resources.remove_unused_volumes().unwrap(),
            vec!["influx-data".to_string()]
        );
    }

    #[tokio::test]
    async fn test_attach_stops_recorded_services() {
        let runtime = FakeRuntime::new();
        let first = harness(CHAIN, runtime.clone());
        first.supervisor.up().await.unwrap();

        let mut record = ProjectRecord::new("test", Path::new("berth.yaml"), CHAIN);
        record.services = first.supervisor.status().unwrap();

        // the first invocation exits, leaving its services running
        let Harness {
            _temp: temp,
            resources,
            supervisor,
            ..
        } = first;
        drop(supervisor);
        assert_eq!(runtime.running(), vec!["a", "b"]);

        let topology = Topology::load(&ComposeParser::parse_str(CHAIN).unwrap()).unwrap();
        let attached = Supervisor::attach(
            topology,
            Arc::new(runtime.clone()),
            resources,
            settings(temp.path()),
            temp.path().to_path_buf(),
            &record,
        )
        .unwrap();
        assert_eq!(state(&attached, "a"), ServiceState::Healthy);

        attached.shutdown().await.unwrap();
        assert_eq!(runtime.stopped(), vec!["b", "a"]);
        assert_eq!(state(&attached, "a"), ServiceState::Stopped);
        assert!(runtime.running().is_empty());
    }

    #[tokio::test]
    async fn test_logs_of_running_service() {
        let runtime = FakeRuntime::new().logs("a", &["ready"]);
        let h = harness(CHAIN, runtime);
        h.supervisor.up().await.unwrap();

        let mut logs = h
            .supervisor
            .logs("a", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(logs.next().await.unwrap().line, "ready");
        assert!(h.supervisor.logs("missing", CancellationToken::new()).await.is_err());

        h.supervisor.shutdown().await.unwrap();
        assert!(h.supervisor.logs("a", CancellationToken::new()).await.is_err());
    }
}
