//! Per-service supervision task
//!
//! One task per service walks it through its states: wait for dependencies,
//! start, gate on health, monitor, and finally stop, fail, or restart. Tasks
//! only coordinate through the state board.

use super::board::{Slots, StateBoard};
use super::state::ServiceState;
use crate::compose::topology::{Service, ServiceId, Topology};
use crate::error::{BerthError, Result};
use crate::runtime::{Health, LaunchSpec, Runtime, RuntimeHandle};
use crate::settings::Settings;
use crate::storage::ResourceManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything the service tasks share
pub(crate) struct Context {
    pub project: String,
    pub project_dir: PathBuf,
    pub topology: Topology,
    pub runtime: Arc<dyn Runtime>,
    pub resources: Arc<ResourceManager>,
    pub board: StateBoard,
    pub settings: Settings,
    pub shutdown: CancellationToken,
}

impl Context {
    /// Time from entering Starting until the service must be healthy
    pub fn startup_timeout(&self, service: &Service) -> Duration {
        let start_period = service
            .healthcheck
            .as_ref()
            .and_then(|h| h.start_period)
            .unwrap_or_default();
        self.settings.startup_timeout.max(start_period)
    }

    pub fn probe_interval(&self, service: &Service) -> Duration {
        service
            .healthcheck
            .as_ref()
            .and_then(|h| h.interval)
            .unwrap_or(self.settings.probe_interval)
    }

    /// How long a service may stay degraded: `retries` failed probes when the
    /// healthcheck says so, the configured grace otherwise
    pub fn degraded_grace(&self, service: &Service) -> Duration {
        match service.healthcheck.as_ref().and_then(|h| h.retries) {
            Some(retries) => self.probe_interval(service).saturating_mul(retries),
            None => self.settings.degraded_grace,
        }
    }

    pub fn stop_timeout(&self, service: &Service) -> Duration {
        service
            .stop_grace_period
            .unwrap_or(self.settings.stop_timeout)
    }
}

/// What let a waiting service go
enum Gate {
    Start,
    Blocked,
    Halted,
}

/// How a started service ended
enum Outcome {
    /// Global shutdown
    Shutdown,
    /// A dependency went down
    Cascade(String),
    /// The service itself failed
    Failed(String),
}

/// Supervise one service until it is settled for good
pub(crate) async fn supervise(ctx: Arc<Context>, id: ServiceId) {
    let task = ServiceTask { ctx, id };
    if let Err(e) = task.run().await {
        task.abandon(e);
    }
}

/// Stop a service left running by an earlier invocation
pub(crate) async fn stop_attached(ctx: Arc<Context>, id: ServiceId) {
    let task = ServiceTask { ctx, id };
    let result = match task.ctx.board.read(|slots| {
        let slot = slots.get(id);
        (slot.state, slot.handle.clone())
    }) {
        Ok((ServiceState::Pending, _)) => task.stop_unstarted(),
        Ok((state, handle)) if state.is_running() => task.stop(handle, None).await,
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        task.abandon(e);
    }
}

struct ServiceTask {
    ctx: Arc<Context>,
    id: ServiceId,
}

impl ServiceTask {
    fn service(&self) -> &Service {
        self.ctx.topology.service(self.id)
    }

    fn name(&self) -> &str {
        &self.service().name
    }

    async fn run(&self) -> Result<()> {
        loop {
            match self.wait_for_start().await? {
                Gate::Start => {}
                Gate::Halted => return self.stop_unstarted(),
                Gate::Blocked => {
                    self.ctx.shutdown.cancelled().await;
                    return self.stop_unstarted();
                }
            }

            let (outcome, handle) = self.start_and_monitor().await?;
            match outcome {
                Outcome::Shutdown => return self.stop(handle, None).await,
                Outcome::Cascade(reason) => return self.stop(handle, Some(reason)).await,
                Outcome::Failed(reason) => {
                    if !self.fail(handle, reason).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Wait until every dependency is healthy and move to Starting, or until
    /// a dependency is gone for good.
    async fn wait_for_start(&self) -> Result<Gate> {
        let id = self.id;
        let deps = self.service().dependencies.clone();

        let gate = self
            .ctx
            .board
            .wait_for(|slots| {
                if slots.halted() {
                    return Some(Ok(Gate::Halted));
                }
                if let Some(reason) = lost_dependency(slots, &deps) {
                    block(slots, id, reason);
                    return Some(Ok(Gate::Blocked));
                }
                if deps.iter().all(|d| slots.state(*d) == ServiceState::Healthy) {
                    return Some(slots.set(id, ServiceState::Starting, None).map(|_| Gate::Start));
                }
                None
            })
            .await??;

        if let Gate::Blocked = gate {
            let detail = self
                .ctx
                .board
                .read(|slots| slots.get(id).detail.clone())?
                .unwrap_or_default();
            warn!("{} will not start: {}", self.name(), detail);
        }

        Ok(gate)
    }

    async fn start_and_monitor(&self) -> Result<(Outcome, Option<RuntimeHandle>)> {
        let ctx = &self.ctx;
        let service = self.service();

        let acquired = match ctx.resources.acquire(&ctx.topology, service) {
            Ok(acquired) => acquired,
            Err(e) => return Ok((Outcome::Failed(e.to_string()), None)),
        };
        let spec = match LaunchSpec::build(&ctx.project, &ctx.project_dir, service, &acquired) {
            Ok(spec) => spec,
            Err(e) => return Ok((Outcome::Failed(e.to_string()), None)),
        };

        let timeout = ctx.startup_timeout(service);
        let deadline = Instant::now() + timeout;

        let handle = match tokio::time::timeout_at(deadline, ctx.runtime.start(&spec)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Ok((Outcome::Failed(e.to_string()), None)),
            Err(_) => {
                let reason = BerthError::Timeout(format!("start took longer than {:?}", timeout));
                return Ok((Outcome::Failed(reason.to_string()), None));
            }
        };

        let id = self.id;
        let recorded = handle.clone();
        ctx.board
            .update(|slots| slots.get_mut(id).handle = Some(recorded))?;

        if let Some(outcome) = self.health_gate(&handle, deadline, timeout).await? {
            return Ok((outcome, Some(handle)));
        }
        ctx.board.transition(id, ServiceState::Healthy, None)?;

        let outcome = self.monitor(&handle).await?;
        Ok((outcome, Some(handle)))
    }

    /// Probe until healthy. `None` means the service became healthy.
    async fn health_gate(
        &self,
        handle: &RuntimeHandle,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Option<Outcome>> {
        let ctx = &self.ctx;
        let interval = ctx.probe_interval(self.service());
        let timed_out = || -> Result<Option<Outcome>> {
            let reason = BerthError::Timeout(format!("not healthy within {:?}", timeout));
            Ok(Some(Outcome::Failed(reason.to_string())))
        };

        loop {
            match tokio::time::timeout_at(deadline, ctx.runtime.probe_health(handle)).await {
                Ok(Health::Healthy) => return Ok(None),
                Ok(health) => debug!("{} is not ready yet ({})", self.name(), health),
                Err(_) => return timed_out(),
            }

            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => return Ok(Some(Outcome::Shutdown)),
                reason = self.dependency_lost() => return Ok(Some(Outcome::Cascade(reason?))),
                _ = tokio::time::sleep_until(deadline) => return timed_out(),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Probe a healthy service until it fails, a dependency goes down, or
    /// shutdown begins
    async fn monitor(&self, handle: &RuntimeHandle) -> Result<Outcome> {
        let ctx = &self.ctx;
        let service = self.service();
        let interval = ctx.probe_interval(service);
        let grace = ctx.degraded_grace(service);
        let mut degraded_since: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => return Ok(Outcome::Shutdown),
                reason = self.dependency_lost() => return Ok(Outcome::Cascade(reason?)),
                _ = tokio::time::sleep(interval) => {}
            }

            match ctx.runtime.probe_health(handle).await {
                Health::Healthy => {
                    if degraded_since.take().is_some() {
                        ctx.board.transition(
                            self.id,
                            ServiceState::Healthy,
                            Some("health probe recovered".to_string()),
                        )?;
                    }
                }
                Health::Unhealthy => match degraded_since {
                    None => {
                        degraded_since = Some(Instant::now());
                        ctx.board.transition(
                            self.id,
                            ServiceState::Degraded,
                            Some("health probe failed".to_string()),
                        )?;
                    }
                    Some(since) if since.elapsed() >= grace => {
                        return Ok(Outcome::Failed(format!(
                            "unhealthy for more than {:?}",
                            grace
                        )));
                    }
                    Some(_) => {}
                },
                Health::Unknown => debug!("Health of {} is unknown", self.name()),
            }
        }
    }

    /// Resolves once a dependency is failed, stopping, or stopped
    async fn dependency_lost(&self) -> Result<String> {
        let deps = &self.service().dependencies;
        self.ctx
            .board
            .wait_for(|slots| {
                deps.iter()
                    .map(|d| slots.get(*d))
                    .find(|dep| dep.state.is_down())
                    .map(|dep| format!("dependency {} is {}", dep.name, dep.state))
            })
            .await
    }

    /// Mark the service failed, tear it down after its dependents, and
    /// decide on a restart. Returns whether the service should start again.
    async fn fail(&self, handle: Option<RuntimeHandle>, reason: String) -> Result<bool> {
        let ctx = &self.ctx;
        let service = self.service();
        let id = self.id;
        let policy = service.restart;

        let restart = ctx.board.update(|slots| {
            let restart = !slots.halted()
                && policy.is_some_and(|p| slots.get(id).attempts < p.max_attempts);
            slots.set(id, ServiceState::Failed, Some(reason.clone()))?;
            slots.get_mut(id).exhausted = !restart;
            Ok::<_, BerthError>(restart)
        })??;
        error!("{} failed: {}", service.name, reason);

        // Dependents go first
        let dependents = ctx.topology.graph().transitive_dependents(id);
        let stop_timeout = ctx.stop_timeout(service);
        let drained = tokio::time::timeout(
            stop_timeout,
            ctx.board.wait_for(|slots| {
                dependents
                    .iter()
                    .all(|d| {
                        matches!(
                            slots.state(*d),
                            ServiceState::Pending
                                | ServiceState::Stopping
                                | ServiceState::Stopped
                                | ServiceState::Failed
                        )
                    })
                    .then_some(())
            }),
        )
        .await;
        if drained.is_err() {
            warn!(
                "Dependents of {} did not begin stopping within {:?}",
                service.name, stop_timeout
            );
        }

        if let Some(handle) = &handle {
            if let Err(e) = ctx.runtime.stop(handle, stop_timeout).await {
                warn!("Failed to stop {}: {}", service.name, e);
            }
        }
        ctx.board.update(|slots| slots.get_mut(id).handle = None)?;
        self.release();

        if !restart {
            return Ok(false);
        }

        let attempt = ctx.board.update(|slots| {
            let slot = slots.get_mut(id);
            slot.attempts += 1;
            slot.attempts
        })?;
        let (max_attempts, delay) = match policy {
            Some(p) => (p.max_attempts, p.backoff(attempt - 1)),
            None => return Ok(false),
        };
        info!(
            "Restarting {} in {:?} (attempt {}/{})",
            service.name, delay, attempt, max_attempts
        );

        tokio::select! {
            _ = ctx.shutdown.cancelled() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }

    /// Stop a started service. Without a cascade reason this is part of a
    /// global shutdown and waits for the direct dependents to be down first.
    async fn stop(&self, handle: Option<RuntimeHandle>, cascade: Option<String>) -> Result<()> {
        let ctx = &self.ctx;
        let service = self.service();
        let id = self.id;

        if cascade.is_none() {
            let dependents = ctx.topology.graph().dependents(id).to_vec();
            ctx.board
                .wait_for(|slots| {
                    dependents
                        .iter()
                        .map(|d| slots.get(*d))
                        .all(|d| {
                            d.handle.is_none()
                                && matches!(
                                    d.state,
                                    ServiceState::Pending
                                        | ServiceState::Stopped
                                        | ServiceState::Failed
                                )
                        })
                        .then_some(())
                })
                .await?;
        }

        let detail = cascade.or_else(|| Some("shutdown".to_string()));
        ctx.board.transition(id, ServiceState::Stopping, detail)?;

        let result = match &handle {
            Some(handle) => ctx.runtime.stop(handle, ctx.stop_timeout(service)).await,
            None => Ok(()),
        };
        self.release();

        ctx.board.update(|slots| {
            match &result {
                Ok(()) => slots.set(id, ServiceState::Stopped, None)?,
                Err(e) => {
                    slots.set(id, ServiceState::Failed, Some(e.to_string()))?;
                    let slot = slots.get_mut(id);
                    slot.exhausted = true;
                    slot.stop_failed = true;
                }
            }
            slots.get_mut(id).handle = None;
            Ok::<_, BerthError>(())
        })??;

        Ok(())
    }

    /// Pending services have nothing to stop
    fn stop_unstarted(&self) -> Result<()> {
        let id = self.id;
        self.ctx.board.update(|slots| {
            if slots.state(id) == ServiceState::Pending {
                slots.set(id, ServiceState::Stopping, Some("shutdown".to_string()))?;
                slots.set(id, ServiceState::Stopped, None)?;
            }
            Ok::<_, BerthError>(())
        })?
    }

    fn release(&self) {
        if let Err(e) = self.ctx.resources.release(self.service()) {
            warn!("Failed to release resources of {}: {}", self.name(), e);
        }
    }

    /// Last resort when supervision itself broke
    fn abandon(&self, e: BerthError) {
        error!("Supervision of {} stopped: {}", self.name(), e);
        let id = self.id;
        let forced = self.ctx.board.update(|slots| {
            if !matches!(slots.state(id), ServiceState::Stopped | ServiceState::Failed) {
                slots.force(id, ServiceState::Failed, Some(e.to_string()));
            }
            slots.get_mut(id).exhausted = true;
        });
        if let Err(e) = forced {
            error!("Failed to record failure of {}: {}", self.name(), e);
        }
    }
}

/// First dependency that will not become healthy again in this session
fn lost_dependency(slots: &Slots, deps: &[ServiceId]) -> Option<String> {
    deps.iter().map(|d| slots.get(*d)).find_map(|dep| {
        let gone = match dep.state {
            ServiceState::Failed => dep.exhausted,
            ServiceState::Stopping | ServiceState::Stopped => true,
            ServiceState::Pending => dep.blocked,
            _ => false,
        };
        gone.then(|| format!("dependency {} is {}", dep.name, dep.state))
    })
}

/// Record that a waiting service can never start
fn block(slots: &mut Slots, id: ServiceId, reason: String) {
    let slot = slots.get_mut(id);
    match slot.state {
        ServiceState::Pending => slot.blocked = true,
        // waiting to restart
        _ => slot.exhausted = true,
    }
    slot.detail = Some(reason);
}
