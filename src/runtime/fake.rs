//! Scripted in-memory runtime
//!
//! Nothing is executed. Each service can be told to fail its first starts,
//! to report a sequence of health results, or to hang when stopped. Every
//! call is recorded so tests can assert on ordering.

use super::{Health, LaunchSpec, LogLine, LogStream, Runtime, RuntimeHandle};
use crate::error::{BerthError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Recorded runtime call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(String),
    Stop(String),
    Probe(String),
}

#[derive(Debug, Default, Clone)]
struct Script {
    /// Number of upcoming starts that fail; `u32::MAX` means always
    start_failures: u32,
    /// Health results, the last one repeats
    health: VecDeque<Health>,
    hang_on_stop: bool,
    start_delay: Option<Duration>,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, Script>,
    calls: Vec<Call>,
    running: HashMap<String, String>,
}

/// Runtime for tests
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script(&self, service: &str, f: impl FnOnce(&mut Script)) {
        if let Ok(mut state) = self.state.lock() {
            f(state.scripts.entry(service.to_string()).or_default());
        }
    }

    /// Fail the next `times` starts of a service
    pub fn fail_start(self, service: &str, times: u32) -> Self {
        self.with_script(service, |s| s.start_failures = times);
        self
    }

    /// Fail every start of a service
    pub fn fail_always(self, service: &str) -> Self {
        self.fail_start(service, u32::MAX)
    }

    /// Health results returned by successive probes
    pub fn health(self, service: &str, results: Vec<Health>) -> Self {
        self.with_script(service, |s| s.health = results.into());
        self
    }

    /// Replace the health results of a running service
    pub fn set_health(&self, service: &str, health: Health) {
        self.with_script(service, |s| s.health = VecDeque::from([health]));
    }

    /// Never complete a stop on time
    pub fn hang_on_stop(self, service: &str) -> Self {
        self.with_script(service, |s| s.hang_on_stop = true);
        self
    }

    /// Delay each start of a service
    pub fn start_delay(self, service: &str, delay: Duration) -> Self {
        self.with_script(service, |s| s.start_delay = Some(delay));
        self
    }

    /// Lines returned by the log stream of a service
    pub fn logs(self, service: &str, lines: &[&str]) -> Self {
        self.with_script(service, |s| {
            s.logs = lines.iter().map(|l| l.to_string()).collect()
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Services started successfully, in order
    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Start(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Services stopped, in order
    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Stop(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Index of the first matching call
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    /// Services currently running
    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .state
            .lock()
            .map(|s| s.running.values().cloned().collect())
            .unwrap_or_default();
        running.sort();
        running
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BerthError::Lock("Failed to lock fake runtime".to_string()))
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle> {
        let delay = {
            let state = self.lock()?;
            state.scripts.get(&spec.service).and_then(|s| s.start_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock()?;
        let script = state.scripts.entry(spec.service.clone()).or_default();
        if script.start_failures > 0 {
            if script.start_failures != u32::MAX {
                script.start_failures -= 1;
            }
            return Err(BerthError::Start {
                service: spec.service.clone(),
                reason: "scripted failure".to_string(),
            });
        }

        let handle = RuntimeHandle::new(&spec.service, None);
        state.calls.push(Call::Start(spec.service.clone()));
        state
            .running
            .insert(handle.id.clone(), spec.service.clone());
        Ok(handle)
    }

    async fn stop(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()> {
        let hang = {
            let mut state = self.lock()?;
            state.calls.push(Call::Stop(handle.service.clone()));
            state
                .scripts
                .get(&handle.service)
                .map(|s| s.hang_on_stop)
                .unwrap_or(false)
        };

        if hang {
            tokio::time::sleep(timeout).await;
        }

        self.lock()?.running.remove(&handle.id);

        if hang {
            Err(BerthError::Timeout(format!(
                "{} did not stop within {:?}",
                handle.service, timeout
            )))
        } else {
            Ok(())
        }
    }

    async fn probe_health(&self, handle: &RuntimeHandle) -> Health {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Health::Unknown,
        };
        state.calls.push(Call::Probe(handle.service.clone()));

        if !state.running.contains_key(&handle.id) {
            return Health::Unhealthy;
        }

        match state.scripts.get_mut(&handle.service) {
            Some(script) if script.health.len() > 1 => {
                script.health.pop_front().unwrap_or(Health::Healthy)
            }
            Some(script) => script.health.front().copied().unwrap_or(Health::Healthy),
            None => Health::Healthy,
        }
    }

    async fn stream_logs(
        &self,
        handle: &RuntimeHandle,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        let lines = {
            let state = self.lock()?;
            state
                .scripts
                .get(&handle.service)
                .map(|s| s.logs.clone())
                .unwrap_or_default()
        };

        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            let _ = tx.try_send(LogLine {
                service: handle.service.clone(),
                line,
            });
        }

        Ok(LogStream::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec(service: &str) -> LaunchSpec {
        LaunchSpec {
            project: "test".to_string(),
            project_dir: PathBuf::from("/"),
            service: service.to_string(),
            reference: "image".to_string(),
            image: Some("image".to_string()),
            command: None,
            environment: BTreeMap::new(),
            working_dir: None,
            mounts: Vec::new(),
            secrets: Vec::new(),
            ports: Vec::new(),
            healthcheck: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_start_failures() {
        let runtime = FakeRuntime::new().fail_start("db", 2);

        assert!(runtime.start(&spec("db")).await.is_err());
        assert!(runtime.start(&spec("db")).await.is_err());
        assert!(runtime.start(&spec("db")).await.is_ok());
        assert_eq!(runtime.started(), vec!["db"]);
    }

    #[tokio::test]
    async fn test_health_sequence_repeats_last() {
        let runtime = FakeRuntime::new().health("db", vec![Health::Unknown, Health::Healthy]);
        let handle = runtime.start(&spec("db")).await.unwrap();

        assert_eq!(runtime.probe_health(&handle).await, Health::Unknown);
        assert_eq!(runtime.probe_health(&handle).await, Health::Healthy);
        assert_eq!(runtime.probe_health(&handle).await, Health::Healthy);
    }

    #[tokio::test]
    async fn test_hanging_stop_times_out() {
        let runtime = FakeRuntime::new().hang_on_stop("db");
        let handle = runtime.start(&spec("db")).await.unwrap();

        let result = runtime.stop(&handle, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(BerthError::Timeout(_))));
        assert!(runtime.running().is_empty());
    }

    #[tokio::test]
    async fn test_log_stream_ends_when_cancelled() {
        let runtime = FakeRuntime::new().logs("web", &["one", "two"]);
        let handle = runtime.start(&spec("web")).await.unwrap();
        let cancel = CancellationToken::new();

        let mut logs = runtime.stream_logs(&handle, cancel.clone()).await.unwrap();
        assert_eq!(logs.next().await.unwrap().line, "one");
        assert_eq!(logs.next().await.unwrap().line, "two");

        cancel.cancel();
        assert!(logs.next().await.is_none());
    }
}
