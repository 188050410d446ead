//! Local process runtime
//!
//! Runs each service's command as a host process in its own process group.
//! Output goes to `<root>/logs/<service>.log`, secrets are written to
//! `<root>/run/<service>/secrets/` and volumes are exposed through
//! `BERTH_MOUNT_*` environment variables, since a plain process has no mount
//! namespace to place them at their target path.

use super::signal;
use super::{Health, LaunchSecret, LaunchSpec, LogLine, LogStream, Runtime, RuntimeHandle};
use crate::error::{BerthError, Result};
use crate::storage::secret::write_private;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health tests without their own timeout are cut off after this long
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll period while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll period while following a log file
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Buffered log lines per stream
const LOG_BUFFER: usize = 256;

struct Instance {
    child: Child,
    spec: LaunchSpec,
    env: HashMap<String, String>,
}

/// Runtime that runs services as local processes
pub struct ProcessRuntime {
    /// Project state directory
    root: PathBuf,
    /// Instances started by this runtime, by handle id
    instances: Mutex<HashMap<String, Instance>>,
}

impl ProcessRuntime {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(root.join("logs"))?;
        std::fs::create_dir_all(root.join("run"))?;

        Ok(Self {
            root,
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Log file of a service
    pub fn log_path(&self, service: &str) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", service))
    }

    fn run_dir(&self, service: &str) -> PathBuf {
        self.root.join("run").join(service)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Instance>>> {
        self.instances
            .lock()
            .map_err(|_| BerthError::Lock("Failed to lock process table".to_string()))
    }

    /// Environment of the service process
    fn environment(&self, spec: &LaunchSpec) -> Result<HashMap<String, String>> {
        let mut env: HashMap<String, String> = spec.environment.clone().into_iter().collect();
        env.insert("BERTH_PROJECT".to_string(), spec.project.clone());
        env.insert("BERTH_SERVICE".to_string(), spec.service.clone());

        for mount in &spec.mounts {
            env.insert(
                format!("BERTH_MOUNT_{}", env_key(&mount.target)),
                mount.source.to_string_lossy().into_owned(),
            );
        }

        if !spec.secrets.is_empty() {
            let dir = self.run_dir(&spec.service).join("secrets");
            std::fs::create_dir_all(&dir)?;
            for secret in &spec.secrets {
                let file_name = secret_file_name(secret);
                let path = dir.join(&file_name);
                write_private(&path, secret.value.expose().as_bytes())?;
                env.insert(
                    format!("BERTH_SECRET_FILE_{}", env_key(&file_name)),
                    path.to_string_lossy().into_owned(),
                );
            }
            env.insert(
                "BERTH_SECRETS_DIR".to_string(),
                dir.to_string_lossy().into_owned(),
            );
        }

        Ok(env)
    }

    fn working_dir(spec: &LaunchSpec) -> PathBuf {
        match &spec.working_dir {
            Some(dir) => spec.project_dir.join(dir),
            None => spec.project_dir.clone(),
        }
    }

    /// `Some(true)` if running, `Some(false)` if exited, `None` if unknown
    fn poll_running(&self, handle: &RuntimeHandle) -> Result<Option<bool>> {
        let mut instances = self.lock()?;
        if let Some(instance) = instances.get_mut(&handle.id) {
            return match instance.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("{} exited with {}", handle.service, status);
                    Ok(Some(false))
                }
                Ok(None) => Ok(Some(true)),
                Err(e) => Err(BerthError::Runtime(format!(
                    "Failed to poll {}: {}",
                    handle.service, e
                ))),
            };
        }
        drop(instances);

        // Started by an earlier invocation; only the pid is known
        Ok(handle.pid.map(signal::is_alive))
    }

    async fn run_health_test(
        &self,
        handle: &RuntimeHandle,
        argv: Vec<String>,
        spec: &LaunchSpec,
        env: HashMap<String, String>,
    ) -> Health {
        let timeout = spec
            .healthcheck
            .as_ref()
            .and_then(|h| h.timeout)
            .unwrap_or(DEFAULT_HEALTH_TIMEOUT);

        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => return Health::Unknown,
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env)
            .current_dir(Self::working_dir(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.status()).await {
            Ok(Ok(status)) if status.success() => Health::Healthy,
            Ok(Ok(status)) => {
                debug!("Health test of {} exited with {}", handle.service, status);
                Health::Unhealthy
            }
            Ok(Err(e)) => {
                warn!("Failed to run health test of {}: {}", handle.service, e);
                Health::Unknown
            }
            Err(_) => {
                debug!("Health test of {} timed out", handle.service);
                Health::Unhealthy
            }
        }
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle> {
        let argv = spec.command.clone().ok_or_else(|| BerthError::Start {
            service: spec.service.clone(),
            reason: format!(
                "no command to run; the process runtime cannot run '{}'",
                spec.reference
            ),
        })?;
        let (program, args) = argv.split_first().ok_or_else(|| BerthError::Start {
            service: spec.service.clone(),
            reason: "empty command".to_string(),
        })?;

        let env = self.environment(spec)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&spec.service))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&env)
            .current_dir(Self::working_dir(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .process_group(0);

        let child = command.spawn().map_err(|e| BerthError::Start {
            service: spec.service.clone(),
            reason: e.to_string(),
        })?;

        let handle = RuntimeHandle::new(&spec.service, child.id());
        info!(
            "Started {} (pid {})",
            spec.service,
            handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );

        self.lock()?.insert(
            handle.id.clone(),
            Instance {
                child,
                spec: spec.clone(),
                env,
            },
        );

        Ok(handle)
    }

    async fn stop(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()> {
        let pid = match handle.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };

        if self.poll_running(handle)? != Some(true) {
            self.lock()?.remove(&handle.id);
            return Ok(());
        }

        debug!("Sending SIGTERM to {} (pid {})", handle.service, pid);
        if let Err(e) = signal::kill_group(pid, libc::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", handle.service, e);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.poll_running(handle)? != Some(true) {
                self.lock()?.remove(&handle.id);
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        warn!(
            "{} did not stop within {:?}, sending SIGKILL",
            handle.service, timeout
        );
        let _ = signal::kill_group(pid, libc::SIGKILL);

        // Reap so the pid does not linger as a zombie
        let child = self.lock()?.remove(&handle.id).map(|i| i.child);
        if let Some(mut child) = child {
            let _ = child.wait().await;
        }

        Err(BerthError::Timeout(format!(
            "{} did not stop within {:?}",
            handle.service, timeout
        )))
    }

    async fn probe_health(&self, handle: &RuntimeHandle) -> Health {
        match self.poll_running(handle) {
            Ok(Some(true)) => {}
            Ok(Some(false)) => return Health::Unhealthy,
            Ok(None) => return Health::Unknown,
            Err(e) => {
                warn!("{}", e);
                return Health::Unknown;
            }
        }

        let instance = match self.lock() {
            Ok(instances) => instances
                .get(&handle.id)
                .map(|i| (i.spec.clone(), i.env.clone())),
            Err(_) => None,
        };

        let test = instance
            .as_ref()
            .and_then(|(spec, _)| spec.healthcheck.as_ref())
            .and_then(|h| h.test.as_ref())
            .map(|t| t.argv());

        match (test, instance) {
            (Some(argv), Some((spec, env))) => {
                self.run_health_test(handle, argv, &spec, env).await
            }
            // no test: a running process is healthy
            _ => Health::Healthy,
        }
    }

    async fn stream_logs(
        &self,
        handle: &RuntimeHandle,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        let path = self.log_path(&handle.service);
        let service = handle.service.clone();
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        let token = cancel.clone();

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            BerthError::Runtime(format!("Failed to open {}: {}", path.display(), e))
        })?;

        tokio::spawn(async move {
            follow(file, service, tx, token).await;
        });

        Ok(LogStream::new(rx, cancel))
    }
}

/// Send every line of the file, then keep following it until cancelled or
/// the receiver goes away
async fn follow(
    file: tokio::fs::File,
    service: String,
    tx: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
) {
    let mut reader = tokio::io::BufReader::new(file);
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = cancel.cancelled() => return,
        };

        match read {
            Ok(0) => {
                tokio::select! {
                    _ = tokio::time::sleep(LOG_POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            // the rest of the line has not been written yet
            Ok(_) if buf.last() != Some(&b'\n') => {}
            Ok(_) => {
                let line = LogLine {
                    service: service.clone(),
                    line: String::from_utf8_lossy(&buf[..buf.len() - 1]).into_owned(),
                };
                buf.clear();
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to read log of {}: {}", service, e);
                return;
            }
        }
    }
}

/// File a secret is written to: the last component of its target
fn secret_file_name(secret: &LaunchSecret) -> String {
    Path::new(&secret.target)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| secret.name.clone())
}

/// Upper-case, with every non-alphanumeric character replaced by `_`
fn env_key(raw: &str) -> String {
    raw.trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
