//! Berth - a dependency-aware multi-service orchestrator
//!
//! This is the main CLI entry point for Berth.

use anyhow::{bail, Context as _};
use berth::compose::resolver::order_names;
use berth::compose::{ComposeParser, Topology};
use berth::runtime::{signal, ProcessRuntime, Runtime, RuntimeHandle};
use berth::settings::Settings;
use berth::storage::{ResourceManager, SecretManager, VolumeManager};
use berth::supervisor::board::HISTORY_LIMIT;
use berth::supervisor::{ProjectRecord, ServiceState, Supervisor};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{Signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Berth - dependency-aware multi-service orchestrator
#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Bring up a topology of services in dependency order", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Topology file
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Project name
    #[arg(short, long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every service and supervise it
    Up {
        /// Return once all services are healthy and leave them running
        #[arg(long)]
        detach: bool,
    },
    /// Stop every service, dependents first
    Down {
        /// Remove the project's named volumes
        #[arg(short, long)]
        volumes: bool,
    },
    /// Show the state of every service
    Status {
        /// Only list the services in this state
        #[arg(long)]
        state: Option<ServiceState>,
    },
    /// Stream the output of a service
    Logs {
        /// Service name
        service: String,
    },
    /// Validate the topology and print it with its startup order
    Config,
}

/// Transitions shown by `status`
const RECENT_TRANSITIONS: usize = 10;

/// A loaded topology and where its state lives
struct Project {
    name: String,
    file: PathBuf,
    content: String,
    topology: Topology,
    settings: Settings,
    /// Directory relative paths in the topology resolve against
    base_dir: PathBuf,
    /// `<data_dir>/projects/<name>`
    state_dir: PathBuf,
}

impl Project {
    fn load(cli: &Cli, settings: Settings) -> anyhow::Result<Self> {
        let working_dir = std::env::current_dir()?;
        let file = match &cli.file {
            Some(file) => file.clone(),
            None => ComposeParser::find_compose_file(&working_dir)
                .with_context(|| format!("no topology file found in {}", working_dir.display()))?,
        };
        let base_dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| working_dir.clone());

        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let config = ComposeParser::parse_file(&file)?;
        let named = config.name.is_some();
        let mut topology = Topology::load(&config)?;

        if let Some(name) = &cli.project {
            topology = topology.with_project_name(name)?;
        } else if !named {
            let dir_name = base_dir
                .canonicalize()
                .ok()
                .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()));
            if let Some(dir_name) = dir_name {
                topology = match topology.clone().with_project_name(&dir_name) {
                    Ok(renamed) => renamed,
                    Err(_) => topology,
                };
            }
        }

        let name = topology.name().to_string();
        let state_dir = settings.project_dir(&name);

        Ok(Self {
            name,
            file,
            content,
            topology,
            settings,
            base_dir,
            state_dir,
        })
    }

    fn resources(&self) -> anyhow::Result<Arc<ResourceManager>> {
        let volumes = VolumeManager::new(self.settings.volumes_dir(), &self.name)?;
        let secrets = SecretManager::new(
            Arc::new(self.settings.secret_provider()),
            self.settings.secret_store(&self.name),
            self.base_dir.clone(),
        );
        Ok(Arc::new(ResourceManager::new(volumes, secrets)))
    }

    fn runtime(&self) -> anyhow::Result<Arc<ProcessRuntime>> {
        Ok(Arc::new(ProcessRuntime::new(self.state_dir.clone())?))
    }

    fn supervisor(&self, runtime: Arc<ProcessRuntime>) -> anyhow::Result<Supervisor> {
        Ok(Supervisor::new(
            self.topology.clone(),
            runtime,
            self.resources()?,
            self.settings.clone(),
            self.base_dir.clone(),
        )?)
    }

    fn record(&self) -> anyhow::Result<Option<ProjectRecord>> {
        let record = ProjectRecord::load(&self.state_dir)?;
        if let Some(record) = &record {
            if record.is_stale(&self.content) {
                warn!(
                    "{} changed since {} was started",
                    self.file.display(),
                    self.name
                );
            }
        }
        Ok(record)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_env("BERTH_LOG").unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let project = Project::load(&cli, settings)?;

    match cli.command {
        Commands::Up { detach } => up(&project, detach).await,
        Commands::Down { volumes } => down(&project, volumes).await,
        Commands::Status { state } => status(&project, state),
        Commands::Logs { service } => logs(&project, &service).await,
        Commands::Config => {
            let names = order_names(&project.topology)?;
            println!("# project: {}", project.name);
            println!("# startup order: {}", names.join(", "));
            print!("{}", ComposeParser::to_yaml(&project.topology.to_config())?);
            Ok(())
        }
    }
}

/// Whether services recorded for the project may still be running
fn is_live(record: &ProjectRecord) -> bool {
    let supervisor = record
        .supervisor_pid
        .is_some_and(|pid| pid != signal::getpid() && signal::is_alive(pid));
    let services = record
        .services
        .iter()
        .filter_map(|s| s.handle.as_ref().and_then(|h| h.pid))
        .any(signal::is_alive);
    supervisor || services
}

async fn up(project: &Project, detach: bool) -> anyhow::Result<()> {
    if let Some(record) = project.record()? {
        if is_live(&record) {
            bail!(
                "project {} is already up; run `berth down` first",
                project.name
            );
        }
    }

    let supervisor = Arc::new(project.supervisor(project.runtime()?)?);
    // installed before startup so a `down` sent meanwhile is not lost
    let mut terminate = tokio::signal::unix::signal(SignalKind::terminate())?;

    let mut record = ProjectRecord::new(&project.name, &project.file, &project.content);
    if !detach {
        record.supervisor_pid = Some(signal::getpid());
    }
    record.services = supervisor.status()?;
    record.save(&project.state_dir)?;

    let recorder = {
        let supervisor = supervisor.clone();
        let mut record = record.clone();
        let state_dir = project.state_dir.clone();
        let mut changes = supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = refresh(&mut record, &supervisor) {
                    warn!("Failed to read service status: {}", e);
                }
                if let Err(e) = record.save(&state_dir) {
                    warn!("Failed to write project record: {}", e);
                }
            }
        })
    };

    if let Err(e) = supervisor.up().await {
        error!("Startup of {} failed: {}", project.name, e);
        let stopped = supervisor.shutdown().await;
        recorder.abort();
        if let Err(stop) = &stopped {
            warn!("{}", stop);
        }
        settle(project, &supervisor, &mut record, &stopped)?;
        return Err(e.into());
    }

    println!(
        "{}: {} service(s) healthy",
        project.name,
        project.topology.len()
    );

    if detach {
        recorder.abort();
        refresh(&mut record, &supervisor)?;
        record.save(&project.state_dir)?;
        return Ok(());
    }

    wait_for_signal(&mut terminate).await?;
    info!("Signal received, stopping {}", project.name);

    let result = supervisor.shutdown().await;
    recorder.abort();
    settle(project, &supervisor, &mut record, &result)?;
    Ok(result?)
}

fn refresh(record: &mut ProjectRecord, supervisor: &Supervisor) -> berth::Result<()> {
    record.services = supervisor.status()?;
    record.history = supervisor.history()?;
    Ok(())
}

/// After a shutdown: forget the project if everything stopped, otherwise
/// keep the record so that `down` can still reach what is left
fn settle(
    project: &Project,
    supervisor: &Supervisor,
    record: &mut ProjectRecord,
    shutdown: &berth::Result<()>,
) -> anyhow::Result<()> {
    if shutdown.is_err() {
        refresh(record, supervisor)?;
    }
    record.finish(&project.state_dir, shutdown.is_ok())?;
    Ok(())
}

async fn wait_for_signal(terminate: &mut Signal) -> anyhow::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn down(project: &Project, volumes: bool) -> anyhow::Result<()> {
    let resources = project.resources()?;

    match project.record()? {
        None => println!("{} is not running", project.name),
        Some(record) => match record.supervisor_pid.filter(|pid| signal::is_alive(*pid)) {
            Some(pid) => {
                // a foreground `up` owns the services; let it stop them
                signal::kill(pid as i32, libc::SIGTERM)
                    .with_context(|| format!("failed to signal supervisor {}", pid))?;
                let limit = project.settings.shutdown_grace + project.settings.stop_timeout;
                let deadline = tokio::time::Instant::now() + limit;
                while signal::is_alive(pid) {
                    if tokio::time::Instant::now() >= deadline {
                        bail!("supervisor {} did not exit within {:?}", pid, limit);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                println!("{} stopped", project.name);
            }
            None => {
                let supervisor = Supervisor::attach(
                    project.topology.clone(),
                    project.runtime()?,
                    resources.clone(),
                    project.settings.clone(),
                    project.base_dir.clone(),
                    &record,
                )?;
                let result = supervisor.shutdown().await;

                let mut record = record;
                let mut history = std::mem::take(&mut record.history);
                history.extend(supervisor.history()?);
                settle(project, &supervisor, &mut record, &result)?;
                if result.is_err() {
                    // keep what the earlier invocation saw as well
                    let keep = history.len().saturating_sub(HISTORY_LIMIT);
                    record.history = history.split_off(keep);
                    record.save(&project.state_dir)?;
                }
                result?;
                println!("{} stopped", project.name);
            }
        },
    }

    if volumes {
        resources.adopt_volumes(&project.topology)?;
        for name in resources.remove_unused_volumes()? {
            println!("Removed volume {}", name);
        }
    }

    Ok(())
}

fn status(project: &Project, only: Option<ServiceState>) -> anyhow::Result<()> {
    let record = match project.record()? {
        Some(record) => record,
        None => {
            println!("{} is not running", project.name);
            return Ok(());
        }
    };

    if let Some(state) = only {
        for name in record.in_state(state) {
            println!("{}", name);
        }
        return Ok(());
    }

    let supervised = record
        .supervisor_pid
        .is_some_and(|pid| signal::is_alive(pid));

    println!("{:<24} {:<10} {:<8} DETAIL", "SERVICE", "STATE", "RESTARTS");
    for service in &record.services {
        let exited = !supervised
            && service.state.is_running()
            && service
                .handle
                .as_ref()
                .and_then(|h| h.pid)
                .is_some_and(|pid| !signal::is_alive(pid));
        let (state, detail) = if exited {
            (ServiceState::Failed, Some("process exited".to_string()))
        } else {
            (service.state, service.detail.clone())
        };
        println!(
            "{:<24} {:<10} {:<8} {}",
            service.name,
            state.to_string(),
            service.attempts,
            detail.unwrap_or_default()
        );
    }

    let recent = record.recent(RECENT_TRANSITIONS);
    if !recent.is_empty() {
        println!();
        println!("Recent transitions:");
        for change in recent {
            println!(
                "  {} {:<24} {} -> {}{}",
                change.at.format("%Y-%m-%d %H:%M:%S"),
                change.service,
                change.from,
                change.to,
                change
                    .detail
                    .as_ref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn logs(project: &Project, service: &str) -> anyhow::Result<()> {
    project.topology.find(service)?;

    let handle = project
        .record()?
        .and_then(|r| r.service(service).and_then(|s| s.handle.clone()))
        .unwrap_or_else(|| RuntimeHandle::new(service, None));

    let runtime = project.runtime()?;
    let cancel = CancellationToken::new();
    let mut stream = runtime.stream_logs(&handle, cancel.clone()).await?;

    loop {
        tokio::select! {
            line = stream.next() => match line {
                Some(line) => println!("{} | {}", line.service, line.line),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                break;
            }
        }
    }
    Ok(())
}
