// ABOUTME: Main entry point for the devloop CLI
// Thin handlers translating flags into session, router and log aggregator calls

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::{Color, Colorize};
use devloop::config::{AppConfig, ProjectConfig, PROJECT_FILE};
use devloop::logs::{LogAggregator, LogLine, LogStream, LogsOutput, LogsRequest};
use devloop::models::{CommandCatalog, ContainerHandle, Mode, Platform};
use devloop::platform::{ClusterAdapter, PlatformSet, PodmanAdapter};
use devloop::router::{CommandRouter, RunOutcome};
use devloop::runtime::ComponentRuntimeView;
use devloop::session::{SessionManager, SessionRequest, StateStore, StopSignal, StopTrigger};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "devloop", version, about = "Inner-loop development sessions on a cluster or Podman")]
struct Cli {
    /// Directory containing devloop.toml
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show logs of the component's running containers
    Logs {
        #[arg(long)]
        dev: bool,
        #[arg(long)]
        deploy: bool,
        #[arg(short, long)]
        follow: bool,
        #[arg(long, default_value = "cluster")]
        platform: Platform,
    },
    /// Run a named command in the component's Dev container
    Run {
        name: String,
        #[arg(long, default_value = "cluster")]
        platform: Platform,
    },
    /// Start a session and follow its logs until interrupted
    Dev {
        #[arg(long)]
        deploy: bool,
        #[arg(long, default_value = "cluster")]
        platform: Platform,
    },
}

#[tokio::main]
async fn main() {
    setup_logging();
    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    let workspace = Workspace::load(&cli.project_dir)?;
    let stop = interrupt_signal();

    match cli.command {
        Commands::Logs {
            dev,
            deploy,
            follow,
            platform,
        } => {
            let request = LogsRequest {
                dev,
                deploy,
                follow,
            };
            logs(&workspace, request, platform, &stop).await
        }
        Commands::Run { name, platform } => run(&workspace, &name, platform, &stop).await,
        Commands::Dev { deploy, platform } => {
            let mode = if deploy { Mode::Deploy } else { Mode::Dev };
            dev(&workspace, mode, platform, &stop).await
        }
    }
}

struct Workspace {
    project_dir: PathBuf,
    config: AppConfig,
    project: ProjectConfig,
    platforms: PlatformSet,
}

impl Workspace {
    fn load(project_dir: &Path) -> Result<Self> {
        let config = AppConfig::load().context("failed to load configuration")?;
        let project = ProjectConfig::load_from_dir(project_dir)
            .context("failed to load project")?
            .ok_or_else(|| anyhow!("no {} found in {}", PROJECT_FILE, project_dir.display()))?;

        if !config.logs.color {
            colored::control::set_override(false);
        }

        let platforms = PlatformSet::new()
            .with_adapter(Arc::new(ClusterAdapter::new(config.cluster.clone())))
            .with_adapter(Arc::new(PodmanAdapter::new(config.podman.clone())));

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            config,
            project,
            platforms,
        })
    }

    fn catalog(&self) -> Arc<dyn CommandCatalog> {
        Arc::new(self.project.clone())
    }

    fn state_store(&self) -> StateStore {
        StateStore::new(self.config.state_dir_for(&self.project_dir))
    }

    fn aggregator(&self, platform: Platform) -> Result<LogAggregator> {
        let view = ComponentRuntimeView::new(
            self.project.component(),
            self.platforms.get(platform)?,
            self.catalog(),
        );
        Ok(LogAggregator::new(view).with_discovery_interval(self.config.logs.discovery_interval()))
    }
}

async fn logs(
    workspace: &Workspace,
    request: LogsRequest,
    platform: Platform,
    stop: &StopSignal,
) -> Result<i32> {
    let aggregator = workspace.aggregator(platform)?;
    match aggregator.stream(request, stop).await? {
        LogsOutput::NoContainers(message) => {
            println!("{}", message);
            Ok(0)
        }
        LogsOutput::Streaming(mut stream) => {
            print_stream(&mut stream, &mut Printer::default()).await;
            match stream.failed_sources() {
                0 => Ok(0),
                failed => {
                    warn!("{} log source(s) failed", failed);
                    Ok(1)
                }
            }
        }
    }
}

async fn run(workspace: &Workspace, name: &str, platform: Platform, stop: &StopSignal) -> Result<i32> {
    let router = CommandRouter::new(
        workspace.project.component(),
        workspace.catalog(),
        workspace.platforms.clone(),
    )
    .with_state_store(workspace.state_store());
    let mut stdout = tokio::io::stdout();
    match router.run(name, platform, &mut stdout, stop).await? {
        RunOutcome::Exited(status) => Ok(i32::try_from(status).unwrap_or(1)),
        RunOutcome::Cancelled => Ok(0),
    }
}

async fn dev(workspace: &Workspace, mode: Mode, platform: Platform, stop: &StopSignal) -> Result<i32> {
    let manager = SessionManager::with_state_store(workspace.platforms.clone(), workspace.state_store());
    for orphan in manager.orphan_state_files() {
        warn!("Found orphaned state file {}", orphan.display());
        eprintln!("warning: {} was left by a process that no longer runs", orphan.display());
    }

    let session = manager
        .start(SessionRequest {
            component: workspace.project.component(),
            mode,
            platform,
            endpoints: workspace.project.endpoints.clone(),
        })
        .await?;
    println!(
        "{} session of {} running on {}. Press Ctrl+C to stop.",
        mode, session.component, platform
    );
    for forwarded in session.forwarded_ports() {
        println!("  - Forwarding from {}", forwarded);
    }

    let aggregator = workspace.aggregator(platform)?;
    let request = LogsRequest {
        dev: mode == Mode::Dev,
        deploy: mode == Mode::Deploy,
        follow: true,
    };
    let retry = workspace
        .config
        .logs
        .discovery_interval()
        .unwrap_or(std::time::Duration::from_secs(2));

    manager
        .spawn(session.id, "logs", move |signal| async move {
            let mut printer = Printer::default();
            let mut announced = false;
            loop {
                match aggregator.stream(request, &signal).await {
                    Ok(LogsOutput::Streaming(mut stream)) => {
                        print_stream(&mut stream, &mut printer).await;
                        break;
                    }
                    Ok(LogsOutput::NoContainers(message)) => {
                        if !announced {
                            println!("{}", message);
                            announced = true;
                        }
                    }
                    Err(e) => warn!("Unable to stream session logs: {}", e),
                }
                tokio::select! {
                    _ = signal.stopped() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
        })
        .await?;

    stop.stopped().await;
    info!("Interrupted, stopping session {}", session.id);
    manager.stop(session.id).await?;
    manager.wait_end(session.id).await?;
    println!("Session stopped");
    Ok(0)
}

async fn print_stream(stream: &mut LogStream, printer: &mut Printer) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(line) => printer.print(&line),
            Err(e) => eprintln!("{}", e),
        }
    }
}

/// Assigns each label a stable terminal color and announces the instance behind it.
#[derive(Default)]
struct Printer {
    colors: HashMap<String, Color>,
    sources: HashMap<String, ContainerHandle>,
}

impl Printer {
    const PALETTE: [Color; 6] = [
        Color::Cyan,
        Color::Green,
        Color::Yellow,
        Color::Magenta,
        Color::Blue,
        Color::BrightRed,
    ];

    fn paint(&mut self, label: &str) -> String {
        let next = Self::PALETTE[self.colors.len() % Self::PALETTE.len()];
        let color = *self.colors.entry(label.to_string()).or_insert(next);
        label.color(color).to_string()
    }

    fn print(&mut self, line: &LogLine) {
        if self.sources.get(&line.label) != Some(&line.source) {
            self.sources.insert(line.label.clone(), line.source.clone());
            println!("{}", line.source_header().dimmed());
        }
        println!("{}: {}", self.paint(&line.label), line.line);
    }
}

/// Fires on Ctrl+C.
fn interrupt_signal() -> StopSignal {
    let trigger = StopTrigger::new();
    let signal = trigger.signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => trigger.stop(),
            Err(e) => {
                warn!("Unable to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });
    signal
}

fn setup_logging() {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "devloop=info".into())
    };

    let log_dir = dirs::home_dir()
        .map(|home| home.join(".devloop").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".devloop/logs"));
    let _ = std::fs::create_dir_all(&log_dir);

    let log_file = log_dir.join(format!(
        "devloop-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    match OpenOptions::new().create(true).append(true).open(&log_file) {
        Ok(file) => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(file)
                    .with_ansi(false),
            )
            .with(filter())
            .init(),
        Err(_) => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter())
            .init(),
    }
}
