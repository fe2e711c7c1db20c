use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use openmemory_sync::config::Config;
use openmemory_sync::error::SyncError;
use openmemory_sync::link::{LinkRecord, KEY_SERVICE_URL};
use openmemory_sync::memory::{ActionRecord, HttpMemoryClient, MemoryService};
use openmemory_sync::service::{ServiceControl, ServiceState};
use openmemory_sync::watcher::{ProjectScanner, Watcher};
use openmemory_sync::{git, Validator};

/// OpenMemory project sync - project watcher daemon and pre-commit validator
#[derive(Parser, Debug)]
#[command(name = "openmemory-sync", version, about)]
struct Args {
    /// Global installation root (registry, pid file, logs, config.toml)
    #[arg(long, global = true, env = "OPENMEMORY_GLOBAL_DIR")]
    global_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the project watcher in the foreground until SIGINT/SIGTERM
    Watch,
    /// Run a single discovery pass and print what changed
    Scan,
    /// Show watcher service state and tracked project count
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Start the watcher as a background service
    Start,
    /// Stop the background watcher
    Stop {
        /// Seconds to wait after SIGTERM before killing
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print a systemd user unit for the watcher
    Unit,
    /// Pre-commit validation; exits 1 when the commit must be blocked
    Validate {
        /// Project directory (defaults to the enclosing git work tree)
        #[arg(short, long)]
        project: Option<PathBuf>,
        /// Downgrade an unreachable memory service to a warning
        #[arg(long)]
        bypass: bool,
        /// Staged paths; asks git when omitted
        files: Vec<String>,
    },
    /// Write the link record binding a project to this installation
    Link {
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
        /// Project name (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
        /// Memory service URL
        #[arg(short, long, env = "OPENMEMORY_URL", default_value = "http://localhost:8080")]
        url: String,
        /// Replace an existing record with a different binding
        #[arg(long)]
        force: bool,
    },
    /// Record an agent action in the project's episodic memory
    Record {
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
        #[arg(short, long)]
        agent: String,
        /// What the agent did
        action: String,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        outcome: Option<String>,
    },
    /// Query project memory for context
    Query {
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
        query: String,
        #[arg(short, default_value_t = 5)]
        k: usize,
    },
}

impl Cmd {
    /// Hook-facing commands keep stderr quiet unless RUST_LOG says otherwise
    fn default_log_level(&self) -> &'static str {
        match self {
            Cmd::Validate { .. } | Cmd::Status { .. } | Cmd::Unit => "warn",
            _ => "info",
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.command.default_log_level()));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let global_dir = Config::resolve_global_dir(args.global_dir.as_deref());
    let config = Config::load_or_default(&global_dir)?;

    match args.command {
        Cmd::Watch => watch(&config).await?,
        Cmd::Scan => scan(&config).await?,
        Cmd::Status { json } => status(&config, json)?,
        Cmd::Start => {
            let pid = ServiceControl::new(&config).start()?;
            println!("watcher started (pid {})", pid);
        }
        Cmd::Stop { timeout_secs } => {
            let stopped = ServiceControl::new(&config)
                .stop(Duration::from_secs(timeout_secs))
                .await?;
            println!("{}", if stopped { "watcher stopped" } else { "watcher was not running" });
        }
        Cmd::Unit => print!("{}", ServiceControl::new(&config).render_systemd_unit()?),
        Cmd::Validate {
            project,
            bypass,
            files,
        } => {
            let code = validate(args.global_dir.as_deref(), project, bypass, files).await?;
            std::process::exit(code);
        }
        Cmd::Link {
            project,
            name,
            url,
            force,
        } => link(&config, &project, name, &url, force)?,
        Cmd::Record {
            project,
            agent,
            action,
            context,
            outcome,
        } => {
            let (record, client) = connect(&config, &project)?;
            let action = ActionRecord {
                project_name: record.project_name,
                agent_name: agent,
                action,
                context,
                outcome,
            };
            let memory_id = client.record_action(&action).await.map_err(SyncError::from)?;
            match memory_id {
                Some(id) => println!("recorded ({})", id),
                None => println!("recorded"),
            }
        }
        Cmd::Query { project, query, k } => {
            let (record, client) = connect(&config, &project)?;
            let results = client
                .query_context(&record.project_name, &query, k)
                .await
                .map_err(SyncError::from)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }
    Ok(())
}

async fn watch(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let control = ServiceControl::new(config);
    let pid = std::process::id();
    control.claim(pid)?;

    let mut watcher = Watcher::new(config)?;
    if let Err(e) = watcher.start() {
        control.release_pid(pid);
        return Err(e.into());
    }
    info!(global_dir = %config.global_dir.display(), "watching for linked projects");

    shutdown_signal().await;
    info!("shutdown requested, finishing current pass");
    watcher.stop().await;
    control.release_pid(pid);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn scan(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let scanner = ProjectScanner::new(config)?;
    let report = tokio::task::spawn_blocking(move || scanner.scan_once()).await??;

    println!(
        "{} discovered, {} added, {} refreshed, {} stale, {} removed, {} tracked ({} ms)",
        report.discovered,
        report.added,
        report.refreshed,
        report.marked_stale,
        report.marked_removed,
        report.tracked,
        report.duration_ms
    );
    if report.foreign > 0 {
        println!("{} record(s) belong to another installation", report.foreign);
    }
    for conflict in &report.conflicts {
        println!(
            "conflict: '{}' kept {} ignored {}",
            conflict.name,
            conflict.kept.display(),
            conflict.ignored.display()
        );
    }
    for issue in &report.issues {
        println!("skipped {}: {}", issue.path.display(), issue.message);
    }
    Ok(())
}

fn status(config: &Config, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let status = ServiceControl::new(config).status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("watcher:  {}", status.state);
    match status.tracked_projects {
        Some(n) => println!("tracked:  {} project(s)", n),
        None => println!("tracked:  unknown (registry unreadable)"),
    }
    println!("registry: {}", status.registry_path.display());
    println!("log:      {}", status.log_file.display());
    Ok(())
}

async fn validate(
    global_dir: Option<&Path>,
    project: Option<PathBuf>,
    bypass: bool,
    files: Vec<String>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let project = match project {
        Some(dir) => dir,
        None => git::repo_root(Path::new("."))?,
    };
    let config = &Config::for_project(global_dir, &project)?;
    let staged = if files.is_empty() {
        git::staged_files(&project)?
    } else {
        files
    };

    let mut validator = Validator::new(
        config.validator.clone(),
        config.watcher.link_file.clone(),
        config.service.clone(),
    )?;
    if bypass {
        validator = validator.with_bypass(true);
    }

    let report = validator.validate(&project, &staged).await;
    match ServiceControl::new(config).state() {
        ServiceState::Running(pid) => println!("(watcher running, pid {})", pid),
        _ => println!("(watcher not running; the project registry may be out of date)"),
    }
    println!("{}", report);
    Ok(report.exit_code())
}

fn link(
    config: &Config,
    project: &Path,
    name: Option<String>,
    url: &str,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let project = project
        .canonicalize()
        .map_err(|e| SyncError::io(project, e))?;
    let project_name = match name {
        Some(name) => name,
        None => project
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::config("cannot derive a project name, pass --name"))?,
    };
    let service_url = Url::parse(url)
        .map_err(|e| SyncError::config(format!("invalid {} '{}': {}", KEY_SERVICE_URL, url, e)))?;

    std::fs::create_dir_all(&config.global_dir)
        .map_err(|e| SyncError::io(&config.global_dir, e))?;
    let record = LinkRecord {
        global_dir: config.global_dir.clone(),
        project_name,
        service_url,
    };
    let path = record.write(&project, &config.watcher.link_file, force)?;

    let support = project.join(&config.validator.support_dir);
    std::fs::create_dir_all(&support).map_err(|e| SyncError::io(&support, e))?;
    println!("linked '{}' -> {}", record.project_name, path.display());
    Ok(())
}

fn connect(
    config: &Config,
    project: &Path,
) -> Result<(LinkRecord, HttpMemoryClient), SyncError> {
    let record = LinkRecord::load(project, &config.watcher.link_file)?;
    let client = HttpMemoryClient::new(record.service_url.clone(), &config.service)?;
    Ok((record, client))
}
