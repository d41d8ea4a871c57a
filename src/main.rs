use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::{info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use scryer::config::{Config, RepoLayout};
use scryer::daemon::Daemon;
use scryer::executor::{CommandTool, Executor};
use scryer::github::GhCli;
use scryer::prompt::PromptRenderer;
use scryer::store::{ItemStatus, WorkStore};
use scryer::workspace::{WorkspaceManager, git};
use scryer::{ScryerError, doctor};

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

fn setup_logging(cli: &Cli, config: &Config) -> Result<()> {
    let level = cli
        .log_level
        .clone()
        .or_else(|| cli.is_verbose().then(|| "debug".to_string()))
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());

    // RUST_LOG wins over flag and config
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let Some(log_file) = cli.log_file.as_ref().or(config.log_file.as_ref()) {
        if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let target = Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .context("Failed to open log file")?,
        );
        builder
            .target(env_logger::Target::Pipe(target))
            .write_style(env_logger::WriteStyle::Never);
    }

    builder.init();
    Ok(())
}

/// The enclosing git repository of the working directory, else the directory itself
async fn detect_repo_root(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return path
            .canonicalize()
            .context(format!("Repository root {} does not exist", path.display()));
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    match git::run_git(&cwd, &["rev-parse", "--show-toplevel"]).await {
        Ok(top) => Ok(PathBuf::from(top)),
        Err(_) => Ok(cwd),
    }
}

/// Flip the shutdown flag on SIGINT or SIGTERM
fn install_signal_handlers(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("signal received signal=SIGINT stop_requested=true"),
            _ = sigterm.recv() => info!("signal received signal=SIGTERM stop_requested=true"),
        }
        let _ = shutdown.send(true);
    });
    Ok(())
}

async fn build_daemon(
    config: &Config,
    layout: &RepoLayout,
    shutdown: watch::Receiver<bool>,
) -> Result<Daemon<GhCli, CommandTool>> {
    layout.ensure_dirs()?;
    let store = WorkStore::open(&layout.db_path).context("Failed to open store")?;
    let renderer = PromptRenderer::load(config.tool.prompt_template.as_deref())?;
    let executor = Executor::new(config.command_tool(), renderer, config.executor_config(layout));
    let source = GhCli::new(config.gh_config(layout));
    let workspaces = WorkspaceManager::new(config.workspace_config(layout));

    Ok(Daemon::new(
        config.daemon_config(layout),
        store,
        source,
        workspaces,
        executor,
        shutdown,
    ))
}

async fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let repo_root = detect_repo_root(cli.repo_root.as_ref()).await?;
    let layout = config.layout(&repo_root).await?;
    info!(
        "repository root={} namespace={}",
        layout.repo_root.display(),
        layout.namespace
    );

    match &cli.command {
        Commands::Status => handle_status_command(&layout),
        Commands::RunOnce { issue } => handle_run_once_command(*issue, config, &layout).await,
        Commands::Daemon => handle_daemon_command(config, &layout).await,
        Commands::Doctor => handle_doctor_command(config, &layout).await,
        Commands::Clean { force } => handle_clean_command(*force, config, &layout).await,
    }
}

fn status_color(status: ItemStatus, text: &str) -> ColoredString {
    match status {
        ItemStatus::Pending => text.normal(),
        ItemStatus::Running => text.cyan(),
        ItemStatus::Done => text.green(),
        ItemStatus::NoChange => text.blue(),
        ItemStatus::Skipped => text.dimmed(),
        ItemStatus::NeedsAttention => text.red(),
    }
}

fn handle_status_command(layout: &RepoLayout) -> Result<i32> {
    layout.ensure_dirs()?;
    let store = WorkStore::open(&layout.db_path).context("Failed to open store")?;
    let counts = store.counts_by_status()?;

    println!("{} {}", "Repo namespace:".green(), layout.namespace);
    if counts.is_empty() {
        println!("No issues tracked yet");
        return Ok(EXIT_OK);
    }

    let total: usize = counts.values().sum();
    println!("{} {}", "Total tracked issues:".green(), total);
    for (status, count) in &counts {
        println!("  {}", status_color(*status, &format!("{}: {}", status, count)));
    }
    Ok(EXIT_OK)
}

async fn handle_run_once_command(issue: Option<u64>, config: &Config, layout: &RepoLayout) -> Result<i32> {
    let (tx, rx) = watch::channel(false);
    install_signal_handlers(tx)?;
    let mut daemon = build_daemon(config, layout, rx).await?;

    match daemon.recover().await {
        Ok(report) if !report.is_empty() => info!(
            "recovered reclaimed={} parked={} removed_workspaces={}",
            report.reclaimed.len(),
            report.parked.len(),
            report.removed.len()
        ),
        Ok(_) => {}
        Err(e @ ScryerError::StoreCorrupt(_)) => return Err(e.into()),
        Err(e) => warn!("recovery failed, continuing error={}", e),
    }

    let result = match issue {
        Some(id) => daemon.run_single(id).await,
        None => daemon.run_cycle().await,
    };

    let code = match result {
        Ok(cycle) => {
            println!("{} {}", "Cycle:".green(), cycle);
            if cycle.is_failure() { EXIT_ERROR } else { EXIT_OK }
        }
        Err(e) if e.is_benign() => {
            warn!("{}", e);
            println!("{} {}", "Nothing to do:".yellow(), e);
            EXIT_OK
        }
        Err(e) => return Err(e.into()),
    };

    if daemon.shutdown_requested() {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(code)
}

async fn handle_daemon_command(config: &Config, layout: &RepoLayout) -> Result<i32> {
    let (tx, rx) = watch::channel(false);
    install_signal_handlers(tx)?;
    let mut daemon = build_daemon(config, layout, rx).await?;

    println!("{} owner={}", "Daemon started".cyan(), daemon.owner());
    daemon.run().await?;

    if daemon.shutdown_requested() {
        println!("{}", "Daemon stopped".yellow());
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(EXIT_OK)
}

async fn handle_doctor_command(config: &Config, layout: &RepoLayout) -> Result<i32> {
    let results = doctor::run_doctor(config, layout).await;
    if doctor::print_report(&results) {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_ERROR)
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).context(format!("Failed to remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).context(format!("Failed to create {}", dir.display()))?;
    Ok(())
}

/// Open the store; with `force`, an unusable store file is deleted and recreated
fn open_store_for_clean(layout: &RepoLayout, force: bool) -> Result<WorkStore> {
    match WorkStore::open(&layout.db_path) {
        Ok(store) => Ok(store),
        Err(ScryerError::StoreCorrupt(msg)) if force => {
            warn!("discarding unusable store path={} reason={}", layout.db_path.display(), msg);
            for suffix in ["", "-wal", "-shm"] {
                let mut path = layout.db_path.clone().into_os_string();
                path.push(suffix);
                let path = PathBuf::from(path);
                if path.exists() {
                    fs::remove_file(&path).context(format!("Failed to remove {}", path.display()))?;
                }
            }
            WorkStore::open(&layout.db_path).context("Failed to recreate store")
        }
        Err(e) => Err(e).context("Failed to open store"),
    }
}

async fn handle_clean_command(force: bool, config: &Config, layout: &RepoLayout) -> Result<i32> {
    layout.ensure_dirs()?;
    let store = open_store_for_clean(layout, force)?;

    let live = store.live_lease_count()?;
    if live > 0 && !force {
        println!(
            "{} {} live lease(s); stop running instances or pass --force",
            "Refusing to clean:".red(),
            live
        );
        return Ok(EXIT_ERROR);
    }

    let workspaces = WorkspaceManager::new(config.workspace_config(layout));
    let removed = workspaces.sweep_orphans(&HashSet::new()).await?;
    reset_dir(&layout.workspaces_dir)?;
    reset_dir(&layout.runs_dir)?;
    let (items, meta) = store.clear()?;

    println!("{}", "Reset complete:".green());
    println!("- repo namespace: {}", layout.namespace);
    println!("- removed workspaces: {}", removed.len());
    println!("- reset workspaces dir: {}", layout.workspaces_dir.display());
    println!("- reset runs dir: {}", layout.runs_dir.display());
    println!("- cleared store rows: items={} meta={}", items, meta);
    println!("- store file: {}", layout.db_path.display());
    Ok(EXIT_OK)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging once the level is known
    setup_logging(&cli, &config).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    let code = match run_application(&cli, &config).await {
        Ok(code) => code,
        Err(e) => {
            let store_corrupt = e
                .downcast_ref::<ScryerError>()
                .is_some_and(|se| matches!(se, ScryerError::StoreCorrupt(_)));
            log::error!("application failed: {:#}", e);
            eprintln!("{} {:#}", "Error:".red(), e);
            if store_corrupt {
                eprintln!("{}", "The store is unusable; run `scryer clean --force` to reset it".yellow());
            }
            EXIT_ERROR
        }
    };

    std::process::exit(code);
}
