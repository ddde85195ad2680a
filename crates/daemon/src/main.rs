//! Termgate Daemon
//!
//! HTTP/WebSocket service for persistent remote shell sessions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::client::{ApiClient, ClientError};
use daemon::config::{default_config_path, Config};
use daemon::lifecycle;
use daemon::orchestrator::DaemonOrchestrator;
use daemon::pidfile::{self, PidFile};
use daemon::protocol::messages::{JobSummary, SessionSummary};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Termgate - persistent remote shell sessions over HTTP.
#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server in the foreground
    Start,

    /// Stop the running server
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show server status
    Status,

    /// Manage shell sessions on the running server
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Manage detached jobs on the running server
    #[command(subcommand)]
    Jobs(JobsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stop a session by id or name
    Stop {
        /// Session id or name
        session: String,
    },
}

/// Subcommands for job management.
#[derive(Subcommand, Debug, Clone)]
pub enum JobsCommands {
    /// List all jobs
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stop a job
    Stop {
        /// Job id
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let file_config = Config::load(&config_path)?;
    let mut config = file_config.clone();
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };

    match cli.command {
        Commands::Start => {
            let log_dir = config.daemon.data_dir.join("logs");
            let _guard = init_tracing(&level, Some(&log_dir));
            config.validate()?;

            // Keys are only written back for the file's own settings, never
            // the environment overrides.
            if config.api_key().is_empty() {
                let mut file_config = file_config;
                if file_config.ensure_api_key(&config_path)? {
                    println!("Generated API key: {}", file_config.api_key());
                    println!("Saved to {}", config_path.display());
                }
                config.security.api_key = file_config.security.api_key;
            }

            run_server(config).await?;
        }
        Commands::Stop { force, timeout } => {
            let _guard = init_tracing(&level, None);
            let pid_path = pidfile::pid_file_path(&config.daemon.data_dir);
            tracing::info!("Stopping server (force: {})", force);

            let result = if force {
                force_stop_server(&pid_path)
            } else {
                graceful_stop_server(&pid_path, Duration::from_secs(timeout)).await
            };
            match result {
                Ok(()) => println!("Server stopped"),
                Err(e) => {
                    eprintln!("Failed to stop server: {:#}", e);
                    if !force {
                        eprintln!("Try: termgate stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            let _guard = init_tracing(&level, None);
            let pid = pidfile::running_pid(&pidfile::pid_file_path(&config.daemon.data_dir));

            match client(&config)?.health().await {
                Ok(health) => {
                    println!("Server Status: {}", health.status);
                    if let Some(pid) = pid {
                        println!("  PID:      {}", pid);
                    }
                    println!("  Address:  {}", config.local_base_url());
                    println!("  Version:  {}", health.version);
                    println!("  Uptime:   {}", format_duration(health.uptime_secs));
                    println!("  Sessions: {}", health.sessions);
                    println!("  Jobs:     {}", health.jobs);
                }
                Err(e) => {
                    eprintln!("Server is not running: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(cmd) => {
            let _guard = init_tracing(&level, None);
            let client = client(&config)?;

            match cmd {
                SessionsCommands::List { json } => {
                    let sessions = client.list_sessions().await.map_err(remote_error)?.sessions;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                SessionsCommands::Stop { session } => {
                    let stopped = client.stop_session(&session).await.map_err(remote_error)?;
                    if stopped.already_stopped {
                        println!("Session {} was already stopped", session);
                    } else {
                        println!("Session {} stopped", session);
                    }
                }
            }
        }
        Commands::Jobs(cmd) => {
            let _guard = init_tracing(&level, None);
            let client = client(&config)?;

            match cmd {
                JobsCommands::List { json } => {
                    let jobs = client.list_jobs().await.map_err(remote_error)?.jobs;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&jobs)?);
                    } else {
                        print_jobs_table(&jobs);
                    }
                }
                JobsCommands::Stop { job_id } => {
                    let stopped = client.stop_job(&job_id).await.map_err(remote_error)?;
                    match stopped.exit_code {
                        Some(code) => println!("Job {} stopped (exit code {})", job_id, code),
                        None => println!("Job {} stopped", job_id),
                    }
                }
            }
        }
    }

    Ok(())
}

/// Sets up logging to stderr and, for the server, a daily rolling file.
///
/// `RUST_LOG` overrides `default_level`.
fn init_tracing(default_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file = log_dir.and_then(|dir| {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("termgate.log")
            .build(dir)
            .map_err(|e| eprintln!("Warning: failed to open log directory {}: {}", dir.display(), e))
            .ok()
    });

    match file {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

/// Runs the server until a signal, a stop or a restart request.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let pid_path = pidfile::pid_file_path(&config.daemon.data_dir);
    if let Some(pid) = pidfile::running_pid(&pid_path).filter(|&p| p != std::process::id()) {
        eprintln!("Error: termgate already running (PID: {})", pid);
        eprintln!();
        eprintln!("To stop the existing server, run:");
        eprintln!("  termgate stop");
        std::process::exit(1);
    }
    let pid_file = PidFile::acquire(&pid_path)?;

    let mut orchestrator = DaemonOrchestrator::new(config)?;
    orchestrator.start().await?;
    if let Some(addr) = orchestrator.local_addr() {
        println!("termgate listening on http://{}", addr);
    }

    let control = orchestrator.control().clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        control.request_shutdown();
    });

    orchestrator.run_until_stopped().await?;
    let restart = orchestrator.restart_requested();
    drop(orchestrator);
    drop(pid_file);

    if restart {
        return Err(lifecycle::reexec());
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            tracing::error!("Failed to register signal handlers; stop with the API instead");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

fn client(config: &Config) -> anyhow::Result<ApiClient> {
    ApiClient::new(config.local_base_url(), config.api_key()).context("Failed to build HTTP client")
}

fn remote_error(e: ClientError) -> anyhow::Error {
    if e.is_connect() {
        anyhow::anyhow!("termgate is not running (cannot connect)")
    } else {
        e.into()
    }
}

fn read_server_pid(pid_path: &Path) -> anyhow::Result<i32> {
    let pid = pidfile::running_pid(pid_path)
        .ok_or_else(|| anyhow::anyhow!("Server is not running (no live PID file)"))?;
    i32::try_from(pid).context("Invalid PID in file")
}

/// Sends SIGTERM and waits for the PID file to disappear.
async fn graceful_stop_server(pid_path: &Path, timeout: Duration) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = read_server_pid(pid_path)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("Failed to signal server (PID {})", pid))?;
    println!("Sent SIGTERM, waiting for server to exit...");

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if pidfile::running_pid(pid_path).is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for server to exit ({}s)", timeout.as_secs())
}

/// Force stop the server using SIGKILL. Its children are not cleaned up.
fn force_stop_server(pid_path: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = read_server_pid(pid_path)?;
    kill(Pid::from_raw(pid), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill server (PID {})", pid))?;
    println!("Sent SIGKILL to server (PID {})", pid);

    let _ = std::fs::remove_file(pid_path);
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let name_width = sessions
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(4)
        .clamp(4, 24);

    println!(
        "{:>4}  {:<name_width$}  {:<10}  {:>8}  {:>8}  {:>10}  CWD",
        "ID",
        "NAME",
        "STATE",
        "PID",
        "COMMANDS",
        "CREATED",
        name_width = name_width
    );
    println!("{}", "-".repeat(name_width + 60));

    for session in sessions {
        println!(
            "{:>4}  {:<name_width$}  {:<10}  {:>8}  {:>8}  {:>10}  {}",
            session.id,
            truncate_str(&session.name, name_width),
            format!("{:?}", session.state).to_lowercase(),
            session.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            session.commands_run,
            format_relative_time(session.created_at),
            session.cwd.as_deref().unwrap_or("-"),
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Print jobs in a formatted ASCII table.
fn print_jobs_table(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }

    println!(
        "{:<36}  {:<9}  {:>5}  {:>10}  COMMAND",
        "ID", "STATUS", "EXIT", "STARTED"
    );
    println!("{}", "-".repeat(90));

    for job in jobs {
        println!(
            "{:<36}  {:<9}  {:>5}  {:>10}  {}",
            job.job_id,
            format!("{:?}", job.status).to_lowercase(),
            job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            format_relative_time(job.started_at),
            truncate_str(&job.command, 40),
        );
    }

    println!();
    println!("Total: {} job(s)", jobs.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let elapsed = daemon::current_timestamp().saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if cut.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
