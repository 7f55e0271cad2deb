//! TestHub Daemon
//!
//! Headless service that tracks test sessions and relays live results.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{IpcClient, IpcResponse, IpcSessionInfo};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::topic;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timeout for connecting to the daemon.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TestHub Daemon - test session lifecycle and live result relay.
#[derive(Parser, Debug)]
#[command(name = "testhub")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the TestHub daemon
    Start,

    /// Stop the running daemon
    Stop {
        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage test sessions
    #[command(subcommand)]
    Session(SessionCommands),

    /// Publish a test result to a session
    Publish {
        /// Session ID
        session_id: String,

        /// JSON payload, e.g. '{"test_name":"boot","status":"pass"}'
        payload: String,
    },

    /// Manage the build catalog
    #[command(subcommand)]
    Builds(BuildsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommands {
    /// Start a session for a build, or reconnect to the open one
    Start {
        /// Build number
        build_number: String,

        /// Operator running the tests
        #[arg(long, short)]
        operator: String,
    },

    /// Pause an active session
    Pause {
        /// Session ID
        session_id: String,
    },

    /// Resume a paused session
    Resume {
        /// Session ID
        session_id: String,
    },

    /// Finish and archive a session
    Finish {
        /// Session ID
        session_id: String,
    },

    /// Show one open session
    Show {
        /// Session ID
        session_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List all open sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Subcommands for the build catalog.
#[derive(Subcommand, Debug, Clone)]
pub enum BuildsCommands {
    /// Register a build number so sessions can be started for it
    Add {
        /// Build number
        build_number: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let log_dir = match cli.command {
        Commands::Start => config.daemon.log_dir.clone(),
        _ => None,
    };
    let _log_guard = init_tracing(cli.verbose, &config.daemon.log_level, log_dir)?;

    match cli.command {
        Commands::Start => {
            tracing::info!("TestHub daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Stop { timeout } => {
            graceful_stop_daemon(&config, timeout).await?;
            println!("Daemon stopped successfully");
        }
        Commands::Status => {
            let mut client = connect(&config).await?;
            match expect_ok(client.status().await?)? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    session_count,
                    viewer_count,
                    listen_addr,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "stopping" }
                    );
                    println!("  Uptime:   {}", format_duration(uptime_secs as f64));
                    println!("  Sessions: {}", session_count);
                    println!("  Viewers:  {}", viewer_count);
                    if let Some(addr) = listen_addr {
                        println!("  Listen:   ws://{}", addr);
                    }
                }
                other => unexpected(other)?,
            }
        }
        Commands::Session(cmd) => {
            let mut client = connect(&config).await?;
            run_session_command(&mut client, cmd).await?;
        }
        Commands::Publish {
            session_id,
            payload,
        } => {
            let mut client = connect(&config).await?;
            let topic = topic::result_topic(&session_id);
            match expect_ok(client.publish(topic, payload).await?)? {
                IpcResponse::Published { accepted: true } => println!("Result queued"),
                IpcResponse::Published { accepted: false } => {
                    anyhow::bail!("Result feed is full, message dropped")
                }
                other => unexpected(other)?,
            }
        }
        Commands::Builds(BuildsCommands::Add { build_number }) => {
            let mut client = connect(&config).await?;
            match expect_ok(client.register_build(build_number).await?)? {
                IpcResponse::BuildRegistered {
                    build_number,
                    created,
                } => {
                    if created {
                        println!("Build {} registered", build_number);
                    } else {
                        println!("Build {} was already registered", build_number);
                    }
                }
                other => unexpected(other)?,
            }
        }
    }

    Ok(())
}

/// Initializes console logging, plus a daily-rolling file when `log_dir` is
/// set. The returned guard must live as long as the process.
fn init_tracing(
    verbose: bool,
    level: &str,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(&dir, "testhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

async fn run_session_command(client: &mut IpcClient, cmd: SessionCommands) -> anyhow::Result<()> {
    match cmd {
        SessionCommands::Start {
            build_number,
            operator,
        } => match expect_ok(client.start_session(build_number, operator).await?)? {
            IpcResponse::SessionStarted {
                created,
                session,
                message,
            } => {
                if created {
                    println!("Session started");
                }
                if let Some(message) = message {
                    println!("{}", message);
                }
                print_session(&session);
            }
            other => unexpected(other)?,
        },
        SessionCommands::Pause { session_id } => {
            print_update(expect_ok(client.pause_session(session_id).await?)?, "paused")?
        }
        SessionCommands::Resume { session_id } => {
            print_update(expect_ok(client.resume_session(session_id).await?)?, "resumed")?
        }
        SessionCommands::Finish { session_id } => {
            match expect_ok(client.finish_session(session_id).await?)? {
                IpcResponse::SessionFinished {
                    session_id,
                    build_number,
                    total_duration_seconds,
                    events,
                } => {
                    println!("Session {} finished and archived", session_id);
                    println!("  Build:    {}", build_number);
                    println!("  Duration: {}", format_duration(total_duration_seconds));
                    println!("  Events:   {}", events);
                }
                other => unexpected(other)?,
            }
        }
        SessionCommands::Show { session_id, json } => {
            match expect_ok(client.get_session(session_id).await?)? {
                IpcResponse::Session { session } => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&session)?);
                    } else {
                        print_session(&session);
                    }
                }
                other => unexpected(other)?,
            }
        }
        SessionCommands::List { json } => match expect_ok(client.list_sessions().await?)? {
            IpcResponse::Sessions { sessions } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
            }
            other => unexpected(other)?,
        },
    }
    Ok(())
}

/// Connects to the daemon configured in `config`.
async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    let socket_path = config.socket_path();
    IpcClient::connect_with_timeout(&socket_path, CONNECT_TIMEOUT)
        .await
        .with_context(|| {
            format!(
                "Daemon is not running (cannot connect to {})",
                socket_path.display()
            )
        })
}

/// Turns an error response into an error.
fn expect_ok(response: IpcResponse) -> anyhow::Result<IpcResponse> {
    match response {
        IpcResponse::Error { kind, message } => {
            anyhow::bail!("Daemon returned error ({:?}): {}", kind, message)
        }
        other => Ok(other),
    }
}

fn unexpected(response: IpcResponse) -> anyhow::Result<()> {
    anyhow::bail!("Unexpected response from daemon: {:?}", response)
}

fn print_update(response: IpcResponse, verb: &str) -> anyhow::Result<()> {
    match response {
        IpcResponse::SessionUpdated {
            session,
            changed,
            message,
        } => {
            if changed {
                println!("Session {} {}", session.session_id, verb);
            }
            if let Some(message) = message {
                println!("{}", message);
            }
            print_session(&session);
            Ok(())
        }
        other => unexpected(other),
    }
}

fn print_session(session: &IpcSessionInfo) {
    println!("  Session:  {}", session.session_id);
    println!("  Build:    {}", session.build_number);
    println!("  Operator: {}", session.operator);
    println!("  Status:   {}", session.status);
    println!("  Started:  {}", session.start_time);
    println!("  Elapsed:  {}", format_duration(session.elapsed_seconds));
    println!("  Events:   {}", session.event_count);
    println!("  Viewers:  {}", session.viewer_count);
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No open sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.session_id.len())
        .max()
        .unwrap_or(10)
        .max(10);
    let build_width = sessions
        .iter()
        .map(|s| s.build_number.len())
        .max()
        .unwrap_or(5)
        .clamp(5, 20);

    println!(
        "{:<id_width$}  {:<build_width$}  {:<8}  {:>12}  {:>6}",
        "SESSION ID",
        "BUILD",
        "STATUS",
        "ELAPSED",
        "EVENTS",
        id_width = id_width,
        build_width = build_width
    );
    println!("{}", "-".repeat(id_width + build_width + 36));

    for session in sessions {
        println!(
            "{:<id_width$}  {:<build_width$}  {:<8}  {:>12}  {:>6}",
            session.session_id,
            truncate_str(&session.build_number, build_width),
            session.status,
            format_duration(session.elapsed_seconds),
            session.event_count,
            id_width = id_width,
            build_width = build_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0).floor() as u64;
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

/// Gracefully stop the daemon via IPC.
///
/// Sends a shutdown request and waits for the socket to go away.
async fn graceful_stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.socket_path();
    let mut client = connect(config).await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match expect_ok(client.stop().await?)? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => unexpected(other)?,
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Run the daemon in headless mode until a signal or an IPC stop request.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested over IPC");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["testhub", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
    }

    #[test]
    fn test_stop_command_default_timeout() {
        let cli = Cli::try_parse_from(["testhub", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 30),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_timeout() {
        let cli = Cli::try_parse_from(["testhub", "stop", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 5),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["testhub", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_session_start() {
        let cli =
            Cli::try_parse_from(["testhub", "session", "start", "1.0.0", "--operator", "qa1"])
                .unwrap();
        match cli.command {
            Commands::Session(SessionCommands::Start {
                build_number,
                operator,
            }) => {
                assert_eq!(build_number, "1.0.0");
                assert_eq!(operator, "qa1");
            }
            _ => panic!("Expected Session Start command"),
        }
    }

    #[test]
    fn test_session_start_short_operator() {
        let cli = Cli::try_parse_from(["testhub", "session", "start", "1.0.0", "-o", "qa1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Session(SessionCommands::Start { .. })
        ));
    }

    #[test]
    fn test_session_start_requires_operator() {
        assert!(Cli::try_parse_from(["testhub", "session", "start", "1.0.0"]).is_err());
    }

    #[test]
    fn test_session_transitions() {
        for (verb, check) in [
            ("pause", 0),
            ("resume", 1),
            ("finish", 2),
        ] {
            let cli = Cli::try_parse_from(["testhub", "session", verb, "abc"]).unwrap();
            match (cli.command, check) {
                (Commands::Session(SessionCommands::Pause { session_id }), 0)
                | (Commands::Session(SessionCommands::Resume { session_id }), 1)
                | (Commands::Session(SessionCommands::Finish { session_id }), 2) => {
                    assert_eq!(session_id, "abc")
                }
                (other, _) => panic!("unexpected command for {}: {:?}", verb, other),
            }
        }
    }

    #[test]
    fn test_session_show_json() {
        let cli = Cli::try_parse_from(["testhub", "session", "show", "abc", "--json"]).unwrap();
        match cli.command {
            Commands::Session(SessionCommands::Show { session_id, json }) => {
                assert_eq!(session_id, "abc");
                assert!(json);
            }
            _ => panic!("Expected Session Show command"),
        }
    }

    #[test]
    fn test_session_list() {
        let cli = Cli::try_parse_from(["testhub", "session", "list"]).unwrap();
        match cli.command {
            Commands::Session(SessionCommands::List { json }) => assert!(!json),
            _ => panic!("Expected Session List command"),
        }
    }

    #[test]
    fn test_session_requires_id() {
        assert!(Cli::try_parse_from(["testhub", "session", "pause"]).is_err());
    }

    #[test]
    fn test_session_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["testhub", "session"]).is_err());
    }

    #[test]
    fn test_publish_command() {
        let cli = Cli::try_parse_from([
            "testhub",
            "publish",
            "abc",
            r#"{"test_name":"boot","status":"pass"}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Publish {
                session_id,
                payload,
            } => {
                assert_eq!(session_id, "abc");
                assert!(payload.contains("boot"));
            }
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_builds_add() {
        let cli = Cli::try_parse_from(["testhub", "builds", "add", "2.1.0"]).unwrap();
        match cli.command {
            Commands::Builds(BuildsCommands::Add { build_number }) => {
                assert_eq!(build_number, "2.1.0")
            }
            _ => panic!("Expected Builds Add command"),
        }
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli =
            Cli::try_parse_from(["testhub", "status", "-v", "--config", "/tmp/c.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_invalid_command_fails() {
        assert!(Cli::try_parse_from(["testhub", "invalid"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["testhub"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.9), "59s");
        assert_eq!(format_duration(61.0), "1m 1s");
        assert_eq!(format_duration(3723.0), "1h 2m 3s");
        assert_eq!(format_duration(-5.0), "0s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a-very-long-build", 10), "a-very-...");
    }

    #[test]
    fn test_expect_ok_rejects_errors() {
        let err = expect_ok(IpcResponse::error(
            daemon::ipc::IpcErrorKind::NotFound,
            "session not found: x",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("session not found: x"));
        assert!(expect_ok(IpcResponse::Pong).is_ok());
    }
}
