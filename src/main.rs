//! Navrelay: one shared code-navigation backend for many editor hosts.
//!
//! Usage:
//!   navrelay serve                               # Shared backend on port 8010
//!   navrelay host --workspace /path/to/project   # Register a host client (starts the backend if needed)
//!   navrelay status                              # Health and registered clients
//!   navrelay call --tool goto_definition --args '{"symbol":"main"}' --workspace /path/to/project

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use navrelay_host::{CoordinatorConfig, EchoExecutor, HostSession, ServerCommand, ServerCoordinator};
use navrelay_protocol::{
    CLIENTS_PATH, ClientList, ClientRegistration, HEALTH_PATH, HealthStatus, TOOL_CALL_PATH,
    ToolCallReply, ToolInvocation,
};
use navrelay_server::{FuzzyMatch, RoutingPolicy, ServerError, ServiceConfig, SharedServer};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "navrelay", about = "Navrelay: shared navigation backend for editor hosts")]
struct Cli {
    /// Port of the shared backend
    #[arg(long, global = true, env = "NAVRELAY_PORT", default_value_t = navrelay_protocol::DEFAULT_PORT)]
    port: u16,

    /// Hostname of the shared backend
    #[arg(long, global = true, default_value = navrelay_protocol::DEFAULT_HOSTNAME)]
    hostname: String,

    /// Lock file path (defaults to navrelay-server.lock in the temp dir)
    #[arg(long, global = true, env = "NAVRELAY_LOCK_FILE")]
    lock_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to <tmp>/navrelay/navrelay.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the shared backend in the foreground
    Serve {
        /// Exit after this long with no registered clients
        #[arg(long, default_value = "30000")]
        idle_timeout_ms: u64,

        /// Deadline for a routed tool call
        #[arg(long, default_value = "30000")]
        call_timeout_ms: u64,

        /// Substring matching of workspace hints
        #[arg(long, value_enum, default_value_t = FuzzyArg::First)]
        fuzzy: FuzzyArg,

        /// Reject calls whose workspace hint matches no client instead of
        /// sending them to the default client
        #[arg(long)]
        no_fallback: bool,

        /// Maximum concurrent connections
        #[arg(long, default_value = "256")]
        max_connections: usize,

        /// Allow cross-origin requests to the public endpoint
        #[arg(long)]
        cors: bool,
    },

    /// Register a host client and answer its tool calls until interrupted
    Host {
        /// Workspace root this client serves
        #[arg(long)]
        workspace: PathBuf,

        /// Display name (defaults to the workspace directory name)
        #[arg(long)]
        name: Option<String>,

        /// Client id (random if not provided)
        #[arg(long)]
        client_id: Option<String>,

        /// How long a newly launched backend has to answer its health probe
        #[arg(long, default_value = "15000")]
        startup_timeout_ms: u64,

        /// Deadline for the backend to acknowledge a registration
        #[arg(long, default_value = "15000")]
        register_timeout_ms: u64,
    },

    /// Print the backend's health and registered clients
    Status,

    /// Invoke a tool through the public endpoint
    Call {
        #[arg(long)]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Route to the client serving this workspace
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FuzzyArg {
    Off,
    First,
    Unique,
}

impl From<FuzzyArg> for FuzzyMatch {
    fn from(arg: FuzzyArg) -> Self {
        match arg {
            FuzzyArg::Off => FuzzyMatch::Disabled,
            FuzzyArg::First => FuzzyMatch::FirstMatch,
            FuzzyArg::Unique => FuzzyMatch::RejectAmbiguous,
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&str>) -> anyhow::Result<Option<PathBuf>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_file_arg) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let log_path = if log_file_arg == "DEFAULT" {
        std::env::temp_dir().join("navrelay").join("navrelay.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(Some(log_path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(path) = init_logging(cli.verbose, cli.log_file.as_deref())? {
        eprintln!("Logging to {}", path.display());
    }

    let lock_file = cli
        .lock_file
        .clone()
        .unwrap_or_else(navrelay_protocol::default_lock_file_path);
    let base_url = format!("http://{}:{}", cli.hostname, cli.port);

    match cli.command {
        Command::Serve {
            idle_timeout_ms,
            call_timeout_ms,
            fuzzy,
            no_fallback,
            max_connections,
            cors,
        } => {
            let config = ServiceConfig {
                hostname: cli.hostname,
                port: cli.port,
                idle_shutdown_delay: Duration::from_millis(idle_timeout_ms),
                call_timeout: Duration::from_millis(call_timeout_ms),
                lock_file: Some(lock_file),
                routing: RoutingPolicy {
                    fuzzy: fuzzy.into(),
                    fallback_to_default: !no_fallback,
                },
                max_connections: Some(max_connections),
                enable_cors: cors,
            };
            serve(config).await
        }
        Command::Host {
            workspace,
            name,
            client_id,
            startup_timeout_ms,
            register_timeout_ms,
        } => {
            let mut server_command = ServerCommand::current_exe_serve(cli.port)
                .context("locating the navrelay executable")?
                .arg("--hostname")
                .arg(cli.hostname.as_str())
                .arg("--lock-file")
                .arg(lock_file.as_os_str())
                .arg("--log-file");
            if let Some(log_file) = &cli.log_file {
                server_command = server_command.arg(log_file.as_str());
            }
            let config = CoordinatorConfig {
                hostname: cli.hostname,
                port: cli.port,
                lock_file,
                server_command: Some(server_command),
                startup_timeout: Duration::from_millis(startup_timeout_ms),
                register_timeout: Duration::from_millis(register_timeout_ms),
                ..CoordinatorConfig::default()
            };
            host(config, workspace, name, client_id).await
        }
        Command::Status => status(&base_url).await,
        Command::Call {
            tool,
            args,
            workspace,
        } => call(&base_url, tool, &args, workspace).await,
    }
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let server = match SharedServer::start(config).await {
        Ok(server) => server,
        Err(ServerError::PortInUse { port }) => {
            // Another backend owns the endpoint; hosts will use that one.
            info!("Port {port} already in use; exiting");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        "Navrelay shared server listening on port {} (pid {})",
        server.port(),
        std::process::id()
    );
    server.run().await;
    info!("Navrelay shared server stopped");
    Ok(())
}

async fn host(
    config: CoordinatorConfig,
    workspace: PathBuf,
    name: Option<String>,
    client_id: Option<String>,
) -> anyhow::Result<()> {
    let workspace = workspace.canonicalize().unwrap_or(workspace);
    let workspace_path = workspace.to_string_lossy().to_string();
    let workspace_name = name.unwrap_or_else(|| {
        workspace
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| workspace_path.clone())
    });
    let client_id = client_id.unwrap_or_else(|| format!("host-{}", Uuid::new_v4().simple()));

    let registration =
        ClientRegistration::new(workspace_path, workspace_name, client_id, std::process::id());
    let executor = EchoExecutor::for_registration(&registration);

    let coordinator = ServerCoordinator::new(config);
    let session = HostSession::start(coordinator.clone(), registration, executor).await?;
    info!(
        "Host client {} registered ({:?} backend on port {})",
        session.client_id(),
        coordinator.ownership(),
        coordinator.port()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {e}");
    }
    info!("Stopping host client {}", session.client_id());
    session.stop().await;
    Ok(())
}

async fn status(base_url: &str) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let health: HealthStatus = http
        .get(format!("{base_url}{HEALTH_PATH}"))
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .with_context(|| format!("no shared server at {base_url}"))?
        .json()
        .await
        .context("reading health")?;
    let clients: ClientList = http
        .get(format!("{base_url}{CLIENTS_PATH}"))
        .timeout(Duration::from_secs(3))
        .send()
        .await?
        .json()
        .await
        .context("reading client list")?;

    println!();
    println!("  Server:     {} (pid {})", health.server, health.server_pid);
    println!("  Port:       {}", health.port);
    println!("  State:      {}", health.state);
    println!("  Clients:    {}", clients.total_clients);
    for client in &clients.clients {
        println!(
            "    {:<24} {:<20} {}",
            client.client_id, client.workspace_name, client.workspace_path
        );
    }
    println!();
    Ok(())
}

async fn call(
    base_url: &str,
    tool: String,
    args: &str,
    workspace: Option<String>,
) -> anyhow::Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be JSON")?;
    let mut invocation = ToolInvocation::new(tool, args);
    if let Some(workspace) = workspace {
        invocation = invocation.with_workspace(workspace);
    }

    let response = reqwest::Client::new()
        .post(format!("{base_url}{TOOL_CALL_PATH}"))
        .json(&invocation)
        .send()
        .await
        .with_context(|| format!("no shared server at {base_url}"))?;
    let status = response.status();
    let reply: ToolCallReply = response.json().await.context("reading tool call reply")?;

    match reply.into_result() {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => bail!("{status}: {e}"),
    }
}
