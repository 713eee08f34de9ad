use clap::{Parser, Subcommand};
use parley_core::config::{
    DEFAULT_CHANNEL_DIRECTORY, DEFAULT_CONTROL_SOCKET, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_TIMEOUT_SECS, EXIT_UNAVAILABLE, call_timeout,
};
use parley_core::{Request, Response};
use parley_host::control::ControlServer;
use parley_host::{HostConfig, HostDaemon, HostError, client};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley-host")]
#[command(about = "Run commands between this host and its guests over virtio-serial")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// libvirt connection URI passed to virsh
    #[arg(long, global = true)]
    connect: Option<String>,

    /// Directory holding the host side of channel sockets
    #[arg(long, global = true, default_value = DEFAULT_CHANNEL_DIRECTORY)]
    channel_dir: PathBuf,

    /// Operator socket of the host daemon
    #[arg(long, global = true, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve all running guests
    Daemon {
        /// Seconds between guest discovery polls
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
        poll_interval: u64,

        /// Default call timeout in seconds (0 waits forever)
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// List running guests
    ListGuests,
    /// List the commands a guest offers
    ListCommands {
        /// Guest name or domain id
        guest: String,

        /// Timeout in seconds (0 waits forever)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run a command on a guest
    Call {
        /// Guest name or domain id
        guest: String,

        /// Command to run
        command: String,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,

        /// Timeout in seconds (0 waits forever)
        #[arg(long)]
        timeout: Option<u64>,

        /// Extra environment for the command
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        environment: Vec<(String, String)>,

        /// Feed this file to the command's standard input ("-" reads stdin)
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
    },
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {}", value)),
    }
}

async fn read_input(source: Option<&Path>) -> std::io::Result<Vec<u8>> {
    match source {
        None => Ok(Vec::new()),
        Some(path) if path == Path::new("-") => {
            let mut input = Vec::new();
            tokio::io::stdin().read_to_end(&mut input).await?;
            Ok(input)
        }
        Some(path) => tokio::fs::read(path).await,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let mut config = HostConfig {
        channel_dir: cli.channel_dir,
        control_socket: cli.control_socket,
        connect_uri: cli.connect,
        ..HostConfig::default()
    };

    match cli.command {
        Commands::Daemon {
            poll_interval,
            timeout,
        } => {
            config.poll_interval = Duration::from_secs(poll_interval.max(1));
            config.call_timeout = call_timeout(timeout);
            match run_daemon(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("Host daemon failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::ListGuests => match config.discovery().find_running_guests().await {
            Ok(guests) => {
                for guest in guests {
                    let id = guest
                        .domain_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{} {}", id, guest.name);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("Cannot list guests: {}", e);
                ExitCode::from(EXIT_UNAVAILABLE)
            }
        },
        Commands::ListCommands { guest, timeout } => {
            one_shot(&config, &guest, Request::list_commands(), timeout).await
        }
        Commands::Call {
            guest,
            command,
            arguments,
            timeout,
            environment,
            input,
        } => {
            let input = match read_input(input.as_deref()).await {
                Ok(input) => input,
                Err(e) => {
                    tracing::error!("Cannot read input: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let request = Request::execute(command, arguments)
                .with_environment(environment.into_iter().collect::<BTreeMap<_, _>>())
                .with_input(input);
            one_shot(&config, &guest, request, timeout).await
        }
    }
}

async fn run_daemon(config: HostConfig) -> Result<(), HostError> {
    let registry = config.registry();
    registry.prepare().await?;

    let (stop, shutdown) = watch::channel(false);
    let (routes, calls) = mpsc::channel(64);

    let control = ControlServer::bind(&config.control_socket, routes, config.call_timeout).await?;
    let control = tokio::spawn(control.run(shutdown.clone()));

    tracing::info!(
        "Host daemon polling every {:?}, channels in {}",
        config.poll_interval,
        config.channel_dir.display()
    );
    let daemon = HostDaemon::new(config.discovery(), registry, config.poll_interval);
    let daemon = tokio::spawn(daemon.run(calls, shutdown));

    wait_for_signal().await;
    tracing::info!("Shutting down");
    let _ = stop.send(true);

    if let Err(e) = daemon.await {
        tracing::warn!("Supervisor task failed: {}", e);
    }
    if let Err(e) = control.await {
        tracing::warn!("Control task failed: {}", e);
    }
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn one_shot(
    config: &HostConfig,
    guest: &str,
    request: Request,
    timeout: Option<u64>,
) -> ExitCode {
    let discovery = config.discovery();
    match client::call(&config.control_socket, &discovery, guest, request, timeout).await {
        Ok(response) => report(response).await,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_status())
        }
    }
}

async fn report(response: Response) -> ExitCode {
    let mut stdout = tokio::io::stdout();
    if let Err(e) = stdout.write_all(&response.output).await {
        tracing::warn!("Cannot write output: {}", e);
    }
    let _ = stdout.flush().await;
    if let Some(error) = &response.error {
        tracing::error!("{}", error);
    }
    ExitCode::from(response.exit_status.clamp(0, 255) as u8)
}
