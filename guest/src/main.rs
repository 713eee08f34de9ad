use clap::{Parser, Subcommand};
use parley_core::config::{DEFAULT_BUSY_RETRY_ATTEMPTS, DEFAULT_TIMEOUT_SECS, call_timeout};
use parley_core::{Request, Response};
use parley_guest::client::call_host;
use parley_guest::{GuestConfig, GuestDaemon};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley-guest")]
#[command(about = "Run commands between this guest and its host over virtio-serial")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this character device instead of searching for the channel
    #[arg(long, global = true)]
    character_device: Option<PathBuf>,

    /// Attempts made while the device reports EBUSY
    #[arg(long, global = true, default_value_t = DEFAULT_BUSY_RETRY_ATTEMPTS)]
    busy_retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests from the host
    Daemon,
    /// List the commands the host offers
    ListCommands {
        /// Timeout in seconds (0 waits forever)
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Run a command on the host
    Call {
        /// Command to run
        command: String,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,

        /// Timeout in seconds (0 waits forever)
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,

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

    let mut config = GuestConfig {
        device_override: cli.character_device,
        ..GuestConfig::default()
    };
    config.busy_retry.attempts = cli.busy_retries.max(1);

    match cli.command {
        Commands::Daemon => {
            let (stop, shutdown) = watch::channel(false);
            let mut daemon = tokio::spawn(GuestDaemon::new(config).run(shutdown));

            tokio::select! {
                result = &mut daemon => return match result {
                    Ok(Ok(())) => ExitCode::SUCCESS,
                    Ok(Err(e)) => {
                        tracing::error!("Guest daemon failed: {}", e);
                        ExitCode::FAILURE
                    }
                    Err(e) => {
                        tracing::error!("Guest daemon task failed: {}", e);
                        ExitCode::FAILURE
                    }
                },
                _ = wait_for_signal() => {}
            }

            tracing::info!("Shutting down");
            let _ = stop.send(true);
            if let Err(e) = daemon.await {
                tracing::warn!("Guest daemon task failed: {}", e);
            }
            ExitCode::SUCCESS
        }
        Commands::ListCommands { timeout } => {
            one_shot(&config, Request::list_commands(), timeout).await
        }
        Commands::Call {
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
            one_shot(&config, request, timeout).await
        }
    }
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

async fn one_shot(config: &GuestConfig, request: Request, timeout: u64) -> ExitCode {
    match call_host(config, request, call_timeout(timeout)).await {
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
