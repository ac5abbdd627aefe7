//! reval CLI
//!
//! Runs a Clojure program (a file, inline code or stdin) in a fresh session
//! on a running nREPL-style server and mirrors its output locally.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reval::exit;
use reval::output::{print_error, print_exception, print_info, print_warning};
use reval::source::Source;
use rv_core::config::{load_client_config, MultiplexMode};
use rv_core::{RunContext, RunError};
use rv_session::{LocalIo, Orchestrator, TcpTransport};

#[derive(Parser)]
#[command(name = "reval")]
#[command(author, version, about = "Run Clojure programs on a remote evaluation server")]
struct Cli {
    /// Program file to run (`-` reads the program from stdin)
    file: Option<PathBuf>,

    /// Arguments bound to *command-line-args*
    #[arg(last = true)]
    args: Vec<String>,

    /// Evaluate CODE instead of reading a file
    #[arg(short, long, value_name = "CODE")]
    eval: Option<String>,

    /// Server host (overrides config)
    #[arg(long, env = "REVAL_HOST")]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long, env = "REVAL_PORT")]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Route standard streams through named pipes: auto, always or never
    #[arg(long, value_name = "MODE")]
    multiplex: Option<MultiplexMode>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,

    /// Debug logging and timing information
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose, cli.debug) {
        (true, _, _) => "error",
        (false, 0, false) => "warn",
        (false, 1, false) => "info",
        (false, 0..=2, _) => "debug",
        (false, _, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e));
            exit::USAGE
        }
    };

    // Exit directly: a pending read on stdin would otherwise hold the runtime open
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config =
        load_client_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = Some(port);
    }
    if let Some(mode) = cli.multiplex {
        config.multiplex = mode;
    }
    let address = config
        .address()
        .context("No server port configured (use --port or REVAL_PORT)")?;

    let source = Source::resolve(cli.eval, cli.file, std::io::stdin().is_terminal())?;
    let text = source
        .load()
        .with_context(|| format!("Failed to read program from {}", source))?;

    let ctx = RunContext::new(cli.args, cli.debug);
    tracing::debug!("Run {} against {}", ctx.run_id(), address);

    let mut io = LocalIo::process();
    if source.reads_stdin() {
        io = io.without_stdin();
    }

    let transport = TcpTransport::new(address).with_timeout(config.response_timeout);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut orchestrator = Orchestrator::new(transport, config, ctx, io);
    let result = orchestrator.run(&text, &cancel).await;

    if orchestrator.context().debug() {
        print_info(&format!(
            "Finished in {:?}",
            orchestrator.context().elapsed()
        ));
    }

    Ok(match result {
        Ok(()) => exit::SUCCESS,
        Err(e) => {
            report(&e);
            exit::exit_code(&e)
        }
    })
}

fn report(err: &RunError) {
    match err {
        RunError::RemoteEvaluation(exception) => print_exception(exception),
        RunError::Cancelled => print_warning("Evaluation cancelled"),
        other => print_error(&other.to_string()),
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
///
/// Signals after the first are logged and otherwise ignored so cleanup can
/// finish.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    None
                }
            };

        loop {
            #[cfg(unix)]
            let terminate_recv = async {
                match terminate.as_mut() {
                    Some(signal) => {
                        signal.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            #[cfg(not(unix))]
            let terminate_recv = std::future::pending::<()>();

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    tracing::info!("Received Ctrl+C");
                }
                _ = terminate_recv => {
                    tracing::info!("Received SIGTERM");
                }
            }

            if cancel.is_cancelled() {
                tracing::warn!("Already cancelling; waiting for cleanup to finish");
            } else {
                cancel.cancel();
            }
        }
    });
}
