//! Glint CLI - Command-line interface for the glint migration engine.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use glint_cli::cli::{Cli, Command, LogFormat};
use glint_cli::commands::{self, Outcome};
use glint_cli::config::Config;
use glint_cli::error::CliResult;
use glint_cli::output;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    // First Ctrl-C cancels, the second exits.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        output::warn("Interrupt received, stopping after the current batch (Ctrl-C again to abort)");
        signal_token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(Outcome::Interrupted.exit_code());
        }
    });

    let code = match run(cli, &cancel).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            let code = e.exit_code();
            output::newline();
            eprintln!("{:?}", miette::Report::new(e));
            code
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, cancel: &CancellationToken) -> CliResult<Outcome> {
    let cwd = std::env::current_dir()?;
    let config = Config::resolve(cli.config.as_deref(), &cwd)?;

    match cli.command {
        Command::Migrate(args) => commands::migrate::run(args, &config, cancel).await,
        Command::Rollback(args) => commands::rollback::run(args, &config, cancel).await,
        Command::Backup(args) => commands::backup::run(args, &config, cancel).await,
        Command::Recovery(args) => commands::recovery::run(args, &config, cancel).await,
        Command::TestConnections(args) => commands::test_connections::run(args, cli.verbose).await,
    }
}

/// Log to stderr, `glint=info` unless `RUST_LOG` says otherwise.
fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "glint=debug" } else { "glint=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
