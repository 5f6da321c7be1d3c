use clap::{Parser, Subcommand};
use specfleet::app::{self, AppContext};
use specfleet::config::AppConfig;
use specfleet::error::Error;
use std::process::ExitCode;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "specfleet", version, about = "Background worker fleet for test-inventory and spec-view generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the clone-and-parse analysis worker.
    Analyzer,
    /// Run the spec-view generation worker.
    SpecGenerator,
    /// Run the auto-refresh scheduler.
    Scheduler,
    /// Enqueue an analysis for a repository URL, then exit.
    Enqueue {
        /// Repository URL, e.g. https://github.com/octocat/Hello-World
        url: String,
        /// Override DATABASE_URL for this invocation.
        #[arg(long)]
        database_url: Option<String>,
    },
}

/// `0` normal, `1` config/validation failure, `2` unrecoverable runtime
/// failure.
fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::Config(_) | Error::Validation(_) => ExitCode::from(1),
        _ => ExitCode::from(2),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version surface here too; only real usage errors
            // are failures.
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    if let Err(err) = app::init_tracing() {
        eprintln!("unable to initialize logging: {err}");
        return ExitCode::from(2);
    }

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Analyzer => build_and_run(config, app::run_analyzer).await,
        Command::SpecGenerator => build_and_run(config, app::run_spec_generator).await,
        Command::Scheduler => build_and_run(config, app::run_scheduler).await,
        Command::Enqueue { url, database_url } => {
            app::run_enqueue(&config, &url, database_url).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            exit_code_for(&err)
        }
    }
}

async fn build_and_run<F, Fut>(config: AppConfig, run: F) -> Result<(), Error>
where
    F: FnOnce(AppContext) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let context = AppContext::build(config).await?;
    run(context).await
}
