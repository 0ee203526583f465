//! Conduit CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod handlers;
mod local;

use commands::Commands;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about = "Conduit CI orchestration engine", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Validate { paths } => handlers::validate(&paths)?,
        Commands::Plan { path } => handlers::plan(&path)?,
        Commands::Match {
            dir,
            event,
            git_ref,
            base_ref,
            action,
            paths,
        } => handlers::match_event(&dir, event.into(), git_ref, base_ref, action, paths)?,
        Commands::Schema { events } => handlers::schema(events)?,
        Commands::Run {
            path,
            event,
            git_ref,
            runners,
            labels,
            approve,
        } => {
            let options = handlers::RunOptions {
                config: cli.config,
                event: event.into(),
                git_ref,
                runners,
                labels,
                approve,
            };
            handlers::run_local(&path, options).await?
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}
