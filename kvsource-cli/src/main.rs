use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::BackendArgs;

#[derive(Parser, Debug)]
#[command(name = "kvsource")]
#[command(about = "Read and watch key-value configuration stores")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true, env = "KVSOURCE_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the values stored under one or more keys
    Get {
        /// Keys or key prefixes, e.g. /app/db
        #[arg(required = true)]
        keys: Vec<String>,

        /// Print a JSON object instead of key=value lines
        #[arg(long)]
        json: bool,
    },

    /// Block until something under a prefix changes, printing each new index
    Watch {
        /// Prefix to watch
        prefix: String,

        /// Only react to changes under these keys (repeatable)
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// Index to resume from
        #[arg(long, default_value = "0")]
        index: u64,

        /// Exit after the first change
        #[arg(long)]
        once: bool,
    },

    /// List supported backend kinds
    Backends,
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output.
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Commands::Get { keys, json } => {
            let config = cli.backend.to_config()?;
            commands::run_get(&config, &keys, json).await?;
        }
        Commands::Watch {
            prefix,
            keys,
            index,
            once,
        } => {
            let config = cli.backend.to_config()?;
            commands::run_watch(&config, &prefix, &keys, index, once).await?;
        }
        Commands::Backends => commands::run_backends(),
    }

    Ok(())
}
