use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mintauth::config::Config;
use mintauth::{CredentialResolver, Generation};

#[derive(Parser, Debug)]
#[command(name = "mintauth")]
#[command(author, version, about = "GitHub App installation token resolver", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mintauth.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an installation access token for a repository
    Token {
        /// Repository full name, e.g. org/repo
        repo: String,
        /// Directory generation (default: current unix time, forcing a rebuild)
        #[arg(short, long)]
        generation: Option<i64>,
    },
    /// Print the installation id owning a repository
    Resolve {
        repo: String,
        #[arg(short, long)]
        generation: Option<i64>,
    },
    /// List every repository the app can access with its installation id
    Installations {
        #[arg(short, long)]
        generation: Option<i64>,
    },
}

fn generation(value: Option<i64>) -> Generation {
    Generation(value.unwrap_or_else(|| chrono::Utc::now().timestamp()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    // logs go to stderr so stdout only carries the requested value
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!("Starting mintauth v{}", env!("CARGO_PKG_VERSION"));

    let resolver = CredentialResolver::from_config(&config)?;

    match cli.command {
        Command::Token { repo, generation: g } => {
            let token = resolver.get_token(&repo, generation(g)).await?;
            println!("{}", token);
        }
        Command::Resolve { repo, generation: g } => {
            let installation_id = resolver.resolve_installation(&repo, generation(g)).await?;
            println!("{}", installation_id);
        }
        Command::Installations { generation: g } => {
            let snapshot = resolver.directory_snapshot(generation(g)).await?;
            for (repo, installation_id) in snapshot.repositories() {
                println!("{}\t{}", repo, installation_id);
            }
        }
    }

    Ok(())
}
