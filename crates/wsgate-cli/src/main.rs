use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use wsgate_deploy::LifecycleEvent;

mod commands;
mod retry;

#[derive(Parser)]
#[command(
    name = "wsgate",
    about = "wsgate — WebSocket gateway deployment reconciler",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a gateway.toml scaffold
    Init {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        #[arg(long, default_value = "WsApi")]
        api: String,
        #[arg(long, default_value = "test")]
        stage: String,
        /// Overwrite an existing gateway.toml
        #[arg(long)]
        force: bool,
    },
    /// Print resource fingerprints.
    ///
    /// With IDENTITY and SECONDARY, prints the digest of that pair.
    /// Otherwise prints every function, integration and the graph
    /// aggregate from the gateway config.
    Fingerprint {
        identity: Option<String>,
        secondary: Option<String>,
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
    },
    /// Print the endpoints a stage is reachable at
    Endpoints {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Show whether applying the config would create a new deployment
    Plan {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
        #[arg(long, default_value = ".wsgate")]
        data_dir: PathBuf,
    },
    /// Settle the config and reconcile the stage
    Apply {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
        #[arg(long, default_value = ".wsgate")]
        data_dir: PathBuf,
        /// Lifecycle event: create, update or delete
        #[arg(long, default_value = "update")]
        event: LifecycleEvent,
        /// Deployment description
        #[arg(long)]
        description: Option<String>,
        /// Fail instead of waiting when a reconcile is already running
        #[arg(long)]
        fail_fast: bool,
        /// Attempts for transient control-plane failures
        #[arg(long, default_value = "3")]
        retries: u32,
        /// Probe the stage after a successful reconcile
        #[arg(long)]
        verify: bool,
    },
    /// Show the stored state of the configured stage
    Status {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
        #[arg(long, default_value = ".wsgate")]
        data_dir: PathBuf,
    },
    /// Probe a deployed stage over WebSocket
    Verify {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
        /// Endpoint to probe (default: the stage's stream URL)
        #[arg(long)]
        url: Option<String>,
    },
    /// Remove the API, or only its stage, from local state
    Teardown {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
        #[arg(long, default_value = ".wsgate")]
        data_dir: PathBuf,
        #[arg(long)]
        stage_only: bool,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("wsgate=info".parse()?);
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Init {
            path,
            api,
            stage,
            force,
        } => commands::init::init(&path, &api, &stage, force),
        Commands::Fingerprint {
            identity,
            secondary,
            config,
        } => commands::inspect::fingerprint(&config, identity.as_deref(), secondary.as_deref()),
        Commands::Endpoints { config, format } => commands::inspect::endpoints(&config, &format),
        Commands::Plan { config, data_dir } => commands::deploy::plan(&config, &data_dir).await,
        Commands::Apply {
            config,
            data_dir,
            event,
            description,
            fail_fast,
            retries,
            verify,
        } => {
            commands::deploy::apply(commands::deploy::ApplyArgs {
                config,
                data_dir,
                event,
                description,
                fail_fast,
                retries,
                verify,
            })
            .await
        }
        Commands::Status { config, data_dir } => {
            commands::deploy::status(&config, &data_dir).await
        }
        Commands::Verify { config, url } => commands::verify::verify(&config, url).await,
        Commands::Teardown {
            config,
            data_dir,
            stage_only,
        } => commands::deploy::teardown(&config, &data_dir, stage_only),
    }
}
