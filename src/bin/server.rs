use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vault_deployer::api::create_api_server;
use vault_deployer::config::{ConfigError, DeployerConfig};
use vault_deployer::release::{GitHubReleaseHost, ReleaseHost};
use vault_deployer::scheduler::Scheduler;
use vault_deployer::sim::SimulatedWorld;
use vault_deployer::Deployer;

#[derive(Parser, Debug)]
#[command(
    name = "vault-deployer",
    version,
    about = "Provision and upgrade vault storage instances from published releases"
)]
struct Args {
    /// JSON config file; defaults apply when it does not exist
    #[arg(short, long, default_value = "deployer.json")]
    config: PathBuf,

    /// Overrides `api.listen_addr`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Serve a demo release from an in-memory release host
    #[arg(long)]
    simulate: bool,
}

fn load_config(args: &Args) -> anyhow::Result<DeployerConfig> {
    let mut config = match DeployerConfig::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            tracing::warn!("Config {} not found, using defaults", path.display());
            DeployerConfig::default()
        }
        Err(e) => return Err(e).context("loading config"),
    };

    if args.simulate {
        let testing = DeployerConfig::for_testing(&config.data_dir);
        config.database_url = testing.database_url;
        config.download = testing.download;
        config.scheduler.refresh_interval_secs = 0;
    }
    if let Some(listen) = args.listen {
        config.api.listen_addr = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    if let Some(addr) = config.metrics_addr {
        vault_deployer::metrics::start_metrics_server(addr).context("starting metrics exporter")?;
    } else {
        vault_deployer::metrics::init_metrics();
    }

    // Platform and ledger always come from the simulators; only the release host is real.
    let world = SimulatedWorld::new();
    let host: Arc<dyn ReleaseHost> = if args.simulate {
        world
            .publish_release("v0.1.0", false, false, 256 * 1024)
            .context("building demo release")?;
        tracing::info!("Simulation mode: demo release v0.1.0 published");
        world.release_host()
    } else {
        let github = GitHubReleaseHost::new(config.release_host.clone())
            .context("creating release host client")?;
        Arc::new(github)
    };

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let deployer = Arc::new(
        Deployer::new(config.clone(), host, world.collaborators())
            .await
            .context("starting deployer")?,
    );

    if args.simulate {
        let summary = deployer.refresh_releases().await.context("initial release refresh")?;
        tracing::info!("Initial refresh: {:?}", summary);
    }

    let scheduler = Scheduler::start(deployer.clone(), config.scheduler.clone());
    let app = create_api_server(deployer);

    let listener = tokio::net::TcpListener::bind(config.api.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.api.listen_addr))?;
    tracing::info!("Vault deployer listening on http://{}", config.api.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await
        .context("serving API")?;

    scheduler.stop().await;
    Ok(())
}
