use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use monet_worker::config::{DEFAULT_CONTROL_PORT, WorkerConfig};
use monet_worker::events;
use monet_worker::plugin::PluginDirectory;
use monet_worker::plugin::store::FsArtifactStore;
use monet_worker::session::{LogForwarder, RemoteLogLayer, Session};
use monet_worker::shutdown::install_shutdown_handler;
use monet_worker::worker::{JobRunner, JsonlMeasurementSink, Orchestrator};

/// How long a running job gets to wind down after the worker was told to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "monet-worker")]
#[command(version)]
#[command(about = "Worker node running graph algorithm experiments for a MONet control server")]
struct Args {
    /// Host of the control server
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port of the control server
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Directory for cached plugin artifacts
    #[arg(long, default_value = "monet_cache")]
    cache_dir: PathBuf,

    /// Root of the artifact store (plugins and input graphs)
    #[arg(long, default_value = "monet_store")]
    store_dir: PathBuf,

    /// Directory measurement files are written to
    #[arg(long, default_value = "monet_measurements")]
    measurement_dir: PathBuf,

    /// Directory input graphs are downloaded to (defaults to the system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Always fetch plugins from the artifact store, ignoring the cache
    #[arg(long)]
    development: bool,
}

impl Args {
    fn into_config(self) -> (WorkerConfig, Option<PathBuf>) {
        let mut config = WorkerConfig::new(self.host, self.port)
            .with_cache_dir(self.cache_dir)
            .with_store_root(self.store_dir)
            .with_development_mode(self.development);
        config.measurement_dir = self.measurement_dir;
        (config, self.scratch_dir)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, scratch_dir) = Args::parse().into_config();

    let logs = LogForwarder::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(RemoteLogLayer::new(logs.clone()))
        .init();

    let shutdown = install_shutdown_handler()?;

    tracing::info!(
        control = %config.control_addr(),
        cache_dir = %config.cache_dir.display(),
        store = %config.store.root.display(),
        development_mode = config.development_mode,
        "Starting worker"
    );

    let store = Arc::new(FsArtifactStore::new(&config.store.root));
    let directory = Arc::new(
        PluginDirectory::open(
            &config.cache_dir,
            config.install_dir(),
            store.clone(),
            config.development_mode,
        )
        .await?,
    );
    directory.validate_cache().await;

    tokio::fs::create_dir_all(&config.measurement_dir).await?;
    let sink = Arc::new(JsonlMeasurementSink::new(&config.measurement_dir));
    let mut runner = JobRunner::new(directory, store, sink);
    if let Some(dir) = scratch_dir {
        runner = runner.with_scratch_dir(dir);
    }

    let (event_tx, event_rx) = events::channel();
    let orchestrator = Orchestrator::new(runner, event_tx.clone());

    let session = Session::new(
        config.control_addr(),
        config.session.clone(),
        orchestrator.clone(),
        event_tx,
        shutdown.clone(),
    )
    .with_log_forwarder(logs);
    session.run(event_rx).await;

    orchestrator.kill_job();
    if tokio::time::timeout(SHUTDOWN_GRACE, orchestrator.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!("Job did not stop in time, exiting anyway");
    }

    let code = shutdown.exit_code();
    tracing::info!(code, "Worker stopped");
    std::process::exit(code);
}
