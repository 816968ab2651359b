//! Volume resizer - grows PersistentVolumes when their claims request more storage

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use resizer_common::events::{EventPublisher, KubeEventPublisher};
use resizer_common::kube_utils::create_client;
use resizer_common::leader_election::LeaderElector;
use resizer_common::metrics::ResizeMetrics;
use resizer_common::telemetry::{init_telemetry, TelemetryConfig};
use resizer_common::Error;
use resizer_controller::{run_controller, Resizer};
use resizer_operator::metrics_server::{self, MetricsEndpoint, MetricsServer};
use resizer_operator::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::default()).context("failed to initialize telemetry")?;

    if let Err(e) = run(cli).await {
        error!(error = %e, "Volume resizer exited with error");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    cli.validate()?;

    let resizer = cli.backend.resizer();
    info!(
        resizer = resizer.name(),
        workers = cli.workers,
        resync_period = ?cli.resync_period,
        "Starting volume resizer"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), resizer.name()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    // Held for the life of the process; dropping it stops the exporter.
    let mut metrics_endpoint = None;
    let mut server = None;
    let mut metrics = None;
    if cli.enable_metrics {
        let address = cli
            .metrics_address()
            .ok_or_else(|| Error::config("--metrics-address is required"))?;
        let endpoint = MetricsEndpoint::new()?;
        let listener = metrics_server::bind(address).await?;
        let router = endpoint.router(&cli.metrics_path);
        metrics = Some(endpoint.resize_metrics());
        metrics_endpoint = Some(endpoint);
        server = Some(MetricsServer::start(listener, router, shutdown.clone()));
    }

    let result = run_controller_elected(&cli, client, resizer, events, metrics, shutdown).await;

    // a failed metrics endpoint stops the controller and fails the process
    let served = match server {
        Some(server) => server.stop().await,
        None => Ok(()),
    };
    drop(metrics_endpoint);
    result?;
    served?;
    info!("Volume resizer stopped");
    Ok(())
}

/// Run the controller, behind a lease when leader election is enabled
async fn run_controller_elected(
    cli: &Cli,
    client: Client,
    resizer: Arc<dyn Resizer>,
    events: Arc<dyn EventPublisher>,
    metrics: Option<ResizeMetrics>,
    shutdown: CancellationToken,
) -> resizer_common::Result<()> {
    let controller = run_controller(
        client.clone(),
        resizer,
        events,
        metrics,
        cli.controller_config(),
        shutdown.clone(),
    );

    if !cli.leader_election {
        return controller.await;
    }

    let config = cli.leader_election_config(&cli.identity())?;
    let elector = Arc::new(LeaderElector::new(client, config)?);

    let mut guard = tokio::select! {
        guard = Arc::clone(&elector).acquire() => guard,
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
    };

    let result = tokio::select! {
        result = controller => result,
        _ = guard.lost() => {
            shutdown.cancel();
            Err(Error::leader_election("leadership lost"))
        }
    };

    if result.is_ok() {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release leader lease");
        }
    }
    result
}
