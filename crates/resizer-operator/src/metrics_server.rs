//! Prometheus scrape endpoint
//!
//! Resize instruments are recorded through OpenTelemetry; the Prometheus
//! exporter registered here turns them into text exposition on every scrape.

use std::future::Future;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use resizer_common::metrics::ResizeMetrics;
use resizer_common::{Error, Result, CONTROLLER_NAME};

/// Meter provider wired to a Prometheus registry
pub struct MetricsEndpoint {
    registry: Registry,
    provider: SdkMeterProvider,
}

impl MetricsEndpoint {
    /// Create a registry and a meter provider that exports into it
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .without_counter_suffixes()
            .without_units()
            .without_scope_info()
            .without_target_info()
            .build()
            .map_err(|e| {
                Error::internal_with_context("metrics", format!("prometheus exporter: {e}"))
            })?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        Ok(Self { registry, provider })
    }

    /// Meter for the controller's instruments
    pub fn meter(&self) -> Meter {
        self.provider.meter(CONTROLLER_NAME)
    }

    /// Resize instruments recorded into this endpoint
    pub fn resize_metrics(&self) -> ResizeMetrics {
        ResizeMetrics::new(&self.meter())
    }

    /// Router serving the registry at `path`
    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(path, get(scrape))
            .with_state(self.registry.clone())
    }

    /// Current exposition text
    pub fn gather(&self) -> Result<String> {
        encode(&self.registry)
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| Error::internal_with_context("metrics", e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| Error::internal_with_context("metrics", e.to_string()))
}

async fn scrape(State(registry): State<Registry>) -> Response {
    match encode(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Bind the metrics listener
///
/// Called before the controller starts so a bad address aborts startup.
/// A leading `:` listens on all interfaces.
pub async fn bind(address: &str) -> Result<TcpListener> {
    let address = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| Error::config(format!("failed to bind metrics address {address}: {e}")))?;
    info!(address = %address, "Metrics endpoint listening");
    Ok(listener)
}

/// Serve `router` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal_with_context("metrics", format!("metrics server: {e}")))
}

/// Running metrics endpoint
///
/// A server failure cancels `shutdown` so the controller stops too; the
/// error is returned by [`stop`](Self::stop).
pub struct MetricsServer {
    task: JoinHandle<Result<()>>,
    shutdown: CancellationToken,
}

impl MetricsServer {
    /// Serve `router` on `listener` until `shutdown` fires
    pub fn start(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Self {
        Self::spawn(serve(listener, router, shutdown.clone()), shutdown)
    }

    fn spawn<F>(server: F, shutdown: CancellationToken) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = server.await;
            if let Err(e) = &result {
                error!(error = %e, "Metrics endpoint failed");
                token.cancel();
            }
            result
        });
        Self { task, shutdown }
    }

    /// Stop serving and report how the server ended
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.map_err(|e| {
            Error::internal_with_context("metrics", format!("metrics server task: {e}"))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn resize_metrics_are_exposed_with_claim_labels() {
        let endpoint = MetricsEndpoint::new().unwrap();
        let metrics = endpoint.resize_metrics();
        metrics.start("apps", "fast").success();
        metrics.start("apps", "").failure();

        let text = endpoint.gather().unwrap();
        assert!(text.contains("resize_controller_pvc_resize_total"));
        assert!(text.contains("resize_controller_pvc_resize_failed"));
        assert!(text.contains("resize_controller_pvc_resize_duration_seconds_bucket"));
        assert!(text.contains("namespace=\"apps\""));
        assert!(text.contains("storage_class=\"fast\""));
        assert!(!text.contains("otel_scope_name"));
    }

    #[tokio::test]
    async fn server_failure_cancels_shutdown_and_is_reported() {
        let shutdown = CancellationToken::new();
        let server = MetricsServer::spawn(
            async { Err(Error::internal_with_context("metrics", "listener closed")) },
            shutdown.clone(),
        );

        shutdown.cancelled().await;
        let err = server.stop().await.unwrap_err();
        assert!(err.to_string().contains("listener closed"));
    }

    #[tokio::test]
    async fn clean_stop_is_ok() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let endpoint = MetricsEndpoint::new().unwrap();
        let shutdown = CancellationToken::new();
        let server = MetricsServer::start(listener, endpoint.router("/metrics"), shutdown.clone());

        server.stop().await.unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn bind_rejects_invalid_addresses() {
        let err = bind("not-an-address").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn endpoint_serves_text_exposition_on_configured_path() {
        let endpoint = MetricsEndpoint::new().unwrap();
        endpoint.resize_metrics().start("apps", "fast").success();

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, endpoint.router("/custom"), shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /custom HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("text/plain"));
        assert!(response.contains("resize_controller_pvc_resize_total"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
