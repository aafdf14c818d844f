//! HTTP exposition.
//!
//! `GET <telemetry_path>` runs one scrape into a fresh Prometheus sink and
//! answers with the text exposition format; `GET /` serves a landing page.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::WebConfig;
use crate::error::{ExporterError, ExporterResult};
use crate::logging::TARGET_SERVER;
use crate::scrape::ScrapeCoordinator;
use crate::sink::PrometheusSink;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub coordinator: Arc<ScrapeCoordinator>,
    pub telemetry_path: Arc<str>,
    pub scrape_timeout: Duration,
    /// Cancelled on process shutdown; in-flight scrapes observe it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        coordinator: Arc<ScrapeCoordinator>,
        web: &WebConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            telemetry_path: Arc::from(web.telemetry_path.as_str()),
            scrape_timeout: Duration::from_secs(web.scrape_timeout_secs),
            shutdown,
        }
    }
}

impl IntoResponse for ExporterError {
    fn into_response(self) -> Response {
        error!(
            target: TARGET_SERVER,
            category = self.category(),
            error = %self,
            "Request failed"
        );
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let telemetry_path = state.telemetry_path.to_string();
    Router::new()
        .route("/", get(landing_page))
        .route(&telemetry_path, get(metrics_handler))
        .with_state(state)
}

async fn landing_page(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Buildkit Exporter</title></head>\n\
         <body>\n\
         <h1>Buildkit Exporter</h1>\n\
         <p><a href='{}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.telemetry_path
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ExporterError> {
    let cancel = state.shutdown.child_token();
    let _stop_timer = cancel.clone().drop_guard();
    let timer = cancel.clone();
    let timeout = state.scrape_timeout;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });

    let mut sink = PrometheusSink::new();
    state.coordinator.catalog().register_all(&mut sink)?;
    state.coordinator.execute_scrape(&cancel, &mut sink).await;

    let body = sink.render()?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}

/// Bind `listen_address` and serve until `shutdown` fires.
pub async fn serve(listen_address: &str, state: AppState) -> ExporterResult<()> {
    let addr: SocketAddr = listen_address.parse().map_err(|e| {
        ExporterError::Internal(format!("Invalid listen address '{}': {}", listen_address, e))
    })?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();

    info!(
        target: TARGET_SERVER,
        address = %local_addr,
        telemetry_path = %state.telemetry_path,
        "Listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(target: TARGET_SERVER, "Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::client::{BuildClient, BuildHistoryEvent, MockBuildClient};
    use crate::config::MetricsConfig;
    use crate::error::TransportError;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use futures::{stream, StreamExt};
    use tower::ServiceExt;

    fn state(client: MockBuildClient) -> AppState {
        let client: Arc<dyn BuildClient> = Arc::new(client);
        let catalog = Arc::new(Catalog::new(&MetricsConfig::default()).unwrap());
        AppState::new(
            Arc::new(ScrapeCoordinator::new(client, catalog, true)),
            &WebConfig::default(),
            CancellationToken::new(),
        )
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_landing_page_links_metrics() {
        let (status, body) = get_text(router(state(MockBuildClient::new())), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<a href='/metrics'>Metrics</a>"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_down() {
        let mut client = MockBuildClient::new();
        client
            .expect_disk_usage()
            .returning(|_| Err(TransportError::unavailable("unix:///run/buildkit/buildkitd.sock", "no such file")));
        client.expect_stream_history().returning(|_, _| {
            Err(TransportError::unavailable("unix:///run/buildkit/buildkitd.sock", "no such file"))
        });
        client.expect_endpoint().return_const("unix:///run/buildkit/buildkitd.sock".to_string());

        let (status, body) = get_text(router(state(client)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("buildkit_up 0"));
        assert!(body.contains("buildkit_exporter_scrapes_total 1"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_samples() {
        let mut client = MockBuildClient::new();
        client.expect_disk_usage().returning(|_| Ok(vec![]));
        client
            .expect_stream_history()
            .returning(|_, _| Ok(stream::empty::<Result<BuildHistoryEvent, TransportError>>().boxed()));
        client.expect_endpoint().return_const("tcp://buildkitd:1234".to_string());

        let (status, body) = get_text(router(state(client)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("buildkit_up 1"));
        assert!(body.contains("buildkit_exporter_build_info{version=\""));
    }
}
