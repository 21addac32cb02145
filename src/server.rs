use crate::{
    archive::FrameArchive,
    capture::SharedCapture,
    config::{Config, RecordingConfig},
    frame_store::FrameStore,
    reconstruct::ReconstructSettings,
    routes::api_routes,
    telemetry::Metrics,
};
use anyhow::Context;
use axum::{http::HeaderValue, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
pub struct SharedState {
    pub frame_store: Arc<FrameStore>,
    pub reconstruct: Arc<ReconstructSettings>,
    pub recording: Arc<RecordingConfig>,
    pub capture: Option<SharedCapture>,
    pub archive: Option<Arc<FrameArchive>>,
    pub encoding_quality: i32,
    pub upload_body_limit: usize,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(
        config: &Config,
        capture: Option<SharedCapture>,
        archive: Option<FrameArchive>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            frame_store: Arc::new(
                FrameStore::new(config.upload.batch_size)
                    .with_session_timeout(config.upload.session_timeout())
                    .with_status_retention(config.upload.status_retention),
            ),
            reconstruct: Arc::new(ReconstructSettings::from(&config.upload)),
            recording: Arc::new(config.recording.clone()),
            capture,
            archive: archive.map(Arc::new),
            encoding_quality: config.encoding.quality,
            upload_body_limit: config.upload.max_body_bytes,
            metrics,
        }
    }
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin {:?}", origin))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

/// The full application: routes, state, CORS, tracing and HTTP metrics.
pub fn build_router(state: SharedState, cors_origins: &[String]) -> anyhow::Result<Router> {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();
    let body_limit = state.upload_body_limit;

    Ok(Router::new()
        .merge(api_routes(body_limit))
        .with_state(state)
        .layer(metrics_layer)
        .layer(cors_layer(cors_origins)?)
        .layer(TraceLayer::new_for_http()))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = build_router(state, &config.server.cors_origins)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
