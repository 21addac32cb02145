use crate::archive::FrameArchive;
use crate::capture::SharedCapture;
use crate::config::Config;
use crate::server::{HttpServer, SharedState};
use crate::telemetry::Metrics;

use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);

    let capture = match &config.capture {
        Some(capture_config) => match SharedCapture::open(&capture_config.video) {
            Ok(capture) => Some(capture),
            Err(e) => {
                tracing::error!("Failed to open capture video: {:?}", e);
                return Err(e.into());
            }
        },
        None => None,
    };

    let archive = match config.archive.clone() {
        Some(archive_config) => {
            let archive =
                tokio::task::spawn_blocking(move || FrameArchive::build(&archive_config))
                    .await?;
            match archive {
                Ok(archive) => {
                    for source in archive.sources() {
                        metrics.record_archive_frames(source.frames.len() as u64, &source.name);
                    }
                    Some(archive)
                }
                Err(e) => {
                    tracing::error!("Failed to build frame archive: {:?}", e);
                    return Err(e.into());
                }
            }
        }
        None => None,
    };

    let state = SharedState::new(&config, capture, archive, metrics);
    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;
    tracing::info!("Server stopped, video capture released");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
