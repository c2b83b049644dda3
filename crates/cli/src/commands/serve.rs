use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use secmgr_core::session::InMemorySessionManager;
use secmgr_idp::endpoint::IdpEndpoint;
use secmgr_idp::pipeline::GroupPipeline;
use secmgr_idp::routes::{router as idp_router, IdpState};
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, info, warn};

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the `serve` command: start the IdP web server.
pub async fn run(config_path: &Path, port: u16, permissive: bool) -> anyhow::Result<()> {
    let config = super::check_config::run(config_path, permissive)?;
    let config = Arc::new(config);

    let sessions = Arc::new(InMemorySessionManager::from_config(&config.idp));
    let pipeline = Arc::new(GroupPipeline::new(config.clone()));
    let endpoint = IdpEndpoint::new(config.clone(), sessions.clone(), pipeline)?;
    let app = idp_router(Arc::new(IdpState { endpoint }));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = sessions.cleanup_expired().await;
            if removed > 0 {
                debug!(removed, "expired sessions purged");
            }
        }
    });

    // Add security headers
    let app = app
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ));

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    println!("secmgr IdP listening on http://{}", addr);
    info!(entity_id = %config.entity_id(), "Starting server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for CTRL+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
