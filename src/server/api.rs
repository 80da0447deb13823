use crate::agent::gather_admin_report;
use crate::cli::Args;
use crate::history::PersistenceAdapter;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{ extract::State, http::StatusCode, response::IntoResponse, routing::get, Router };
use serde::Serialize;
use tower_http::cors::{ Any, CorsLayer };
use log::{ error, info };

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Clone)]
struct AppState {
    adapter: Arc<dyn PersistenceAdapter>,
}

/// Health probe plus the data source for the delegated admin reporting
/// view. Runs beside the WebSocket server on its own port.
pub async fn start_http_server(
    http_port: u16,
    adapter: Arc<dyn PersistenceAdapter>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/admin/stats", get(admin_stats_handler))
        .layer(cors)
        .with_state(AppState { adapter });

    if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        let cert_path = args.tls_cert_path.as_ref().unwrap();
        let key_path = args.tls_key_path.as_ref().unwrap();

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        tokio::spawn(async move {
            let result = axum_server
                ::bind_rustls(addr, tls_config)
                .serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS server started with TLS enabled");
    } else {
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                }
            }
        });

        info!("HTTP server started");
    }

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

async fn admin_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = gather_admin_report(state.adapter.as_ref()).await;
    (StatusCode::OK, axum::Json(report)).into_response()
}
