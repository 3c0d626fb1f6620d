use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate::PaywallConfig;
use paygate_daemon::{bootstrap, routes};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match PaywallConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let mut state = match bootstrap::bootstrap(&config).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to start paywall: {e}");
            std::process::exit(1);
        }
    };

    state.metrics_token = std::env::var("PAYGATE_METRICS_TOKEN")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.into_bytes());
    if state.metrics_token.is_none() {
        tracing::warn!("PAYGATE_METRICS_TOKEN not set, /metrics endpoint is publicly accessible");
    }

    let monitor = Arc::clone(&state.monitor).spawn();
    let state = web::Data::new(state);
    let port = config.port;

    tracing::info!("paygate listening on port {port}");
    tracing::info!("  POST http://localhost:{port}/payments");
    tracing::info!("  GET  http://localhost:{port}/payments/{{id}}");
    tracing::info!("  GET  http://localhost:{port}/payments/by-address/{{address}}");

    let served = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::create_payment)
            .service(routes::get_payment_by_address)
            .service(routes::get_payment)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    monitor.stop().await;
    served
}
