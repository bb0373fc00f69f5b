use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402_facilitator::bootstrap::bootstrap;
use x402_facilitator::config::FacilitatorConfig;
use x402_facilitator::routes;

fn build_cors(origins: &[String]) -> Cors {
    let cors = if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default().allowed_origin_fn(|origin, _| {
            origin
                .to_str()
                .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                .unwrap_or(false)
        })
    } else {
        origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
    };
    cors.allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec!["content-type", "authorization", "x-facilitator-auth"])
        .max_age(3600)
}

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

    let config = match FacilitatorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "loaded configuration");

    let state = match bootstrap(&config) {
        Ok(s) => web::Data::from(s),
        Err(e) => {
            tracing::error!("failed to start facilitator: {e}");
            std::process::exit(1);
        }
    };

    let port = config.port;
    let cors_origins = config.allowed_origins.clone();

    tracing::info!("x402 facilitator listening on port {port}");
    tracing::info!("Rate limit: {} req/min per IP", config.rate_limit_rpm);
    tracing::info!("  GET  http://localhost:{port}/supported");
    tracing::info!("  POST http://localhost:{port}/verify");
    tracing::info!("  POST http://localhost:{port}/settle");
    tracing::info!("  GET  http://localhost:{port}/api/deferred/info?network=");

    let governor_conf = match GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
    {
        Some(c) => c,
        None => {
            tracing::error!("invalid rate limiter configuration");
            std::process::exit(1);
        }
    };

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .app_data(web::PayloadConfig::new(65_536))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
