use std::sync::Arc;

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use alias_pay::{ConfirmationStore, PaymentService, ServiceDeps, SqliteConfirmationStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alias_pay_server::config::ServerConfig;
use alias_pay_server::routes;
use alias_pay_server::state::AppState;
use alias_pay_server::upstream::{self, HttpCartStore, HttpDirectory, HttpLedger, HttpRelay};

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

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let confirmations: Option<Arc<dyn ConfirmationStore>> = match &config.confirmation_db_path {
        Some(path) => match SqliteConfirmationStore::open(path) {
            Ok(store) => {
                tracing::info!("Confirmation store: SQLite at {path}");
                Some(Arc::new(store))
            }
            Err(e) => {
                // Refuse to start rather than silently forget paid carts.
                tracing::error!("Failed to open confirmation store at {path}: {e}");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("CONFIRMATION_DB_PATH not set, confirmed payments are kept in memory");
            None
        }
    };

    let client = upstream::http_client();
    let relay = Arc::new(HttpRelay::new(client.clone(), &config.upstream.relay));
    let carts = Arc::new(HttpCartStore::new(
        client.clone(),
        &config.upstream.cart_service,
    ));

    let service = Arc::new(PaymentService::new(
        ServiceDeps {
            directory: Arc::new(HttpDirectory::new(client.clone(), &config.upstream.directory)),
            relay: relay.clone(),
            ledger: Arc::new(HttpLedger::new(client, &config.upstream.ledger)),
            carts: carts.clone(),
            catalog: carts,
            confirmations,
        },
        config.payment.clone(),
    ));
    if let Err(e) = service.initialize().await {
        tracing::error!("failed to start payment service: {e}");
        std::process::exit(1);
    }

    let state = web::Data::new(AppState {
        service: service.clone(),
        events: relay,
        relay_secret: config.relay_secret.clone(),
        metrics_token: config.metrics_token.clone(),
        admin_token: config.admin_token.clone(),
        public_metrics: config.public_metrics,
    });

    let port = config.port;
    tracing::info!("alias-pay listening on port {port}");
    tracing::info!("Rate limit: {} req/min per IP", config.rate_limit_rpm);
    tracing::info!("  POST http://localhost:{port}/checkout");
    tracing::info!("  POST http://localhost:{port}/confirm");
    tracing::info!("  POST http://localhost:{port}/relay/events");

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    let result = HttpServer::new(move || {
        App::new()
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    service.shutdown().await;
    result
}
