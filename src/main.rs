use std::sync::Arc;
use tokio::net::TcpListener;

use pulse_server::auth::JwtVerifier;
use pulse_server::chat::store::MessageStore;
use pulse_server::config::{generate_config_template, Config};
use pulse_server::presence::PresenceRegistry;
use pulse_server::{auth, db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "pulse_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "pulse_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Pulse server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // Build application state. The presence registry is constructed once
    // here and torn down explicitly at shutdown.
    let registry = Arc::new(PresenceRegistry::new());
    let app_state = state::AppState {
        store: MessageStore::new(db),
        registry: registry.clone(),
        verifier: Arc::new(JwtVerifier::new(jwt_secret.clone())),
        jwt_secret,
        read_deadline: config.read_deadline(),
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

/// Wait for ctrl-c, then close every live session before the server stops
/// accepting connections.
async fn shutdown_signal(registry: Arc<PresenceRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received, closing live sessions");
    registry.close_all();
}
