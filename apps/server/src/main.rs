use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parlor_server::auth::{Authenticator, StaticSessionAuthenticator};
use parlor_server::config::Config;
use parlor_server::history::HistoryStore;
use parlor_server::hub::{sweeper, Hub};
use parlor_server::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let port = config.port;

    let history = HistoryStore::connect(
        &config.database_path,
        config.history_retention_ttl,
        config.history_per_room_cap,
    )
    .await
    .expect("failed to open history store");

    let hub = Arc::new(Hub::new(config.clone(), history));
    sweeper::spawn(hub.clone());

    // Dev authenticator: the real identity provider plugs in behind the
    // same trait.
    let auth: Arc<dyn Authenticator> = Arc::new(StaticSessionAuthenticator::from_env());

    let state = AppState { hub, auth };

    let app = Router::new()
        .merge(parlor_server::routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "parlor-server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
