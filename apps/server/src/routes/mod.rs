pub mod health;

use axum::Router;

use crate::AppState;

/// Assemble the full route surface: the chat upgrade endpoint plus health.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::hub::server::router())
}
