pub mod auth;
pub mod config;
pub mod error;
pub mod history;
pub mod hub;
pub mod routes;

use std::sync::Arc;

use auth::Authenticator;
use hub::Hub;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub auth: Arc<dyn Authenticator>,
}
