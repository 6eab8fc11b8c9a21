pub mod appresult;
pub mod config;
pub mod protocol;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use rooms::RoomRegistry;
pub use store::Store;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<Config>,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(rooms::router())
        .with_state(app_state)
}

async fn health() -> &'static str {
    "ok"
}
