mod broadcast;
mod msg;
mod registry;
mod ws;

use axum::{routing::get, Router};
use uuid::Uuid;

use crate::AppState;

pub use broadcast::{DeliveryError, FanOut, Outbox};
pub use registry::{JoinError, JoinRequest, RoomRegistry, Session};

/// Identifies one client connection for its whole lifetime.
pub type ConnId = Uuid;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(ws::room_ws))
}
