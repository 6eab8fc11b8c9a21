use std::sync::Arc;

use log::{error, info};
use roomrelay::{AppResult, AppState, Config, RoomRegistry, Store};

#[tokio::main]
async fn main() -> AppResult<()> {
    let config = Config::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = Store::load(&config.data_file).await;
    let registry = Arc::new(RoomRegistry::new(store));

    let app_state = AppState {
        registry: Arc::clone(&registry),
        config: Arc::new(config.clone()),
    };
    let app = roomrelay::router(app_state);

    let listener = tokio::net::TcpListener::bind(config.addr.as_str()).await?;
    info!("websocket relay listening on ws://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, flushing {}", registry.store().path().display());
    registry.store().flush().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
