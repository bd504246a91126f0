use std::sync::Arc;

use coterie_app::{Config, Substrate};

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    coterie_api::observability::init(&config);

    let substrate = match Substrate::build(&config).await {
        Ok(substrate) => Arc::new(substrate),
        Err(e) => {
            tracing::error!(error = %e, "failed to assemble substrate");
            std::process::exit(1);
        }
    };

    let app = coterie_api::app::build_router(substrate);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = config.bind_addr, "failed to bind");
            std::process::exit(1);
        }
    };

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server exited");
    }
}
