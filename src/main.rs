use llmrelay::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,llmrelay=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {} ({})", err.message, err.code);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = llmrelay::app::load_state().await?;
    let app = llmrelay::app::build_app(state.clone());
    let listener = bind_listener(&state.runtime.listen).await?;
    let addr = listener.local_addr().map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "listen_failed",
            err.to_string(),
        )
    })?;
    tracing::info!(upstream = %state.config.upstream_base_url, "listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "serve_failed",
                err.to_string(),
            )
        })?;
    Ok(())
}

/// Startup failures are server errors, like everything else `run` returns.
async fn bind_listener(listen: &str) -> Result<tokio::net::TcpListener, AppError> {
    let addr: std::net::SocketAddr = listen.parse().map_err(|err: std::net::AddrParseError| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "listen_invalid",
            err.to_string(),
        )
    })?;
    tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "listen_failed",
            err.to_string(),
        )
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
