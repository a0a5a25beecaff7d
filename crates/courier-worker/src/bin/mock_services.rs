use anyhow::{Context, Result};
use courier_worker::{init_telemetry, mock, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env());

    let addr = std::env::var("MOCK_SERVICES_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(%addr, "Mock services listening");

    axum::serve(listener, mock::router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
