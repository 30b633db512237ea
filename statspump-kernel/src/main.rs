/**
 * STATSPUMP - process entry point
 *
 * Loads .env and the YAML configuration, builds the pump with the HTTP SEMP
 * transport and MQTT buses, serves the status API, and shuts everything
 * down on Ctrl-C.
 */

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use statspump_kernel::config::load_config;
use statspump_kernel::connection::MqttConnector;
use statspump_kernel::http::{api_key_from_env, build_router};
use statspump_kernel::local_bus::ListenerRegistry;
use statspump_kernel::semp::HttpSempTransport;
use statspump_kernel::StatsPump;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Ok if there is no .env
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match load_config().await {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load configuration: {}", e);
            std::process::exit(2);
        }
    };
    let settings = config.pump.clone();

    let transport = Arc::new(HttpSempTransport::new(settings.http_connect_timeout(), settings.http_read_timeout())?);
    let connector = Arc::new(MqttConnector::new(settings.mqtt_keep_alive()));
    let pump = match StatsPump::from_config(&config, &ListenerRegistry::with_builtins(), transport, connector) {
        Ok(pump) => pump,
        Err(e) if e.is_config() => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };
    pump.start().await?;

    let api_key = api_key_from_env();
    if api_key.is_none() {
        info!("STATSPUMP_API_KEY not set, only /health is served");
    }
    let app = build_router(pump.status_state(api_key));
    let addr: SocketAddr = settings.status_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Status API listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received");
        })
        .await?;

    pump.stop().await;
    Ok(())
}
