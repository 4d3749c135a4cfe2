use anyhow::Result;
use clap::Parser;
use meshcache::config::Config;
use meshcache::peers::MeshAddress;
use meshcache::proxy::{self, ProxyState};
use meshcache::telemetry::Activity;
use meshcache::transport::{MeshDriver, SimDriver, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(
    name = "meshcache",
    about = "Self-organizing mesh node that fronts a Nix binary cache"
)]
struct Cli {
    /// Path to the TOML config file. MESHCACHE_* env vars override it.
    #[arg(long, env = "MESHCACHE_CONFIG", default_value = "meshcache.toml")]
    config: PathBuf,

    /// Pin this node to the root role regardless of what it can see.
    #[arg(long)]
    root: bool,

    /// Override the configured HTTP port.
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshcache=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if cli.root {
        config.mesh.pin_root = true;
    }
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }
    config.validate()?;
    let config = Arc::new(config);

    // Locally administered unicast address for this process.
    let mut octets = rand::random::<[u8; 6]>();
    octets[0] = (octets[0] | 0x02) & 0xfe;
    let (driver, _handle) = SimDriver::new(MeshAddress(octets));

    let addr = driver.local_addr();
    tracing::info!(%addr, softap = %config.softap_ssid(addr), "node identity");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let activity = Activity::new();
    let transport = Transport::new(
        driver,
        config.clone(),
        activity.clone(),
        shutdown_rx.clone(),
    );
    if config.mesh.boot_mesh {
        transport.start();
    } else {
        tracing::info!("mesh disabled by config, serving local cache info only");
    }

    // Status heartbeat: surfaces what a badge would show on its LEDs.
    {
        let mut rx = activity.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snap = rx.borrow_and_update().clone();
                tracing::debug!(
                    role = ?snap.role,
                    layer = snap.layer,
                    connected = snap.connected,
                    peers = snap.peer_count,
                    avg_rtt_ms = ?snap.avg_rtt_ms,
                    "status"
                );
            }
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = ProxyState::new(transport.topology_handle(), config.clone(), activity)?;
    let app = proxy::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "cache proxy listening");

    let mut shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
