use std::sync::Arc;
use tracing::{error, info, warn};
use miolink::{BleTransport, Result, Session, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔋 miolink Battery Check Example");

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = SessionConfig::from_file(&path)?;
    info!("Looking for device {}", config.device_id);

    let transport = Arc::new(BleTransport::new().await?);
    let mut session = Session::new(config, transport);
    session
        .on_battery_level(|reading| match reading {
            Ok(level) => info!("✅ Battery Level: {}%", level),
            Err(e) => warn!("⚠️ Unreadable battery payload: {}", e),
        })
        .on_state_change(|from, to| info!("  {} -> {}", from, to));

    let handle = session.start().await?;

    // Ctrl-C requests a stop; the session still tears down before returning
    let mut changes = handle.state_changes();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted in state {}, stopping...", handle.state());
            handle.stop();
        }
        _ = changes.wait_for(|state| state.is_terminal()) => {}
    }

    let outcome = handle.wait().await;
    if let Err(e) = &outcome {
        error!("❌ Session failed: {}", e);
    }
    outcome
}
