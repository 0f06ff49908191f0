use std::sync::Arc;
use tracing::{error, info, warn};
use miolink::{
    BleTransport, NotificationRouter, ProfileKind, Result, Session, SessionConfig, SessionMode,
    SessionState, Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💓 miolink Heart Rate Stream Example");

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let mut config = SessionConfig::from_file(&path)?;
    config.mode = SessionMode::Streaming;
    config.profile = ProfileKind::Full;

    let transport = Arc::new(BleTransport::new().await?);
    let mut session = Session::new(config, transport)
        .with_router(NotificationRouter::with_standard_decoders());
    session
        .on_battery_level(|reading| match reading {
            Ok(level) => info!("🔋 Battery: {}%", level),
            Err(e) => warn!("⚠️ Unreadable battery payload: {}", e),
        })
        .on_telemetry(|event| match &event.telemetry {
            Ok(Telemetry::HeartRate(measurement)) => {
                info!("💓 {} bpm", measurement.bpm);
                if !measurement.rr_intervals.is_empty() {
                    info!("  RR: {:?} ms", measurement.rr_intervals_ms());
                }
            }
            Ok(Telemetry::BodySensorLocation(location)) => {
                info!("📍 Sensor location: {:?}", location);
            }
            Ok(other) => info!("📦 {}", other),
            Err(e) => warn!("⚠️ {}", e),
        });

    let handle = session.start().await?;

    let mut changes = handle.state_changes();
    if changes
        .wait_for(|state| *state == SessionState::Active || state.is_terminal())
        .await
        .is_ok()
    {
        info!("Streaming, press Ctrl-C to stop");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping...");
            handle.stop();
        }
        _ = changes.wait_for(|state| state.is_terminal()) => {}
    }

    match handle.wait().await {
        Ok(()) => {
            info!("✅ Session ended");
            Ok(())
        }
        Err(e) => {
            error!("❌ Session failed: {}", e);
            Err(e)
        }
    }
}
