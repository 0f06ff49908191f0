use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{error, info};
use miolink::{
    protocol::encode_user_info, BleTransport, MioError, ProfileKind, Result, Session,
    SessionConfig, SessionMode, SessionState, UserInfo, UserInfoRules,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("⚙️ miolink User Settings Example");

    let info = UserInfo {
        unit_type: 1,
        birthday: NaiveDate::from_ymd_opt(1985, 6, 15)
            .ok_or_else(|| MioError::Config("invalid birthday".to_string()))?,
        body_weight: 75,
        body_height: 180,
        resting_hr: 58,
        max_hr: 186,
        ..UserInfo::default()
    };

    // Rejected records never reach the device
    let invalid = UserInfo {
        max_hr: 240,
        ..info.clone()
    };
    if let Err(e) = encode_user_info(&invalid, &UserInfoRules) {
        info!("Rejected as expected: {}", e);
    }

    info!("Frame: {:02X?}", encode_user_info(&info, &UserInfoRules)?);

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let mut config = SessionConfig::from_file(&path)?;
    config.mode = SessionMode::Streaming;
    config.profile = ProfileKind::Full;

    let transport = Arc::new(BleTransport::new().await?);
    let handle = Session::new(config, transport).start().await?;

    let reached = handle
        .state_changes()
        .wait_for(|state| *state == SessionState::Active || state.is_terminal())
        .await
        .map(|state| *state);

    if matches!(reached, Ok(SessionState::Active)) {
        match handle.send_user_info(&info, &UserInfoRules).await {
            Ok(()) => info!("✅ User settings sent"),
            Err(e) => error!("❌ Failed to send user settings: {}", e),
        }
        handle.stop();
    }

    handle.wait().await
}
