#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # miolink
//!
//! A Rust library for pairing with Mio heart-rate wearables over Bluetooth Low Energy.
//!
//! A [`Session`] finds one configured wearable, connects, resolves the battery service
//! (and optionally heart rate and the Mio sport service), reads the battery level once
//! and then streams notifications to registered observers until it is stopped or the
//! link drops. The device's command protocol is modelled by [`CommandFrame`] and the
//! [`CommandCodec`] implementations, with validation applied before anything is
//! encoded.
//!
//! ## Layout
//!
//! - [`gatt`]: the closed table of service and characteristic identifiers
//! - [`protocol`]: command groups, frames and the user settings codec
//! - [`validate`]: the validation capability and the default user settings rules
//! - [`machine`]: the session lifecycle as a pure state machine
//! - [`session`]: the async driver and [`SessionHandle`]
//! - [`router`]: per-characteristic decoders and observers
//! - [`transport`]: the radio capability a session consumes, with [`BleTransport`]
//!   and [`MockTransport`] implementations
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use miolink::{BleTransport, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::from_file("config.json")?;
//!     let transport = Arc::new(BleTransport::new().await?);
//!
//!     let mut session = Session::new(config, transport);
//!     session.on_battery_level(|level| match level {
//!         Ok(level) => println!("Battery: {level}%"),
//!         Err(e) => eprintln!("Bad battery payload: {e}"),
//!     });
//!
//!     // The default mode reads the battery once, then disconnects.
//!     session.start().await?.wait().await?;
//!     Ok(())
//! }
//! ```

/// btleplug-backed transport
pub mod ble;
/// Session configuration
pub mod config;
/// Error types and handling
pub mod error;
pub mod gatt;
pub mod machine;
pub mod mock;
/// Command frames and codecs
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;
/// Shared value types
pub mod types;
pub mod validate;

pub use ble::BleTransport;
pub use config::{Profile, ProfileKind, SessionConfig, SessionMode, TimeoutConfig};
pub use error::{DecodeError, MioError, Result};
pub use gatt::{CharacteristicKind, ServiceKind};
pub use mock::{MockPeripheral, MockTransport};
pub use protocol::{CommandCodec, CommandFrame, CommandType, RunCommand, UserInfo, UserInfoSet};
pub use router::{NotificationRouter, Telemetry, TelemetryEvent};
pub use session::{Session, SessionHandle};
pub use transport::{Transport, TransportEvent};
pub use types::{Advertisement, PeripheralId, PowerState, SessionState};
pub use validate::{UserInfoRules, Validate, ValidationError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
