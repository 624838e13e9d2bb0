#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Trainerlink
//!
//! A Rust library for talking to indoor cycling peripherals via Bluetooth Low Energy:
//! smart trainers, standalone power meters and heart rate straps.
//!
//! The library takes a live, already paired GATT connection, works out what kind of
//! device is on the other end, decodes its telemetry and sends control commands back.
//!
//! ## Supported Devices
//!
//! - **FTMS trainers**: Fitness Machine Service; erg, simulated grade and resistance
//! - **Wahoo Kickr**: vendor resistance protocol on top of the Cycling Power Service
//! - **Power meters**: Cycling Power Service, including zero-offset calibration
//! - **Heart rate straps**: Heart Rate Service
//!
//! ## Architecture
//!
//! - [`protocol`]: pure encode/decode functions for each wire format
//! - [`link`]: the [`LinkArbiter`], which serializes every write against one physical
//!   link and fans notifications out to subscribers
//! - [`device`]: the [`Device`] state machine for each device class
//! - [`telemetry`]: listener registry for power, cadence and heart rate
//! - [`connector`]: classifies a fresh connection and runs the startup handshake
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use trainerlink::{BleManager, Connector, DeviceConfig, ScanParams, TrainerRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ble = BleManager::new().await?;
//!     let params = ScanParams::default();
//!     let found = ble.scan_for_devices(&params).await?;
//!     let transport = ble.connect(&found[0], &params).await?;
//!
//!     let connector = Connector::new(Arc::new(TrainerRegistry::new()), DeviceConfig::default());
//!     let trainer = connector.connect_powermeter(transport).await?;
//!
//!     trainer.set_power_recipient(Arc::new(|_tm_ms: u64, watts: i16| {
//!         println!("{watts} W");
//!     }));
//!     trainer.update_erg(1_000, 200).await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport and scanning
pub mod ble;
/// Classification and startup of freshly connected peripherals
pub mod connector;
/// Per-peripheral device state machine
pub mod device;
/// Error types and handling
pub mod error;
/// Serialized write queue and notification fan-out for one physical link
pub mod link;
/// Wire codecs for every supported protocol
pub mod protocol;
/// Lookup of the active vendor-protocol trainer
pub mod registry;
/// Telemetry listener registry
pub mod telemetry;
/// Type definitions and configuration
pub mod types;

#[cfg(test)]
mod fake;

// Re-export the main types for convenient usage
pub use ble::{BleManager, BtleTransport, GattTransport};
pub use connector::Connector;
pub use device::Device;
pub use error::{Result, TrainerError};
pub use link::{LinkArbiter, LinkStats, NotificationSubscription, PendingWrite};
pub use registry::TrainerRegistry;
pub use telemetry::{CadenceRecipient, HrmRecipient, PowerRecipient, SlopeSource};
pub use types::{
    Capabilities, CommandKind, CommandOutcome, ConnectionState, DeviceClass, DeviceConfig,
    DeviceFlags, DeviceInfo, LinkConfig, RateLimitConfig, ResistanceCalibration, ScanParams,
    SkipReason, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service (0x1826)
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Status characteristic (0x2ADA)
pub const FTMS_STATUS_UUID: Uuid = Uuid::from_u128(0x0000_2ada_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (0x2AD9)
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Service (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement characteristic (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Control Point characteristic (0x2A66)
pub const CYCLING_POWER_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a66_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Wahoo Kickr vendor service, advertised next to the Cycling Power Service
pub const KICKR_SERVICE_UUID: Uuid = Uuid::from_u128(0xa026_ee01_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Wahoo Kickr vendor write characteristic
///
/// Lives inside the Cycling Power Service, not the vendor service.
pub const KICKR_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0xa026_e005_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// 4iiii display service, used only while pairing a head unit display
pub const DISPLAY_SERVICE_UUID: Uuid = Uuid::from_u128(0x9891_eaf5_5456_11eb_ae93_0242_ac13_0002);

/// 4iiii display control point characteristic
pub const DISPLAY_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x2ebe_05f1_20f5_ec8e_374e_fc19_0000_3c16);
