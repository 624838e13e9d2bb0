use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Connection state of a device as seen by the core
///
/// `Disconnected` is both the state before the startup handshake and the state
/// after an explicit disconnect. `BrieflyGone` and `ExtendedGone` are set by an
/// external reconnection watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Handshake complete, device usable
    Ok,
    /// Transport blip, expected to come back
    BrieflyGone,
    /// Transport gone for a while
    ExtendedGone,
    /// Not (or no longer) connected
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::BrieflyGone => write!(f, "Briefly Gone"),
            Self::ExtendedGone => write!(f, "Extended Gone"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Device class picked by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Standard fitness machine (FTMS) trainer
    FitnessMachine,
    /// Standalone cycling power meter
    CyclingPower,
    /// Trainer driven through the vendor resistance protocol
    ProprietaryTrainer,
    /// Heart rate strap
    HeartRate,
}

impl DeviceClass {
    /// Human readable description of the device class
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::FitnessMachine => "FTMS Smart Trainer",
            Self::CyclingPower => "Bluetooth Powermeter",
            Self::ProprietaryTrainer => "Wahoo Kickr",
            Self::HeartRate => "Bluetooth HRM",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// What kinds of telemetry a device produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Produces power readings
    pub has_power: bool,
    /// Produces cadence readings
    pub has_cadence: bool,
    /// Produces heart rate readings
    pub has_hrm: bool,
}

/// Caller-owned bitmask describing what a device is currently used for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFlags(u32);

impl DeviceFlags {
    /// No usage recorded
    pub const NONE: Self = Self(0);
    /// Used as the controllable trainer
    pub const USED_AS_TRAINER: Self = Self(1 << 0);
    /// Used as a display-only power meter
    pub const USED_AS_POWERMETER: Self = Self(1 << 1);
    /// Used as the heart rate source
    pub const USED_AS_HRM: Self = Self(1 << 2);

    /// Build flags from raw bits; unknown bits are preserved
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every bit of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear every bit of `other`
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for DeviceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Kind of outbound control command, each with its own rate-limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Simulated grade
    Slope,
    /// Target power (erg mode)
    Erg,
    /// Target resistance
    Resistance,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slope => write!(f, "slope"),
            Self::Erg => write!(f, "erg"),
            Self::Resistance => write!(f, "resistance"),
        }
    }
}

/// Why a control command was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Same command kind was sent less than the minimum interval ago
    RateLimited,
    /// Slope update without an attached slope source
    NoSlopeSource,
    /// The device cannot be commanded at all
    NotControllable,
}

/// Result of a control command that did not fail
///
/// A skipped command is benign: the caller should simply try again on its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// The command was written to the device
    Sent,
    /// The command was not sent for a benign reason
    Skipped(SkipReason),
}

impl CommandOutcome {
    /// `true` when the device was updated
    #[must_use]
    pub const fn updated(self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Device information gathered during scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Device address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
    /// Service UUIDs seen in the advertisement
    pub services: Vec<Uuid>,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            address,
            rssi,
            services: Vec::new(),
        }
    }
}

/// Scan and connect parameters for [`crate::ble::BleManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
        }
    }
}

/// Link arbiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Pause before characteristic resolution and before the write on an uncached write
    pub settle_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
        }
    }
}

/// Timeouts for operations that wait on the peripheral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound on waiting for the zero-offset response
    pub zero_offset_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            zero_offset_timeout_ms: 5_000,
        }
    }
}

/// Command rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum time between two accepted commands of the same kind
    pub min_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
        }
    }
}

/// Resistance endpoints for the vendor resistance protocol
///
/// The level runs from 0 (full resistance) to 0x3fff (no resistance), so the
/// downhill value is numerically larger than the uphill value. Deserializing runs
/// the same checks as [`ResistanceCalibration::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredCalibration")]
pub struct ResistanceCalibration {
    /// Level sent at the steepest downhill
    pub downhill: u16,
    /// Level sent at the steepest uphill
    pub uphill: u16,
}

impl ResistanceCalibration {
    /// Highest level accepted for a calibration endpoint
    pub const MAX_LEVEL: u16 = 0x3fff;

    /// Validate a caller-supplied calibration
    ///
    /// # Errors
    ///
    /// Returns [`crate::TrainerError::InvalidParameters`] if either value exceeds
    /// [`Self::MAX_LEVEL`] or the downhill value is not above the uphill value.
    pub fn new(downhill: u16, uphill: u16) -> crate::Result<Self> {
        if downhill > Self::MAX_LEVEL || uphill > Self::MAX_LEVEL {
            return Err(crate::TrainerError::InvalidParameters(format!(
                "Calibration {downhill:#06x}/{uphill:#06x} exceeds {:#06x}",
                Self::MAX_LEVEL
            )));
        }
        if downhill <= uphill {
            return Err(crate::TrainerError::InvalidParameters(format!(
                "Downhill level {downhill:#06x} must be above uphill level {uphill:#06x}"
            )));
        }
        Ok(Self { downhill, uphill })
    }

    /// Use the stored values if they are valid, the defaults otherwise
    #[must_use]
    pub fn or_default(downhill: u16, uphill: u16) -> Self {
        Self::new(downhill, uphill).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct StoredCalibration {
    downhill: u16,
    uphill: u16,
}

impl TryFrom<StoredCalibration> for ResistanceCalibration {
    type Error = crate::TrainerError;

    fn try_from(stored: StoredCalibration) -> crate::Result<Self> {
        Self::new(stored.downhill, stored.uphill)
    }
}

impl Default for ResistanceCalibration {
    fn default() -> Self {
        Self {
            downhill: 0x3fff,
            uphill: 0x2000,
        }
    }
}

/// Everything a device needs besides its transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Link arbiter settings
    pub link: LinkConfig,
    /// Operation timeouts
    pub timeouts: TimeoutConfig,
    /// Command rate limiting
    pub rate_limit: RateLimitConfig,
    /// Vendor resistance endpoints
    pub calibration: ResistanceCalibration,
}
