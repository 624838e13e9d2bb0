//! Telemetry listeners.
//!
//! Devices decode measurements inside notification callbacks and hand them to the
//! recipients registered here. Recipients are synchronous and are called in
//! registration order; adding one never replaces another.

use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

/// Consumer of instantaneous power readings
pub trait PowerRecipient: Send + Sync {
    /// Called with the receive time in ms since the Unix epoch and the power in watts
    fn notify_power(&self, tm_ms: u64, watts: i16);
}

/// Consumer of cadence readings
pub trait CadenceRecipient: Send + Sync {
    /// Called with the receive time in ms since the Unix epoch and cadence in rpm
    fn notify_cadence(&self, tm_ms: u64, rpm: f64);
}

/// Consumer of heart rate readings
pub trait HrmRecipient: Send + Sync {
    /// Called with the receive time in ms since the Unix epoch and heart rate in bpm
    fn notify_hrm(&self, tm_ms: u64, bpm: u16);
}

/// Supplier of the grade the rider is currently on
pub trait SlopeSource: Send + Sync {
    /// Current grade in percent, positive uphill
    fn last_slope_in_whole_percent(&self) -> f64;
}

impl<F> PowerRecipient for F
where
    F: Fn(u64, i16) + Send + Sync,
{
    fn notify_power(&self, tm_ms: u64, watts: i16) {
        self(tm_ms, watts);
    }
}

impl<F> CadenceRecipient for F
where
    F: Fn(u64, f64) + Send + Sync,
{
    fn notify_cadence(&self, tm_ms: u64, rpm: f64) {
        self(tm_ms, rpm);
    }
}

impl<F> HrmRecipient for F
where
    F: Fn(u64, u16) + Send + Sync,
{
    fn notify_hrm(&self, tm_ms: u64, bpm: u16) {
        self(tm_ms, bpm);
    }
}

/// Wall clock in milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Recipients attached to one device
#[derive(Default)]
pub struct TelemetryDistributor {
    power: RwLock<Vec<Arc<dyn PowerRecipient>>>,
    cadence: RwLock<Vec<Arc<dyn CadenceRecipient>>>,
    hrm: RwLock<Vec<Arc<dyn HrmRecipient>>>,
    slope_source: Mutex<Option<Arc<dyn SlopeSource>>>,
}

impl TelemetryDistributor {
    /// Create a distributor with no recipients
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a power recipient
    pub fn add_power_recipient(&self, recipient: Arc<dyn PowerRecipient>) {
        self.power
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(recipient);
    }

    /// Add a cadence recipient
    pub fn add_cadence_recipient(&self, recipient: Arc<dyn CadenceRecipient>) {
        self.cadence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(recipient);
    }

    /// Add a heart rate recipient
    pub fn add_hrm_recipient(&self, recipient: Arc<dyn HrmRecipient>) {
        self.hrm
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(recipient);
    }

    /// Replace the slope source
    pub fn set_slope_source(&self, source: Arc<dyn SlopeSource>) {
        *self
            .slope_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    /// Current slope source, if one is set
    #[must_use]
    pub fn slope_source(&self) -> Option<Arc<dyn SlopeSource>> {
        self.slope_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forward a power reading to every power recipient
    pub fn publish_power(&self, tm_ms: u64, watts: i16) {
        let recipients = self
            .power
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for recipient in recipients {
            recipient.notify_power(tm_ms, watts);
        }
    }

    /// Forward a cadence reading to every cadence recipient
    pub fn publish_cadence(&self, tm_ms: u64, rpm: f64) {
        let recipients = self
            .cadence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for recipient in recipients {
            recipient.notify_cadence(tm_ms, rpm);
        }
    }

    /// Forward a heart rate reading to every heart rate recipient
    pub fn publish_hrm(&self, tm_ms: u64, bpm: u16) {
        let recipients = self
            .hrm
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for recipient in recipients {
            recipient.notify_hrm(tm_ms, bpm);
        }
    }

    /// Number of recipients of each kind: power, cadence, heart rate
    #[must_use]
    pub fn recipient_counts(&self) -> (usize, usize, usize) {
        (
            self.power.read().unwrap_or_else(PoisonError::into_inner).len(),
            self.cadence.read().unwrap_or_else(PoisonError::into_inner).len(),
            self.hrm.read().unwrap_or_else(PoisonError::into_inner).len(),
        )
    }

    /// Drop every recipient and the slope source
    pub fn detach_all(&self) {
        self.power.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.cadence.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.hrm.write().unwrap_or_else(PoisonError::into_inner).clear();
        *self
            .slope_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for TelemetryDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (power, cadence, hrm) = self.recipient_counts();
        f.debug_struct("TelemetryDistributor")
            .field("power", &power)
            .field("cadence", &cadence)
            .field("hrm", &hrm)
            .field("has_slope_source", &self.slope_source().is_some())
            .finish()
    }
}
