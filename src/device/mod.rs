use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::{Result, TrainerError},
    link::{LinkArbiter, NotificationSubscription},
    telemetry::{
        CadenceRecipient, HrmRecipient, PowerRecipient, SlopeSource, TelemetryDistributor,
    },
    types::{
        Capabilities, CommandOutcome, ConnectionState, DeviceClass, DeviceConfig, DeviceFlags,
        ResistanceCalibration, SkipReason,
    },
};

mod cycling_power;
mod fitness_machine;
mod heart_rate;
mod proprietary;
/// Per-command-kind send throttle
pub mod rate_limit;

use cycling_power::CyclingPower;
use fitness_machine::FitnessMachine;
use heart_rate::HeartRate;
use proprietary::ProprietaryTrainer;
use rate_limit::RateLimiter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State every device variant shares
///
/// Notification callbacks only ever hold a `Weak` reference to this, so a device
/// that the application drops is not kept alive by its own subscriptions.
pub(crate) struct DeviceShared {
    id: String,
    name: String,
    class: DeviceClass,
    config: DeviceConfig,
    arbiter: Arc<LinkArbiter>,
    state: RwLock<ConnectionState>,
    user_wants_to_keep: AtomicBool,
    flags: AtomicU32,
    cadence_seen: AtomicBool,
    telemetry: TelemetryDistributor,
    rate_limiter: RateLimiter,
    subscriptions: Mutex<Vec<NotificationSubscription>>,
}

impl DeviceShared {
    /// Subscribe on behalf of the device; the subscription is cancelled on disconnect
    async fn subscribe<F>(&self, service: Uuid, characteristic: Uuid, on_value: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let subscription = self
            .arbiter
            .subscribe_notifications(service, characteristic, on_value)
            .await?;
        lock(&self.subscriptions).push(subscription);
        Ok(())
    }

    fn cancel_subscriptions(&self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.cancel();
        }
    }
}

/// Behavior selected at classification time
enum DeviceVariant {
    FitnessMachine(FitnessMachine),
    CyclingPower(CyclingPower),
    ProprietaryTrainer(ProprietaryTrainer),
    HeartRate(HeartRate),
}

impl DeviceVariant {
    fn for_class(class: DeviceClass, config: &DeviceConfig) -> Self {
        match class {
            DeviceClass::FitnessMachine => Self::FitnessMachine(FitnessMachine),
            DeviceClass::CyclingPower => Self::CyclingPower(CyclingPower),
            DeviceClass::ProprietaryTrainer => {
                let calibration = config.calibration;
                Self::ProprietaryTrainer(ProprietaryTrainer::new(
                    ResistanceCalibration::or_default(calibration.downhill, calibration.uphill),
                ))
            }
            DeviceClass::HeartRate => Self::HeartRate(HeartRate),
        }
    }

    async fn start(&self, shared: &Arc<DeviceShared>) -> Result<()> {
        match self {
            Self::FitnessMachine(v) => v.start(shared).await,
            Self::CyclingPower(v) => v.start(shared).await,
            Self::ProprietaryTrainer(v) => v.start(shared).await,
            Self::HeartRate(v) => v.start(shared).await,
        }
    }
}

/// A connected trainer, power meter or heart rate strap
///
/// Created by [`crate::Connector`] once the peripheral has been classified and its
/// startup handshake has completed. Telemetry is delivered to the recipients attached
/// with the `set_*_recipient` methods; control commands go out through the link's
/// write queue.
///
/// The `update_*` commands are meant to be called on every simulation tick. A call
/// that arrives too soon after the previous one of the same kind, or that the device
/// cannot act on, returns [`CommandOutcome::Skipped`] rather than an error.
pub struct Device {
    shared: Arc<DeviceShared>,
    variant: DeviceVariant,
}

impl Device {
    /// Build the device for `class` and run its startup sequence
    ///
    /// The arbiter must already be in the connection epoch of the peripheral's link.
    /// If any startup step fails, every subscription made so far is cancelled and the
    /// error is returned; no half-started device escapes.
    pub(crate) async fn start(
        class: DeviceClass,
        arbiter: Arc<LinkArbiter>,
        config: DeviceConfig,
    ) -> Result<Arc<Self>> {
        let transport = arbiter.transport().ok_or(TrainerError::Disconnected)?;
        let name = transport.name().unwrap_or_else(|| "Unknown".to_string());

        let shared = Arc::new(DeviceShared {
            id: transport.id(),
            name,
            class,
            rate_limiter: RateLimiter::new(&config.rate_limit),
            config,
            arbiter,
            state: RwLock::new(ConnectionState::Disconnected),
            user_wants_to_keep: AtomicBool::new(true),
            flags: AtomicU32::new(DeviceFlags::NONE.bits()),
            cadence_seen: AtomicBool::new(false),
            telemetry: TelemetryDistributor::new(),
            subscriptions: Mutex::new(Vec::new()),
        });
        let variant = DeviceVariant::for_class(class, &shared.config);

        info!("Starting {} '{}'", class, shared.name);
        if let Err(e) = variant.start(&shared).await {
            error!("Startup of '{}' failed: {}", shared.name, e);
            shared.cancel_subscriptions();
            return Err(e);
        }

        let device = Arc::new(Self { shared, variant });
        device.set_state(ConnectionState::Ok);
        info!("{} '{}' is ready", class, device.name());
        Ok(device)
    }

    /// Stable identifier of the peripheral
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.shared.id
    }

    /// Advertised name, or `"Unknown"`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Class the peripheral was classified as
    #[must_use]
    pub fn class(&self) -> DeviceClass {
        self.shared.class
    }

    /// Human readable device type
    #[must_use]
    pub fn device_type_description(&self) -> &'static str {
        self.shared.class.description()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Override the connection state
    ///
    /// Used by a connection watchdog to report [`ConnectionState::BrieflyGone`] and
    /// [`ConnectionState::ExtendedGone`].
    pub fn set_state(&self, state: ConnectionState) {
        *self
            .shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Whether the transport still reports the link as up
    pub async fn transport_connected(&self) -> bool {
        self.shared.arbiter.transport_connected().await
    }

    /// False once the application disconnected the device on purpose
    #[must_use]
    pub fn user_wants_to_keep(&self) -> bool {
        self.shared.user_wants_to_keep.load(Ordering::Acquire)
    }

    /// Telemetry this device produces
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        match self.variant {
            DeviceVariant::FitnessMachine(_) => Capabilities {
                has_power: true,
                has_cadence: self.shared.cadence_seen.load(Ordering::Acquire),
                has_hrm: false,
            },
            DeviceVariant::CyclingPower(_) | DeviceVariant::ProprietaryTrainer(_) => {
                Capabilities {
                    has_power: true,
                    has_cadence: false,
                    has_hrm: false,
                }
            }
            DeviceVariant::HeartRate(_) => Capabilities {
                has_power: false,
                has_cadence: false,
                has_hrm: true,
            },
        }
    }

    /// Roles the application assigned to this device
    #[must_use]
    pub fn device_flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits(self.shared.flags.load(Ordering::Acquire))
    }

    /// Replace the role flags
    pub fn set_device_flags(&self, flags: DeviceFlags) {
        self.shared.flags.store(flags.bits(), Ordering::Release);
    }

    /// Add a power recipient
    pub fn set_power_recipient(&self, recipient: Arc<dyn PowerRecipient>) {
        self.shared.telemetry.add_power_recipient(recipient);
    }

    /// Add a cadence recipient
    pub fn set_cadence_recipient(&self, recipient: Arc<dyn CadenceRecipient>) {
        self.shared.telemetry.add_cadence_recipient(recipient);
    }

    /// Add a heart rate recipient
    pub fn set_hrm_recipient(&self, recipient: Arc<dyn HrmRecipient>) {
        self.shared.telemetry.add_hrm_recipient(recipient);
    }

    /// Set the source consulted by [`Self::update_slope`]
    pub fn set_slope_source(&self, source: Arc<dyn SlopeSource>) {
        self.shared.telemetry.set_slope_source(source);
    }

    /// Send the slope source's current grade, scaled by `ftms_pct`
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write fails.
    pub async fn update_slope(&self, now_ms: u64, ftms_pct: f64) -> Result<CommandOutcome> {
        match &self.variant {
            DeviceVariant::FitnessMachine(v) => v.update_slope(&self.shared, now_ms, ftms_pct).await,
            DeviceVariant::ProprietaryTrainer(v) => {
                v.update_slope(&self.shared, now_ms, ftms_pct).await
            }
            DeviceVariant::CyclingPower(_) | DeviceVariant::HeartRate(_) => {
                Ok(CommandOutcome::Skipped(SkipReason::NotControllable))
            }
        }
    }

    /// Hold the rider at `watts`
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write fails.
    pub async fn update_erg(&self, now_ms: u64, watts: i16) -> Result<CommandOutcome> {
        match &self.variant {
            DeviceVariant::FitnessMachine(v) => v.update_erg(&self.shared, now_ms, watts).await,
            DeviceVariant::ProprietaryTrainer(v) => v.update_erg(&self.shared, now_ms, watts).await,
            DeviceVariant::CyclingPower(_) | DeviceVariant::HeartRate(_) => {
                Ok(CommandOutcome::Skipped(SkipReason::NotControllable))
            }
        }
    }

    /// Set resistance as a fraction of the trainer's range, 0.0 easiest to 1.0 hardest
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write fails.
    pub async fn update_resistance(&self, now_ms: u64, fraction: f64) -> Result<CommandOutcome> {
        match &self.variant {
            DeviceVariant::FitnessMachine(v) => {
                v.update_resistance(&self.shared, now_ms, fraction).await
            }
            DeviceVariant::ProprietaryTrainer(v) => {
                v.update_resistance(&self.shared, now_ms, fraction).await
            }
            DeviceVariant::CyclingPower(_) | DeviceVariant::HeartRate(_) => {
                Ok(CommandOutcome::Skipped(SkipReason::NotControllable))
            }
        }
    }

    /// Run the power meter's zero-offset calibration
    ///
    /// # Errors
    ///
    /// - [`TrainerError::CalibrationFailed`] if the meter reports failure; retrying may help
    /// - [`TrainerError::CalibrationUnknownResult`] for any other result code
    /// - [`TrainerError::Timeout`] if no answer arrives in time
    /// - [`TrainerError::Unsupported`] for trainers and heart rate straps
    /// - transport errors from subscribing or writing
    pub async fn zero_offset(&self) -> Result<()> {
        match &self.variant {
            DeviceVariant::CyclingPower(_) | DeviceVariant::ProprietaryTrainer(_) => {
                cycling_power::zero_offset(&self.shared).await
            }
            DeviceVariant::FitnessMachine(_) | DeviceVariant::HeartRate(_) => {
                Err(self.unsupported("zero offset"))
            }
        }
    }

    /// Resistance endpoints of a vendor-protocol trainer
    #[must_use]
    pub fn resistance_calibration(&self) -> Option<ResistanceCalibration> {
        match &self.variant {
            DeviceVariant::ProprietaryTrainer(v) => Some(v.calibration()),
            _ => None,
        }
    }

    /// Change the resistance endpoints of a vendor-protocol trainer
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Unsupported`] for any other device class, or
    /// [`TrainerError::InvalidParameters`] if the endpoints are out of range or the
    /// downhill level is not above the uphill level.
    pub fn set_resistance_calibration(&self, calibration: ResistanceCalibration) -> Result<()> {
        match &self.variant {
            DeviceVariant::ProprietaryTrainer(v) => {
                v.set_calibration(ResistanceCalibration::new(
                    calibration.downhill,
                    calibration.uphill,
                )?);
                Ok(())
            }
            _ => Err(self.unsupported("resistance calibration")),
        }
    }

    /// Tear the device down at the application's request
    ///
    /// Cancels every subscription, detaches all telemetry recipients, ends the
    /// connection epoch and disconnects the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport error if disconnecting fails; the device is
    /// [`ConnectionState::Disconnected`] either way.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from '{}'", self.name());

        self.shared.user_wants_to_keep.store(false, Ordering::Release);
        self.shared.cancel_subscriptions();
        self.shared.telemetry.detach_all();
        self.set_state(ConnectionState::Disconnected);

        let transport = self.shared.arbiter.transport();
        self.shared.arbiter.end_epoch();
        if let Some(transport) = transport {
            transport.disconnect().await?;
        }
        Ok(())
    }

    fn unsupported(&self, operation: &'static str) -> TrainerError {
        TrainerError::Unsupported {
            operation,
            device: self.device_type_description(),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("class", &self.shared.class)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
