use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    ble::GattTransport,
    device::Device,
    error::{Result, TrainerError},
    link::LinkArbiter,
    registry::TrainerRegistry,
    types::{DeviceClass, DeviceConfig},
    CYCLING_POWER_SERVICE_UUID, FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_SERVICE_UUID,
    KICKR_SERVICE_UUID,
};

/// Pick the device class for a trainer or power meter from its services
///
/// A standard fitness machine wins over the vendor protocol, which wins over a plain
/// cycling power meter. Many trainers advertise several of these at once.
///
/// # Errors
///
/// Returns [`TrainerError::UnrecognizedDevice`] if none of them is present.
pub fn classify_powermeter(services: &[Uuid]) -> Result<DeviceClass> {
    if services.contains(&FITNESS_MACHINE_SERVICE_UUID) {
        Ok(DeviceClass::FitnessMachine)
    } else if services.contains(&KICKR_SERVICE_UUID) {
        Ok(DeviceClass::ProprietaryTrainer)
    } else if services.contains(&CYCLING_POWER_SERVICE_UUID) {
        Ok(DeviceClass::CyclingPower)
    } else {
        Err(TrainerError::UnrecognizedDevice)
    }
}

/// Pick the device class for a heart rate strap from its services
///
/// # Errors
///
/// Returns [`TrainerError::UnrecognizedDevice`] if the heart rate service is missing.
pub fn classify_hrm(services: &[Uuid]) -> Result<DeviceClass> {
    if services.contains(&HEART_RATE_SERVICE_UUID) {
        Ok(DeviceClass::HeartRate)
    } else {
        Err(TrainerError::UnrecognizedDevice)
    }
}

/// Turns freshly paired links into started [`Device`]s
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use trainerlink::{BleManager, Connector, DeviceConfig, ScanParams, TrainerRegistry};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let ble = BleManager::new().await?;
///     let params = ScanParams::default();
///     let found = ble.scan_for_devices(&params).await?;
///
///     let registry = Arc::new(TrainerRegistry::new());
///     let connector = Connector::new(Arc::clone(&registry), DeviceConfig::default());
///     let strap = connector.connect_hrm(ble.connect(&found[0], &params).await?).await?;
///     println!("{} ({})", strap.name(), strap.device_type_description());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Connector {
    registry: Arc<TrainerRegistry>,
    config: DeviceConfig,
}

impl Connector {
    /// Create a connector that registers vendor-protocol trainers in `registry`
    #[must_use]
    pub const fn new(registry: Arc<TrainerRegistry>, config: DeviceConfig) -> Self {
        Self { registry, config }
    }

    /// Registry this connector reports vendor-protocol trainers to
    #[must_use]
    pub const fn registry(&self) -> &Arc<TrainerRegistry> {
        &self.registry
    }

    /// Classify and start a trainer or power meter
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::UnrecognizedDevice`] if no supported service is
    /// advertised, or the transport error of the first startup step that fails.
    pub async fn connect_powermeter(
        &self,
        transport: Arc<dyn GattTransport>,
    ) -> Result<Arc<Device>> {
        let device = self.connect(transport, classify_powermeter).await?;
        if device.class() == DeviceClass::ProprietaryTrainer {
            self.registry.set_active(&device);
        }
        Ok(device)
    }

    /// Classify and start a heart rate strap
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::UnrecognizedDevice`] if the heart rate service is not
    /// advertised, or the transport error of the subscription.
    pub async fn connect_hrm(&self, transport: Arc<dyn GattTransport>) -> Result<Arc<Device>> {
        self.connect(transport, classify_hrm).await
    }

    async fn connect(
        &self,
        transport: Arc<dyn GattTransport>,
        classify: fn(&[Uuid]) -> Result<DeviceClass>,
    ) -> Result<Arc<Device>> {
        let id = transport.id();
        let arbiter = Arc::new(LinkArbiter::new(self.config.link.clone()));
        arbiter.begin_epoch(Arc::clone(&transport));

        let services = transport.services().await?;
        let class = match classify(&services) {
            Ok(class) => class,
            Err(e) => {
                error!("{} advertises no supported service: {:?}", id, services);
                arbiter.end_epoch();
                return Err(e);
            }
        };
        info!("Classified {} as {}", id, class);

        let started = Device::start(class, Arc::clone(&arbiter), self.config.clone()).await;
        if started.is_err() {
            arbiter.end_epoch();
        }
        started
    }
}
