use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Manager, Peripheral},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{Result, TrainerError},
    types::{DeviceInfo, ScanParams},
    CYCLING_POWER_SERVICE_UUID, FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_SERVICE_UUID,
    KICKR_SERVICE_UUID,
};

/// A characteristic resolved on the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

/// A value pushed by the peripheral on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that changed
    pub characteristic: Uuid,
    /// New value
    pub value: Vec<u8>,
}

/// Stream of notifications for every subscribed characteristic on a link
pub type NotificationStream = BoxStream<'static, Notification>;

/// A live, already paired GATT connection
///
/// This is the seam between the core and the Bluetooth stack: the btleplug
/// implementation is [`BtleTransport`], tests use an in-memory fake.
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Stable identifier of the physical device (its address)
    fn id(&self) -> String;

    /// Advertised name, if any
    fn name(&self) -> Option<String>;

    /// Whether the link is currently up
    async fn is_connected(&self) -> bool;

    /// UUIDs of the primary services the peripheral exposes
    async fn services(&self) -> Result<Vec<Uuid>>;

    /// Look up a characteristic within a service
    async fn resolve_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle>;

    /// Write a value to a resolved characteristic
    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()>;

    /// Enable notification delivery for a resolved characteristic
    async fn start_notifications(&self, handle: &CharacteristicHandle) -> Result<()>;

    /// Stream of notifications for all subscribed characteristics
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Tear down the link
    async fn disconnect(&self) -> Result<()>;
}

/// [`GattTransport`] backed by a btleplug peripheral
pub struct BtleTransport {
    peripheral: Peripheral,
    name: Option<String>,
    resolved: Mutex<HashMap<CharacteristicHandle, Characteristic>>,
}

impl BtleTransport {
    /// Wrap a connected peripheral whose services have been discovered
    #[must_use]
    pub fn new(peripheral: Peripheral, name: Option<String>) -> Self {
        Self {
            peripheral,
            name,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    async fn characteristic(&self, handle: &CharacteristicHandle) -> Result<Characteristic> {
        if let Some(characteristic) = self.resolved.lock().await.get(handle) {
            return Ok(characteristic.clone());
        }
        let characteristic =
            find_characteristic(&self.peripheral, handle.service, handle.characteristic)?;
        self.resolved
            .lock()
            .await
            .insert(*handle, characteristic.clone());
        Ok(characteristic)
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic> {
    let services = peripheral.services();
    let found_service = services
        .iter()
        .find(|s| s.uuid == service)
        .ok_or(TrainerError::ServiceNotFound { service })?;

    found_service
        .characteristics
        .iter()
        .find(|c| c.uuid == characteristic)
        .cloned()
        .ok_or(TrainerError::CharacteristicNotFound {
            service,
            characteristic,
        })
}

#[async_trait]
impl GattTransport for BtleTransport {
    fn id(&self) -> String {
        self.peripheral.address().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .peripheral
            .services()
            .iter()
            .filter(|s| s.primary)
            .map(|s| s.uuid)
            .collect())
    }

    async fn resolve_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        let handle = CharacteristicHandle {
            service,
            characteristic,
        };
        self.characteristic(&handle).await?;
        Ok(handle)
    }

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(handle).await?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {:02X?} to {}", data, handle.characteristic);

        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| TrainerError::WriteFailed {
                characteristic: handle.characteristic,
                reason: e.to_string(),
            })
    }

    async fn start_notifications(&self, handle: &CharacteristicHandle) -> Result<()> {
        let characteristic = self.characteristic(handle).await?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Services a supported peripheral advertises
const SUPPORTED_SERVICES: [Uuid; 4] = [
    FITNESS_MACHINE_SERVICE_UUID,
    KICKR_SERVICE_UUID,
    CYCLING_POWER_SERVICE_UUID,
    HEART_RATE_SERVICE_UUID,
];

/// BLE manager for finding and connecting fitness peripherals
pub struct BleManager {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if the Bluetooth adapter cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Scan for trainers, power meters and heart rate straps
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`TrainerError::Ble`] for other Bluetooth-related errors.
    pub async fn scan_for_devices(&self, params: &ScanParams) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for fitness devices...");

        let adapters = self.manager.adapters().await?;
        let central = adapters.first().ok_or(TrainerError::DeviceNotFound)?;

        let scan_filter = ScanFilter {
            services: SUPPORTED_SERVICES.to_vec(),
        };
        central.start_scan(scan_filter).await?;

        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;

        central.stop_scan().await?;

        let peripherals = central.peripherals().await?;
        let mut devices = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !properties
                .services
                .iter()
                .any(|s| SUPPORTED_SERVICES.contains(s))
            {
                continue;
            }

            let mut device_info = DeviceInfo::new(
                properties
                    .local_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                properties.address.to_string(),
                properties.rssi.unwrap_or(0),
            );
            device_info.services.clone_from(&properties.services);

            info!("Found fitness device: {}", device_info.name);
            self.peripherals
                .lock()
                .await
                .insert(device_info.address.clone(), peripheral);
            devices.push(device_info);
        }

        info!("Scan completed. Found {} fitness device(s)", devices.len());
        Ok(devices)
    }

    /// Connect to a device found by [`Self::scan_for_devices`]
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if the device was not seen during a scan,
    /// [`TrainerError::Timeout`] if connection times out,
    /// or [`TrainerError::ConnectionFailed`] if connection fails.
    pub async fn connect(
        &self,
        device_info: &DeviceInfo,
        params: &ScanParams,
    ) -> Result<Arc<BtleTransport>> {
        info!("Connecting to device: {}", device_info.name);

        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&device_info.address)
            .cloned()
            .ok_or(TrainerError::DeviceNotFound)?;

        timeout(
            Duration::from_millis(params.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| TrainerError::Timeout {
            timeout_ms: params.connect_timeout_ms,
        })?
        .map_err(|e| TrainerError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        info!("Successfully connected to {}", device_info.name);
        Ok(Arc::new(BtleTransport::new(
            peripheral,
            Some(device_info.name.clone()),
        )))
    }
}
