//! In-memory [`GattTransport`] for tests.

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use uuid::Uuid;

use crate::{
    ble::{CharacteristicHandle, GattTransport, Notification, NotificationStream},
    device::Device,
    error::{Result, TrainerError},
    link::LinkArbiter,
    types::{DeviceClass, DeviceConfig, LinkConfig},
    CYCLING_POWER_CONTROL_POINT_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    CYCLING_POWER_SERVICE_UUID, FITNESS_MACHINE_SERVICE_UUID, FTMS_CONTROL_POINT_UUID,
    FTMS_STATUS_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
    INDOOR_BIKE_DATA_UUID, KICKR_SERVICE_UUID, KICKR_WRITE_CHAR_UUID,
};

type Responder = Box<dyn Fn(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start a device of `class` on a fresh link to `transport`
pub async fn start_device(
    transport: Arc<FakeTransport>,
    class: DeviceClass,
) -> Result<Arc<Device>> {
    let arbiter = Arc::new(LinkArbiter::new(LinkConfig { settle_delay_ms: 0 }));
    arbiter.begin_epoch(transport);
    Device::start(class, arbiter, DeviceConfig::default()).await
}

/// Let spawned tasks run until the notifications they were handed are delivered
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub struct FakeTransport {
    id: String,
    name: Option<String>,
    services: Vec<(Uuid, Vec<Uuid>)>,
    connected: AtomicBool,
    write_delay: Duration,
    in_flight: AtomicBool,
    overlap: AtomicBool,
    failures_left: AtomicUsize,
    resolves: AtomicUsize,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    enabled: Mutex<HashMap<Uuid, usize>>,
    sink: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    pending: Mutex<Vec<Notification>>,
    responder: Mutex<Option<Responder>>,
}

impl FakeTransport {
    pub fn new(name: &str, services: Vec<(Uuid, Vec<Uuid>)>) -> Self {
        Self {
            id: format!("fake:{name}"),
            name: Some(name.to_string()),
            services,
            connected: AtomicBool::new(true),
            write_delay: Duration::ZERO,
            in_flight: AtomicBool::new(false),
            overlap: AtomicBool::new(false),
            failures_left: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            enabled: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    /// FTMS trainer that also exposes a Cycling Power Service
    pub fn trainer() -> Self {
        Self::new(
            "Smart Trainer",
            vec![
                (
                    FITNESS_MACHINE_SERVICE_UUID,
                    vec![INDOOR_BIKE_DATA_UUID, FTMS_STATUS_UUID, FTMS_CONTROL_POINT_UUID],
                ),
                (
                    CYCLING_POWER_SERVICE_UUID,
                    vec![CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_CONTROL_POINT_UUID],
                ),
            ],
        )
    }

    pub fn kickr() -> Self {
        Self::new(
            "KICKR CORE",
            vec![
                (
                    CYCLING_POWER_SERVICE_UUID,
                    vec![
                        CYCLING_POWER_MEASUREMENT_UUID,
                        CYCLING_POWER_CONTROL_POINT_UUID,
                        KICKR_WRITE_CHAR_UUID,
                    ],
                ),
                (KICKR_SERVICE_UUID, vec![]),
            ],
        )
    }

    pub fn power_meter() -> Self {
        Self::new(
            "Crank PM",
            vec![(
                CYCLING_POWER_SERVICE_UUID,
                vec![CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_CONTROL_POINT_UUID],
            )],
        )
    }

    pub fn heart_rate() -> Self {
        Self::new(
            "HR Strap",
            vec![(HEART_RATE_SERVICE_UUID, vec![HEART_RATE_MEASUREMENT_UUID])],
        )
    }

    pub fn unnamed(mut self) -> Self {
        self.name = None;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Answer writes with a notification
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected_now(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        lock(&self.writes)
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn notification_enables(&self, characteristic: Uuid) -> usize {
        lock(&self.enabled).get(&characteristic).copied().unwrap_or(0)
    }

    /// Push a notification as if the peripheral had sent it
    pub fn emit(&self, characteristic: Uuid, value: Vec<u8>) {
        let notification = Notification {
            characteristic,
            value,
        };
        let sink = lock(&self.sink);
        match sink.as_ref() {
            Some(tx) if !tx.is_closed() => {
                let _ = tx.unbounded_send(notification);
            }
            _ => lock(&self.pending).push(notification),
        }
    }
}

#[async_trait]
impl GattTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        Ok(self.services.iter().map(|(s, _)| *s).collect())
    }

    async fn resolve_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let (_, characteristics) = self
            .services
            .iter()
            .find(|(s, _)| *s == service)
            .ok_or(TrainerError::ServiceNotFound { service })?;
        if characteristics.contains(&characteristic) {
            Ok(CharacteristicHandle {
                service,
                characteristic,
            })
        } else {
            Err(TrainerError::CharacteristicNotFound {
                service,
                characteristic,
            })
        }
    }

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.in_flight.store(false, Ordering::SeqCst);

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TrainerError::WriteFailed {
                characteristic: handle.characteristic,
                reason: "injected failure".to_string(),
            });
        }

        lock(&self.writes).push((handle.characteristic, data.to_vec()));
        let responses = lock(&self.responder)
            .as_ref()
            .map(|respond| respond(handle.characteristic, data))
            .unwrap_or_default();
        for (characteristic, value) in responses {
            self.emit(characteristic, value);
        }
        Ok(())
    }

    async fn start_notifications(&self, handle: &CharacteristicHandle) -> Result<()> {
        *lock(&self.enabled).entry(handle.characteristic).or_insert(0) += 1;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded();
        for notification in lock(&self.pending).drain(..) {
            let _ = tx.unbounded_send(notification);
        }
        *lock(&self.sink) = Some(tx);
        Ok(rx.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
