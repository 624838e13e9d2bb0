//! Write arbitration and notification fan-out for one physical link.
//!
//! A GATT link can only carry one outstanding operation. Several parts of the
//! crate want to write at the same time (the simulation tick pushing a new grade, a
//! notification handler re-requesting control), so every write goes through a single
//! queue drained by one worker task per connection epoch. Callers never coordinate
//! among themselves.
//!
//! Notifications are not queued: one dispatcher task per epoch reads the transport's
//! notification stream and hands each value to the callbacks registered for its
//! characteristic.

use bytes::Bytes;
use futures::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ble::{CharacteristicHandle, GattTransport, NotificationStream},
    error::{Result, TrainerError},
    types::LinkConfig,
    FITNESS_MACHINE_SERVICE_UUID,
};

type Listener = Arc<dyn Fn(&[u8]) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters for writes that went through the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Writes handed to the queue
    pub submitted: u64,
    /// Writes the peripheral accepted
    pub succeeded: u64,
    /// Writes that failed, including ones nobody waited for
    pub failed: u64,
}

#[derive(Default)]
struct StatCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

struct WriteJob {
    service: Uuid,
    characteristic: Uuid,
    payload: Bytes,
    reply: oneshot::Sender<Result<()>>,
}

/// State the write worker needs; shared between the worker and its epoch
struct EpochLink {
    transport: Arc<dyn GattTransport>,
    cache: Mutex<HashMap<(Uuid, Uuid), CharacteristicHandle>>,
    settle_delay: Duration,
    stats: Arc<StatCounters>,
}

impl EpochLink {
    async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    async fn perform_write(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        let cacheable = service == FITNESS_MACHINE_SERVICE_UUID;
        let key = (service, characteristic);

        if cacheable {
            let cached = lock(&self.cache).get(&key).copied();
            if let Some(handle) = cached {
                return self.transport.write(&handle, payload).await;
            }
        }

        // cold path: give the peripheral time after service discovery
        self.settle().await;
        let handle = self
            .transport
            .resolve_characteristic(service, characteristic)
            .await?;
        if cacheable {
            lock(&self.cache).insert(key, handle);
        }
        self.settle().await;
        self.transport.write(&handle, payload).await
    }
}

async fn run_write_queue(link: Arc<EpochLink>, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(job) = jobs.recv().await {
        let result = link
            .perform_write(job.service, job.characteristic, &job.payload)
            .await;
        match &result {
            Ok(()) => {
                link.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                link.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Queued write to {} failed: {}", job.characteristic, e);
            }
        }
        // the submitter may have stopped waiting
        let _ = job.reply.send(result);
    }
    debug!("Write queue drained");
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    by_characteristic: HashMap<Uuid, Vec<(u64, Listener)>>,
}

impl ListenerRegistry {
    fn register(&mut self, characteristic: Uuid, listener: Listener) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_characteristic
            .entry(characteristic)
            .or_default()
            .push((id, listener));
        id
    }

    fn remove(&mut self, characteristic: Uuid, id: u64) {
        if let Some(listeners) = self.by_characteristic.get_mut(&characteristic) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    fn targets(&self, characteristic: Uuid) -> Vec<Listener> {
        self.by_characteristic
            .get(&characteristic)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    fn count(&self, characteristic: Uuid) -> usize {
        self.by_characteristic
            .get(&characteristic)
            .map_or(0, Vec::len)
    }
}

async fn dispatch_notifications(
    mut stream: NotificationStream,
    listeners: Weak<Mutex<ListenerRegistry>>,
) {
    while let Some(notification) = stream.next().await {
        let Some(registry) = listeners.upgrade() else {
            break;
        };
        let targets = lock(&registry).targets(notification.characteristic);
        drop(registry);

        for target in targets {
            target(&notification.value);
        }
    }
    debug!("Notification stream ended");
}

/// One physical connection instance
struct Epoch {
    number: u64,
    link: Arc<EpochLink>,
    queue: mpsc::UnboundedSender<WriteJob>,
    listeners: Arc<Mutex<ListenerRegistry>>,
    enabled: AsyncMutex<HashSet<CharacteristicHandle>>,
    dispatcher: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Epoch {
    async fn ensure_dispatcher(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_none() {
            let stream = self.link.transport.notifications().await?;
            *dispatcher = Some(tokio::spawn(dispatch_notifications(
                stream,
                Arc::downgrade(&self.listeners),
            )));
        }
        Ok(())
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

/// Completion of a write handed to [`LinkArbiter::submit`]
///
/// The write is already queued when this value exists; dropping it does not cancel
/// the write, it only discards the outcome.
#[must_use = "dropping a PendingWrite discards the write outcome"]
pub struct PendingWrite {
    reply: oneshot::Receiver<Result<()>>,
}

impl PendingWrite {
    /// Wait for the queued write to finish
    ///
    /// # Errors
    ///
    /// Returns the transport error of the write, or [`TrainerError::Disconnected`] if
    /// the link went away before the write ran.
    pub async fn outcome(self) -> Result<()> {
        self.reply
            .await
            .unwrap_or(Err(TrainerError::Disconnected))
    }
}

/// Handle to a single notification callback
///
/// [`Self::cancel`] removes only this callback. Notifications stay enabled on the
/// peripheral for any other callback on the same characteristic. Cancelling twice, or
/// after the link is gone, does nothing. Dropping the handle leaves the callback in
/// place.
pub struct NotificationSubscription {
    listeners: Weak<Mutex<ListenerRegistry>>,
    characteristic: Uuid,
    id: u64,
    cancelled: AtomicBool,
}

impl NotificationSubscription {
    /// Characteristic this subscription listens to
    #[must_use]
    pub const fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Deregister the callback
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.listeners.upgrade() {
            lock(&registry).remove(self.characteristic, self.id);
        }
    }
}

impl std::fmt::Debug for NotificationSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSubscription")
            .field("characteristic", &self.characteristic)
            .field("id", &self.id)
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .finish()
    }
}

/// Owner of the single physical link to a peripheral
///
/// All writes against the link are serialized through one queue, in submission
/// order, with at most one in flight. A failed write is reported to its submitter
/// and logged; it never blocks the writes behind it.
///
/// Resolved fitness machine characteristics are cached for the lifetime of a
/// connection epoch. [`Self::begin_epoch`] throws the cache, the queue and every
/// notification callback away at once.
pub struct LinkArbiter {
    config: LinkConfig,
    stats: Arc<StatCounters>,
    epochs_started: AtomicU64,
    current: RwLock<Option<Arc<Epoch>>>,
}

impl LinkArbiter {
    /// Create an arbiter with no link attached
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            stats: Arc::new(StatCounters::default()),
            epochs_started: AtomicU64::new(0),
            current: RwLock::new(None),
        }
    }

    fn current_epoch(&self) -> Option<Arc<Epoch>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start a new connection epoch on `transport`
    ///
    /// Must be called exactly once per new physical connection, before anything
    /// subscribes. Writes still queued from the previous epoch finish against the
    /// previous transport; cached handles and notification callbacks are dropped.
    /// Returns the epoch number.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn begin_epoch(&self, transport: Arc<dyn GattTransport>) -> u64 {
        let number = self.epochs_started.fetch_add(1, Ordering::AcqRel) + 1;
        let link = Arc::new(EpochLink {
            transport,
            cache: Mutex::new(HashMap::new()),
            settle_delay: Duration::from_millis(self.config.settle_delay_ms),
            stats: Arc::clone(&self.stats),
        });
        let (queue, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_write_queue(Arc::clone(&link), jobs));

        let epoch = Arc::new(Epoch {
            number,
            link,
            queue,
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            enabled: AsyncMutex::new(HashSet::new()),
            dispatcher: AsyncMutex::new(None),
        });

        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(epoch);
        info!("Started connection epoch {}", number);
        number
    }

    /// End the current epoch without starting a new one
    pub fn end_epoch(&self) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(epoch) = previous {
            info!("Ended connection epoch {}", epoch.number);
        }
    }

    /// Number of the current epoch, if a link is attached
    #[must_use]
    pub fn epoch(&self) -> Option<u64> {
        self.current_epoch().map(|epoch| epoch.number)
    }

    /// Transport of the current epoch
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn GattTransport>> {
        self.current_epoch()
            .map(|epoch| Arc::clone(&epoch.link.transport))
    }

    /// Whether the current transport reports the link as up
    pub async fn transport_connected(&self) -> bool {
        match self.transport() {
            Some(transport) => transport.is_connected().await,
            None => false,
        }
    }

    /// Write counters since the arbiter was created
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Queue a write and return immediately
    ///
    /// The write takes its place in the queue during this call, so the order of
    /// `submit` calls is the order in which writes reach the peripheral.
    pub fn submit(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: impl Into<Bytes>,
    ) -> PendingWrite {
        let (reply, receiver) = oneshot::channel();
        let pending = PendingWrite { reply: receiver };

        let Some(epoch) = self.current_epoch() else {
            let _ = reply.send(Err(TrainerError::Disconnected));
            return pending;
        };

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let job = WriteJob {
            service,
            characteristic,
            payload: payload.into(),
            reply,
        };
        if let Err(mpsc::error::SendError(job)) = epoch.queue.send(job) {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            let _ = job.reply.send(Err(TrainerError::Disconnected));
        }
        pending
    }

    /// Queue a write and wait for it to complete
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Disconnected`] without a link, or the transport error
    /// of the write.
    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.submit(service, characteristic, payload).outcome().await
    }

    /// Register `on_value` for every notification on a characteristic
    ///
    /// Notifications are enabled on the peripheral the first time a characteristic
    /// is subscribed in an epoch.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Disconnected`] without a link, or the transport error
    /// from resolving the characteristic or enabling notifications.
    pub async fn subscribe_notifications<F>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        on_value: F,
    ) -> Result<NotificationSubscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let epoch = self.current_epoch().ok_or(TrainerError::Disconnected)?;
        epoch.ensure_dispatcher().await?;

        let transport = &epoch.link.transport;
        let handle = transport
            .resolve_characteristic(service, characteristic)
            .await?;
        {
            let mut enabled = epoch.enabled.lock().await;
            if !enabled.contains(&handle) {
                transport.start_notifications(&handle).await?;
                enabled.insert(handle);
                debug!("Enabled notifications on {}", characteristic);
            }
        }

        let id = lock(&epoch.listeners).register(characteristic, Arc::new(on_value));
        Ok(NotificationSubscription {
            listeners: Arc::downgrade(&epoch.listeners),
            characteristic,
            id,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Number of callbacks registered on a characteristic in the current epoch
    #[must_use]
    pub fn listener_count(&self, characteristic: Uuid) -> usize {
        self.current_epoch()
            .map_or(0, |epoch| lock(&epoch.listeners).count(characteristic))
    }
}

impl std::fmt::Debug for LinkArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkArbiter")
            .field("epoch", &self.epoch())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
