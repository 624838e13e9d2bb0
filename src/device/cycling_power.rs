use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::DeviceShared;
use crate::{
    error::{Result, TrainerError},
    link::NotificationSubscription,
    protocol::cps::{encode_start_offset_compensation, parse_power_measurement, ControlPointResponse},
    telemetry::now_ms,
    CYCLING_POWER_CONTROL_POINT_UUID, CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_SERVICE_UUID,
};

/// Standalone power meter; reports power, takes no commands
#[derive(Debug)]
pub(super) struct CyclingPower;

impl CyclingPower {
    pub(super) async fn start(&self, shared: &Arc<DeviceShared>) -> Result<()> {
        subscribe_power(shared).await
    }
}

/// Subscribe the cycling power measurement and forward power readings
pub(super) async fn subscribe_power(shared: &Arc<DeviceShared>) -> Result<()> {
    let weak = Arc::downgrade(shared);
    shared
        .subscribe(
            CYCLING_POWER_SERVICE_UUID,
            CYCLING_POWER_MEASUREMENT_UUID,
            move |value| on_power_measurement(&weak, value),
        )
        .await
}

fn on_power_measurement(device: &Weak<DeviceShared>, value: &[u8]) {
    let Some(shared) = device.upgrade() else {
        return;
    };
    if let Some(measurement) = parse_power_measurement(value) {
        shared
            .telemetry
            .publish_power(now_ms(), measurement.power_watts);
    }
}

/// Zero-offset calibration
///
/// Listens on the control point, writes the start-offset-compensation request and
/// waits for the first response that echoes it. The listener is removed on every
/// path out of this function, including the caller dropping the future.
pub(super) async fn zero_offset(shared: &DeviceShared) -> Result<()> {
    info!("Starting zero offset on '{}'", shared.name);

    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let subscription = shared
        .arbiter
        .subscribe_notifications(
            CYCLING_POWER_SERVICE_UUID,
            CYCLING_POWER_CONTROL_POINT_UUID,
            move |value| {
                let Some(response) = ControlPointResponse::parse(value) else {
                    return;
                };
                if !response.answers_offset_compensation() {
                    return;
                }
                let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(response);
                }
            },
        )
        .await?;
    let subscription = CancelOnDrop(subscription);

    let result = request_offset_compensation(shared, rx).await;
    drop(subscription);

    match &result {
        Ok(()) => info!("Zero offset on '{}' succeeded", shared.name),
        Err(e) => warn!("Zero offset on '{}' failed: {}", shared.name, e),
    }
    result
}

/// Removes the listener even when the caller abandons the calibration
struct CancelOnDrop(NotificationSubscription);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn request_offset_compensation(
    shared: &DeviceShared,
    response: oneshot::Receiver<ControlPointResponse>,
) -> Result<()> {
    shared
        .arbiter
        .write(
            CYCLING_POWER_SERVICE_UUID,
            CYCLING_POWER_CONTROL_POINT_UUID,
            encode_start_offset_compensation(),
        )
        .await?;

    let timeout_ms = shared.config.timeouts.zero_offset_timeout_ms;
    let response = tokio::time::timeout(Duration::from_millis(timeout_ms), response)
        .await
        .map_err(|_| TrainerError::Timeout { timeout_ms })?
        .map_err(|_| TrainerError::Disconnected)?;

    if let Some(torque) = response.residual_torque_nm {
        debug!("Residual torque after zero offset: {:.3} N·m", torque);
    }
    response.calibration_outcome()
}
