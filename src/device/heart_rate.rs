use std::sync::{Arc, Weak};

use super::DeviceShared;
use crate::{
    error::Result, protocol::hrm::parse_heart_rate, telemetry::now_ms,
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};

/// Heart rate strap
#[derive(Debug)]
pub(super) struct HeartRate;

impl HeartRate {
    pub(super) async fn start(&self, shared: &Arc<DeviceShared>) -> Result<()> {
        let weak = Arc::downgrade(shared);
        shared
            .subscribe(
                HEART_RATE_SERVICE_UUID,
                HEART_RATE_MEASUREMENT_UUID,
                move |value| on_heart_rate(&weak, value),
            )
            .await
    }
}

fn on_heart_rate(device: &Weak<DeviceShared>, value: &[u8]) {
    let Some(shared) = device.upgrade() else {
        return;
    };
    if let Some(bpm) = parse_heart_rate(value) {
        shared.telemetry.publish_hrm(now_ms(), bpm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fake::{settle, start_device, FakeTransport},
        types::{Capabilities, CommandOutcome, DeviceClass, SkipReason},
    };
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_heart_rate_fan_out() {
        let transport = Arc::new(FakeTransport::heart_rate());
        let device = start_device(transport.clone(), DeviceClass::HeartRate)
            .await
            .unwrap();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&first);
        device.set_hrm_recipient(Arc::new(move |_: u64, bpm: u16| log.lock().unwrap().push(bpm)));
        let log = Arc::clone(&second);
        device.set_hrm_recipient(Arc::new(move |_: u64, bpm: u16| log.lock().unwrap().push(bpm)));

        transport.emit(HEART_RATE_MEASUREMENT_UUID, vec![0x00, 72]);
        transport.emit(HEART_RATE_MEASUREMENT_UUID, vec![0x01, 0x2C, 0x01]);
        transport.emit(HEART_RATE_MEASUREMENT_UUID, vec![0x01]);
        settle().await;

        assert_eq!(*first.lock().unwrap(), vec![72, 300]);
        assert_eq!(*second.lock().unwrap(), vec![72, 300]);
        assert_eq!(
            device.capabilities(),
            Capabilities {
                has_power: false,
                has_cadence: false,
                has_hrm: true,
            }
        );
    }

    #[tokio::test]
    async fn test_heart_rate_strap_ignores_commands() {
        let transport = Arc::new(FakeTransport::heart_rate());
        let device = start_device(transport.clone(), DeviceClass::HeartRate)
            .await
            .unwrap();

        assert_eq!(
            device.update_erg(1_000, 100).await.unwrap(),
            CommandOutcome::Skipped(SkipReason::NotControllable)
        );
        assert!(device.zero_offset().await.is_err());
        assert!(transport.writes().is_empty());
    }
}
