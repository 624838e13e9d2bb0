use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{cycling_power, DeviceShared};
use crate::{
    error::Result,
    protocol::{
        dampen_downhill,
        kickr::{
            encode_resistance_level, encode_target_power, level_for_fraction, level_for_slope,
            shape_slope,
        },
    },
    types::{CommandKind, CommandOutcome, ResistanceCalibration, SkipReason},
    CYCLING_POWER_SERVICE_UUID, KICKR_WRITE_CHAR_UUID,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Trainer driven through the vendor resistance protocol
///
/// Reports power like a plain power meter. Simulated hills are sent as resistance
/// levels between the calibrated downhill and uphill endpoints, moving at most half a
/// percentage point of grade per update.
#[derive(Debug)]
pub(super) struct ProprietaryTrainer {
    calibration: Mutex<ResistanceCalibration>,
    last_slope_sent: Mutex<f64>,
}

impl ProprietaryTrainer {
    pub(super) fn new(calibration: ResistanceCalibration) -> Self {
        Self {
            calibration: Mutex::new(calibration),
            last_slope_sent: Mutex::new(0.0),
        }
    }

    pub(super) fn calibration(&self) -> ResistanceCalibration {
        *lock(&self.calibration)
    }

    pub(super) fn set_calibration(&self, calibration: ResistanceCalibration) {
        debug!(
            "Resistance calibration set to {:#06x}/{:#06x}",
            calibration.downhill, calibration.uphill
        );
        *lock(&self.calibration) = calibration;
    }

    pub(super) async fn start(&self, shared: &Arc<DeviceShared>) -> Result<()> {
        cycling_power::subscribe_power(shared).await?;

        shared
            .subscribe(CYCLING_POWER_SERVICE_UUID, KICKR_WRITE_CHAR_UUID, |value| {
                debug!("Trainer response {:02X?}", value);
            })
            .await
    }

    pub(super) async fn update_slope(
        &self,
        shared: &DeviceShared,
        now_ms: u64,
        ftms_pct: f64,
    ) -> Result<CommandOutcome> {
        let Some(source) = shared.telemetry.slope_source() else {
            return Ok(CommandOutcome::Skipped(SkipReason::NoSlopeSource));
        };
        if !shared.rate_limiter.try_acquire(CommandKind::Slope, now_ms) {
            return Ok(CommandOutcome::Skipped(SkipReason::RateLimited));
        }

        let desired = dampen_downhill(source.last_slope_in_whole_percent() * ftms_pct);
        let slope = {
            let mut last_sent = lock(&self.last_slope_sent);
            *last_sent = shape_slope(desired, *last_sent);
            *last_sent
        };
        let level = level_for_slope(slope, &self.calibration());
        debug!(
            "Updating '{}' with slope {:.1}% as level {:#06x}",
            shared.name, slope, level
        );

        send(shared, encode_resistance_level(level)).await?;
        Ok(CommandOutcome::Sent)
    }

    pub(super) async fn update_erg(
        &self,
        shared: &DeviceShared,
        now_ms: u64,
        watts: i16,
    ) -> Result<CommandOutcome> {
        if !shared.rate_limiter.try_acquire(CommandKind::Erg, now_ms) {
            return Ok(CommandOutcome::Skipped(SkipReason::RateLimited));
        }
        debug!("Updating '{}' with erg {}W", shared.name, watts);
        send(shared, encode_target_power(i32::from(watts))).await?;
        Ok(CommandOutcome::Sent)
    }

    pub(super) async fn update_resistance(
        &self,
        shared: &DeviceShared,
        now_ms: u64,
        fraction: f64,
    ) -> Result<CommandOutcome> {
        if !shared.rate_limiter.try_acquire(CommandKind::Resistance, now_ms) {
            return Ok(CommandOutcome::Skipped(SkipReason::RateLimited));
        }
        let level = level_for_fraction(fraction);
        debug!(
            "Updating '{}' with resistance {:.2} as level {:#06x}",
            shared.name, fraction, level
        );
        send(shared, encode_resistance_level(level)).await?;
        Ok(CommandOutcome::Sent)
    }
}

async fn send(shared: &DeviceShared, frame: bytes::Bytes) -> Result<()> {
    shared
        .arbiter
        .write(CYCLING_POWER_SERVICE_UUID, KICKR_WRITE_CHAR_UUID, frame)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TrainerError,
        fake::{settle, start_device, FakeTransport},
        link::LinkArbiter,
        types::{DeviceClass, DeviceConfig},
        Device, SlopeSource, CYCLING_POWER_CONTROL_POINT_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    };
    use tokio_test::assert_ok;

    struct Grade(f64);

    impl SlopeSource for Grade {
        fn last_slope_in_whole_percent(&self) -> f64 {
            self.0
        }
    }

    async fn kickr() -> (Arc<FakeTransport>, Arc<Device>) {
        let transport = Arc::new(FakeTransport::kickr());
        let device = start_device(transport.clone(), DeviceClass::ProprietaryTrainer)
            .await
            .unwrap();
        (transport, device)
    }

    fn levels(transport: &FakeTransport) -> Vec<u16> {
        transport
            .writes_to(KICKR_WRITE_CHAR_UUID)
            .iter()
            .filter(|frame| frame[0] == 0x40)
            .map(|frame| u16::from_le_bytes([frame[1], frame[2]]))
            .collect()
    }

    #[tokio::test]
    async fn test_startup_subscriptions_without_request_control() {
        let (transport, device) = kickr().await;

        assert_eq!(transport.notification_enables(CYCLING_POWER_MEASUREMENT_UUID), 1);
        assert_eq!(transport.notification_enables(KICKR_WRITE_CHAR_UUID), 1);
        assert!(transport.writes().is_empty());
        assert_eq!(device.device_type_description(), "Wahoo Kickr");
        assert!(!device.capabilities().has_cadence);
    }

    #[tokio::test]
    async fn test_slope_without_source_is_checked_first() {
        let (transport, device) = kickr().await;

        assert_eq!(
            device.update_slope(1_000, 1.0).await.unwrap(),
            CommandOutcome::Skipped(SkipReason::NoSlopeSource)
        );
        // the miss above did not consume the window
        device.set_slope_source(Arc::new(Grade(0.0)));
        assert_eq!(device.update_slope(1_100, 1.0).await.unwrap(), CommandOutcome::Sent);
        assert_eq!(levels(&transport).len(), 1);
    }

    #[tokio::test]
    async fn test_slope_steps_towards_target() {
        let (transport, device) = kickr().await;
        device.set_slope_source(Arc::new(Grade(10.0)));

        for tick in 0..3u64 {
            assert!(device.update_slope(tick * 500, 1.0).await.unwrap().updated());
        }
        // 0.5, 1.0 and 1.5 percent with the default 0x3fff/0x2000 calibration
        assert_eq!(levels(&transport), vec![12082, 11877, 11673]);
    }

    #[tokio::test]
    async fn test_calibration_changes_levels() {
        let (transport, device) = kickr().await;
        device.set_slope_source(Arc::new(Grade(0.0)));
        let calibration = ResistanceCalibration::new(0x3000, 0x1000).unwrap();
        assert_ok!(device.set_resistance_calibration(calibration));
        assert_eq!(device.resistance_calibration(), Some(calibration));

        assert!(device.update_slope(1_000, 1.0).await.unwrap().updated());
        assert_eq!(levels(&transport), vec![0x2000]);
    }

    #[tokio::test]
    async fn test_erg_records_window() {
        let (transport, device) = kickr().await;

        assert_eq!(device.update_erg(1_000, 250).await.unwrap(), CommandOutcome::Sent);
        assert_eq!(
            device.update_erg(1_100, 260).await.unwrap(),
            CommandOutcome::Skipped(SkipReason::RateLimited)
        );
        assert_eq!(
            transport.writes_to(KICKR_WRITE_CHAR_UUID),
            vec![vec![0x42, 0xFA, 0x00]]
        );
    }

    #[tokio::test]
    async fn test_resistance_uses_fixed_endpoints() {
        let (transport, device) = kickr().await;

        assert!(device.update_resistance(1_000, 1.0).await.unwrap().updated());
        assert!(device.update_resistance(1_500, 0.0).await.unwrap().updated());
        assert_eq!(levels(&transport), vec![0x185b, 0x5f5b]);
    }

    #[tokio::test]
    async fn test_vendor_responses_do_not_disturb_commands() {
        let (transport, device) = kickr().await;

        transport.emit(KICKR_WRITE_CHAR_UUID, vec![0x01, 0x40, 0x01]);
        settle().await;
        assert!(device.update_resistance(1_000, 1.0).await.unwrap().updated());
        assert_eq!(levels(&transport), vec![0x185b]);
    }

    #[tokio::test]
    async fn test_inverted_calibration_is_rejected() {
        let (transport, device) = kickr().await;
        device.set_slope_source(Arc::new(Grade(0.0)));
        let inverted = ResistanceCalibration {
            downhill: 0x1000,
            uphill: 0x2000,
        };

        assert!(matches!(
            device.set_resistance_calibration(inverted),
            Err(TrainerError::InvalidParameters(_))
        ));
        assert_eq!(
            device.resistance_calibration(),
            Some(ResistanceCalibration::default())
        );
        assert!(device.update_slope(1_000, 1.0).await.unwrap().updated());
        assert_eq!(levels(&transport), vec![12287]);
    }

    #[tokio::test]
    async fn test_inverted_configured_calibration_falls_back() {
        let transport = Arc::new(FakeTransport::kickr());
        let mut config = DeviceConfig::default();
        config.link.settle_delay_ms = 0;
        config.calibration = ResistanceCalibration {
            downhill: 0x1000,
            uphill: 0x2000,
        };
        let arbiter = Arc::new(LinkArbiter::new(config.link.clone()));
        arbiter.begin_epoch(transport.clone());

        let device = Device::start(DeviceClass::ProprietaryTrainer, arbiter, config)
            .await
            .unwrap();
        assert_eq!(
            device.resistance_calibration(),
            Some(ResistanceCalibration::default())
        );
    }

    #[tokio::test]
    async fn test_zero_offset_inherited() {
        let transport = Arc::new(FakeTransport::kickr());
        transport.respond_with(|characteristic, data| {
            if characteristic == CYCLING_POWER_CONTROL_POINT_UUID && data == [0x0c] {
                vec![(characteristic, vec![0x20, 0x0c, 0x01])]
            } else {
                Vec::new()
            }
        });
        let device = start_device(transport, DeviceClass::ProprietaryTrainer)
            .await
            .unwrap();
        assert_ok!(device.zero_offset().await);
    }
}
