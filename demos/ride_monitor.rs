use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use trainerlink::{
    telemetry::now_ms, BleManager, Connector, DeviceConfig, DeviceFlags, HEART_RATE_SERVICE_UUID,
    Result, ScanParams, SlopeSource, TrainerRegistry,
};

/// A fixed climb standing in for a route simulation
struct SteadyClimb(f64);

impl SlopeSource for SteadyClimb {
    fn last_slope_in_whole_percent(&self) -> f64 {
        self.0
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Trainerlink Ride Monitor Example");
    info!("Scanning for trainers, power meters and heart rate straps...");

    let ble = BleManager::new().await?;
    let params = ScanParams::default();
    let found = ble.scan_for_devices(&params).await?;
    if found.is_empty() {
        error!("❌ No fitness devices found");
        return Ok(());
    }

    let registry = Arc::new(TrainerRegistry::new());
    let connector = Connector::new(Arc::clone(&registry), DeviceConfig::default());

    let mut trainer = None;
    let mut strap = None;
    for info in &found {
        let is_strap = info.services.contains(&HEART_RATE_SERVICE_UUID);
        if (is_strap && strap.is_some()) || (!is_strap && trainer.is_some()) {
            continue;
        }

        let transport = match ble.connect(info, &params).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("⚠️  Could not connect to {}: {}", info.name, e);
                continue;
            }
        };
        let connected = if is_strap {
            connector.connect_hrm(transport).await
        } else {
            connector.connect_powermeter(transport).await
        };

        match connected {
            Ok(device) => {
                info!(
                    "✅ Connected to {} ({})",
                    device.name(),
                    device.device_type_description()
                );
                if is_strap {
                    device.set_device_flags(DeviceFlags::USED_AS_HRM);
                    strap = Some(device);
                } else {
                    device.set_device_flags(DeviceFlags::USED_AS_TRAINER);
                    trainer = Some(device);
                }
            }
            Err(e) => warn!("⚠️  {} is not usable: {}", info.name, e),
        }
    }

    if let Some(strap) = &strap {
        strap.set_hrm_recipient(Arc::new(|_tm_ms: u64, bpm: u16| {
            info!("❤️  {} bpm", bpm);
        }));
    }

    let Some(trainer) = trainer else {
        warn!("No trainer or power meter connected, only showing heart rate");
        sleep(Duration::from_secs(30)).await;
        return Ok(());
    };

    trainer.set_power_recipient(Arc::new(|_tm_ms: u64, watts: i16| {
        info!("⚡ {} W", watts);
    }));
    trainer.set_cadence_recipient(Arc::new(|_tm_ms: u64, rpm: f64| {
        info!("🔄 {:.0} rpm", rpm);
    }));
    trainer.set_slope_source(Arc::new(SteadyClimb(4.0)));

    if registry.active().is_some() {
        info!("Vendor protocol trainer registered for calibration");
    }

    info!("📈 Riding a steady 4% climb for 30 seconds...");
    for _ in 0..60 {
        match trainer.update_slope(now_ms(), 1.0).await {
            Ok(outcome) if outcome.updated() => info!("Sent slope update"),
            Ok(_) => {}
            Err(e) => {
                error!("❌ Slope update failed: {}", e);
                break;
            }
        }
        sleep(Duration::from_millis(500)).await;
    }

    info!("🎯 Switching to erg mode at 180 W");
    if let Err(e) = trainer.update_erg(now_ms(), 180).await {
        error!("❌ Failed to set erg target: {}", e);
    }
    sleep(Duration::from_secs(10)).await;

    info!("🔌 Disconnecting...");
    trainer.disconnect().await?;
    if let Some(strap) = strap {
        strap.disconnect().await?;
    }
    info!("✅ Ride monitor example completed");
    Ok(())
}
