use std::sync::{atomic::Ordering, Arc, Weak};
use tracing::{debug, info, warn};

use super::DeviceShared;
use crate::{
    error::Result,
    protocol::{
        dampen_downhill,
        ftms::{parse_indoor_bike_data, ControlPointCommand, ControlPointResponse, MachineStatus},
    },
    telemetry::now_ms,
    types::{CommandKind, CommandOutcome, SkipReason},
    FITNESS_MACHINE_SERVICE_UUID, FTMS_CONTROL_POINT_UUID, FTMS_STATUS_UUID,
    INDOOR_BIKE_DATA_UUID,
};

/// Trainer speaking the standard Fitness Machine Service
#[derive(Debug)]
pub(super) struct FitnessMachine;

impl FitnessMachine {
    pub(super) async fn start(&self, shared: &Arc<DeviceShared>) -> Result<()> {
        let weak = Arc::downgrade(shared);
        shared
            .subscribe(FITNESS_MACHINE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, move |value| {
                on_indoor_bike_data(&weak, value);
            })
            .await?;

        shared
            .subscribe(FITNESS_MACHINE_SERVICE_UUID, FTMS_STATUS_UUID, |value| {
                if let Some(status) = MachineStatus::parse(value) {
                    debug!("Fitness machine status {:#04x}", status.opcode);
                }
            })
            .await?;

        let weak = Arc::downgrade(shared);
        shared
            .subscribe(FITNESS_MACHINE_SERVICE_UUID, FTMS_CONTROL_POINT_UUID, move |value| {
                on_control_point_response(&weak, value);
            })
            .await?;

        // the machine may still accept commands without it
        if let Err(e) = send(shared, ControlPointCommand::RequestControl).await {
            warn!("Requesting control of '{}' failed: {}", shared.name, e);
        }
        Ok(())
    }

    pub(super) async fn update_slope(
        &self,
        shared: &DeviceShared,
        now_ms: u64,
        ftms_pct: f64,
    ) -> Result<CommandOutcome> {
        if !shared.rate_limiter.try_acquire(CommandKind::Slope, now_ms) {
            return Ok(CommandOutcome::Skipped(SkipReason::RateLimited));
        }
        let Some(source) = shared.telemetry.slope_source() else {
            debug!("Not updating '{}': no slope source", shared.name);
            return Ok(CommandOutcome::Skipped(SkipReason::NoSlopeSource));
        };

        let grade_percent = dampen_downhill(source.last_slope_in_whole_percent() * ftms_pct);
        debug!("Updating '{}' with slope {:.1}%", shared.name, grade_percent);
        send(shared, ControlPointCommand::SetSimulationParameters { grade_percent }).await?;
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
        send(shared, ControlPointCommand::SetTargetPower(watts)).await?;
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
        debug!("Updating '{}' with resistance {:.2}", shared.name, fraction);
        send(shared, ControlPointCommand::SetTargetResistance(fraction)).await?;
        Ok(CommandOutcome::Sent)
    }
}

async fn send(shared: &DeviceShared, command: ControlPointCommand) -> Result<()> {
    shared
        .arbiter
        .write(
            FITNESS_MACHINE_SERVICE_UUID,
            FTMS_CONTROL_POINT_UUID,
            command.to_bytes(),
        )
        .await
}

fn on_indoor_bike_data(device: &Weak<DeviceShared>, value: &[u8]) {
    let Some(shared) = device.upgrade() else {
        return;
    };
    let data = parse_indoor_bike_data(value);
    let tm_ms = now_ms();

    if let Some(rpm) = data.cadence_rpm {
        shared.cadence_seen.store(true, Ordering::Release);
        shared.telemetry.publish_cadence(tm_ms, rpm);
    }
    if let Some(watts) = data.power_watts {
        shared.telemetry.publish_power(tm_ms, watts);
    }
}

fn on_control_point_response(device: &Weak<DeviceShared>, value: &[u8]) {
    let Some(shared) = device.upgrade() else {
        return;
    };
    let Some(response) = ControlPointResponse::parse(value) else {
        return;
    };
    debug!(
        "Control point answered opcode {:#04x} with {:?}",
        response.request_opcode, response.result
    );

    if response.must_request_control() {
        info!("'{}' refused a command, requesting control again", shared.name);
        // outcome is only visible in the link stats
        drop(shared.arbiter.submit(
            FITNESS_MACHINE_SERVICE_UUID,
            FTMS_CONTROL_POINT_UUID,
            ControlPointCommand::RequestControl.to_bytes(),
        ));
    }
}
