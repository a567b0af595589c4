use std::time::Duration;

use tracing::{debug, info, warn};

use hopper_common::{CycleOutcome, TelemetryError};

use super::{telemetry::TelemetryPublisher, with_monitor_blocking, SharedMonitor};

/// Runs for the life of the process: one cycle, then sleep for the poll
/// interval that is configured at that moment.
pub async fn run<T: TelemetryPublisher>(monitor: SharedMonitor, publisher: T) {
    info!("reporting task started");
    loop {
        let interval = report_once(&monitor, &publisher).await;
        tokio::time::sleep(interval).await;
    }
}

/// Executes a single reporting cycle and returns how long to sleep before
/// the next one.
pub async fn report_once<T: TelemetryPublisher>(
    monitor: &SharedMonitor,
    publisher: &T,
) -> Duration {
    // Mode check and sampling happen under one lock acquisition.
    let outcome = match with_monitor_blocking(monitor, |monitor| monitor.run_cycle()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("reporting cycle aborted: {err:#}");
            return monitor.lock().await.poll_interval();
        }
    };

    match outcome {
        CycleOutcome::Suspended => {
            debug!("calibration mode active; reporting cycle skipped");
        }
        CycleOutcome::SensorFailed(err) => {
            warn!("level sample failed, keeping previous level: {err}");
        }
        CycleOutcome::Measured {
            raw_cm,
            level,
            telemetry,
        } => {
            info!("hopper level {level}% ({raw_cm:.1} cm)");
            if let Some(telemetry) = telemetry {
                match publisher.publish(&telemetry).await {
                    Ok(()) => debug!("telemetry published to {}", telemetry.broker.host),
                    Err(
                        err @ (TelemetryError::Connection(_)
                        | TelemetryError::Auth(_)
                        | TelemetryError::Timeout(_)),
                    ) => warn!("telemetry dropped: {err}"),
                }
            }
        }
    }

    monitor.lock().await.poll_interval()
}
