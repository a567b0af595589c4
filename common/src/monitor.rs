use std::{fmt, str::FromStr, time::Duration};

use crate::{
    battery::{BatteryMonitor, BatterySource},
    calibration::ReferenceLevel,
    config::BrokerSettings,
    error::{CaptureError, SensorError},
    sampler::{DistanceSampler, EchoPins},
    store::{ConfigStore, SnapshotStorage},
    topics::{TOPIC_PELLET_LEVEL, TOPIC_PELLET_TYPE, TOPIC_SENSOR_BATTERY},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
    #[default]
    Normal,
    Calibrating,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Calibrating => "calibrating",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" => Ok(Self::Normal),
            "calibrating" => Ok(Self::Calibrating),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reading ready to leave the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub level: u8,
    pub pellet_type: String,
    pub battery: f32,
    pub broker: BrokerSettings,
}

impl Telemetry {
    /// Topic/payload pairs in publish order.
    pub fn messages(&self) -> [(&'static str, String); 3] {
        [
            (TOPIC_PELLET_LEVEL, self.level.to_string()),
            (TOPIC_PELLET_TYPE, self.pellet_type.clone()),
            (TOPIC_SENSOR_BATTERY, format!("{:.1}", self.battery)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Calibration mode: nothing sampled, nothing published.
    Suspended,
    /// The sensor did not answer; the previous level stands.
    SensorFailed(SensorError),
    Measured {
        raw_cm: f32,
        level: u8,
        telemetry: Option<Telemetry>,
    },
}

/// Everything the reporting loop and the control surface share: sensor,
/// battery input, settings, operating mode and the last reported level.
///
/// Callers hold it behind one lock so that a mode check and the sample that
/// follows it are never interleaved with a calibration capture.
pub struct HopperMonitor<P, B, S> {
    sampler: DistanceSampler<P>,
    battery: BatteryMonitor<B>,
    store: ConfigStore<S>,
    mode: OperatingMode,
    level: u8,
}

impl<P, B, S> HopperMonitor<P, B, S>
where
    P: EchoPins,
    B: BatterySource,
    S: SnapshotStorage,
{
    pub fn new(
        sampler: DistanceSampler<P>,
        battery: BatteryMonitor<B>,
        store: ConfigStore<S>,
    ) -> Self {
        Self {
            sampler,
            battery,
            store,
            mode: OperatingMode::Normal,
            level: 0,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OperatingMode) {
        self.mode = mode;
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConfigStore<S> {
        &mut self.store
    }

    pub fn poll_interval(&self) -> Duration {
        let seconds = self.store.settings().hopper.poll_interval_seconds.max(1);
        Duration::from_secs(u64::from(seconds))
    }

    /// One reporting cycle up to (not including) the publish.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        if self.mode == OperatingMode::Calibrating {
            return CycleOutcome::Suspended;
        }

        let raw_cm = match self.sampler.measure() {
            Ok(raw_cm) => raw_cm,
            Err(err) => return CycleOutcome::SensorFailed(err),
        };

        let settings = self.store.settings();
        let level = settings.hopper.calibration().percentage(raw_cm).min(100);
        self.level = level;

        let telemetry = if settings.broker.enabled {
            let pellet_type = settings.hopper.pellet_type.clone();
            let broker = settings.broker.clone();
            Some(Telemetry {
                level,
                pellet_type,
                battery: self.battery.read(),
                broker,
            })
        } else {
            None
        };

        CycleOutcome::Measured {
            raw_cm,
            level,
            telemetry,
        }
    }

    /// Takes a fresh reading, stores it as the given reference mark and
    /// persists it. Returns the captured distance.
    pub fn capture_reference(&mut self, level: ReferenceLevel) -> Result<f32, CaptureError> {
        let raw_cm = self.sampler.measure()?;
        self.store.set_reference(level, raw_cm)?;
        Ok(raw_cm)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        battery::{tests::FixedBattery, AdcScale},
        config::{DeviceSettings, HopperSettings},
        error::ConfigError,
        sampler::tests::ScriptedEcho,
        store::MemoryStorage,
    };

    type TestMonitor = HopperMonitor<ScriptedEcho, FixedBattery, MemoryStorage>;

    fn monitor(echo: ScriptedEcho, settings: DeviceSettings) -> (TestMonitor, MemoryStorage) {
        let storage = MemoryStorage::default();
        let monitor = HopperMonitor::new(
            DistanceSampler::new(echo),
            BatteryMonitor::new(FixedBattery(u16::MAX), AdcScale::default()),
            ConfigStore::new(storage.clone(), settings),
        );
        (monitor, storage)
    }

    fn reporting_settings() -> DeviceSettings {
        let mut settings = DeviceSettings::default();
        settings.broker.enabled = true;
        settings.broker.host = "broker.local".to_string();
        settings.hopper.pellet_type = "oak".to_string();
        settings
    }

    #[test]
    fn measured_cycle_updates_level_and_builds_telemetry() {
        let (mut monitor, _) = monitor(ScriptedEcho::distance(42.5), reporting_settings());

        let CycleOutcome::Measured {
            level,
            telemetry: Some(telemetry),
            ..
        } = monitor.run_cycle()
        else {
            panic!("expected a measurement with telemetry");
        };
        assert_eq!(level, 50);
        assert_eq!(monitor.level(), 50);
        assert_eq!(telemetry.level, 50);
        assert_eq!(telemetry.pellet_type, "oak");
        assert_eq!(telemetry.battery, 100.0);
    }

    #[test]
    fn telemetry_payloads_are_plain_text() {
        let telemetry = Telemetry {
            level: 64,
            pellet_type: "oak".to_string(),
            battery: 87.26,
            broker: BrokerSettings::default(),
        };

        assert_eq!(
            telemetry.messages(),
            [
                ("hopper/pellets/level", "64".to_string()),
                ("hopper/pellets/type", "oak".to_string()),
                ("hopper/sensor/battery", "87.3".to_string()),
            ]
        );
    }

    #[test]
    fn disabled_broker_skips_telemetry() {
        let (mut monitor, _) = monitor(ScriptedEcho::distance(10.0), DeviceSettings::default());

        let outcome = monitor.run_cycle();

        assert!(matches!(
            outcome,
            CycleOutcome::Measured {
                level: 100,
                telemetry: None,
                ..
            }
        ));
    }

    #[test]
    fn calibration_mode_suspends_every_cycle() {
        let (mut monitor, _) = monitor(ScriptedEcho::distance(10.0), reporting_settings());
        monitor.set_mode(OperatingMode::Calibrating);

        for _ in 0..5 {
            assert_eq!(monitor.run_cycle(), CycleOutcome::Suspended);
        }
        assert_eq!(monitor.level(), 0);
        assert_eq!(monitor.sampler_triggers(), 0);
    }

    #[test]
    fn sensor_timeout_keeps_previous_level() {
        let (mut monitor, _) = monitor(ScriptedEcho::silent(), reporting_settings());
        monitor.level = 37;

        let outcome = monitor.run_cycle();

        assert!(matches!(outcome, CycleOutcome::SensorFailed(_)));
        assert_eq!(monitor.level(), 37);
    }

    #[test]
    fn degenerate_calibration_reports_zero() {
        let mut settings = reporting_settings();
        settings.hopper.full_cm = 40.0;
        settings.hopper.empty_cm = 40.0;
        let (mut monitor, _) = monitor(ScriptedEcho::distance(20.0), settings);

        assert!(matches!(
            monitor.run_cycle(),
            CycleOutcome::Measured { level: 0, .. }
        ));
    }

    #[test]
    fn poll_interval_follows_hopper_settings() {
        let (mut monitor, _) = monitor(ScriptedEcho::distance(20.0), DeviceSettings::default());
        assert_eq!(monitor.poll_interval(), Duration::from_secs(300));

        monitor
            .store_mut()
            .set(HopperSettings {
                poll_interval_seconds: 15,
                ..HopperSettings::default()
            })
            .unwrap();
        assert_eq!(monitor.poll_interval(), Duration::from_secs(15));
    }

    #[test]
    fn capture_stores_and_persists_reference() {
        let (mut monitor, storage) = monitor(ScriptedEcho::distance(80.0), DeviceSettings::default());

        let captured = monitor.capture_reference(ReferenceLevel::Empty).unwrap();

        assert!((captured - 80.0).abs() < 0.1, "captured {captured}");
        assert_eq!(monitor.store().calibration().empty_cm, captured);
        assert_eq!(storage.saves(), 1);
    }

    #[test]
    fn capture_timeout_leaves_calibration_untouched() {
        let (mut monitor, storage) = monitor(ScriptedEcho::silent(), DeviceSettings::default());

        let result = monitor.capture_reference(ReferenceLevel::Full);

        assert!(matches!(result, Err(CaptureError::Sensor(_))));
        assert_eq!(monitor.store().calibration().full_cm, 10.0);
        assert_eq!(storage.saves(), 0);
    }

    #[test]
    fn capture_persistence_failure_rolls_back() {
        let (mut monitor, storage) = monitor(ScriptedEcho::distance(60.0), DeviceSettings::default());
        storage.refuse_writes(true);

        let result = monitor.capture_reference(ReferenceLevel::Empty);

        assert!(matches!(
            result,
            Err(CaptureError::Config(ConfigError::Persistence(_)))
        ));
        assert_eq!(monitor.store().calibration().empty_cm, 75.0);
    }

    impl TestMonitor {
        fn sampler_triggers(&self) -> u32 {
            self.sampler.pins().triggers
        }
    }
}
