pub mod battery;
pub mod calibration;
pub mod config;
pub mod error;
pub mod monitor;
pub mod sampler;
pub mod store;
pub mod topics;

pub use battery::{AdcScale, BatteryMonitor, BatterySource};
pub use calibration::{CalibrationPoints, ReferenceLevel};
pub use config::{
    BrokerSettings, DeviceSettings, HopperSettings, NetworkSettings, Settings, SettingsGroup,
};
pub use error::{CaptureError, ConfigError, SensorError, StorageError, TelemetryError};
pub use monitor::{CycleOutcome, HopperMonitor, OperatingMode, Telemetry};
pub use sampler::{DistanceSampler, EchoPins};
pub use store::{ConfigStore, Loaded, MemoryStorage, RestartRequired, SnapshotStorage};
pub use topics::*;
