use std::{fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::calibration::CalibrationPoints;

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_POLL_INTERVAL_SECONDS: u32 = 300;
pub const DEFAULT_FULL_CM: f32 = 10.0;
pub const DEFAULT_EMPTY_CM: f32 = 75.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub enabled: bool,
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: DEFAULT_BROKER_PORT,
            user: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopperSettings {
    pub poll_interval_seconds: u32,
    pub pellet_type: String,
    pub full_cm: f32,
    pub empty_cm: f32,
}

impl Default for HopperSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            pellet_type: String::new(),
            full_cm: DEFAULT_FULL_CM,
            empty_cm: DEFAULT_EMPTY_CM,
        }
    }
}

impl HopperSettings {
    pub fn calibration(&self) -> CalibrationPoints {
        CalibrationPoints {
            empty_cm: self.empty_cm,
            full_cm: self.full_cm,
        }
    }

    pub fn set_calibration(&mut self, points: CalibrationPoints) {
        self.empty_cm = points.empty_cm;
        self.full_cm = points.full_cm;
    }
}

/// The three settings groups as held in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSettings {
    pub network: NetworkSettings,
    pub broker: BrokerSettings,
    pub hopper: HopperSettings,
}

/// On-disk layout: one record per named array, rewritten as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub network: Vec<NetworkSettings>,
    #[serde(default)]
    pub broker: Vec<BrokerSettings>,
    #[serde(default)]
    pub hopper: Vec<HopperSettings>,
}

impl From<&DeviceSettings> for SettingsDocument {
    fn from(settings: &DeviceSettings) -> Self {
        Self {
            network: vec![settings.network.clone()],
            broker: vec![settings.broker.clone()],
            hopper: vec![settings.hopper.clone()],
        }
    }
}

impl From<SettingsDocument> for DeviceSettings {
    fn from(document: SettingsDocument) -> Self {
        Self {
            network: document.network.into_iter().next().unwrap_or_default(),
            broker: document.broker.into_iter().next().unwrap_or_default(),
            hopper: document.hopper.into_iter().next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsGroup {
    Network,
    Broker,
    Hopper,
}

impl SettingsGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Broker => "broker",
            Self::Hopper => "hopper",
        }
    }
}

impl FromStr for SettingsGroup {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "network" => Ok(Self::Network),
            "broker" => Ok(Self::Broker),
            "hopper" => Ok(Self::Hopper),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SettingsGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A settings group that can be read, validated and replaced independently.
pub trait Settings: Clone + Serialize + DeserializeOwned {
    const GROUP: SettingsGroup;

    fn validate(&self) -> Result<(), String>;
    fn slot(settings: &DeviceSettings) -> &Self;
    fn slot_mut(settings: &mut DeviceSettings) -> &mut Self;
}

impl Settings for NetworkSettings {
    const GROUP: SettingsGroup = SettingsGroup::Network;

    fn validate(&self) -> Result<(), String> {
        if self.enabled && self.ssid.trim().is_empty() {
            return Err("ssid cannot be empty when the network is enabled".to_string());
        }
        Ok(())
    }

    fn slot(settings: &DeviceSettings) -> &Self {
        &settings.network
    }

    fn slot_mut(settings: &mut DeviceSettings) -> &mut Self {
        &mut settings.network
    }
}

impl Settings for BrokerSettings {
    const GROUP: SettingsGroup = SettingsGroup::Broker;

    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be between 1 and 65535".to_string());
        }
        if self.enabled && self.host.trim().is_empty() {
            return Err("host cannot be empty when reporting is enabled".to_string());
        }
        Ok(())
    }

    fn slot(settings: &DeviceSettings) -> &Self {
        &settings.broker
    }

    fn slot_mut(settings: &mut DeviceSettings) -> &mut Self {
        &mut settings.broker
    }
}

impl Settings for HopperSettings {
    const GROUP: SettingsGroup = SettingsGroup::Hopper;

    fn validate(&self) -> Result<(), String> {
        if self.poll_interval_seconds == 0 {
            return Err("poll_interval_seconds must be at least 1".to_string());
        }
        for (name, value) in [("full_cm", self.full_cm), ("empty_cm", self.empty_cm)] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a non-negative distance"));
            }
        }
        Ok(())
    }

    fn slot(settings: &DeviceSettings) -> &Self {
        &settings.hopper
    }

    fn slot_mut(settings: &mut DeviceSettings) -> &mut Self {
        &mut settings.hopper
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_factory_state() {
        let settings = DeviceSettings::default();
        assert!(!settings.network.enabled);
        assert!(!settings.broker.enabled);
        assert_eq!(settings.broker.port, 1883);
        assert_eq!(settings.hopper.poll_interval_seconds, 300);
        assert_eq!(settings.hopper.full_cm, 10.0);
        assert_eq!(settings.hopper.empty_cm, 75.0);
    }

    #[test]
    fn document_holds_one_record_per_named_array() {
        let document = SettingsDocument::from(&DeviceSettings::default());
        let value = serde_json::to_value(&document).unwrap();

        for group in ["network", "broker", "hopper"] {
            assert_eq!(value[group].as_array().map(Vec::len), Some(1), "{group}");
        }
        assert_eq!(value["hopper"][0]["poll_interval_seconds"], 300);
    }

    #[test]
    fn empty_arrays_fall_back_to_defaults() {
        let document: SettingsDocument =
            serde_json::from_str(r#"{"network":[],"broker":[{"enabled":true,"host":"mqtt.local","port":1884,"user":"u","password":"p"}]}"#)
                .unwrap();
        let settings = DeviceSettings::from(document);

        assert_eq!(settings.network, NetworkSettings::default());
        assert_eq!(settings.broker.host, "mqtt.local");
        assert_eq!(settings.broker.port, 1884);
        assert_eq!(settings.hopper, HopperSettings::default());
    }

    #[test]
    fn missing_field_is_rejected_by_shape() {
        let result = serde_json::from_str::<HopperSettings>(
            r#"{"poll_interval_seconds":60,"pellet_type":"oak","full_cm":10}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn broker_validation_rules() {
        let mut broker = BrokerSettings {
            enabled: true,
            ..BrokerSettings::default()
        };
        assert!(broker.validate().is_err());

        broker.host = "10.0.0.2".to_string();
        assert!(broker.validate().is_ok());

        broker.port = 0;
        assert!(broker.validate().is_err());
    }

    #[test]
    fn hopper_validation_rules() {
        let mut hopper = HopperSettings::default();
        assert!(hopper.validate().is_ok());

        hopper.poll_interval_seconds = 0;
        assert!(hopper.validate().is_err());

        hopper.poll_interval_seconds = 60;
        hopper.empty_cm = f32::INFINITY;
        assert!(hopper.validate().is_err());
    }

    #[test]
    fn group_names_round_trip() {
        for group in [
            SettingsGroup::Network,
            SettingsGroup::Broker,
            SettingsGroup::Hopper,
        ] {
            assert_eq!(group.as_str().parse::<SettingsGroup>(), Ok(group));
        }
        assert!("wifi".parse::<SettingsGroup>().is_err());
    }
}
