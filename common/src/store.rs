use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::{
    calibration::{CalibrationPoints, ReferenceLevel},
    config::{
        BrokerSettings, DeviceSettings, HopperSettings, NetworkSettings, Settings,
        SettingsDocument, SettingsGroup,
    },
    error::{ConfigError, StorageError},
};

/// Durable home of the settings document. `save` replaces the whole
/// snapshot in one step; a failed save must leave the previous one intact.
pub trait SnapshotStorage {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn save(&mut self, snapshot: &[u8]) -> Result<(), StorageError>;
}

impl<T: SnapshotStorage + ?Sized> SnapshotStorage for Box<T> {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).load()
    }

    fn save(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        (**self).save(snapshot)
    }
}

/// How the settings came to be in memory after [`ConfigStore::open`].
#[derive(Debug)]
pub enum Loaded {
    Stored,
    FirstBoot,
    Recovered(StorageError),
}

/// Returned by [`ConfigStore::reset_all`]; the caller owns the restart.
#[must_use = "a factory reset only completes after the device restarts"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequired;

pub struct ConfigStore<S> {
    settings: DeviceSettings,
    storage: S,
}

impl<S: SnapshotStorage> ConfigStore<S> {
    pub fn new(storage: S, settings: DeviceSettings) -> Self {
        Self { settings, storage }
    }

    /// Loads the stored document, writing defaults on first boot.
    ///
    /// Unreadable documents leave defaults in memory; the storage is only
    /// rewritten by the next successful mutation.
    pub fn open(mut storage: S) -> (Self, Loaded) {
        let loaded = match storage.load() {
            Ok(Some(raw)) => match serde_json::from_slice::<SettingsDocument>(&raw) {
                Ok(document) => return (Self::new(storage, document.into()), Loaded::Stored),
                Err(err) => Loaded::Recovered(err.into()),
            },
            Ok(None) => Loaded::FirstBoot,
            Err(err) => Loaded::Recovered(err),
        };

        let mut store = Self::new(storage, DeviceSettings::default());
        if matches!(loaded, Loaded::FirstBoot) {
            if let Err(err) = store.persist() {
                return (store, Loaded::Recovered(err));
            }
        }
        (store, loaded)
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn get<T: Settings>(&self) -> &T {
        T::slot(&self.settings)
    }

    pub fn set<T: Settings>(&mut self, value: T) -> Result<(), ConfigError> {
        value.validate().map_err(|reason| ConfigError::Invalid {
            group: T::GROUP.as_str(),
            reason,
        })?;

        let previous = self.settings.clone();
        *T::slot_mut(&mut self.settings) = value;
        self.commit(previous)
    }

    pub fn get_json(&self, group: SettingsGroup) -> Value {
        match group {
            SettingsGroup::Network => to_json(self.get::<NetworkSettings>()),
            SettingsGroup::Broker => to_json(self.get::<BrokerSettings>()),
            SettingsGroup::Hopper => to_json(self.get::<HopperSettings>()),
        }
    }

    /// Replaces one group from a serialized body; every field is required.
    pub fn set_json(&mut self, group: SettingsGroup, body: &[u8]) -> Result<(), ConfigError> {
        match group {
            SettingsGroup::Network => self.set(parse::<NetworkSettings>(body)?),
            SettingsGroup::Broker => self.set(parse::<BrokerSettings>(body)?),
            SettingsGroup::Hopper => self.set(parse::<HopperSettings>(body)?),
        }
    }

    pub fn calibration(&self) -> CalibrationPoints {
        self.settings.hopper.calibration()
    }

    pub fn set_reference(&mut self, level: ReferenceLevel, cm: f32) -> Result<(), ConfigError> {
        let mut hopper = self.settings.hopper.clone();
        let mut points = hopper.calibration();
        points.set(level, cm);
        hopper.set_calibration(points);
        self.set(hopper)
    }

    pub fn reset_all(&mut self) -> Result<RestartRequired, ConfigError> {
        let previous = std::mem::take(&mut self.settings);
        self.commit(previous)?;
        Ok(RestartRequired)
    }

    fn commit(&mut self, previous: DeviceSettings) -> Result<(), ConfigError> {
        if let Err(err) = self.persist() {
            self.settings = previous;
            return Err(ConfigError::Persistence(err));
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<(), StorageError> {
        let payload = serde_json::to_vec_pretty(&SettingsDocument::from(&self.settings))?;
        self.storage.save(&payload)
    }
}

fn parse<T: Settings>(body: &[u8]) -> Result<T, ConfigError> {
    serde_json::from_slice(body).map_err(|err| ConfigError::Invalid {
        group: T::GROUP.as_str(),
        reason: err.to_string(),
    })
}

fn to_json<T: Settings>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// Volatile storage shared between clones; writes can be refused to
/// exercise the rollback path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Option<Vec<u8>>,
    saves: usize,
    refuse_writes: bool,
}

impl MemoryStorage {
    pub fn with_snapshot(snapshot: impl Into<Vec<u8>>) -> Self {
        let storage = Self::default();
        storage.lock().snapshot = Some(snapshot.into());
        storage
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.lock().snapshot.clone()
    }

    pub fn saves(&self) -> usize {
        self.lock().saves
    }

    pub fn refuse_writes(&self, refuse: bool) {
        self.lock().refuse_writes = refuse;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStorage for MemoryStorage {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().snapshot.clone())
    }

    fn save(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.refuse_writes {
            return Err(StorageError::Io("storage is read-only".to_string()));
        }
        inner.snapshot = Some(snapshot.to_vec());
        inner.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn stored_document(storage: &MemoryStorage) -> SettingsDocument {
        serde_json::from_slice(&storage.snapshot().unwrap()).unwrap()
    }

    fn broker() -> BrokerSettings {
        BrokerSettings {
            enabled: true,
            host: "192.168.1.20".to_string(),
            port: 1883,
            user: "hopper".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn first_boot_writes_defaults() {
        let storage = MemoryStorage::default();
        let (store, loaded) = ConfigStore::open(storage.clone());

        assert!(matches!(loaded, Loaded::FirstBoot));
        assert_eq!(store.settings(), &DeviceSettings::default());
        assert_eq!(storage.saves(), 1);
    }

    #[test]
    fn corrupt_document_recovers_with_defaults_without_writing() {
        let storage = MemoryStorage::with_snapshot("{not json");
        let (store, loaded) = ConfigStore::open(storage.clone());

        assert!(matches!(loaded, Loaded::Recovered(StorageError::Format(_))));
        assert_eq!(store.settings(), &DeviceSettings::default());
        assert_eq!(storage.saves(), 0);
    }

    #[test]
    fn stored_document_is_loaded() {
        let mut settings = DeviceSettings::default();
        settings.hopper.pellet_type = "hardwood".to_string();
        let raw = serde_json::to_vec(&SettingsDocument::from(&settings)).unwrap();

        let (store, loaded) = ConfigStore::open(MemoryStorage::with_snapshot(raw));

        assert!(matches!(loaded, Loaded::Stored));
        assert_eq!(store.get::<HopperSettings>().pellet_type, "hardwood");
    }

    #[test]
    fn set_rewrites_full_document() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());

        store.set(broker()).unwrap();

        let document = stored_document(&storage);
        assert_eq!(document.broker, vec![broker()]);
        assert_eq!(document.network, vec![NetworkSettings::default()]);
        assert_eq!(document.hopper, vec![HopperSettings::default()]);
    }

    #[test]
    fn missing_field_is_invalid_and_keeps_prior_group() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());
        store.set(broker()).unwrap();

        let result = store.set_json(
            SettingsGroup::Broker,
            br#"{"enabled":true,"host":"10.0.0.9","port":1883,"user":"x"}"#,
        );

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                group: "broker",
                ..
            })
        ));
        assert_eq!(store.get::<BrokerSettings>(), &broker());
        assert_eq!(storage.saves(), 1);
    }

    #[test]
    fn semantic_rejection_does_not_touch_storage() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());

        let result = store.set(HopperSettings {
            poll_interval_seconds: 0,
            ..HopperSettings::default()
        });

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        assert_eq!(storage.saves(), 0);
    }

    #[test]
    fn persistence_failure_rolls_back_memory() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());
        let before = store.settings().clone();
        storage.refuse_writes(true);

        let result = store.set(broker());

        assert!(matches!(result, Err(ConfigError::Persistence(_))));
        assert_eq!(store.settings(), &before);
    }

    #[test]
    fn set_reference_updates_one_mark_and_persists() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());

        store.set_reference(ReferenceLevel::Full, 12.5).unwrap();

        assert_eq!(
            store.calibration(),
            CalibrationPoints {
                empty_cm: 75.0,
                full_cm: 12.5,
            }
        );
        assert_eq!(stored_document(&storage).hopper[0].full_cm, 12.5);
    }

    #[test]
    fn reset_restores_defaults_and_requests_restart() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());
        store.set(broker()).unwrap();

        let restart = store.reset_all().unwrap();

        assert_eq!(restart, RestartRequired);
        assert_eq!(store.settings(), &DeviceSettings::default());
        assert_eq!(stored_document(&storage).broker, vec![BrokerSettings::default()]);
    }

    #[test]
    fn failed_reset_keeps_current_settings() {
        let storage = MemoryStorage::default();
        let mut store = ConfigStore::new(storage.clone(), DeviceSettings::default());
        store.set(broker()).unwrap();
        storage.refuse_writes(true);

        assert!(store.reset_all().is_err());
        assert_eq!(store.get::<BrokerSettings>(), &broker());
    }

    #[test]
    fn json_round_trip_per_group() {
        let mut store = ConfigStore::new(MemoryStorage::default(), DeviceSettings::default());
        let body = serde_json::json!({
            "poll_interval_seconds": 60,
            "pellet_type": "softwood",
            "full_cm": 8.5,
            "empty_cm": 80.0,
        });

        store
            .set_json(SettingsGroup::Hopper, body.to_string().as_bytes())
            .unwrap();

        assert_eq!(store.get_json(SettingsGroup::Hopper), body);
    }
}
