use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{config::ClockSettings, error::StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Str,
    Bool,
    U8,
    U16,
    U32,
    U64,
}

/// A typed value as it sits in the key/value partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StoredValue {
    Str(String),
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl StoredValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::Str,
            Self::Bool(_) => ValueKind::Bool,
            Self::U8(_) => ValueKind::U8,
            Self::U16(_) => ValueKind::U16,
            Self::U32(_) => ValueKind::U32,
            Self::U64(_) => ValueKind::U64,
        }
    }
}

/// Durable key/value storage with NVS-style typed slots.
pub trait KvBackend {
    fn get(&self, key: &str, kind: ValueKind) -> Result<Option<StoredValue>, StoreError>;
    fn set(&mut self, key: &str, value: &StoredValue) -> Result<(), StoreError>;
}

/// Rust types that map onto one [`ValueKind`].
pub trait Persisted: Sized {
    const KIND: ValueKind;

    fn from_stored(value: StoredValue) -> Option<Self>;
    fn to_stored(&self) -> StoredValue;
}

impl Persisted for String {
    const KIND: ValueKind = ValueKind::Str;

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::Str(value) => Some(value),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::Str(self.clone())
    }
}

impl Persisted for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::Bool(value) => Some(value),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::Bool(*self)
    }
}

impl Persisted for u8 {
    const KIND: ValueKind = ValueKind::U8;

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::U8(value) => Some(value),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::U8(*self)
    }
}

impl Persisted for u16 {
    const KIND: ValueKind = ValueKind::U16;

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::U16(value) => Some(value),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::U16(*self)
    }
}

impl Persisted for u32 {
    const KIND: ValueKind = ValueKind::U32;

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::U32(value) => Some(value),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::U32(*self)
    }
}

impl Persisted for u64 {
    const KIND: ValueKind = ValueKind::U64;

    fn from_stored(value: StoredValue) -> Option<Self> {
        match value {
            StoredValue::U64(value) => Some(value),
            _ => None,
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::U64(*self)
    }
}

/// Reads `key`, falling back to `default` when the key is missing, was
/// written with a different type by an older firmware, or cannot be read.
pub fn read_or<B, T>(backend: &B, key: &str, default: T) -> T
where
    B: KvBackend + ?Sized,
    T: Persisted,
{
    match backend.get(key, T::KIND) {
        Ok(Some(value)) => T::from_stored(value).unwrap_or_else(|| {
            warn!("config key `{key}` has unexpected type; using default");
            default
        }),
        Ok(None) => default,
        Err(StoreError::TypeMismatch { .. }) => {
            warn!("config key `{key}` has unexpected type; using default");
            default
        }
        Err(err) => {
            warn!("failed to read config key `{key}` ({err}); using default");
            default
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBackend {
    values: HashMap<String, StoredValue>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn raw(&self, key: &str) -> Option<&StoredValue> {
        self.values.get(key)
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str, kind: ValueKind) -> Result<Option<StoredValue>, StoreError> {
        match self.values.get(key) {
            Some(value) if value.kind() == kind => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: kind,
            }),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &StoredValue) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// RAM copy of [`ClockSettings`] backed by a [`KvBackend`].
///
/// Reads never touch the backend. Writes update the RAM copy first and then
/// persist only the keys whose value changed, so the control loop sees an
/// operator edit on its very next tick even if flash is slow or failing.
#[derive(Debug)]
pub struct ConfigStore<B> {
    backend: B,
    settings: ClockSettings,
}

impl<B: KvBackend> ConfigStore<B> {
    pub fn load(backend: B) -> Self {
        let mut settings = ClockSettings::load_from(&backend);
        settings.sanitize();
        Self { backend, settings }
    }

    pub fn settings(&self) -> &ClockSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Applies `edit`, sanitizes the result and persists changed keys.
    /// Returns the number of keys written.
    pub fn update<F>(&mut self, edit: F) -> Result<usize, StoreError>
    where
        F: FnOnce(&mut ClockSettings),
    {
        let previous = self.settings.entries();
        let mut next = self.settings.clone();
        edit(&mut next);
        next.sanitize();
        self.settings = next;

        let mut written = 0;
        for ((key, old), (_, new)) in previous.iter().zip(self.settings.entries()) {
            if *old != new {
                self.backend.set(key, &new)?;
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn set_use_ntp(&mut self, enabled: bool) -> Result<usize, StoreError> {
        self.update(|settings| settings.use_ntp = enabled)
    }

    pub fn set_manual_time(&mut self, epoch_secs: u64) -> Result<usize, StoreError> {
        self.update(|settings| {
            settings.manual_time = epoch_secs;
            settings.use_ntp = false;
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::keys;

    #[test]
    fn loads_defaults_from_empty_backend() {
        let store = ConfigStore::load(MemoryBackend::new());
        assert_eq!(store.settings(), &ClockSettings::default());
        assert!(store.backend().is_empty());
    }

    #[test]
    fn writes_only_changed_keys_and_reads_back_immediately() {
        let mut store = ConfigStore::load(MemoryBackend::new());

        let written = store
            .update(|settings| {
                settings.twelve_hour = false;
                settings.night.start_hour = 22;
            })
            .unwrap();

        assert_eq!(written, 2);
        assert!(!store.settings().twelve_hour);
        assert_eq!(store.settings().night.start_hour, 22);
        assert_eq!(
            store.backend().raw(keys::TWELVE_HOUR),
            Some(&StoredValue::Bool(false))
        );
        assert_eq!(
            store.backend().raw(keys::NIGHT_START),
            Some(&StoredValue::U8(22))
        );
        assert_eq!(store.backend().len(), 2);

        let reloaded = ConfigStore::load(store.backend().clone());
        assert_eq!(reloaded.settings(), store.settings());
    }

    #[test]
    fn unchanged_update_writes_nothing() {
        let mut store = ConfigStore::load(MemoryBackend::new());
        assert_eq!(store.update(|_| {}).unwrap(), 0);
    }

    #[test]
    fn mistyped_key_falls_back_to_default() {
        let mut backend = MemoryBackend::new();
        backend
            .set(keys::DAY_BRIGHTNESS, &StoredValue::Str("bright".into()))
            .unwrap();

        let store = ConfigStore::load(backend);
        assert_eq!(
            store.settings().day_brightness,
            ClockSettings::default().day_brightness
        );
    }

    /// Fails reads of one key the way flash does for a value larger than
    /// the read buffer.
    struct UnreadableKey {
        inner: MemoryBackend,
        key: &'static str,
    }

    impl KvBackend for UnreadableKey {
        fn get(&self, key: &str, kind: ValueKind) -> Result<Option<StoredValue>, StoreError> {
            if key == self.key {
                return Err(StoreError::Backend {
                    key: key.to_string(),
                    message: "ESP_ERR_NVS_INVALID_LENGTH".into(),
                });
            }
            self.inner.get(key, kind)
        }

        fn set(&mut self, key: &str, value: &StoredValue) -> Result<(), StoreError> {
            self.inner.set(key, value)
        }
    }

    #[test]
    fn unreadable_key_falls_back_to_default() {
        let mut inner = MemoryBackend::new();
        inner
            .set(keys::NTP_SERVER, &StoredValue::Str("n".repeat(212)))
            .unwrap();
        inner
            .set(keys::WIFI_SSID, &StoredValue::Str("attic".into()))
            .unwrap();

        let store = ConfigStore::load(UnreadableKey {
            inner,
            key: keys::NTP_SERVER,
        });

        assert_eq!(store.settings().ntp_server, "pool.ntp.org");
        assert_eq!(store.settings().wifi_ssid, "attic");
    }

    #[test]
    fn manual_time_disables_ntp() {
        let mut store = ConfigStore::load(MemoryBackend::new());
        store.set_manual_time(1_767_225_600).unwrap();

        assert!(!store.settings().use_ntp);
        assert_eq!(store.settings().manual_time, 1_767_225_600);
        assert_eq!(
            store.backend().raw(keys::USE_NTP),
            Some(&StoredValue::Bool(false))
        );
    }
}
