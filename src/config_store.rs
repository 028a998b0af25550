use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use crate::database::{ConfigEntry, DatabaseProvider};
use crate::errors::Result;

/// Keys whose change only takes effect after a restart
const REBOOT_KEYS: &[&str] = &["recognition.workers", "probe.interval", "camera.retry_interval"];

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValue {
    pub value: String,
    pub must_reboot: bool,
}

/// Runtime key/value configuration persisted in the database.
///
/// Reads never fail the caller: a missing or unreadable key is logged and
/// reported as `None` so the dependent feature can be disabled.
#[derive(Clone)]
pub struct ConfigStore {
    database: Arc<dyn DatabaseProvider>,
}

impl ConfigStore {
    pub fn new(database: Arc<dyn DatabaseProvider>) -> Self {
        Self { database }
    }

    pub async fn seed_defaults(&self, entries: &[(String, String)]) -> Result<usize> {
        let mut inserted = 0;
        for (key, value) in entries {
            let entry = ConfigEntry {
                key: key.clone(),
                value: value.clone(),
                must_reboot: REBOOT_KEYS.contains(&key.as_str()),
            };
            if self.database.insert_config_if_missing(&entry).await? {
                debug!("Seeded config key '{}' = '{}'", key, value);
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!("Seeded {} runtime configuration keys", inserted);
        }
        Ok(inserted)
    }

    pub async fn get(&self, key: &str) -> Option<ConfigValue> {
        match self.database.get_config(key).await {
            Ok(Some(entry)) => Some(ConfigValue {
                value: entry.value,
                must_reboot: entry.must_reboot,
            }),
            Ok(None) => {
                warn!("Config key '{}' is not set, dependent feature disabled", key);
                None
            }
            Err(e) => {
                warn!("Failed to read config key '{}': {}", key, e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let entry = ConfigEntry {
            key: key.to_string(),
            value: value.into(),
            must_reboot: REBOOT_KEYS.contains(&key),
        };
        if entry.must_reboot {
            info!("Config key '{}' changed, restart required to apply", key);
        }
        self.database.set_config(&entry).await
    }

    pub async fn get_parsed<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.get(key).await?;
        match value.value.trim().parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Config key '{}' has invalid value '{}': {}", key, value.value, e);
                None
            }
        }
    }

    pub async fn get_duration(&self, key: &str) -> Option<Duration> {
        let value = self.get(key).await?;
        match humantime::parse_duration(value.value.trim()) {
            Ok(duration) => Some(duration),
            Err(e) => {
                warn!("Config key '{}' is not a duration ('{}'): {}", key, value.value, e);
                None
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_str(&value.value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Config key '{}' is not valid JSON: {}", key, e);
                None
            }
        }
    }

    pub async fn get_or<T>(&self, key: &str, fallback: T) -> T
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get_parsed(key).await.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::database::SqliteDatabase;

    async fn open_store(dir: &tempfile::TempDir) -> ConfigStore {
        let path = dir.path().join("config.db");
        let db = SqliteDatabase::new(path.to_str().unwrap()).await.unwrap();
        db.initialize().await.unwrap();
        ConfigStore::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_missing_keys_degrade_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        assert!(store.get("detection.min_start_faces").await.is_none());
        assert!(store.get_parsed::<u32>("detection.min_start_faces").await.is_none());
        assert_eq!(store.get_or("detection.min_start_faces", 20u32).await, 20);
    }

    #[tokio::test]
    async fn test_typed_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.seed_defaults(&[
            ("probe.interval".to_string(), "30s".to_string()),
            ("recognition.threshold".to_string(), "0.6".to_string()),
            ("camera.credentials".to_string(), r#"[{"username":"admin","password":"1234"}]"#.to_string()),
        ]).await.unwrap();

        assert_eq!(store.get_duration("probe.interval").await, Some(Duration::from_secs(30)));
        assert_eq!(store.get_parsed::<f64>("recognition.threshold").await, Some(0.6));
        assert!(store.get("probe.interval").await.unwrap().must_reboot);

        let creds: Vec<Credentials> = store.get_json("camera.credentials").await.unwrap();
        assert_eq!(creds[0].username, "admin");

        store.set("recognition.threshold", "not-a-number").await.unwrap();
        assert!(store.get_parsed::<f64>("recognition.threshold").await.is_none());
    }

    #[tokio::test]
    async fn test_seed_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.set("recording.delta", "2").await.unwrap();
        let inserted = store.seed_defaults(&[("recording.delta".to_string(), "1".to_string())]).await.unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(store.get_parsed::<f64>("recording.delta").await, Some(2.0));
    }
}
