//! Data directory on the host: alarm blobs and the controller config file.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{debug, warn};

use homelink_common::{BlobStore, ControllerConfig, StoreError};

const DATA_DIR_ENV: &str = "HOMELINK_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "./.homelink";
const CONFIG_FILE: &str = "config.json";

pub fn data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Blobs live at `<root>/<namespace>/<key>.bin`. Saves go through a temp file
/// and a rename so a crash never leaves a half-written blob behind.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{key}.bin"))
    }

    fn io_error(namespace: &str, key: &str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            namespace: namespace.to_string(),
            key: key.to_string(),
            source,
        }
    }
}

impl BlobStore for FileBlobStore {
    fn load_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path(namespace, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(namespace, key, err)),
        }
    }

    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(namespace, key);
        let wrap = |err| Self::io_error(namespace, key, err);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }

        let staging = path.with_extension("bin.tmp");
        let mut file = fs::File::create(&staging).map_err(wrap)?;
        file.write_all(bytes).map_err(wrap)?;
        file.sync_all().map_err(wrap)?;
        drop(file);
        fs::rename(&staging, &path).map_err(wrap)?;
        debug!("stored {} bytes at {}", bytes.len(), path.display());
        Ok(())
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(namespace, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(namespace, key, err)),
        }
    }
}

/// Reads `config.json` from the data directory (defaults when it is absent),
/// then applies environment overrides and clamps limits.
pub fn load_config(data_dir: &Path) -> ControllerConfig {
    let path = data_dir.join(CONFIG_FILE);
    let mut config = read_config_file(&path).unwrap_or_else(|err| {
        warn!("failed to load config from {}: {err:#}", path.display());
        ControllerConfig::default()
    });
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.sanitize();
    config
}

fn read_config_file(path: &Path) -> anyhow::Result<ControllerConfig> {
    match fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("{} is not a valid config", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(ControllerConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(config: &mut ControllerConfig, var: impl Fn(&str) -> Option<String>) {
    let port = |name: &str| var(name).and_then(|value| value.parse::<u16>().ok());

    if let Some(host) = var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(mqtt_port) = port("MQTT_PORT") {
        config.network.mqtt_port = mqtt_port;
    }
    if let Some(user) = var("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }
    if let Some(tcp_port) = port("HOMELINK_TCP_PORT") {
        config.tcp_port = tcp_port;
    }
    if let Some(http_port) = port("HOMELINK_HTTP_PORT") {
        config.http_port = http_port;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use homelink_common::{AlarmRecord, AlarmStore, AlarmTime, DayMask, Envelope, Operation, TaskId};

    use super::*;

    #[test]
    fn blobs_survive_a_new_store_instance() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        assert_eq!(store.load_blob("alarms", "records").unwrap(), None);

        store.save_blob("alarms", "records", &[1, 2, 3]).unwrap();
        store.save_u32("alarms", "count", 7).unwrap();

        let reopened = FileBlobStore::new(dir.path());
        assert_eq!(
            reopened.load_blob("alarms", "records").unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(reopened.load_u32("alarms", "count").unwrap(), Some(7));
        assert!(dir.path().join("alarms").join("records.bin").exists());
        assert!(!dir.path().join("alarms").join("records.bin.tmp").exists());
    }

    #[test]
    fn erase_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        store.save_blob("alarms", "count", &[0, 0, 0, 1]).unwrap();

        store.erase("alarms", "count").unwrap();
        store.erase("alarms", "count").unwrap();
        assert_eq!(store.load_blob("alarms", "count").unwrap(), None);
    }

    #[test]
    fn alarm_list_reloads_from_disk() {
        let dir = tempdir().unwrap();
        let trigger = Envelope::request(TaskId::Led.raw(), Operation::Set, 2).unwrap();
        let record = AlarmRecord {
            time: AlarmTime::At(6 * 3600),
            days: DayMask::ALL,
            trigger,
        };

        let mut alarms = AlarmStore::load(FileBlobStore::new(dir.path()), 4).unwrap();
        alarms.insert(record.clone()).unwrap();
        drop(alarms);

        let reloaded = AlarmStore::load(FileBlobStore::new(dir.path()), 4).unwrap();
        assert_eq!(reloaded.records(), &[record]);
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = read_config_file(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn config_file_is_read_and_env_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, br#"{"tcp_port": 4000, "network": {"mqtt_host": "broker"}}"#).unwrap();

        let mut config = read_config_file(&path).unwrap();
        assert_eq!(config.tcp_port, 4000);
        assert_eq!(config.network.mqtt_host, "broker");

        let env: HashMap<&str, &str> = HashMap::from([
            ("MQTT_HOST", "other-broker"),
            ("MQTT_PORT", "8883"),
            ("HOMELINK_HTTP_PORT", "not-a-port"),
        ]);
        apply_env_overrides(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.network.mqtt_host, "other-broker");
        assert_eq!(config.network.mqtt_port, 8883);
        assert_eq!(config.tcp_port, 4000);
        assert_eq!(config.http_port, ControllerConfig::default().http_port);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, b"{not json").unwrap();
        assert!(read_config_file(&path).is_err());
    }
}
