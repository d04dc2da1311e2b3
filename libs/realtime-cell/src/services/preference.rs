use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use crate::RealtimeError;

/// Key under which the channel's enable/disable toggle is stored.
pub const ENABLED_KEY: &str = "realtime_enabled";

/// Client-local persistent string storage.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), RealtimeError>;
}

/// Absent or unparseable values count as enabled.
pub fn read_enabled(store: &dyn PreferenceStore) -> bool {
    match store.get(ENABLED_KEY).as_deref() {
        Some("false") => false,
        Some("true") | None => true,
        Some(other) => {
            debug!("Ignoring unparseable {} value '{}'", ENABLED_KEY, other);
            true
        }
    }
}

pub fn write_enabled(store: &dyn PreferenceStore, enabled: bool) -> Result<(), RealtimeError> {
    store.set(ENABLED_KEY, if enabled { "true" } else { "false" })
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::default();
        store
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        store
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), RealtimeError> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Preferences kept as a flat JSON object of strings in a single file.
#[derive(Debug)]
pub struct FilePreferenceStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl FilePreferenceStore {
    /// Loads the file if present. A missing or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Preference file {} is corrupt, starting empty: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            values: RwLock::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<(), RealtimeError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| RealtimeError::Preference(e.to_string()))?;
        }

        let contents = serde_json::to_string_pretty(values)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, contents).map_err(|e| RealtimeError::Preference(e.to_string()))?;
        fs::rename(&staging, &self.path).map_err(|e| RealtimeError::Preference(e.to_string()))
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), RealtimeError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }
}
