//! Configuration supplied by the external settings provider

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CatalogError;
use crate::thumbs::cache::ThumbnailSettings;

const APP_DIR_NAME: &str = "game-library";

/// Key-value settings store owned by the front-end
pub trait SettingsProvider {
    fn get(&self, key: &str) -> Option<String>;
}

impl SettingsProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Flat JSON object on disk, e.g. `{"root_directory": "/games", "tile_width": 120}`
#[derive(Debug, Clone, Default)]
pub struct JsonSettings {
    values: serde_json::Map<String, Value>,
}

impl JsonSettings {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path).map_err(|e| CatalogError::io(path, e))?;
        Self::parse(&text).map_err(|reason| CatalogError::InvalidSetting {
            key: path.display().to_string(),
            value: String::new(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        match serde_json::from_str::<Value>(text).map_err(|e| e.to_string())? {
            Value::Object(values) => Ok(JsonSettings { values }),
            other => Err(format!("expected a JSON object, found {other}")),
        }
    }
}

impl SettingsProvider for JsonSettings {
    fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            other => Some(other.to_string()),
        }
    }
}

/// Grid layout preferences passed through to the presentation layer.
/// Tile size also bounds generated thumbnails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPrefs {
    pub grid_rows: u32,
    pub grid_cols: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl Default for DisplayPrefs {
    fn default() -> Self {
        DisplayPrefs {
            grid_rows: 4,
            grid_cols: 5,
            tile_width: 120,
            tile_height: 100,
        }
    }
}

/// Everything the catalog core needs to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub root_directory: PathBuf,
    /// Launchable extensions, without the leading dot
    pub include_extensions: Vec<String>,
    pub catalog_path: PathBuf,
    pub thumbnail_dir: PathBuf,
    pub thumbnail_cache_max_bytes: u64,
    /// Upper bound on concurrent thumbnail derivations
    pub worker_pool_size: usize,
    /// Rescan on this interval; manual refresh only when None
    pub refresh_interval_secs: Option<u64>,
    pub follow_symlinks: bool,
    pub scan_on_startup: bool,
    pub display: DisplayPrefs,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        let data = dirs::data_dir()
            .unwrap_or_else(|| home.clone())
            .join(APP_DIR_NAME);
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| home.clone())
            .join(APP_DIR_NAME);

        CatalogConfig {
            root_directory: home.join("Games"),
            include_extensions: vec!["exe".into(), "app".into(), "sh".into()],
            catalog_path: data.join("catalog.json"),
            thumbnail_dir: cache.join("thumbnails"),
            thumbnail_cache_max_bytes: 64 * 1024 * 1024,
            worker_pool_size: 4,
            refresh_interval_secs: None,
            follow_symlinks: true,
            scan_on_startup: true,
            display: DisplayPrefs::default(),
        }
    }
}

impl CatalogConfig {
    /// Defaults overlaid with whatever the provider has set
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self, CatalogError> {
        let mut config = CatalogConfig::default();

        if let Some(v) = settings.get("root_directory") {
            config.root_directory = PathBuf::from(v);
        }
        if let Some(v) = settings.get("include_extensions") {
            config.include_extensions = v
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(v) = settings.get("catalog_path") {
            config.catalog_path = PathBuf::from(v);
        }
        if let Some(v) = settings.get("thumbnail_dir") {
            config.thumbnail_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(settings, "thumbnail_cache_max_bytes")? {
            config.thumbnail_cache_max_bytes = v;
        }
        if let Some(v) = parsed(settings, "worker_pool_size")? {
            config.worker_pool_size = v;
        }
        if let Some(v) = parsed::<u64>(settings, "refresh_interval_secs")? {
            config.refresh_interval_secs = (v > 0).then_some(v);
        }
        if let Some(v) = parsed(settings, "follow_symlinks")? {
            config.follow_symlinks = v;
        }
        if let Some(v) = parsed(settings, "scan_on_startup")? {
            config.scan_on_startup = v;
        }
        if let Some(v) = parsed(settings, "grid_rows")? {
            config.display.grid_rows = v;
        }
        if let Some(v) = parsed(settings, "grid_cols")? {
            config.display.grid_cols = v;
        }
        if let Some(v) = parsed(settings, "tile_width")? {
            config.display.tile_width = v;
        }
        if let Some(v) = parsed(settings, "tile_height")? {
            config.display.tile_height = v;
        }

        Ok(config)
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.max(1)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn thumbnail_settings(&self) -> ThumbnailSettings {
        ThumbnailSettings {
            max_width: self.display.tile_width.max(1),
            max_height: self.display.tile_height.max(1),
            max_cache_bytes: self.thumbnail_cache_max_bytes,
        }
    }
}

fn parsed<T>(settings: &dyn SettingsProvider, key: &str) -> Result<Option<T>, CatalogError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = settings.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| CatalogError::InvalidSetting {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}
