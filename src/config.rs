//! Configuration management for the lumind daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file
//! that enables modules and sets location and daytime behaviour.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::RwLock;

use crate::message::Coordinates;

/// Main configuration structure for the lumind daemon.
///
/// Every section is optional; an empty file (or no file at all) runs every
/// module with its defaults.
///
/// # Example
///
/// ```yaml
/// version: 1
/// verbose: false
///
/// interface:
///   inhibit_disabled: false
///
/// location:
///   latitude: 45.46
///   longitude: 9.19
///
/// daytime:
///   sunrise: "07:00"
///   sunset: "19:30"
///   event_duration_secs: 1800
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Log at debug level.
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub interface: InterfaceCfg,

    #[serde(default)]
    pub location: LocationCfg,

    #[serde(default)]
    pub daytime: DaytimeCfg,
}

/// D-Bus interface module settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCfg {
    /// Keep the interface module registered but skip it at evaluation, so it
    /// ends up `Disabled` and never touches the session bus.
    #[serde(default)]
    pub disabled: bool,

    /// Do not serve `org.freedesktop.ScreenSaver`.
    #[serde(default)]
    pub inhibit_disabled: bool,
}

/// Location module settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationCfg {
    #[serde(default)]
    pub disabled: bool,

    /// Fixed latitude; together with `longitude` it disables lookups.
    #[serde(default)]
    pub latitude: Option<f64>,

    #[serde(default)]
    pub longitude: Option<f64>,

    /// Seconds to wait for a location before loading the cache file.
    #[serde(default = "defaults::fallback_timeout_secs")]
    pub fallback_timeout_secs: u64,

    /// Overrides the default cache file location.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for LocationCfg {
    fn default() -> Self {
        Self {
            disabled: false,
            latitude: None,
            longitude: None,
            fallback_timeout_secs: defaults::fallback_timeout_secs(),
            cache_file: None,
        }
    }
}

impl LocationCfg {
    /// Coordinates configured by the user, if both are present.
    pub fn fixed(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        }
    }

    /// Where the last known location is persisted.
    ///
    /// `$XDG_CACHE_HOME/lumind` or `~/.cache/lumind` unless overridden.
    pub fn cache_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cache_file {
            return Some(path.clone());
        }
        env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".cache")))
            .map(|dir| dir.join("lumind"))
    }
}

/// Daytime module settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaytimeCfg {
    #[serde(default)]
    pub disabled: bool,

    /// Fixed sunrise as `HH:MM`, local time.
    #[serde(default)]
    pub sunrise: Option<String>,

    /// Fixed sunset as `HH:MM`, local time.
    #[serde(default)]
    pub sunset: Option<String>,

    /// Length of the window around each event during which `InEvent` is set.
    #[serde(default = "defaults::event_duration_secs")]
    pub event_duration_secs: u64,
}

impl Default for DaytimeCfg {
    fn default() -> Self {
        Self {
            disabled: false,
            sunrise: None,
            sunset: None,
            event_duration_secs: defaults::event_duration_secs(),
        }
    }
}

impl DaytimeCfg {
    /// Both events are fixed, so no location is needed.
    pub fn has_fixed_events(&self) -> bool {
        self.sunrise.is_some() && self.sunset.is_some()
    }
}

/// Parses a daily event time written as `HH:MM`.
pub fn parse_event_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            verbose: false,
            interface: InterfaceCfg::default(),
            location: LocationCfg::default(),
            daytime: DaytimeCfg::default(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    ///
    /// # Example
    ///
    /// ```
    /// use lumind::config::Config;
    ///
    /// let mut config = Config::default();
    /// assert!(config.validate().is_ok());
    ///
    /// config.daytime.sunrise = Some("25:00".into());
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        let loc = &self.location;
        if loc.latitude.is_some() != loc.longitude.is_some() {
            anyhow::bail!("location needs both latitude and longitude, or neither");
        }
        if let Some(coords) = loc.fixed() {
            if !coords.is_valid() {
                anyhow::bail!(
                    "location {:.2} {:.2} is out of range",
                    coords.lat,
                    coords.lon
                );
            }
        }

        for (name, value) in [
            ("sunrise", &self.daytime.sunrise),
            ("sunset", &self.daytime.sunset),
        ] {
            if let Some(value) = value {
                if parse_event_time(value).is_none() {
                    anyhow::bail!("{name} '{value}' is not a valid HH:MM time");
                }
            }
        }

        if self.daytime.event_duration_secs == 0 {
            anyhow::bail!("daytime event_duration_secs must be positive");
        }
        Ok(())
    }
}

mod defaults {
    /// Seconds before the location module falls back to its cache.
    pub fn fallback_timeout_secs() -> u64 {
        3
    }

    /// Half an hour around sunrise and sunset.
    pub fn event_duration_secs() -> u64 {
        30 * 60
    }
}

fn locate_config() -> Option<PathBuf> {
    if let Ok(env_path) = env::var("LUMIND_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("lumind/config.yml");
        if cfg_dir.exists() {
            return Some(cfg_dir);
        }
    }

    let etc = Path::new("/etc/lumind/config.yml");
    if etc.exists() {
        return Some(etc.to_path_buf());
    }

    None
}

/// Configuration manager that handles both config data and file operations.
///
/// # Example
///
/// ```no_run
/// use lumind::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml"))).await?;
/// let verbose = config_manager.get().await.verbose;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. LUMIND_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/lumind/config.yml or ~/.config/lumind/config.yml
    /// 4. /etc/lumind/config.yml
    ///
    /// A missing file in the standard locations means defaults; an
    /// explicitly given path must exist.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = path.or_else(locate_config) else {
            info!("No configuration file found, using defaults");
            return Ok(Self::new(Config::default(), None));
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path).await?;

        Ok(Self::new(config, Some(config_path)))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// File the configuration came from; `None` when running on defaults.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    async fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            anyhow::bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
