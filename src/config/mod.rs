use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use time::format_description::{self, OwnedFormatItem};

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "CopyBoard";
const APP_NAME: &str = "copyboard";

pub const DEFAULT_DATE_FORMAT: &str = "[year]. [month]. [day]. [hour]:[minute]:[second]";

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover() -> Result<Self> {
        let paths = ConfigPaths::discover()?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        if !self.paths.config_file.exists() {
            let mut default_cfg = AppConfig::default();
            default_cfg.post_load(&self.paths)?;
            self.write_default_config(&default_cfg)?;
            return Ok(default_cfg);
        }

        self.load()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let raw = fs::read_to_string(&self.paths.config_file)
            .with_context(|| format!("reading config {}", self.paths.config_file.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw).context("parsing config toml")?;
        cfg.post_load(&self.paths)?;
        Ok(cfg)
    }

    fn write_default_config(&self, cfg: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(cfg).context("serializing default config")?;
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::File::create(&self.paths.config_file)
            .with_context(|| format!("creating config {}", self.paths.config_file.display()))?;
        file.write_all(toml.as_bytes())
            .context("writing default config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
}

impl ConfigPaths {
    pub fn discover() -> Result<Self> {
        let override_config = env::var("COPYBOARD_CONFIG").ok().map(PathBuf::from);
        let override_data = env::var("COPYBOARD_DATA").ok().map(PathBuf::from);

        let project_dirs = ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
            .context("resolving XDG project directories")?;

        let config_dir = override_config
            .clone()
            .map(|p| {
                if p.is_dir() {
                    p
                } else {
                    p.parent().map(Path::to_path_buf).unwrap_or(p)
                }
            })
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());

        let config_file = override_config
            .filter(|p| p.is_file() || p.extension().is_some())
            .unwrap_or_else(|| config_dir.join("config.toml"));

        let data_dir = override_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf());
        let database_path = data_dir.join("copyboard.db");

        Ok(Self {
            config_dir,
            config_file,
            data_dir,
            database_path,
        })
    }

    /// Lays every path out below `root`; used by tests and portable setups.
    pub fn rooted_at(root: &Path) -> Self {
        let config_dir = root.join("config");
        let data_dir = root.join("data");
        Self {
            config_file: config_dir.join("config.toml"),
            database_path: data_dir.join("copyboard.db"),
            config_dir,
            data_dir,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub history: HistoryOptions,
    pub intake: IntakeOptions,
    pub cache: CacheOptions,
    pub search: SearchOptions,
    pub storage: StorageOptions,
    pub display: DisplayOptions,
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) -> Result<()> {
        self.storage
            .resolve(paths)
            .context("resolving storage paths")?;
        self.history.sanitize();
        self.display.sanitize();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryOptions {
    pub max_entries: usize,
    pub max_text_length: usize,
    pub min_text_length: usize,
    /// Entries at least this many characters long are stored compressed
    pub compression_threshold: usize,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            max_entries: 10,
            max_text_length: 10_000,
            min_text_length: 3,
            compression_threshold: crate::codec::DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl HistoryOptions {
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.max_entries == 0 {
            tracing::warn!("history.max_entries must be positive, using default");
            self.max_entries = defaults.max_entries;
        }
        let marker_len = crate::history::TRUNCATION_MARKER.chars().count();
        if self.max_text_length <= marker_len {
            tracing::warn!(
                max = self.max_text_length,
                marker_len,
                "history.max_text_length must exceed the truncation marker, using default"
            );
            self.max_text_length = defaults.max_text_length;
        }
        if self.min_text_length > self.max_text_length {
            tracing::warn!(
                min = self.min_text_length,
                max = self.max_text_length,
                "history.min_text_length exceeds max_text_length, clamping"
            );
            self.min_text_length = self.max_text_length;
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeOptions {
    /// Detection state used until the user toggles it for the first time
    pub enabled: bool,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "debounce_ms")]
    pub debounce: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "duplicate_window_ms")]
    pub duplicate_window: Duration,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(300),
            duplicate_window: Duration::from_millis(1000),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "ttl_ms")]
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub min_query_length: usize,
    /// 0 keeps every match
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            min_query_length: 2,
            max_results: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(skip)]
    pub database_path: PathBuf,
    pub wal_autocheckpoint: u32,
    pub write_behind: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            wal_autocheckpoint: 1000,
            write_behind: true,
        }
    }
}

impl StorageOptions {
    fn resolve(&mut self, paths: &ConfigPaths) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = paths.database_path.clone();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayOptions {
    pub date_format: String,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

impl DisplayOptions {
    fn sanitize(&mut self) {
        if let Err(err) = format_description::parse_owned::<1>(&self.date_format) {
            tracing::warn!(%err, format = %self.date_format, "invalid display.date_format, using default");
            self.date_format = DEFAULT_DATE_FORMAT.to_string();
        }
    }

    pub fn date_format(&self) -> Result<OwnedFormatItem> {
        format_description::parse_owned::<1>(&self.date_format)
            .with_context(|| format!("parsing date format {:?}", self.date_format))
    }
}
