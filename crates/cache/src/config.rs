//! Cache configuration
//!
//! Capacity, disk quota, segment sizing and location of the frame cache. A
//! configuration can be built programmatically, read from environment variables
//! or loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::segment::{RANGE_ALIGN, RECORD_HEADER_LEN, SEGMENT_HEADER_LEN};

/// Name embedded in segment headers and the table of contents
pub const DEFAULT_CACHE_NAME: &str = "ViewerCache";

/// Bumped whenever the on-disk layout changes; files tagged otherwise are discarded
pub const CACHE_VERSION: &str = "v1.0.0";

const MB: usize = 1024 * 1024;

/// Configuration for a frame cache instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Cache name used in file names and headers
    pub cache_name: String,
    /// Layout version tag
    pub cache_version: String,
    /// Directory holding segment files and the table of contents
    pub cache_dir: PathBuf,
    /// Byte ceiling for entries held in the in-memory portion
    pub capacity_bytes: usize,
    /// Byte ceiling for all segment files together
    pub disk_quota_bytes: usize,
    /// Size of the data area of a regular segment file
    pub segment_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            cache_version: CACHE_VERSION.to_string(),
            cache_dir: Self::default_cache_dir(),
            capacity_bytes: 512 * MB,
            disk_quota_bytes: 2048 * MB,
            segment_size: 64 * MB,
        }
    }
}

/// On-disk representation, sizes in megabytes
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_quota_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segment_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Creates a configuration with sizes in megabytes.
    pub fn new(capacity_mb: usize, disk_quota_mb: usize, cache_dir: PathBuf) -> Self {
        Self {
            capacity_bytes: capacity_mb * MB,
            disk_quota_bytes: disk_quota_mb * MB,
            cache_dir,
            ..Self::default()
        }
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn with_capacity_mb(self, mb: usize) -> Self {
        self.with_capacity_bytes(mb * MB)
    }

    /// Sets the capacity to a fraction of `total_bytes` (e.g. installed RAM).
    pub fn with_capacity_fraction(self, fraction: f64, total_bytes: usize) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        self.with_capacity_bytes((total_bytes as f64 * fraction) as usize)
    }

    pub fn with_disk_quota_bytes(mut self, bytes: usize) -> Self {
        self.disk_quota_bytes = bytes;
        self
    }

    pub fn with_disk_quota_mb(self, mb: usize) -> Self {
        self.with_disk_quota_bytes(mb * MB)
    }

    pub fn with_segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/frame-cache/viewer
    /// - Linux: ~/.cache/frame-cache/viewer
    /// - Windows: %LOCALAPPDATA%\frame-cache\viewer
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("frame-cache").join("viewer")
        } else {
            PathBuf::from("cache/viewer")
        }
    }

    /// Checks that the sizes are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.is_empty() || self.cache_name.contains(['.', '/', '\\']) {
            return Err(ConfigError::InvalidValue("cache_name".to_string()));
        }
        if self.segment_size == 0 {
            return Err(ConfigError::InvalidValue("segment_size".to_string()));
        }
        // A frame as large as the capacity must fit in a dedicated segment.
        let overhead = SEGMENT_HEADER_LEN + RECORD_HEADER_LEN + RANGE_ALIGN;
        if self.disk_quota_bytes < self.capacity_bytes.saturating_add(overhead) {
            return Err(ConfigError::QuotaBelowCapacity {
                quota: self.disk_quota_bytes,
                capacity: self.capacity_bytes,
            });
        }
        if self.disk_quota_bytes < self.segment_size.saturating_add(SEGMENT_HEADER_LEN) {
            return Err(ConfigError::QuotaBelowSegment {
                quota: self.disk_quota_bytes,
                segment_size: self.segment_size,
            });
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// - `FRAME_CACHE_CAPACITY_MB`: in-memory capacity (default: 512)
    /// - `FRAME_CACHE_DISK_MB`: disk quota (default: 2048)
    /// - `FRAME_CACHE_SEGMENT_MB`: segment size (default: 64)
    /// - `FRAME_CACHE_DIR`: cache directory
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_mb("FRAME_CACHE_CAPACITY_MB")? {
            config.capacity_bytes = mb * MB;
        }
        if let Some(mb) = env_mb("FRAME_CACHE_DISK_MB")? {
            config.disk_quota_bytes = mb * MB;
        }
        if let Some(mb) = env_mb("FRAME_CACHE_SEGMENT_MB")? {
            config.segment_size = mb * MB;
        }
        if let Ok(val) = std::env::var("FRAME_CACHE_DIR") {
            config.cache_dir = PathBuf::from(val);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// ```toml
    /// capacity_mb = 512
    /// disk_quota_mb = 2048
    /// segment_mb = 64
    /// cache_dir = "/path/to/cache"
    /// ```
    ///
    /// Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(name) = file.cache_name {
            config.cache_name = name;
        }
        if let Some(mb) = file.capacity_mb {
            config.capacity_bytes = mb * MB;
        }
        if let Some(mb) = file.disk_quota_mb {
            config.disk_quota_bytes = mb * MB;
        }
        if let Some(mb) = file.segment_mb {
            config.segment_size = mb * MB;
        }
        if let Some(dir) = file.cache_dir {
            config.cache_dir = dir;
        }

        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            cache_name: Some(self.cache_name.clone()),
            capacity_mb: Some(self.capacity_mb()),
            disk_quota_mb: Some(self.disk_quota_mb()),
            segment_mb: Some(self.segment_size / MB),
            cache_dir: Some(self.cache_dir.clone()),
        };
        Ok(toml::to_string(&file)?)
    }

    pub fn capacity_mb(&self) -> usize {
        self.capacity_bytes / MB
    }

    pub fn disk_quota_mb(&self) -> usize {
        self.disk_quota_bytes / MB
    }

    /// Path of the persisted table of contents
    pub fn toc_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.toc.json", self.cache_name))
    }

    /// Tag written into segment headers and the table of contents
    pub fn version_tag(&self) -> String {
        format!("{}-{}", self.cache_name, self.cache_version)
    }
}

fn env_mb(name: &str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("disk quota of {quota} bytes cannot hold the capacity of {capacity} bytes plus segment overhead")]
    QuotaBelowCapacity { quota: usize, capacity: usize },
    #[error("disk quota of {quota} bytes cannot hold one segment of {segment_size} bytes")]
    QuotaBelowSegment { quota: usize, segment_size: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML write error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 4] = [
        "FRAME_CACHE_CAPACITY_MB",
        "FRAME_CACHE_DISK_MB",
        "FRAME_CACHE_SEGMENT_MB",
        "FRAME_CACHE_DIR",
    ];

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity_bytes, 512 * MB);
        assert_eq!(config.disk_quota_bytes, 2048 * MB);
        assert_eq!(config.segment_size, 64 * MB);
        assert_eq!(config.cache_version, CACHE_VERSION);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_capacity_mb(100)
            .with_disk_quota_mb(400)
            .with_segment_size(4096)
            .with_cache_dir("/custom/path")
            .with_cache_name("NodeCache");

        assert_eq!(config.capacity_bytes, 100 * MB);
        assert_eq!(config.disk_quota_bytes, 400 * MB);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.cache_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.toc_path(), PathBuf::from("/custom/path/NodeCache.toc.json"));
        assert_eq!(config.version_tag(), format!("NodeCache-{}", CACHE_VERSION));
    }

    #[test]
    fn test_capacity_fraction() {
        let config = CacheConfig::default().with_capacity_fraction(0.25, 8000);
        assert_eq!(config.capacity_bytes, 2000);

        let config = CacheConfig::default().with_capacity_fraction(3.0, 8000);
        assert_eq!(config.capacity_bytes, 8000);
    }

    #[test]
    fn test_validate() {
        let config = CacheConfig::new(100, 50, PathBuf::from("/tmp/x"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QuotaBelowCapacity { .. })
        ));

        // Equal sizes leave no room for segment and record headers
        let config = CacheConfig::new(100, 100, PathBuf::from("/tmp/x"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QuotaBelowCapacity { .. })
        ));

        let config = CacheConfig::default()
            .with_capacity_bytes(4000)
            .with_disk_quota_bytes(4000 + SEGMENT_HEADER_LEN + RECORD_HEADER_LEN + RANGE_ALIGN)
            .with_segment_size(4000);
        assert!(config.validate().is_ok());

        let config = config.with_segment_size(8192);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QuotaBelowSegment { .. })
        ));

        let config = CacheConfig::default().with_segment_size(0);
        assert!(config.validate().is_err());

        let config = CacheConfig::default().with_cache_name("bad.name");
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&VARS);

        env::set_var("FRAME_CACHE_CAPACITY_MB", "128");
        env::set_var("FRAME_CACHE_DISK_MB", "1024");
        env::set_var("FRAME_CACHE_SEGMENT_MB", "16");
        env::set_var("FRAME_CACHE_DIR", "/tmp/test-frame-cache");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.capacity_bytes, 128 * MB);
        assert_eq!(config.disk_quota_bytes, 1024 * MB);
        assert_eq!(config.segment_size, 16 * MB);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/test-frame-cache"));
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&VARS);

        for var in &VARS {
            env::remove_var(var);
        }
        env::set_var("FRAME_CACHE_CAPACITY_MB", "64");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.capacity_bytes, 64 * MB);
        assert_eq!(config.disk_quota_bytes, 2048 * MB);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&["FRAME_CACHE_CAPACITY_MB"]);

        env::set_var("FRAME_CACHE_CAPACITY_MB", "lots");
        assert!(CacheConfig::from_env().is_err());
    }

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CacheConfig::new(128, 512, PathBuf::from("/tmp/cache")).with_segment_size(8 * MB);
        let toml = config.to_toml().unwrap();
        let parsed = CacheConfig::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CacheConfig::from_toml("capacity_mb = 32\n").unwrap();
        assert_eq!(config.capacity_bytes, 32 * MB);
        assert_eq!(config.disk_quota_bytes, 2048 * MB);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(matches!(
            CacheConfig::from_toml("capacity_mb = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let config_path = temp.path().join("frame_cache.toml");

        let config = CacheConfig::new(16, 64, temp.path().join("cache"));
        config.save_to_file(&config_path).unwrap();

        let loaded = CacheConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);
    }
}
