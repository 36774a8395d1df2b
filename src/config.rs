//! Configuration for the conversion cache and its pipeline.
//!
//! All behaviour is controlled through [`CacheConfig`], built via
//! [`CacheConfigBuilder`]. Collaborators (store, converter, notifier) are
//! constructed separately and handed to the service; the config only holds
//! the knobs they and the coordinator read.

use crate::error::ConversionError;
use crate::format::FormatPair;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the default data directory.
pub const DATA_DIR_ENV: &str = "DOCCACHE_DATA_DIR";

/// Default upload limit: 8 MiB.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 8 << 20;

/// Configuration for the conversion cache.
///
/// # Example
/// ```rust
/// use doccache::{CacheConfig, Format, FormatPair};
///
/// let config = CacheConfig::builder()
///     .db_path("/tmp/doccache/conversions.db")
///     .formats(FormatPair::new(Format::Pptx, Format::Pdf))
///     .converter_timeout_secs(300)
///     .build()
///     .unwrap();
/// assert_eq!(config.formats.a, Format::Pptx);
/// ```
#[derive(Clone)]
pub struct CacheConfig {
    /// SQLite database file. Default: see [`default_db_path`].
    pub db_path: PathBuf,

    /// The two formats this cache tracks. Default: docx ⇄ pdf.
    pub formats: FormatPair,

    /// Largest accepted input in bytes. Default: 8 MiB.
    pub max_input_bytes: usize,

    /// Upper bound for one external converter call. Default: 120.
    pub converter_timeout_secs: u64,

    /// Upper bound for one store operation (lookup or insert). Default: 10.
    pub store_timeout_secs: u64,

    /// How long SQLite waits on another writer's lock. Default: 5000.
    pub sqlite_busy_timeout_ms: u64,

    /// Upper bound for one notifier call. Default: 30.
    pub notifier_timeout_secs: u64,

    /// Requests processed at once by batch entry points. Default: 4.
    pub concurrency: usize,

    /// Collapse concurrent identical requests into one converter call. Default: true.
    pub single_flight: bool,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

/// Default database location: `$DOCCACHE_DATA_DIR/conversions.db`, else the
/// platform data directory (`~/.local/share/doccache/conversions.db` on Linux).
pub fn default_db_path() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("conversions.db");
        }
    }

    let base = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("doccache").join("conversions.db")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            formats: FormatPair::default(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            converter_timeout_secs: 120,
            store_timeout_secs: 10,
            sqlite_busy_timeout_ms: 5000,
            notifier_timeout_secs: 30,
            concurrency: 4,
            single_flight: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("db_path", &self.db_path)
            .field("formats", &self.formats)
            .field("max_input_bytes", &self.max_input_bytes)
            .field("converter_timeout_secs", &self.converter_timeout_secs)
            .field("store_timeout_secs", &self.store_timeout_secs)
            .field("sqlite_busy_timeout_ms", &self.sqlite_busy_timeout_ms)
            .field("notifier_timeout_secs", &self.notifier_timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("single_flight", &self.single_flight)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl CacheConfig {
    /// Create a new builder for `CacheConfig`.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn converter_timeout(&self) -> Duration {
        Duration::from_secs(self.converter_timeout_secs)
    }

    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.notifier_timeout_secs)
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    pub fn formats(mut self, pair: FormatPair) -> Self {
        self.config.formats = pair;
        self
    }

    pub fn max_input_bytes(mut self, n: usize) -> Self {
        self.config.max_input_bytes = n;
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter_timeout_secs = secs;
        self
    }

    pub fn store_timeout_secs(mut self, secs: u64) -> Self {
        self.config.store_timeout_secs = secs;
        self
    }

    pub fn sqlite_busy_timeout_ms(mut self, ms: u64) -> Self {
        self.config.sqlite_busy_timeout_ms = ms;
        self
    }

    pub fn notifier_timeout_secs(mut self, secs: u64) -> Self {
        self.config.notifier_timeout_secs = secs;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn single_flight(mut self, v: bool) -> Self {
        self.config.single_flight = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<CacheConfig, ConversionError> {
        let c = &self.config;
        if c.formats.a == c.formats.b {
            return Err(ConversionError::InvalidConfig(format!(
                "format pair needs two different formats, got {}",
                c.formats
            )));
        }
        if c.max_input_bytes == 0 {
            return Err(ConversionError::InvalidConfig(
                "max_input_bytes must be ≥ 1".into(),
            ));
        }
        for (name, v) in [
            ("converter_timeout_secs", c.converter_timeout_secs),
            ("store_timeout_secs", c.store_timeout_secs),
            ("sqlite_busy_timeout_ms", c.sqlite_busy_timeout_ms),
            ("notifier_timeout_secs", c.notifier_timeout_secs),
        ] {
            if v == 0 {
                return Err(ConversionError::InvalidConfig(format!("{name} must be ≥ 1")));
            }
        }
        if c.concurrency == 0 {
            return Err(ConversionError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.db_path.as_os_str().is_empty() {
            return Err(ConversionError::InvalidConfig(
                "db_path must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    #[test]
    fn defaults_build() {
        let config = CacheConfig::builder().build().unwrap();
        assert_eq!(config.formats, FormatPair::default());
        assert_eq!(config.max_input_bytes, 8 * 1024 * 1024);
        assert_eq!(config.converter_timeout(), Duration::from_secs(120));
        assert!(config.single_flight);
        assert!(config.db_path.ends_with("conversions.db"));
    }

    #[test]
    fn rejects_degenerate_pair() {
        let err = CacheConfig::builder()
            .formats(FormatPair::new(Format::Pdf, Format::Pdf))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("two different formats"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = CacheConfig::builder()
            .store_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("store_timeout_secs"));

        let err = CacheConfig::builder()
            .sqlite_busy_timeout_ms(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("sqlite_busy_timeout_ms"));
    }

    #[test]
    fn concurrency_is_clamped() {
        let config = CacheConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn debug_hides_callback() {
        let s = format!("{:?}", CacheConfig::default());
        assert!(s.contains("CacheConfig"));
        assert!(s.contains("progress_callback: None"));
    }
}
