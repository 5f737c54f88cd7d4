//! INI configuration file.
//!
//! ```ini
//! [dispatcher]
//! max_parallel = 5
//!
//! [task]
//! read_buffer_size = 4096
//! flush_buffer_size = 16384
//! sync_buffer_size = 65536
//! sync_interval_ms = 2000
//! progress_interval_ms = 3000
//! pre_allocate = auto
//! pass_if_already_completed = true
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 100
//! max_delay_ms = 30000
//!
//! [store]
//! remit_delay_ms = 1500
//!
//! [connection]
//! connect_timeout_secs = 30
//! read_timeout_secs = 60
//! user_agent = rangefetch/0.1.0
//!
//! [logging]
//! level = info
//! directory = /var/log/rangefetch
//! ```
//!
//! Missing sections and keys keep their defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use super::{EngineConfig, LoggingConfig};
use crate::error::ConfigError;
use crate::policy::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_SECS,
};

/// Location used when no config path is given: `<config dir>/rangefetch/config.ini`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rangefetch").join("config.ini"))
}

/// Settings loaded from an INI file.
#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Loads `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parses INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();
        let engine = &mut config.engine;

        if let Some(max_parallel) = value::<usize>(&ini, "dispatcher", "max_parallel")? {
            engine.max_parallel = max_parallel.max(1);
        }

        let task = &mut engine.task_defaults;
        if let Some(v) = value::<usize>(&ini, "task", "read_buffer_size")? {
            task.read_buffer_size = v.max(1);
        }
        if let Some(v) = value::<usize>(&ini, "task", "flush_buffer_size")? {
            task.flush_buffer_size = v;
        }
        if let Some(v) = value::<u64>(&ini, "task", "sync_buffer_size")? {
            task.sync_buffer_size = v;
        }
        if let Some(v) = value::<u64>(&ini, "task", "sync_interval_ms")? {
            task.sync_interval = Duration::from_millis(v);
        }
        if let Some(v) = value::<u64>(&ini, "task", "progress_interval_ms")? {
            task.progress_interval = Duration::from_millis(v);
        }
        if let Some(raw) = raw(&ini, "task", "pre_allocate") {
            task.pre_allocate = if raw.eq_ignore_ascii_case("auto") {
                None
            } else {
                Some(parse_bool("task", "pre_allocate", raw)?)
            };
        }
        if let Some(raw) = raw(&ini, "task", "pass_if_already_completed") {
            task.pass_if_already_completed = parse_bool("task", "pass_if_already_completed", raw)?;
        }

        let max_attempts = value::<u32>(&ini, "retry", "max_attempts")?;
        let initial_delay = value::<u64>(&ini, "retry", "initial_delay_ms")?;
        let max_delay = value::<u64>(&ini, "retry", "max_delay_ms")?;
        if max_attempts.is_some() || initial_delay.is_some() || max_delay.is_some() {
            engine.retry = RetryPolicy::ExponentialBackoff {
                max_attempts: max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
                initial_delay: Duration::from_millis(
                    initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY_MS),
                ),
                max_delay: max_delay
                    .map_or(Duration::from_secs(DEFAULT_MAX_DELAY_SECS), Duration::from_millis),
                multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            };
        }

        if let Some(v) = value::<u64>(&ini, "store", "remit_delay_ms")? {
            engine.remit_delay = (v > 0).then(|| Duration::from_millis(v));
        }

        if let Some(v) = value::<u64>(&ini, "connection", "connect_timeout_secs")? {
            engine.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = value::<u64>(&ini, "connection", "read_timeout_secs")? {
            engine.read_timeout = Duration::from_secs(v);
        }
        if let Some(v) = raw(&ini, "connection", "user_agent").filter(|v| !v.is_empty()) {
            engine.user_agent = v.to_string();
        }

        if let Some(v) = raw(&ini, "logging", "level").filter(|v| !v.is_empty()) {
            config.logging.level = v.to_string();
        }
        if let Some(v) = raw(&ini, "logging", "directory").filter(|v| !v.is_empty()) {
            config.logging.directory = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    /// Renders every setting, defaults included.
    pub fn to_ini_string(&self) -> String {
        let engine = &self.engine;
        let task = &engine.task_defaults;
        let mut ini = Ini::new();

        ini.with_section(Some("dispatcher"))
            .set("max_parallel", engine.max_parallel.to_string());

        ini.with_section(Some("task"))
            .set("read_buffer_size", task.read_buffer_size.to_string())
            .set("flush_buffer_size", task.flush_buffer_size.to_string())
            .set("sync_buffer_size", task.sync_buffer_size.to_string())
            .set("sync_interval_ms", task.sync_interval.as_millis().to_string())
            .set("progress_interval_ms", task.progress_interval.as_millis().to_string())
            .set(
                "pre_allocate",
                task.pre_allocate.map_or("auto".to_string(), |v| v.to_string()),
            )
            .set(
                "pass_if_already_completed",
                task.pass_if_already_completed.to_string(),
            );

        let (initial_delay, max_delay) = match &engine.retry {
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                ..
            } => (*initial_delay, *max_delay),
            RetryPolicy::Fixed { delay, .. } => (*delay, *delay),
            RetryPolicy::None => (Duration::ZERO, Duration::ZERO),
        };
        ini.with_section(Some("retry"))
            .set("max_attempts", engine.retry.max_attempts().to_string())
            .set("initial_delay_ms", initial_delay.as_millis().to_string())
            .set("max_delay_ms", max_delay.as_millis().to_string());

        ini.with_section(Some("store")).set(
            "remit_delay_ms",
            engine
                .remit_delay
                .map_or(0, |d| d.as_millis())
                .to_string(),
        );

        ini.with_section(Some("connection"))
            .set("connect_timeout_secs", engine.connect_timeout.as_secs().to_string())
            .set("read_timeout_secs", engine.read_timeout.as_secs().to_string())
            .set("user_agent", engine.user_agent.clone());

        let mut logging = ini.with_section(Some("logging"));
        logging.set("level", self.logging.level.clone());
        if let Some(dir) = &self.logging.directory {
            logging.set("directory", dir.display().to_string());
        }

        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = ini.write_to(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, self.to_ini_string()).map_err(io_error)
    }
}

fn raw<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))
        .and_then(|props| props.get(key))
        .map(str::trim)
}

fn value<T: FromStr>(ini: &Ini, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
    raw(ini, section, key)
        .map(|v| {
            v.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value: v.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
