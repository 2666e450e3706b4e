//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::queue::{CapacityConfigError, DEFAULT_POOL_SIZE, NodePool, PoolConfig};

mod cli;

pub use cli::{CliArgs, Command, DemoArgs, QueueOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "render-queue";
const ENV_PREFIX: &str = "RENDER_QUEUE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queued_rendering: QueuedRenderingSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct QueuedRenderingSettings {
    pub enabled: bool,
    pub pool: PoolConfig,
}

impl QueuedRenderingSettings {
    /// Construct the process-wide pool described by these settings.
    pub fn build_pool(&self) -> NodePool {
        if self.enabled {
            NodePool::new(self.pool)
        } else {
            NodePool::unbounded(self.pool.cache_enabled())
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid configuration for `queued_rendering.pool_size`: {0}")]
    Capacity(#[from] CapacityConfigError),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Demo(args)) => raw.apply_queue_overrides(&args.overrides),
        None => raw.apply_queue_overrides(&QueueOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    queued_rendering: RawQueuedRenderingSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_queue_overrides(&mut self, overrides: &QueueOverrides) {
        if let Some(size) = overrides.pool_size {
            self.queued_rendering.pool_size = Some(size);
        }
        if overrides.no_cache {
            self.queued_rendering.cache = Some(false);
        }
        if overrides.disable_queue {
            self.queued_rendering.enabled = Some(false);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let queued_rendering = build_queued_rendering_settings(raw.queued_rendering)?;
        let logging = build_logging_settings(raw.logging)?;

        Ok(Self {
            queued_rendering,
            logging,
        })
    }
}

fn build_queued_rendering_settings(
    queued: RawQueuedRenderingSettings,
) -> Result<QueuedRenderingSettings, LoadError> {
    let enabled = queued.enabled.unwrap_or(true);
    let cache = queued.cache.unwrap_or(true);
    let requested = queued
        .pool_size
        .unwrap_or(i64::try_from(DEFAULT_POOL_SIZE).unwrap_or(i64::MAX));

    let pool = PoolConfig::new(requested)?.cache(cache);

    Ok(QueuedRenderingSettings { enabled, pool })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueuedRenderingSettings {
    enabled: Option<bool>,
    pool_size: Option<i64>,
    cache: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests;
