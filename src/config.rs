use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::device::Retry;
use crate::encoder::PageFormat;
use crate::error::{Error, Result};
use crate::page::Geometry;
use crate::pipeline::PipelineOptions;
use crate::pixel::PixelStrategy;
use crate::watch::WatchOptions;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_output_dir")]
    output_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_retry_limit")]
    retry_limit: u32,
    #[serde(default = "default_retry_delay_ms")]
    retry_delay_ms: u64,
    #[serde(default = "default_blank_threshold")]
    blank_threshold: f64,
    #[serde(default = "default_pixel_strategy")]
    pixel_strategy: String,
    #[serde(default = "default_page_format")]
    page_format: String,
    #[serde(default = "default_jpeg_quality")]
    jpeg_quality: u8,
    #[serde(default = "default_worker_backlog")]
    worker_backlog: usize,
    #[serde(default = "default_debounce_ms")]
    debounce_ms: u64,
    #[serde(default = "default_fast_poll_ms")]
    fast_poll_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    idle_poll_ms: u64,
    #[serde(default = "default_reconnect_ms")]
    reconnect_ms: u64,
}

fn default_output_dir() -> String {
    "scans".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_retry_limit() -> u32 {
    120
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_blank_threshold() -> f64 {
    0.99
}

fn default_pixel_strategy() -> String {
    "table".into()
}

fn default_page_format() -> String {
    "jpeg".into()
}

fn default_jpeg_quality() -> u8 {
    PageFormat::DEFAULT_QUALITY
}

fn default_worker_backlog() -> usize {
    16
}

fn default_debounce_ms() -> u64 {
    5000
}

fn default_fast_poll_ms() -> u64 {
    50
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_reconnect_ms() -> u64 {
    1000
}

#[derive(Debug)]
pub struct Config {
    pub output_dir: PathBuf,
    pub log_level: String,
    pub format: PageFormat,
    pub retry: Retry,
    pub pipeline: PipelineOptions,
    pub watch: WatchOptions,
    pub reconnect: Duration,
}

fn parse_config(text: &str) -> Result<Config> {
    let raw: RawConfig =
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))?;

    let strategy: PixelStrategy = raw.pixel_strategy.parse()?;
    let format = match raw.page_format.parse()? {
        PageFormat::Jpeg { .. } if !(1..=100).contains(&raw.jpeg_quality) => {
            return Err(Error::Config(format!(
                "jpeg_quality {} is outside 1..=100",
                raw.jpeg_quality
            )));
        }
        PageFormat::Jpeg { .. } => PageFormat::Jpeg {
            quality: raw.jpeg_quality,
        },
        f => f,
    };
    if !(0.0..=1.0).contains(&raw.blank_threshold) {
        return Err(Error::Config(format!(
            "blank_threshold {} is outside 0..=1",
            raw.blank_threshold
        )));
    }
    if raw.retry_limit == 0 {
        return Err(Error::Config("retry_limit must be at least 1".into()));
    }
    if raw.worker_backlog == 0 {
        return Err(Error::Config("worker_backlog must be at least 1".into()));
    }

    Ok(Config {
        output_dir: PathBuf::from(raw.output_dir),
        log_level: raw.log_level,
        format,
        retry: Retry {
            limit: raw.retry_limit,
            delay: Duration::from_millis(raw.retry_delay_ms),
        },
        pipeline: PipelineOptions {
            geometry: Geometry::A4_600DPI,
            strategy,
            backlog: raw.worker_backlog,
            blank_threshold: raw.blank_threshold,
        },
        watch: WatchOptions {
            debounce: Duration::from_millis(raw.debounce_ms),
            fast_poll: Duration::from_millis(raw.fast_poll_ms),
            idle_poll: Duration::from_millis(raw.idle_poll_ms),
        },
        reconnect: Duration::from_millis(raw.reconnect_ms),
    })
}

pub fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read config {path}: {e}")))?;
    parse_config(&text)
}

/// Load `path`, or fall back to the built-in defaults.
pub fn load(path: Option<&str>) -> Result<Config> {
    match path {
        Some(p) => load_config(p),
        None => parse_config(""),
    }
}
