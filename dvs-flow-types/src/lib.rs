//! Core type definitions for the DVS event-based optical flow pipeline.
//!
//! This crate provides the event and flow-vector types exchanged between the
//! estimator and its sinks, the sensor geometry type, and the serde
//! configuration tree with the runtime defaults.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sign of the brightness change reported by a DVS pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    /// Brightness decrease.
    Off,
    /// Brightness increase.
    On,
}

impl Polarity {
    /// Numeric form used by the CSV sink and the AEDAT address encoding.
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            Polarity::Off => 0,
            Polarity::On => 1,
        }
    }

    #[inline]
    pub fn from_bool(on: bool) -> Self {
        if on {
            Polarity::On
        } else {
            Polarity::Off
        }
    }
}

/// A single address-event as delivered by the sensor driver.
///
/// Timestamps are microseconds, non-decreasing within a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolarityEvent {
    pub x: u16,
    pub y: u16,
    pub timestamp: i64,
    pub polarity: Polarity,
}

/// An event annotated (at most once) with a local flow estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub x: u16,
    pub y: u16,
    pub timestamp: i64,
    pub polarity: Polarity,
    /// Horizontal flow, pixels per second.
    pub u: f32,
    /// Vertical flow, pixels per second.
    pub v: f32,
    /// Undistorted event x coordinate.
    pub xu: f32,
    /// Undistorted event y coordinate.
    pub yu: f32,
    pub has_flow: bool,
}

impl From<PolarityEvent> for FlowEvent {
    fn from(e: PolarityEvent) -> Self {
        Self {
            x: e.x,
            y: e.y,
            timestamp: e.timestamp,
            polarity: e.polarity,
            u: 0.0,
            v: 0.0,
            xu: e.x as f32,
            yu: e.y as f32,
            has_flow: false,
        }
    }
}

impl FlowEvent {
    /// Flow magnitude in pixels per second.
    #[inline]
    pub fn speed(&self) -> f32 {
        (self.u * self.u + self.v * self.v).sqrt()
    }
}

/// Pixel dimensions of the sensor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSize {
    pub width: u16,
    pub height: u16,
}

impl SensorSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }

    /// Events on the outermost pixel ring never get a plane fit.
    #[inline]
    pub fn is_border(&self, x: u16, y: u16) -> bool {
        x == 0 || y == 0 || x + 1 >= self.width || y + 1 >= self.height
    }

    #[inline]
    pub fn n_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Where accepted flow vectors are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    None,
    File,
    Serial,
    Both,
}

impl OutputMode {
    #[inline]
    pub fn has_file(&self) -> bool {
        matches!(self, OutputMode::File | OutputMode::Both)
    }

    #[inline]
    pub fn has_serial(&self) -> bool {
        matches!(self, OutputMode::Serial | OutputMode::Both)
    }
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::File
    }
}

/// One row of the per-packet timing log.
///
/// `delay_us` is wallclock minus event time, relative to a monotonic
/// reference captured on the first event. The `wx`, `wy` and `d` columns are
/// kept for column-layout compatibility with downstream analysis scripts and
/// are always written as 0.0 here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingRow {
    pub t_last: i64,
    pub delay_us: i64,
    pub flow_rate: f32,
    pub wx: f32,
    pub wy: f32,
    pub d: f32,
}

fn default_refractory_period_us() -> i64 {
    100_000
}

fn default_dt_max_us() -> i64 {
    2_000_000
}

fn default_v_max() -> f32 {
    1000.0
}

fn default_dx() -> u8 {
    2
}

fn default_n_reject() -> u32 {
    2
}

fn default_max_nrmse() -> f32 {
    0.3
}

fn default_dt_stop_factor() -> f32 {
    3.0
}

fn default_n_min() -> u32 {
    8
}

fn default_rate_setpoint() -> f32 {
    2500.0
}

fn default_rate_tau() -> f32 {
    0.01
}

/// Parameters of the local plane-fit flow estimator.
///
/// All values can be re-read at runtime; a change of `dx` additionally
/// requires regenerating the search kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowParamsConfig {
    /// Per-pixel admission floor, microseconds.
    #[serde(default = "default_refractory_period_us")]
    pub refractory_period_us: i64,
    /// Oldest neighbor timestamp admitted into a fit, microseconds.
    #[serde(default = "default_dt_max_us")]
    pub dt_max_us: i64,
    /// Flow speeds above this are rejected, pixels per second.
    #[serde(default = "default_v_max")]
    pub v_max: f32,
    /// Search kernel half-size. Valid range is 1-5.
    #[serde(default = "default_dx")]
    pub dx: u8,
    /// Maximum number of outlier-rejection iterations.
    #[serde(default = "default_n_reject")]
    pub n_reject: u32,
    /// Normalized RMS residual accepted as a good fit.
    #[serde(default = "default_max_nrmse")]
    pub max_nrmse: f32,
    /// Support-truncation multiplier of the adaptive timestamp cutoff.
    #[serde(default = "default_dt_stop_factor")]
    pub dt_stop_factor: f32,
    /// Minimum number of neighbors required for a fit.
    #[serde(default = "default_n_min")]
    pub n_min: u32,
}

impl Default for FlowParamsConfig {
    fn default() -> Self {
        Self {
            refractory_period_us: default_refractory_period_us(),
            dt_max_us: default_dt_max_us(),
            v_max: default_v_max(),
            dx: default_dx(),
            n_reject: default_n_reject(),
            max_nrmse: default_max_nrmse(),
            dt_stop_factor: default_dt_stop_factor(),
            n_min: default_n_min(),
        }
    }
}

/// Parameters of the adaptive event-rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    /// Turn adaptive admission gating on.
    #[serde(default)]
    pub enabled: bool,
    /// Adaptive rate target, flow events per second.
    #[serde(default = "default_rate_setpoint")]
    pub setpoint: f32,
    /// IIR time constant of the rate estimator, seconds.
    #[serde(default = "default_rate_tau")]
    pub tau: f32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            setpoint: default_rate_setpoint(),
            tau: default_rate_tau(),
        }
    }
}

/// Output sink selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub mode: OutputMode,
}

/// The full runtime configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    #[serde(default)]
    pub flow: FlowParamsConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Parse a configuration tree from a TOML file.
pub fn config_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<FlowConfig> {
    let buf = std::fs::read_to_string(path)?;
    let cfg: FlowConfig = toml::from_str(&buf)?;
    Ok(cfg)
}
