//! Event-driven local plane-fit optical flow estimation.
//!
//! For each incoming DVS event the estimator fits a spatiotemporal plane
//! `a*dx + b*dy + tau = 0` to the timestamps of recent spatially adjacent
//! events and reports the flow vector `(a,b)/(a^2+b^2)` in pixels per
//! second. Admission is gated by a per-pixel refractory period and an
//! optional adaptive rate limiter; accepted vectors are handed to a bounded
//! non-blocking output ring while a raw AEDAT logger archives every input
//! event.

mod calibration;
mod errors;
mod gate;
mod kernel;
mod params;
mod pipeline;
mod plane_fit;
mod rate;
mod regularization;
mod timestamp_map;

pub use crate::calibration::UndistortionMap;
pub use crate::errors::{Error, Result};
pub use crate::gate::{check_admission, Admission};
pub use crate::kernel::{SearchKernel, MAX_KERNEL_DX, MAX_KERNEL_LEN};
pub use crate::params::LiveParams;
pub use crate::pipeline::{EventDisposition, FlowPipeline, PipelineStats};
pub use crate::plane_fit::{fit_plane, FitParams, FitRejection, PlaneFit};
pub use crate::rate::RateEstimator;
pub use crate::regularization::{RegularizationConfig, RegularizationFilter};
pub use crate::timestamp_map::TimestampMap;
