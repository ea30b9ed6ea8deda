use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use aedat_log::AedatWriter;
use dvs_flow_output::{FlowSender, TimingLog};
use dvs_flow_types::{FlowConfig, FlowEvent, Polarity, PolarityEvent, SensorSize, TimingRow};

use crate::calibration::UndistortionMap;
use crate::errors::Result;
use crate::gate::{check_admission, Admission};
use crate::params::LiveParams;
use crate::plane_fit::{fit_plane, FitRejection};
use crate::rate::RateEstimator;
use crate::regularization::RegularizationFilter;
use crate::timestamp_map::TimestampMap;

/// What became of one processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Skipped by the per-pixel refractory period.
    Refractory,
    /// Shed by the adaptive rate limiter.
    RateLimited,
    /// The fitter produced no flow vector.
    Rejected(FitRejection),
    /// The regularization filter found no supporting neighbor.
    RegularizationRejected,
    /// A flow vector was produced and queued to the sink.
    Queued,
    /// A flow vector was produced but the output ring was full.
    RingFull,
}

/// Per-pipeline observables. Rejections and drops are normal outcomes and
/// are counted, not logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub events_in: u64,
    pub refractory_skips: u64,
    pub rate_limited: u64,
    pub rejected_insufficient_support: u64,
    pub rejected_singular_system: u64,
    pub rejected_velocity_out_of_range: u64,
    pub rejected_not_a_number: u64,
    pub regularization_rejects: u64,
    pub flows_accepted: u64,
    pub ring_full_drops: u64,
}

/// Per-event orchestration, executed on the thread delivering events from
/// the sensor driver.
///
/// For each event: archive it to the raw log, gate admission, update the
/// polarity's timestamp grid, run the plane fit, annotate, refresh the rate
/// estimate, and push the result to the output ring without ever blocking.
pub struct FlowPipeline {
    size: SensorSize,
    ts_on: TimestampMap,
    ts_off: TimestampMap,
    undistortion: Arc<UndistortionMap>,
    params: Arc<LiveParams>,
    rate: RateEstimator,
    last_flow_t: i64,
    regularizer: Option<RegularizationFilter>,
    raw_log: Option<AedatWriter<Box<dyn Write + Send>>>,
    timing_log: Option<TimingLog>,
    ring: FlowSender,
    /// Monotonic reference captured on the first event, paired with that
    /// event's timestamp.
    t_ref: Option<(Instant, i64)>,
    stats: PipelineStats,
}

impl FlowPipeline {
    pub fn new(
        config: &FlowConfig,
        size: SensorSize,
        undistortion: Arc<UndistortionMap>,
        ring: FlowSender,
    ) -> Result<Self> {
        let params = Arc::new(LiveParams::new(config)?);
        Ok(Self {
            size,
            ts_on: TimestampMap::new(size),
            ts_off: TimestampMap::new(size),
            undistortion,
            params,
            rate: RateEstimator::new(),
            last_flow_t: 0,
            regularizer: None,
            raw_log: None,
            timing_log: None,
            ring,
            t_ref: None,
            stats: PipelineStats::default(),
        })
    }

    /// Archive every input event to this raw AEDAT log, admitted or not.
    pub fn set_raw_log(&mut self, log: AedatWriter<Box<dyn Write + Send>>) {
        self.raw_log = Some(log);
    }

    /// Record one timing row per processed packet.
    pub fn set_timing_log(&mut self, log: TimingLog) {
        self.timing_log = Some(log);
    }

    /// Enable post-fit neighborhood regularization.
    pub fn set_regularizer(&mut self, filter: RegularizationFilter) {
        self.regularizer = Some(filter);
    }

    /// Handle for live parameter updates from a configuration thread.
    pub fn params(&self) -> Arc<LiveParams> {
        self.params.clone()
    }

    pub fn size(&self) -> SensorSize {
        self.size
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Current filtered flow-event rate, events per second.
    pub fn flow_rate(&self) -> f32 {
        self.rate.rate()
    }

    /// Last admitted timestamp at a pixel for one polarity; zero if never
    /// touched.
    pub fn last_pixel_timestamp(&self, polarity: Polarity, x: u16, y: u16) -> i64 {
        let grid = match polarity {
            Polarity::On => &self.ts_on,
            Polarity::Off => &self.ts_off,
        };
        grid.get(x as i32, y as i32)
    }

    /// Process one packet of events and report its timing row.
    pub fn process_packet(&mut self, events: &[PolarityEvent]) -> Option<TimingRow> {
        for e in events {
            self.process_event(e);
        }
        let last = events.last()?;
        let (ref_instant, ref_t) = *self.t_ref.as_ref()?;
        let elapsed_us = ref_instant.elapsed().as_micros() as i64;
        let row = TimingRow {
            t_last: last.timestamp,
            delay_us: elapsed_us - (last.timestamp - ref_t),
            flow_rate: self.rate.rate(),
            wx: 0.0,
            wy: 0.0,
            d: 0.0,
        };
        if let Some(log) = self.timing_log.as_mut() {
            if let Err(e) = log.write_row(&row) {
                warn!("timing log write failed ({e}); timing log disabled");
                self.timing_log = None;
            }
        }
        Some(row)
    }

    /// Process a single event through the full per-event sequence.
    pub fn process_event(&mut self, e: &PolarityEvent) -> EventDisposition {
        self.stats.events_in += 1;

        // Archive first, regardless of admission.
        if let Some(log) = self.raw_log.as_mut() {
            if let Err(err) = log.write_event(e) {
                warn!("raw event log write failed ({err}); raw logging disabled");
                self.raw_log = None;
            }
        }
        if self.t_ref.is_none() {
            self.t_ref = Some((Instant::now(), e.timestamp));
        }

        let grid = match e.polarity {
            Polarity::On => &mut self.ts_on,
            Polarity::Off => &mut self.ts_off,
        };

        let rate_setpoint = if self.params.rate_enabled() {
            Some(self.params.rate_setpoint())
        } else {
            None
        };
        match check_admission(
            e.timestamp,
            grid.get(e.x as i32, e.y as i32),
            self.params.refractory_period_us(),
            rate_setpoint,
            self.last_flow_t,
        ) {
            Admission::Refractory => {
                self.stats.refractory_skips += 1;
                return EventDisposition::Refractory;
            }
            Admission::RateLimited => {
                self.stats.rate_limited += 1;
                return EventDisposition::RateLimited;
            }
            Admission::Admitted => {}
        }

        // The only write path to the timestamp memory.
        grid.set(e.x as i32, e.y as i32, e.timestamp);

        let fit_params = self.params.fit_params();
        let fit = {
            let kernel = self.params.kernel();
            fit_plane(
                e.x,
                e.y,
                e.timestamp,
                grid,
                &kernel,
                self.undistortion.as_ref(),
                &fit_params,
            )
        };
        let fit = match fit {
            Ok(fit) => fit,
            Err(reason) => {
                match reason {
                    FitRejection::InsufficientSupport => {
                        self.stats.rejected_insufficient_support += 1
                    }
                    FitRejection::SingularSystem => self.stats.rejected_singular_system += 1,
                    FitRejection::VelocityOutOfRange => {
                        self.stats.rejected_velocity_out_of_range += 1
                    }
                    FitRejection::NotANumber => self.stats.rejected_not_a_number += 1,
                }
                return EventDisposition::Rejected(reason);
            }
        };

        let mut out: FlowEvent = (*e).into();
        out.u = fit.u;
        out.v = fit.v;
        out.xu = fit.xu;
        out.yu = fit.yu;
        out.has_flow = true;

        if let Some(reg) = self.regularizer.as_mut() {
            if !reg.check_and_store(&out) {
                out.has_flow = false;
                self.stats.regularization_rejects += 1;
                return EventDisposition::RegularizationRejected;
            }
        }

        let dt = e.timestamp - self.last_flow_t;
        if dt > 0 {
            self.rate.update(dt, self.params.rate_tau());
        }
        self.last_flow_t = e.timestamp;
        self.stats.flows_accepted += 1;

        if self.ring.try_push(out) {
            EventDisposition::Queued
        } else {
            self.stats.ring_full_drops += 1;
            EventDisposition::RingFull
        }
    }

    /// Close the raw and timing logs and report the run counters.
    pub fn finish(&mut self) -> Result<PipelineStats> {
        if let Some(mut log) = self.raw_log.take() {
            log.close()?;
        }
        if let Some(mut log) = self.timing_log.take() {
            log.flush()?;
        }
        info!(
            "pipeline finished: {} events in, {} flow vectors, {} ring-full drops",
            self.stats.events_in, self.stats.flows_accepted, self.stats.ring_full_drops
        );
        Ok(self.stats)
    }
}
