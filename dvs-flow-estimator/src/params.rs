use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use tracing::info;

use dvs_flow_types::FlowConfig;

use crate::errors::Result;
use crate::kernel::SearchKernel;
use crate::plane_fit::FitParams;

/// Live-tunable estimator parameters, shared between the event-processing
/// thread and a configuration thread.
///
/// Scalars are unsynchronized atomic loads; floats are stored as their bit
/// patterns. The search kernel is the only locked state: a `dx` change
/// regenerates it under the write lock while the fitter holds the read lock
/// for the duration of one fit.
pub struct LiveParams {
    refractory_period_us: AtomicI64,
    dt_max_us: AtomicI64,
    v_max_bits: AtomicU32,
    n_min: AtomicU32,
    n_reject: AtomicU32,
    max_nrmse_bits: AtomicU32,
    dt_stop_factor_bits: AtomicU32,
    rate_enabled: AtomicBool,
    rate_setpoint_bits: AtomicU32,
    rate_tau_bits: AtomicU32,
    kernel: RwLock<SearchKernel>,
}

impl LiveParams {
    pub fn new(cfg: &FlowConfig) -> Result<Self> {
        let kernel = SearchKernel::new(cfg.flow.dx)?;
        Ok(Self {
            refractory_period_us: AtomicI64::new(cfg.flow.refractory_period_us),
            dt_max_us: AtomicI64::new(cfg.flow.dt_max_us),
            v_max_bits: AtomicU32::new(cfg.flow.v_max.to_bits()),
            n_min: AtomicU32::new(cfg.flow.n_min),
            n_reject: AtomicU32::new(cfg.flow.n_reject),
            max_nrmse_bits: AtomicU32::new(cfg.flow.max_nrmse.to_bits()),
            dt_stop_factor_bits: AtomicU32::new(cfg.flow.dt_stop_factor.to_bits()),
            rate_enabled: AtomicBool::new(cfg.rate.enabled),
            rate_setpoint_bits: AtomicU32::new(cfg.rate.setpoint.to_bits()),
            rate_tau_bits: AtomicU32::new(cfg.rate.tau.to_bits()),
            kernel: RwLock::new(kernel),
        })
    }

    /// Apply a full configuration update. Scalar updates are plain atomic
    /// stores; a changed `dx` regenerates the kernel under the exclusive
    /// lock. An invalid `dx` leaves every parameter unchanged.
    pub fn apply(&self, cfg: &FlowConfig) -> Result<()> {
        if cfg.flow.dx != self.kernel_half_size() {
            let new_kernel = SearchKernel::new(cfg.flow.dx)?;
            let mut guard = self.kernel.write().unwrap();
            info!(
                "search kernel regenerated: dx {} -> {}",
                guard.half_size(),
                cfg.flow.dx
            );
            *guard = new_kernel;
        }
        self.refractory_period_us
            .store(cfg.flow.refractory_period_us, Ordering::Relaxed);
        self.dt_max_us.store(cfg.flow.dt_max_us, Ordering::Relaxed);
        self.v_max_bits
            .store(cfg.flow.v_max.to_bits(), Ordering::Relaxed);
        self.n_min.store(cfg.flow.n_min, Ordering::Relaxed);
        self.n_reject.store(cfg.flow.n_reject, Ordering::Relaxed);
        self.max_nrmse_bits
            .store(cfg.flow.max_nrmse.to_bits(), Ordering::Relaxed);
        self.dt_stop_factor_bits
            .store(cfg.flow.dt_stop_factor.to_bits(), Ordering::Relaxed);
        self.rate_enabled.store(cfg.rate.enabled, Ordering::Relaxed);
        self.rate_setpoint_bits
            .store(cfg.rate.setpoint.to_bits(), Ordering::Relaxed);
        self.rate_tau_bits
            .store(cfg.rate.tau.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    pub fn refractory_period_us(&self) -> i64 {
        self.refractory_period_us.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rate_enabled(&self) -> bool {
        self.rate_enabled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rate_setpoint(&self) -> f32 {
        f32::from_bits(self.rate_setpoint_bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn rate_tau(&self) -> f32 {
        f32::from_bits(self.rate_tau_bits.load(Ordering::Relaxed))
    }

    pub fn kernel_half_size(&self) -> u8 {
        self.kernel.read().unwrap().half_size()
    }

    /// Shared-mode kernel access for the duration of one fit.
    pub fn kernel(&self) -> RwLockReadGuard<'_, SearchKernel> {
        self.kernel.read().unwrap()
    }

    /// Snapshot the fit parameters for one fit.
    pub fn fit_params(&self) -> FitParams {
        FitParams {
            dt_max_us: self.dt_max_us.load(Ordering::Relaxed),
            v_max: f32::from_bits(self.v_max_bits.load(Ordering::Relaxed)),
            n_min: self.n_min.load(Ordering::Relaxed) as usize,
            n_reject: self.n_reject.load(Ordering::Relaxed),
            max_nrmse: f32::from_bits(self.max_nrmse_bits.load(Ordering::Relaxed)),
            dt_stop_factor: f32::from_bits(self.dt_stop_factor_bits.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[test]
    fn snapshot_reflects_config() {
        let cfg = FlowConfig::default();
        let params = LiveParams::new(&cfg).unwrap();
        let fit = params.fit_params();
        assert_eq!(fit.dt_max_us, 2_000_000);
        assert_eq!(fit.v_max, 1000.0);
        assert_eq!(fit.n_min, 8);
        assert_eq!(fit.n_reject, 2);
        assert_eq!(params.kernel_half_size(), 2);
        assert_eq!(params.kernel().len(), 24);
    }

    #[test]
    fn apply_updates_scalars_and_kernel() {
        let mut cfg = FlowConfig::default();
        let params = LiveParams::new(&cfg).unwrap();
        cfg.flow.dx = 3;
        cfg.flow.v_max = 500.0;
        cfg.rate.enabled = true;
        params.apply(&cfg).unwrap();
        assert_eq!(params.kernel_half_size(), 3);
        assert_eq!(params.kernel().len(), 48);
        assert_eq!(params.fit_params().v_max, 500.0);
        assert!(params.rate_enabled());
    }

    #[test]
    fn invalid_dx_rejected_without_side_effects() {
        let mut cfg = FlowConfig::default();
        let params = LiveParams::new(&cfg).unwrap();
        cfg.flow.dx = 9;
        cfg.flow.v_max = 1.0;
        let res = params.apply(&cfg);
        assert!(matches!(res, Err(Error::InvalidKernelDx(9))));
        assert_eq!(params.kernel_half_size(), 2);
        assert_eq!(params.fit_params().v_max, 1000.0);
    }

    #[test]
    fn init_fails_on_invalid_dx() {
        let mut cfg = FlowConfig::default();
        cfg.flow.dx = 0;
        assert!(matches!(
            LiveParams::new(&cfg),
            Err(Error::InvalidKernelDx(0))
        ));
    }
}
