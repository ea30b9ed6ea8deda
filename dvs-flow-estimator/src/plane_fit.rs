use crate::calibration::UndistortionMap;
use crate::kernel::{SearchKernel, MAX_KERNEL_LEN};
use crate::timestamp_map::TimestampMap;

const FLT_ZERO_EPSILON: f32 = 1.0e-10;
const SECONDS_TO_MICROSECONDS: f32 = 1.0e6;

/// Why a fit produced no flow vector. Rejections are the normal outcome for
/// most events; they are counted, not logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FitRejection {
    InsufficientSupport,
    SingularSystem,
    VelocityOutOfRange,
    NotANumber,
}

/// An accepted local plane fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFit {
    /// Horizontal flow, pixels per second.
    pub u: f32,
    /// Vertical flow, pixels per second.
    pub v: f32,
    /// Undistorted coordinates of the triggering event.
    pub xu: f32,
    pub yu: f32,
    /// Neighbors supporting the accepted fit.
    pub n_support: usize,
    /// Normalized mean-squared residual of the accepted fit.
    pub nmse: f32,
}

/// Snapshot of the fit parameters, immutable for the duration of one fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParams {
    pub dt_max_us: i64,
    pub v_max: f32,
    pub n_min: usize,
    pub n_reject: u32,
    pub max_nrmse: f32,
    pub dt_stop_factor: f32,
}

#[derive(Clone, Copy, Default)]
struct Neighbor {
    dx_px: i8,
    dy_px: i8,
    dt: i64,
}

/// Fit a plane `a*dx + b*dy + tau = 0` to the neighborhood timestamps of the
/// event at (x,y,t) and extract the flow vector `(a,b)/(a^2+b^2)`.
///
/// The normal-equation sums are accumulated once and decremented in place
/// during outlier rejection instead of refitting from scratch.
pub fn fit_plane(
    x: u16,
    y: u16,
    t: i64,
    grid: &TimestampMap,
    kernel: &SearchKernel,
    undistortion: &UndistortionMap,
    params: &FitParams,
) -> Result<PlaneFit, FitRejection> {
    // Plane fits on the sensor border are unreliable.
    if grid.size().is_border(x, y) {
        return Err(FitRejection::InsufficientSupport);
    }

    // Gather neighborhood timestamps, sorted ascending by dt. The buffers
    // are stack-allocated and sized by the largest kernel.
    let mut pts = [Neighbor::default(); MAX_KERNEL_LEN];
    let mut n = 0usize;
    for &(dx, dy) in kernel.offsets() {
        let t_n = grid.get(x as i32 + dx as i32, y as i32 + dy as i32);
        if t_n == 0 {
            continue;
        }
        let dt = t - t_n;
        if dt < 0 || dt > params.dt_max_us {
            continue;
        }
        let mut j = n;
        while j > 0 && pts[j - 1].dt > dt {
            pts[j] = pts[j - 1];
            j -= 1;
        }
        pts[j] = Neighbor {
            dx_px: dx,
            dy_px: dy,
            dt,
        };
        n += 1;
    }
    if n < params.n_min {
        return Err(FitRejection::InsufficientSupport);
    }

    // Adaptive support cutoff: find the first linearly independent pair of
    // offsets, then stop at the first timestamp gap exceeding
    // dt_stop_factor times the lead dt.
    let mut lead = None;
    for i in 1..n {
        let det = pts[0].dx_px as i32 * pts[i].dy_px as i32
            - pts[0].dy_px as i32 * pts[i].dx_px as i32;
        if det != 0 {
            lead = Some(i);
            break;
        }
    }
    if let Some(lead_idx) = lead {
        let limit = params.dt_stop_factor * pts[lead_idx].dt as f32;
        for j in (lead_idx + 1)..n {
            if (pts[j].dt - pts[j - 1].dt) as f32 > limit {
                n = j;
                break;
            }
        }
        if n < params.n_min {
            return Err(FitRejection::InsufficientSupport);
        }
    }

    // Transform retained neighbors to undistorted relative coordinates and
    // accumulate the normal-equation sums.
    let xu0 = undistortion.ux(x, y);
    let yu0 = undistortion.uy(x, y);
    let mut dxu = [0.0f32; MAX_KERNEL_LEN];
    let mut dyu = [0.0f32; MAX_KERNEL_LEN];
    let mut tau = [0.0f32; MAX_KERNEL_LEN];
    let mut retained = [true; MAX_KERNEL_LEN];

    let mut sxx = 0.0f32;
    let mut syy = 0.0f32;
    let mut sxy = 0.0f32;
    let mut sxt = 0.0f32;
    let mut syt = 0.0f32;
    let mut st = 0.0f32;
    let mut st2 = 0.0f32;

    for i in 0..n {
        let xx = (x as i32 + pts[i].dx_px as i32) as u16;
        let yy = (y as i32 + pts[i].dy_px as i32) as u16;
        let dx = undistortion.ux(xx, yy) - xu0;
        let dy = undistortion.uy(xx, yy) - yu0;
        let ta = -(pts[i].dt as f32) / SECONDS_TO_MICROSECONDS;
        dxu[i] = dx;
        dyu[i] = dy;
        tau[i] = ta;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
        sxt += dx * ta;
        syt += dy * ta;
        st += ta;
        st2 += ta * ta;
    }

    let (mut a, mut b) = match solve_2x2(sxx, syy, sxy, sxt, syt) {
        Some(sol) => sol,
        None => return Err(FitRejection::SingularSystem),
    };

    let threshold = params.max_nrmse * params.max_nrmse;
    let mut n_ret = n;
    let mut nmse = normalized_mse(st2, st, sxt, syt, a, b, n_ret);

    if nmse > threshold {
        let mut accepted = false;
        for _ in 0..params.n_reject {
            // Remove the neighbor farthest from the current plane, measured
            // in the transformed (dxu, dyu, tau) space.
            let mut worst = None;
            let mut worst_residual = -1.0f32;
            for i in 0..n {
                if !retained[i] {
                    continue;
                }
                let r = (tau[i] - a * dxu[i] - b * dyu[i]).abs();
                if r > worst_residual {
                    worst_residual = r;
                    worst = Some(i);
                }
            }
            let Some(w) = worst else {
                return Err(FitRejection::InsufficientSupport);
            };
            sxx -= dxu[w] * dxu[w];
            syy -= dyu[w] * dyu[w];
            sxy -= dxu[w] * dyu[w];
            sxt -= dxu[w] * tau[w];
            syt -= dyu[w] * tau[w];
            st -= tau[w];
            st2 -= tau[w] * tau[w];
            retained[w] = false;
            n_ret -= 1;
            if n_ret < params.n_min {
                return Err(FitRejection::InsufficientSupport);
            }
            match solve_2x2(sxx, syy, sxy, sxt, syt) {
                Some((a2, b2)) => {
                    a = a2;
                    b = b2;
                }
                None => return Err(FitRejection::InsufficientSupport),
            }
            nmse = normalized_mse(st2, st, sxt, syt, a, b, n_ret);
            if nmse <= threshold {
                accepted = true;
                break;
            }
        }
        if !accepted {
            return Err(FitRejection::InsufficientSupport);
        }
    }

    let scale = 1.0 / (a * a + b * b);
    let u = scale * a;
    let v = scale * b;
    if !u.is_finite() || !v.is_finite() {
        return Err(FitRejection::NotANumber);
    }
    if (u * u + v * v).sqrt() > params.v_max {
        return Err(FitRejection::VelocityOutOfRange);
    }

    Ok(PlaneFit {
        u,
        v,
        xu: xu0,
        yu: yu0,
        n_support: n_ret,
        nmse,
    })
}

#[inline]
fn solve_2x2(sxx: f32, syy: f32, sxy: f32, sxt: f32, syt: f32) -> Option<(f32, f32)> {
    let d = sxx * syy - sxy * sxy;
    if d.abs() < FLT_ZERO_EPSILON {
        return None;
    }
    let a = (syy * sxt - sxy * syt) / d;
    let b = (sxx * syt - sxy * sxt) / d;
    Some((a, b))
}

#[inline]
fn normalized_mse(st2: f32, st: f32, sxt: f32, syt: f32, a: f32, b: f32, n: usize) -> f32 {
    let ssr = st2 - a * sxt - b * syt;
    ssr * n as f32 / (st * st + 1.0e-12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dvs_flow_types::SensorSize;

    const SIZE: SensorSize = SensorSize {
        width: 64,
        height: 64,
    };

    fn defaults() -> FitParams {
        FitParams {
            dt_max_us: 2_000_000,
            v_max: 1000.0,
            n_min: 8,
            n_reject: 2,
            max_nrmse: 0.3,
            dt_stop_factor: 3.0,
        }
    }

    fn setup() -> (TimestampMap, SearchKernel, UndistortionMap) {
        (
            TimestampMap::new(SIZE),
            SearchKernel::new(2).unwrap(),
            UndistortionMap::identity(SIZE),
        )
    }

    /// Seed the grid with the timestamps of an edge sweeping in +x at
    /// 100 px/s: one column every 10 ms.
    fn seed_moving_edge(grid: &mut TimestampMap, cols: std::ops::Range<i32>, rows: std::ops::Range<i32>) {
        for x in cols {
            for y in rows.clone() {
                grid.set(x, y, 1_000_000 + 10_000 * x as i64);
            }
        }
    }

    #[test]
    fn uniform_motion_recovered() {
        let (mut grid, kernel, undist) = setup();
        seed_moving_edge(&mut grid, 1..13, 28..37);
        // Event at the wavefront, on the plane.
        let (x, y) = (12u16, 32u16);
        let t = 1_000_000 + 10_000 * 12;
        let fit = fit_plane(x, y, t, &grid, &kernel, &undist, &defaults()).unwrap();
        assert_relative_eq!(fit.u, 100.0, max_relative = 1e-3);
        assert_relative_eq!(fit.v, 0.0, epsilon = 1e-3);
        assert_eq!(fit.xu, 12.0);
        assert_eq!(fit.yu, 32.0);
        assert!(fit.nmse <= 0.09);
    }

    #[test]
    fn border_events_bypass_the_fit() {
        let (mut grid, kernel, undist) = setup();
        seed_moving_edge(&mut grid, 0..64, 0..64);
        for (x, y) in [(0, 30), (63, 30), (30, 0), (30, 63)] {
            let res = fit_plane(x, y, i64::MAX / 2, &grid, &kernel, &undist, &defaults());
            assert_eq!(res, Err(FitRejection::InsufficientSupport), "({x},{y})");
        }
    }

    #[test]
    fn too_few_neighbors_rejected() {
        let (mut grid, kernel, undist) = setup();
        // Only two usable neighbors.
        grid.set(10, 10, 900);
        grid.set(11, 10, 950);
        let res = fit_plane(12, 10, 1000, &grid, &kernel, &undist, &defaults());
        assert_eq!(res, Err(FitRejection::InsufficientSupport));
    }

    #[test]
    fn colinear_neighbors_are_singular() {
        let (mut grid, kernel, undist) = setup();
        // Five events along the line y=5, monotonically increasing t.
        for x in 0..5 {
            grid.set(x, 5, 100 * (x as i64 + 1));
        }
        let mut params = defaults();
        params.n_min = 2;
        let res = fit_plane(4, 5, 500, &grid, &kernel, &undist, &params);
        assert_eq!(res, Err(FitRejection::SingularSystem));
    }

    #[test]
    fn stale_neighbors_outside_dt_max_ignored() {
        let (mut grid, kernel, undist) = setup();
        seed_moving_edge(&mut grid, 1..13, 28..37);
        // Make all but a couple of neighbors older than dt_max.
        let mut params = defaults();
        params.dt_max_us = 5_000;
        let t = 1_000_000 + 10_000 * 12;
        let res = fit_plane(12, 32, t, &grid, &kernel, &undist, &params);
        assert_eq!(res, Err(FitRejection::InsufficientSupport));
    }

    #[test]
    fn outlier_rejected_then_accepted() {
        let (mut grid, kernel, undist) = setup();
        let (x, y) = (10u16, 10u16);
        let t = 200_000i64;
        // Ten clean neighbors on the plane of a 100 px/s +x motion...
        for dy in -2..=2i32 {
            grid.set(x as i32 - 2, y as i32 + dy, t - 20_000);
            grid.set(x as i32 - 1, y as i32 + dy, t - 10_000);
        }
        // ...plus one neighbor with an anomalous timestamp.
        grid.set(x as i32, y as i32 + 2, t - 22_000);
        let fit = fit_plane(x, y, t, &grid, &kernel, &undist, &defaults()).unwrap();
        assert_eq!(fit.n_support, 10);
        assert_relative_eq!(fit.u, 100.0, max_relative = 1e-3);
        assert_relative_eq!(fit.v, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn outlier_iterations_exhausted_rejects() {
        let (mut grid, kernel, undist) = setup();
        let (x, y) = (10u16, 10u16);
        let t = 200_000i64;
        for dy in -2..=2i32 {
            grid.set(x as i32 - 2, y as i32 + dy, t - 20_000);
            grid.set(x as i32 - 1, y as i32 + dy, t - 10_000);
        }
        grid.set(x as i32, y as i32 + 2, t - 22_000);
        let mut params = defaults();
        params.n_reject = 0;
        let res = fit_plane(x, y, t, &grid, &kernel, &undist, &params);
        assert_eq!(res, Err(FitRejection::InsufficientSupport));
    }

    #[test]
    fn fast_motion_rejected_by_v_max() {
        let (mut grid, kernel, undist) = setup();
        // Edge moving at 1e4 px/s: one column every 100 us.
        for x in 1..13i32 {
            for y in 28..37i32 {
                grid.set(x, y, 1_000 + 100 * x as i64);
            }
        }
        let t = 1_000 + 100 * 12;
        let res = fit_plane(12, 32, t, &grid, &kernel, &undist, &defaults());
        assert_eq!(res, Err(FitRejection::VelocityOutOfRange));
        let mut params = defaults();
        params.v_max = 20_000.0;
        let fit = fit_plane(12, 32, t, &grid, &kernel, &undist, &params).unwrap();
        assert_relative_eq!(fit.u, 1.0e4, max_relative = 1e-3);
    }

    #[test]
    fn zero_gradient_is_not_a_number() {
        let (mut grid, kernel, undist) = setup();
        // Every neighbor fired simultaneously with the event: tau = 0
        // everywhere, the plane is flat and the velocity is undefined.
        let t = 5_000i64;
        for dx in -2..=2i32 {
            for dy in -2..=2i32 {
                grid.set(10 + dx, 10 + dy, t);
            }
        }
        let res = fit_plane(10, 10, t, &grid, &kernel, &undist, &defaults());
        assert_eq!(res, Err(FitRejection::NotANumber));
    }

    #[test]
    fn support_truncated_at_timestamp_gap() {
        let (mut grid, kernel, undist) = setup();
        let (x, y) = (10u16, 10u16);
        let t = 3_000_000i64;
        // A tight recent cluster...
        for dy in -2..=2i32 {
            grid.set(x as i32 - 2, y as i32 + dy, t - 4_000);
            grid.set(x as i32 - 1, y as i32 + dy, t - 2_000);
        }
        // ...and stale cells far behind the dt_stop_factor gap, still inside
        // dt_max. With n_min above the cluster size the truncation leaves
        // too little support.
        for dy in -2..=2i32 {
            grid.set(x as i32 + 1, y as i32 + dy, t - 1_900_000);
            grid.set(x as i32 + 2, y as i32 + dy, t - 1_900_000);
        }
        let mut params = defaults();
        params.n_min = 12;
        let res = fit_plane(x, y, t, &grid, &kernel, &undist, &params);
        assert_eq!(res, Err(FitRejection::InsufficientSupport));
        // The same support passes when the minimum fits the cluster.
        params.n_min = 8;
        let fit = fit_plane(x, y, t, &grid, &kernel, &undist, &params).unwrap();
        assert_eq!(fit.n_support, 10);
    }

    #[test]
    fn incremental_solve_matches_svd_least_squares() {
        use nalgebra::{Dyn, OMatrix, OVector, U2};

        let (mut grid, kernel, undist) = setup();
        let (x, y) = (20u16, 20u16);
        let t = 500_000i64;
        // An oblique motion with mild timestamp noise, deterministic.
        let mut k = 0i64;
        for dx in -2..=2i32 {
            for dy in -2..=2i32 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let plane = 7_000 * dx as i64 + 3_000 * dy as i64;
                let noise = (k * 37) % 200 - 100;
                k += 1;
                let t_n = t + plane + noise;
                if t_n < t {
                    grid.set(x as i32 + dx, y as i32 + dy, t_n);
                }
            }
        }
        let mut params = defaults();
        params.v_max = 1.0e6;
        params.max_nrmse = 100.0; // accept the first pass
        let fit = fit_plane(x, y, t, &grid, &kernel, &undist, &params).unwrap();

        // Recover the plane gradient from the reported velocity.
        let speed2 = fit.u * fit.u + fit.v * fit.v;
        let a = (fit.u / speed2) as f64;
        let b = (fit.v / speed2) as f64;

        // Reference: SVD least squares over the same neighbor set.
        let mut rows = Vec::new();
        let mut rhs = Vec::new();
        for dx in -2..=2i32 {
            for dy in -2..=2i32 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let t_n = grid.get(x as i32 + dx, y as i32 + dy);
                if t_n == 0 {
                    continue;
                }
                rows.push(dx as f64);
                rows.push(dy as f64);
                rhs.push(-((t - t_n) as f64) / 1.0e6);
            }
        }
        let m = OMatrix::<f64, Dyn, U2>::from_row_slice(&rows);
        let v = OVector::<f64, Dyn>::from_row_slice(&rhs);
        let reference = lstsq::lstsq(&m, &v, 1.0e-14).unwrap();
        assert_relative_eq!(a, reference.solution[0], max_relative = 1e-3);
        assert_relative_eq!(b, reference.solution[1], max_relative = 1e-3);
    }
}
