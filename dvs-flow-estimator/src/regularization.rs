use dvs_flow_types::{FlowEvent, SensorSize};

/// Parameters of the neighborhood regularization filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationConfig {
    /// Spatial search radius in pixels.
    pub radius: u16,
    /// Temporal window, microseconds.
    pub dt_max_us: i64,
    /// Allowed relative magnitude difference.
    pub max_speed_factor: f32,
    /// Allowed direction difference, degrees.
    pub max_angle_deg: f32,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            radius: 2,
            dt_max_us: 100_000,
            max_speed_factor: 0.5,
            max_angle_deg: 30.0,
        }
    }
}

#[derive(Clone, Copy)]
struct StoredFlow {
    t: i64,
    u: f32,
    v: f32,
}

/// Post-fit gating filter: a flow vector passes only when at least one
/// recent neighbor agrees with it in magnitude and direction.
///
/// The filter keeps its own per-pixel store of the last accepted flow
/// vector; rejected events clear `has_flow` but are otherwise preserved.
pub struct RegularizationFilter {
    cfg: RegularizationConfig,
    size: SensorSize,
    grid: Vec<Option<StoredFlow>>,
}

impl RegularizationFilter {
    pub fn new(cfg: RegularizationConfig, size: SensorSize) -> Self {
        Self {
            cfg,
            size,
            grid: vec![None; size.n_pixels()],
        }
    }

    /// Check the annotated event against its neighborhood, then store its
    /// vector for later events. Returns whether a supporting neighbor was
    /// found.
    pub fn check_and_store(&mut self, e: &FlowEvent) -> bool {
        let magnitude = (e.u * e.u + e.v * e.v).sqrt();
        let angle = e.v.atan2(e.u);
        let max_magnitude_diff = magnitude * self.cfg.max_speed_factor;
        let max_angle_diff = self.cfg.max_angle_deg.to_radians();

        let r = self.cfg.radius as i32;
        let mut supported = false;
        'scan: for dy in -r..=r {
            for dx in -r..=r {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let xx = e.x as i32 + dx;
                let yy = e.y as i32 + dy;
                if xx < 0
                    || yy < 0
                    || xx >= self.size.width as i32
                    || yy >= self.size.height as i32
                {
                    continue;
                }
                let idx = yy as usize * self.size.width as usize + xx as usize;
                let Some(stored) = self.grid[idx] else {
                    continue;
                };
                if e.timestamp - stored.t > self.cfg.dt_max_us {
                    continue;
                }
                let magnitude_b = (stored.u * stored.u + stored.v * stored.v).sqrt();
                if (magnitude - magnitude_b).abs() > max_magnitude_diff {
                    continue;
                }
                let angle_b = stored.v.atan2(stored.u);
                let mut da = (angle - angle_b).abs();
                if da > std::f32::consts::PI {
                    da = 2.0 * std::f32::consts::PI - da;
                }
                if da > max_angle_diff {
                    continue;
                }
                supported = true;
                break 'scan;
            }
        }

        let idx = e.y as usize * self.size.width as usize + e.x as usize;
        self.grid[idx] = Some(StoredFlow {
            t: e.timestamp,
            u: e.u,
            v: e.v,
        });
        supported
    }
}
