/// Outcome of the two-stage admission check run before the fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The pixel fired again within the refractory period.
    Refractory,
    /// The adaptive rate limiter is shedding events.
    RateLimited,
}

/// Decide whether an event at time `t` may proceed to the fitter.
///
/// Stage one compares against the last admitted timestamp at the same pixel
/// and polarity. Stage two (when a setpoint is given) sheds events while the
/// accepted-flow rate would exceed the setpoint: the comparison uses the
/// inverse interval since the last accepted flow vector, since the filtered
/// estimate only advances on accepted events and a latched comparison would
/// never reopen the gate.
#[inline]
pub fn check_admission(
    t: i64,
    last_pixel_t: i64,
    refractory_period_us: i64,
    rate_setpoint: Option<f32>,
    last_flow_t: i64,
) -> Admission {
    if t - last_pixel_t < refractory_period_us {
        return Admission::Refractory;
    }
    if let Some(setpoint) = rate_setpoint {
        if last_flow_t > 0 {
            let dt = t - last_flow_t;
            if dt < 1 {
                return Admission::RateLimited;
            }
            if 1.0e6 / dt as f32 > setpoint {
                return Admission::RateLimited;
            }
        }
    }
    Admission::Admitted
}
