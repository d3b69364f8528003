use crate::time::{seconds_between, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KalmanState {
    pub position: f32,     // Altitude (m)
    pub velocity: f32,     // Vertical Velocity (m/s)
    pub acceleration: f32, // Last control input (m/s^2)
}

/// Position/velocity filter with vertical acceleration as a known input.
///
/// Acceleration drives the prediction directly instead of being a third
/// state; the barometric altitude is the only measurement.
pub struct VerticalKalman {
    // Last update time, None until the first measurement
    t: Option<Instant>,

    // State vector [pos, vel] and the acceleration used for the last predict
    x: [f32; 2],
    a: f32,

    // Covariance matrix P (2x2)
    p: [[f32; 2]; 2],

    // Position measurement variance (m^2)
    p_var: f32,
    // Acceleration process variance ((m/s^2)^2)
    a_var: f32,
}

impl VerticalKalman {
    pub fn new(position_variance: f32, acceleration_variance: f32) -> Self {
        Self {
            t: None,
            x: [0.0, 0.0],
            a: 0.0,
            p: [[0.0, 0.0], [0.0, 0.0]],
            p_var: position_variance,
            a_var: acceleration_variance,
        }
    }

    /// Forgets everything; the next update re-seeds the state.
    pub fn reset(&mut self) {
        self.t = None;
        self.x = [0.0, 0.0];
        self.a = 0.0;
        self.p = [[0.0, 0.0], [0.0, 0.0]];
    }

    pub fn is_initialized(&self) -> bool {
        self.t.is_some()
    }

    /// Predict with `accel` over the time since the last call, then correct
    /// with the measured altitude `position` (m).
    pub fn update(&mut self, time: Instant, position: f32, accel: f32) {
        if !position.is_finite() || !accel.is_finite() {
            fatal!("kalman input invalid: position={} accel={}", position, accel);
        }

        let Some(t_prev) = self.t else {
            self.t = Some(time);
            self.x = [position, 0.0];
            self.a = accel;
            self.p = [[0.0, 0.0], [0.0, 0.0]];
            return;
        };

        let dt = seconds_between(t_prev, time);
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;
        self.t = Some(time);

        // Predict: pos += vel*dt + 0.5*acc*dt^2, vel += acc*dt
        self.a = accel;
        self.x[0] += dt * self.x[1] + dt2 * accel / 2.0;
        self.x[1] += dt * accel;

        // P = F*P*F' + Q, Q from white acceleration noise
        let inc = dt * self.p[1][1] + dt3 * self.a_var / 2.0;
        self.p[0][0] += dt * (self.p[0][1] + self.p[1][0] + inc) - dt4 * self.a_var / 4.0;
        self.p[1][0] += inc;
        self.p[0][1] += inc;
        self.p[1][1] += dt2 * self.a_var;

        // H = [1, 0]
        let s = self.p[0][0] + self.p_var;
        let k0 = self.p[0][0] / s;
        let k1 = self.p[0][1] / s;

        // Innovation y = z - Hx
        let y = position - self.x[0];
        if !y.is_finite() {
            fatal!("kalman residual invalid: z={} p={}", position, self.x[0]);
        }
        if !k0.is_finite() || !k1.is_finite() {
            fatal!(
                "kalman gain invalid: k0={} k1={} p11={} p12={} p21={} p22={}",
                k0,
                k1,
                self.p[0][0],
                self.p[0][1],
                self.p[1][0],
                self.p[1][1]
            );
        }

        self.x[0] += k0 * y;
        if !self.x[0].is_finite() {
            fatal!("kalman position invalid: k0={} y={}", k0, y);
        }
        self.x[1] += k1 * y;
        if !self.x[1].is_finite() {
            fatal!("kalman velocity invalid: k1={} y={}", k1, y);
        }

        // P = (I - KH)P, in the order that reuses the pre-update terms
        self.p[1][1] -= k1 * self.p[1][0];
        self.p[0][1] -= k1 * self.p[0][0];
        self.p[1][0] -= k0 * self.p[1][0];
        self.p[0][0] -= k0 * self.p[0][0];
    }

    pub fn try_state(&self) -> Option<KalmanState> {
        self.t.map(|_| KalmanState {
            position: self.x[0],
            velocity: self.x[1],
            acceleration: self.a,
        })
    }

    /// Current estimate. Reading before the first update halts.
    pub fn state(&self) -> KalmanState {
        match self.try_state() {
            Some(state) => state,
            None => fatal!("kalman state read before first update"),
        }
    }

    pub fn covariance(&self) -> [[f32; 2]; 2] {
        self.p
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::testing::at_ms;

    fn filter() -> VerticalKalman {
        VerticalKalman::new(0.1 * 0.1, 0.3 * 0.3)
    }

    #[test]
    fn first_update_seeds_state() {
        let mut kf = filter();
        assert!(kf.try_state().is_none());
        kf.update(at_ms(0), 123.0, 0.5);
        let s = kf.state();
        assert_eq!(s.position, 123.0);
        assert_eq!(s.velocity, 0.0);
        assert_eq!(s.acceleration, 0.5);
        assert_eq!(kf.covariance(), [[0.0, 0.0], [0.0, 0.0]]);
    }

    #[test]
    fn constant_position_converges() {
        let mut kf = filter();
        kf.update(at_ms(0), 0.0, 0.0);
        for i in 1..=2000 {
            kf.update(at_ms(i * 50), 50.0, 0.0);
        }
        let s = kf.state();
        assert_abs_diff_eq!(s.position, 50.0, epsilon = 0.05);
        assert_abs_diff_eq!(s.velocity, 0.0, epsilon = 0.05);
    }

    #[test]
    fn tracks_steady_climb() {
        let mut kf = filter();
        for i in 0..=1200u64 {
            let t = i as f32 * 0.05;
            kf.update(at_ms(i * 50), 2.0 * t, 0.0);
        }
        assert_abs_diff_eq!(kf.state().velocity, 2.0, epsilon = 0.1);
    }

    #[test]
    fn covariance_stays_symmetric_and_non_negative() {
        let mut kf = filter();
        for i in 0..500u64 {
            kf.update(at_ms(i * 50), (i % 7) as f32, 0.1);
        }
        let p = kf.covariance();
        assert!(p[0][0] >= 0.0 && p[1][1] >= 0.0);
        assert_abs_diff_eq!(p[0][1], p[1][0], epsilon = 1e-4);
    }

    #[test]
    fn reset_forgets_state() {
        let mut kf = filter();
        kf.update(at_ms(0), 10.0, 0.0);
        kf.reset();
        assert!(!kf.is_initialized());
    }

    #[test]
    #[should_panic(expected = "kalman input invalid")]
    fn nan_input_is_fatal() {
        let mut kf = filter();
        kf.update(at_ms(0), 10.0, 0.0);
        kf.update(at_ms(50), f32::NAN, 0.0);
    }

    #[test]
    #[should_panic(expected = "before first update")]
    fn reading_uninitialized_is_fatal() {
        filter().state();
    }
}
