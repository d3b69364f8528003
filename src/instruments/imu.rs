//! Motion processing: body-frame acceleration to vertical acceleration, and
//! the Kalman filter that turns it plus barometric altitude into climb rate.

use core::cell::RefCell;

use crate::bus::Subscriber;
use crate::drivers::ahrs::Quaternion;
use crate::drivers::imu::{acceleration_valid, orientation_valid};
use crate::drivers::kalman::{KalmanState, VerticalKalman};
use crate::instruments::baro::Altimeter;
use crate::settings::VarioConfig;
use crate::state::MotionSample;
use crate::time::{seconds_between, Instant};

/// m/s² per g
pub const STANDARD_GRAVITY: f32 = 9.806_65;

// New measurements carry 90% of the gravity estimate after 5 s:
// K = ln(1 - 0.9) / 5
const GRAVITY_K: f32 = -0.460_517;

struct Inner {
    kalman: VerticalKalman,
    orientation: Option<Quaternion>,
    /// Best guess for the strength of gravity, g.
    gravity: f32,
    warmup_left: u32,
    warmup_sum: f32,
    warmup_count: u32,
    last_time: Option<Instant>,
    vertical_accel: f32,
    total_accel: f32,
}

pub struct MotionProcessor<'a> {
    altimeter: &'a Altimeter,
    warmup_samples: u32,
    inner: RefCell<Inner>,
}

impl<'a> MotionProcessor<'a> {
    pub fn new(altimeter: &'a Altimeter, config: &VarioConfig) -> Self {
        Self {
            altimeter,
            warmup_samples: config.warmup_samples,
            inner: RefCell::new(Inner {
                kalman: VerticalKalman::new(config.position_variance, config.acceleration_variance),
                orientation: None,
                gravity: 1.0,
                warmup_left: config.warmup_samples,
                warmup_sum: 0.0,
                warmup_count: 0,
                last_time: None,
                vertical_accel: 0.0,
                total_accel: 0.0,
            }),
        }
    }

    /// Restarts the gravity warm-up, e.g. after the device slept.
    pub fn wake(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.warmup_left = self.warmup_samples;
        inner.warmup_sum = 0.0;
        inner.warmup_count = 0;
        inner.last_time = None;
    }

    /// Kalman climb rate, m/s. `None` until the filter has been seeded.
    pub fn velocity(&self) -> Option<f32> {
        self.inner.borrow().kalman.try_state().map(|s| s.velocity)
    }

    pub fn kalman_state(&self) -> Option<KalmanState> {
        self.inner.borrow().kalman.try_state()
    }

    pub fn gravity(&self) -> f32 {
        self.inner.borrow().gravity
    }

    /// World-frame vertical acceleration with gravity removed, g.
    pub fn vertical_accel(&self) -> f32 {
        self.inner.borrow().vertical_accel
    }

    /// Magnitude of the last body-frame acceleration, g.
    pub fn total_accel(&self) -> f32 {
        self.inner.borrow().total_accel
    }

    pub fn is_warming_up(&self) -> bool {
        self.inner.borrow().warmup_left > 0
    }
}

impl Inner {
    fn update_gravity(&mut self, time: Instant, world_z: f32) {
        if self.warmup_left > 0 {
            self.warmup_left -= 1;
            self.warmup_sum += world_z;
            self.warmup_count += 1;
            self.gravity = self.warmup_sum / self.warmup_count as f32;
        } else {
            let dt = match self.last_time {
                Some(last) => seconds_between(last, time),
                None => 0.0,
            };
            let f = libm::expf(GRAVITY_K * dt);
            self.gravity = self.gravity * f + world_z * (1.0 - f);
        }
        self.last_time = Some(time);
    }
}

impl Subscriber<MotionSample> for MotionProcessor<'_> {
    fn on_receive(&self, msg: &MotionSample) {
        let orientation = if msg.has_orientation {
            let q = Quaternion::from_vector(msg.qx, msg.qy, msg.qz);
            if !orientation_valid(&q) {
                defmt_or_log::warn!("motion sample dropped: bad orientation");
                return;
            }
            Some(q)
        } else {
            None
        };
        if msg.has_accel && !acceleration_valid([msg.ax, msg.ay, msg.az]) {
            defmt_or_log::warn!("motion sample dropped: bad acceleration");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if orientation.is_some() {
            inner.orientation = orientation;
        }
        if !msg.has_accel {
            return;
        }
        let Some(q) = inner.orientation else {
            return;
        };

        inner.total_accel = libm::sqrtf(msg.ax * msg.ax + msg.ay * msg.ay + msg.az * msg.az);
        let (_, _, world_z) = q.rotate(msg.ax, msg.ay, msg.az);

        // Against the estimate from before this sample
        let warming_up = inner.warmup_left > 0;
        inner.vertical_accel = world_z - inner.gravity;
        inner.update_gravity(msg.time, world_z);

        let accel = if warming_up {
            0.0
        } else {
            inner.vertical_accel * STANDARD_GRAVITY
        };

        if let Some(position) = self.altimeter.standard_altitude() {
            inner.kalman.update(msg.time, position, accel);
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::state::PressureSample;
    use crate::testing::at_ms;

    fn ready_altimeter() -> Altimeter {
        let alt = Altimeter::new(&VarioConfig::default());
        alt.init().unwrap();
        alt.on_receive(&PressureSample { time: at_ms(0), pressure: 100_009 });
        alt
    }

    fn motion(ms: u64, accel: [f32; 3], q: Option<[f32; 3]>) -> MotionSample {
        let mut m = MotionSample::empty(at_ms(ms));
        m.has_accel = true;
        [m.ax, m.ay, m.az] = accel;
        if let Some([x, y, z]) = q {
            m.has_orientation = true;
            m.qx = x;
            m.qy = y;
            m.qz = z;
        }
        m
    }

    fn config(warmup_samples: u32) -> VarioConfig {
        VarioConfig { warmup_samples, ..VarioConfig::default() }
    }

    #[test]
    fn warmup_averages_unweighted() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(4));
        for (i, z) in [0.9, 1.1, 0.95, 1.05].into_iter().enumerate() {
            proc.on_receive(&motion(i as u64 * 50, [0.0, 0.0, z], Some([0.0; 3])));
        }
        assert!(!proc.is_warming_up());
        assert_abs_diff_eq!(proc.gravity(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn gravity_follows_exponential_after_warmup() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(1));
        proc.on_receive(&motion(0, [0.0, 0.0, 1.0], Some([0.0; 3])));
        assert_abs_diff_eq!(proc.gravity(), 1.0);

        // Five seconds of a new reading gets 90% of the way there
        proc.on_receive(&motion(5_000, [0.0, 0.0, 1.1], None));
        assert_abs_diff_eq!(proc.gravity(), 1.09, epsilon = 1e-4);
        assert_abs_diff_eq!(proc.vertical_accel(), 0.1, epsilon = 1e-5);
    }

    #[test]
    fn acceleration_is_derotated() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(1));
        // Device rolled 90 degrees about X: body Y points up
        let s = core::f32::consts::FRAC_1_SQRT_2;
        proc.on_receive(&motion(0, [0.0, 1.0, 0.0], Some([s, 0.0, 0.0])));
        assert_abs_diff_eq!(proc.gravity(), 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(proc.total_accel(), 1.0);
    }

    #[test]
    fn accel_only_sample_uses_last_orientation() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(1));

        // No orientation seen yet: nothing to rotate with
        proc.on_receive(&motion(0, [0.0, 0.0, 1.0], None));
        assert!(proc.velocity().is_none());

        proc.on_receive(&MotionSample { has_accel: false, ..motion(10, [0.0; 3], Some([0.0; 3])) });
        proc.on_receive(&motion(20, [0.0, 0.0, 1.0], None));
        assert!(proc.velocity().is_some());
    }

    #[test]
    fn kalman_waits_for_altimeter() {
        let alt = Altimeter::new(&VarioConfig::default());
        alt.init().unwrap();
        let proc = MotionProcessor::new(&alt, &config(1));
        proc.on_receive(&motion(0, [0.0, 0.0, 1.0], Some([0.0; 3])));
        assert!(proc.velocity().is_none());

        alt.on_receive(&PressureSample { time: at_ms(10), pressure: 100_009 });
        proc.on_receive(&motion(20, [0.0, 0.0, 1.0], None));
        let state = proc.kalman_state().unwrap();
        assert_abs_diff_eq!(state.position, 110.126, epsilon = 0.01);
        assert_eq!(state.velocity, 0.0);
    }

    #[test]
    fn still_device_reads_no_climb() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(20));
        for i in 0..400 {
            proc.on_receive(&motion(i * 50, [0.0, 0.0, 1.0], Some([0.0; 3])));
        }
        assert_abs_diff_eq!(proc.velocity().unwrap(), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn non_finite_sample_leaves_state_alone() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(3));
        for i in 0..2 {
            proc.on_receive(&motion(i * 50, [0.0, 0.0, 1.0], Some([0.0; 3])));
        }
        let gravity = proc.gravity();
        let state = proc.kalman_state();

        proc.on_receive(&motion(100, [0.0, 0.0, f32::NAN], None));
        proc.on_receive(&motion(150, [0.0, 0.0, 1.0], Some([f32::NAN, 0.0, 0.0])));
        proc.on_receive(&motion(200, [0.0, 0.0, 1.0], Some([2.0, 0.0, 0.0])));
        proc.on_receive(&motion(250, [0.0, 0.0, 2_000.0], None));

        assert_eq!(proc.gravity(), gravity);
        assert_eq!(proc.kalman_state(), state);
        assert!(proc.is_warming_up());
        assert_eq!(proc.total_accel(), 1.0);

        // The kept orientation still works for the next good sample
        proc.on_receive(&motion(300, [0.0, 0.0, 1.0], None));
        assert!(!proc.is_warming_up());
        assert_abs_diff_eq!(proc.velocity().unwrap(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn wake_restarts_warmup() {
        let alt = ready_altimeter();
        let proc = MotionProcessor::new(&alt, &config(2));
        for i in 0..3 {
            proc.on_receive(&motion(i * 50, [0.0, 0.0, 1.0], Some([0.0; 3])));
        }
        assert!(!proc.is_warming_up());
        proc.wake();
        assert!(proc.is_warming_up());
    }
}
