//! Motion front end: raw IMU frames in, `MotionSample`s out.
//!
//! Orientation is fused here with the Mahony filter; the estimators
//! downstream only ever see a quaternion vector part with `w >= 0`.
//! A half that fails validation is dropped from the sample, reported as a
//! [`SensorError`] and noted on the bus as a [`Comment`].

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::MessageBus;
use crate::drivers::ahrs::{Mahony, Quaternion};
use crate::drivers::icm42688::{Icm42688, ACCEL_LSB_PER_G, GYRO_LSB_PER_DPS};
use crate::error::SensorError;
use crate::state::{Comment, MotionSample};
use crate::time::{seconds_between, Clock, Instant};

/// Largest quaternion norm accepted from the fusion filter.
pub const MAX_QUATERNION_NORM: f32 = 1.1;
/// Largest acceleration magnitude accepted, g.
pub const MAX_ACCELERATION_G: f32 = 1000.0;

const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
// dt guard between frames, s
const MIN_DT: f32 = 0.001;
const MAX_DT: f32 = 0.2;

/// One IMU frame in physical units.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawMotion {
    pub accel_g: [f32; 3],
    pub gyro_dps: [f32; 3],
}

/// Anything that can produce IMU frames.
pub trait MotionSource {
    fn read_motion(&mut self) -> Result<RawMotion, SensorError>;
}

impl<SPI: SpiBus, CS: OutputPin> MotionSource for Icm42688<SPI, CS> {
    fn read_motion(&mut self) -> Result<RawMotion, SensorError> {
        let (accel, gyro) = self.read_all()?;
        Ok(RawMotion {
            accel_g: accel.map(|a| a as f32 / ACCEL_LSB_PER_G),
            gyro_dps: gyro.map(|g| g as f32 / GYRO_LSB_PER_DPS),
        })
    }
}

pub struct MotionFrontEnd<S> {
    source: S,
    ahrs: Mahony,
    last: Option<Instant>,
}

impl<S: MotionSource> MotionFrontEnd<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            ahrs: Mahony::new(),
            last: None,
        }
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn orientation(&self) -> Quaternion {
        self.ahrs.q.canonical()
    }

    /// Reads one frame, fuses it and publishes the resulting sample.
    ///
    /// Returns the published sample, or `None` when nothing usable was left.
    /// An invalid half is still reported as an error after the valid half
    /// went out.
    pub fn step<C: Clock>(
        &mut self,
        bus: &MessageBus<'_, C>,
    ) -> Result<Option<MotionSample>, SensorError> {
        let raw = self.source.read_motion()?;
        let now = bus.clock().now();
        let dt = match self.last {
            Some(last) => seconds_between(last, now).clamp(MIN_DT, MAX_DT),
            None => MIN_DT,
        };
        self.last = Some(now);

        let [ax, ay, az] = raw.accel_g;
        let [gx, gy, gz] = raw.gyro_dps.map(|d| d * DEG_TO_RAD);
        self.ahrs.update(dt, gx, gy, gz, ax, ay, az);
        let q = self.ahrs.q.canonical();

        let mut sample = MotionSample::empty(now);
        let mut fault = None;

        if orientation_valid(&q) {
            sample.has_orientation = true;
            sample.qx = q.x;
            sample.qy = q.y;
            sample.qz = q.z;
        } else {
            defmt_or_log::warn!("imu orientation rejected, norm {}", q.norm());
            bus.publish(&Comment::new(
                now,
                format_args!("imu orientation rejected {} {} {} {}", q.w, q.x, q.y, q.z),
            ));
            self.ahrs = Mahony::new();
            fault = Some(SensorError::InvalidOrientation);
        }

        if acceleration_valid(raw.accel_g) {
            sample.has_accel = true;
            sample.ax = ax;
            sample.ay = ay;
            sample.az = az;
        } else {
            defmt_or_log::warn!("imu acceleration rejected");
            bus.publish(&Comment::new(
                now,
                format_args!("imu acceleration rejected {} {} {}", ax, ay, az),
            ));
            fault.get_or_insert(SensorError::InvalidAcceleration);
        }

        let published = if sample.has_orientation || sample.has_accel {
            bus.publish(&sample);
            Some(sample)
        } else {
            None
        };

        match fault {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }
}

pub(crate) fn orientation_valid(q: &Quaternion) -> bool {
    q.is_finite() && q.norm() <= MAX_QUATERNION_NORM
}

pub(crate) fn acceleration_valid([x, y, z]: [f32; 3]) -> bool {
    x.is_finite()
        && y.is_finite()
        && z.is_finite()
        && libm::sqrtf(x * x + y * y + z * z) <= MAX_ACCELERATION_G
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use super::*;
    use crate::bus::Subscriber;
    use crate::testing::ManualClock;

    struct Frames(Vec<Result<RawMotion, SensorError>>);

    impl MotionSource for Frames {
        fn read_motion(&mut self) -> Result<RawMotion, SensorError> {
            self.0.remove(0)
        }
    }

    #[derive(Default)]
    struct Seen {
        motion: RefCell<Vec<MotionSample>>,
        comments: RefCell<Vec<Comment>>,
    }

    impl Subscriber<MotionSample> for Seen {
        fn on_receive(&self, msg: &MotionSample) {
            self.motion.borrow_mut().push(*msg);
        }
    }

    impl Subscriber<Comment> for Seen {
        fn on_receive(&self, msg: &Comment) {
            self.comments.borrow_mut().push(msg.clone());
        }
    }

    fn level() -> RawMotion {
        RawMotion { accel_g: [0.0, 0.0, 1.0], gyro_dps: [0.0; 3] }
    }

    #[test]
    fn level_frame_is_published_whole() {
        let clock = ManualClock::new();
        let seen = Seen::default();
        let bus = MessageBus::new(&clock);
        bus.subscribe::<MotionSample>(&seen).unwrap();

        let mut front = MotionFrontEnd::new(Frames(vec![Ok(level())]));
        let sample = front.step(&bus).unwrap().unwrap();

        assert!(sample.has_accel && sample.has_orientation);
        assert_eq!(sample.az, 1.0);
        assert!(sample.qx.abs() < 1e-3);
        assert_eq!(seen.motion.borrow().as_slice(), &[sample]);
    }

    #[test]
    fn huge_acceleration_drops_that_half() {
        let clock = ManualClock::new();
        let seen = Seen::default();
        let bus = MessageBus::new(&clock);
        bus.subscribe::<MotionSample>(&seen).unwrap();
        bus.subscribe::<Comment>(&seen).unwrap();

        let frame = RawMotion { accel_g: [0.0, 0.0, 2000.0], gyro_dps: [0.0; 3] };
        let mut front = MotionFrontEnd::new(Frames(vec![Ok(frame)]));
        assert_eq!(front.step(&bus), Err(SensorError::InvalidAcceleration));

        let motion = seen.motion.borrow();
        assert_eq!(motion.len(), 1);
        assert!(!motion[0].has_accel);
        assert!(motion[0].has_orientation);
        assert_eq!(motion[0].az, 0.0);
        assert!(seen.comments.borrow()[0].text.starts_with("imu acceleration rejected"));
    }

    #[test]
    fn nothing_valid_publishes_nothing() {
        let clock = ManualClock::new();
        let seen = Seen::default();
        let bus = MessageBus::new(&clock);
        bus.subscribe::<MotionSample>(&seen).unwrap();
        bus.subscribe::<Comment>(&seen).unwrap();

        let frame = RawMotion { accel_g: [f32::NAN, 0.0, 1.0], gyro_dps: [f32::NAN; 3] };
        let mut front = MotionFrontEnd::new(Frames(vec![Ok(frame), Ok(level())]));
        assert_eq!(front.step(&bus), Err(SensorError::InvalidOrientation));
        assert!(seen.motion.borrow().is_empty());
        assert_eq!(seen.comments.borrow().len(), 2);

        // Filter was reset and recovers on the next good frame
        clock.advance_ms(50);
        assert!(front.step(&bus).unwrap().is_some());
        assert!(front.orientation().is_finite());
    }

    #[test]
    fn transfer_errors_pass_through() {
        let clock = ManualClock::new();
        let bus = MessageBus::new(&clock);
        let mut front = MotionFrontEnd::new(Frames(vec![Err(SensorError::Pin)]));
        assert_eq!(front.step(&bus), Err(SensorError::Pin));
    }
}
