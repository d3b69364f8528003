//! Wind and airspeed from GPS ground velocity.
//!
//! While circling, ground velocity traces a circle in the velocity plane: the
//! centre is the wind vector and the radius is the (assumed constant)
//! airspeed. Samples are bucketed by direction into [`BIN_COUNT`] bins; each
//! [`WindEstimator::estimate`] call takes one coordinate-descent step on the
//! fit, so the cost per scheduler slot stays bounded and the fit converges
//! over many slots.
//!
//! Velocity-plane coordinates are x = East, y = North.

use core::cell::{Cell, RefCell};
use core::f32::consts::{PI, TAU};

use crate::bus::Subscriber;
use crate::settings::VarioConfig;
use crate::state::{GroundVelocitySample, WindEstimate};

pub const BIN_COUNT: usize = 8;
pub const SAMPLES_PER_BIN: usize = 20;
const MAX_POINTS: usize = BIN_COUNT * SAMPLES_PER_BIN;

const BIN_SPAN: f32 = TAU / BIN_COUNT as f32;
const POPULATED_BINS_REQUIRED: usize = 3;
// An empty run this long leaves everything on one side of the circle
const MAX_EMPTY_RUN: usize = BIN_COUNT / 2;

/// Recent samples from one compass sector.
#[derive(Clone, Copy)]
struct WindBin {
    angle: [f32; SAMPLES_PER_BIN],
    speed: [f32; SAMPLES_PER_BIN],
    index: usize,
    count: usize,
    // Representative point, velocity plane
    x: f32,
    y: f32,
}

impl WindBin {
    const EMPTY: Self = Self {
        angle: [0.0; SAMPLES_PER_BIN],
        speed: [0.0; SAMPLES_PER_BIN],
        index: 0,
        count: 0,
        x: 0.0,
        y: 0.0,
    };

    fn push(&mut self, angle: f32, speed: f32) {
        self.angle[self.index] = angle;
        self.speed[self.index] = speed;
        self.index = (self.index + 1) % SAMPLES_PER_BIN;
        self.count = (self.count + 1).min(SAMPLES_PER_BIN);
    }

    /// Circular mean of the track angles, arithmetic mean of the speeds.
    fn update_representative(&mut self) {
        let n = self.count;
        let (mut sin_sum, mut cos_sum, mut speed_sum) = (0.0, 0.0, 0.0);
        for i in 0..n {
            sin_sum += libm::sinf(self.angle[i]);
            cos_sum += libm::cosf(self.angle[i]);
            speed_sum += self.speed[i];
        }
        let angle = libm::atan2f(sin_sum, cos_sum);
        let speed = speed_sum / n as f32;
        (self.x, self.y) = to_xy(angle, speed);
    }
}

fn to_xy(angle: f32, speed: f32) -> (f32, f32) {
    (speed * libm::sinf(angle), speed * libm::cosf(angle))
}

/// Direction of (x, y), radians East of North in `[0, 2π)`.
fn direction_of(x: f32, y: f32) -> f32 {
    normalize_angle(libm::atan2f(x, y))
}

fn normalize_angle(mut a: f32) -> f32 {
    if a < 0.0 {
        a += TAU;
    }
    if a >= TAU {
        a -= TAU;
    }
    a
}

fn speed_of(x: f32, y: f32) -> f32 {
    libm::sqrtf(x * x + y * y)
}

struct Inner {
    bins: [WindBin; BIN_COUNT],
    wx: f32,
    wy: f32,
    estimate: WindEstimate,
}

pub struct WindEstimator {
    standard_airspeed: f32,
    step: f32,
    flying: Cell<bool>,
    inner: RefCell<Inner>,
}

impl WindEstimator {
    pub fn new(config: &VarioConfig) -> Self {
        Self {
            standard_airspeed: config.standard_airspeed,
            step: config.wind_step,
            flying: Cell::new(false),
            inner: RefCell::new(Inner {
                bins: [WindBin::EMPTY; BIN_COUNT],
                wx: 0.0,
                wy: 0.0,
                estimate: cleared_estimate(config.standard_airspeed),
            }),
        }
    }

    /// Samples are only taken in while flying.
    pub fn set_flying(&self, flying: bool) {
        self.flying.set(flying);
    }

    pub fn is_flying(&self) -> bool {
        self.flying.get()
    }

    /// Drops all samples and the current fit.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.bins = [WindBin::EMPTY; BIN_COUNT];
        inner.wx = 0.0;
        inner.wy = 0.0;
        inner.estimate = cleared_estimate(self.standard_airspeed);
    }

    pub fn estimate_snapshot(&self) -> WindEstimate {
        self.inner.borrow().estimate
    }

    /// Number of samples held in each bin.
    pub fn bin_counts(&self) -> [usize; BIN_COUNT] {
        self.inner.borrow().bins.map(|b| b.count)
    }

    /// Per-bin representative ground velocity (x East, y North) as of the
    /// last fit step, for plotting the circle. `None` for empty bins.
    pub fn representatives(&self) -> [Option<(f32, f32)>; BIN_COUNT] {
        self.inner.borrow().bins.map(|b| (b.count > 0).then_some((b.x, b.y)))
    }

    /// Whether the binned samples spread far enough around the circle to fit.
    pub fn has_enough_points(&self) -> bool {
        enough_points(&self.inner.borrow().bins)
    }

    /// One fitting step. Returns false when there are too few samples to
    /// fit; the previous estimate is kept.
    pub fn estimate(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !enough_points(&inner.bins) {
            return false;
        }
        for bin in inner.bins.iter_mut().filter(|b| b.count > 0) {
            bin.update_representative();
        }
        let points = SamplePoints::from_bins(&inner.bins);

        let (wx, wy) = (inner.wx, inner.wy);
        let airspeed = inner.estimate.airspeed;
        let mut best = points.fit_error(wx, wy, airspeed);
        let mut best_step = None;

        let s = self.step;
        let nudges = [
            (s, 0.0, 0.0),
            (-s, 0.0, 0.0),
            (0.0, s, 0.0),
            (0.0, -s, 0.0),
            (0.0, 0.0, s),
            (0.0, 0.0, -s),
        ];
        for nudge in nudges {
            let err = points.fit_error(wx + nudge.0, wy + nudge.1, airspeed + nudge.2);
            if err < best {
                best = err;
                best_step = Some(nudge);
            }
        }

        if let Some((dx, dy, da)) = best_step {
            inner.wx += dx;
            inner.wy += dy;
            let (wx, wy) = (inner.wx, inner.wy);
            let est = &mut inner.estimate;
            est.airspeed += da;
            est.wind_speed = speed_of(wx, wy);
            est.wind_direction = direction_of(wx, wy);
            est.wind_direction_from = normalize_angle(est.wind_direction + PI);
            defmt_or_log::debug!(
                "wind fit {} m/s toward {} rad, airspeed {}, error {}",
                est.wind_speed,
                est.wind_direction,
                est.airspeed,
                best
            );
        }
        inner.estimate.error = best;
        inner.estimate.valid = true;
        true
    }

    fn submit(&self, sample: &GroundVelocitySample) {
        let mut inner = self.inner.borrow_mut();
        let (gx, gy) = to_xy(sample.track_angle, sample.speed);

        // Bin around half the wind so the bins follow the circle as the fit
        // moves without letting a bad fit run away with them.
        let angle = if inner.estimate.valid {
            direction_of(gx - inner.wx / 2.0, gy - inner.wy / 2.0)
        } else {
            normalize_angle(sample.track_angle)
        };
        let bin = ((angle / BIN_SPAN) as usize).min(BIN_COUNT - 1);
        inner.bins[bin].push(sample.track_angle, sample.speed);
        inner.estimate.recent_bin = Some(bin as u8);

        if inner.estimate.valid {
            inner.estimate.airspeed_live = speed_of(gx - inner.wx, gy - inner.wy);
        }
    }
}

impl Subscriber<GroundVelocitySample> for WindEstimator {
    fn on_receive(&self, msg: &GroundVelocitySample) {
        if self.flying.get() {
            self.submit(msg);
        }
    }
}

fn cleared_estimate(airspeed: f32) -> WindEstimate {
    WindEstimate {
        wind_speed: 0.0,
        wind_direction: 0.0,
        wind_direction_from: PI,
        airspeed,
        airspeed_live: 0.0,
        error: f32::MAX,
        valid: false,
        recent_bin: None,
    }
}

fn enough_points(bins: &[WindBin; BIN_COUNT]) -> bool {
    let populated = bins.iter().filter(|b| b.count > 0).count();
    if populated < POPULATED_BINS_REQUIRED {
        return false;
    }
    // Longest empty run, wrapping around north
    let mut run = 0;
    for i in 0..2 * BIN_COUNT {
        if bins[i % BIN_COUNT].count == 0 {
            run += 1;
            if run >= MAX_EMPTY_RUN {
                return false;
            }
        } else {
            run = 0;
        }
    }
    true
}

/// Every stored sample in the velocity plane, converted once per fit step.
struct SamplePoints {
    xy: [(f32, f32); MAX_POINTS],
    len: usize,
}

impl SamplePoints {
    fn from_bins(bins: &[WindBin; BIN_COUNT]) -> Self {
        let mut points = Self { xy: [(0.0, 0.0); MAX_POINTS], len: 0 };
        for bin in bins {
            for i in 0..bin.count {
                points.xy[points.len] = to_xy(bin.angle[i], bin.speed[i]);
                points.len += 1;
            }
        }
        points
    }

    /// RMS distance of the samples from the circle.
    fn fit_error(&self, wx: f32, wy: f32, airspeed: f32) -> f32 {
        let points = &self.xy[..self.len];
        let sum: f32 = points
            .iter()
            .map(|&(x, y)| {
                let dr = speed_of(x - wx, y - wy) - airspeed;
                dr * dr
            })
            .sum();
        libm::sqrtf(sum / points.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn flying_estimator() -> WindEstimator {
        let wind = WindEstimator::new(&VarioConfig::default());
        wind.set_flying(true);
        wind
    }

    fn deg(d: f32) -> f32 {
        d.to_radians()
    }

    fn sample(track_deg: f32, speed: f32) -> GroundVelocitySample {
        GroundVelocitySample { track_angle: deg(track_deg), speed }
    }

    /// Ground velocity flying `heading` at `airspeed` in wind (wx, wy).
    fn circling(heading_deg: f32, airspeed: f32, wx: f32, wy: f32) -> GroundVelocitySample {
        let (ax, ay) = to_xy(deg(heading_deg), airspeed);
        let (gx, gy) = (ax + wx, ay + wy);
        GroundVelocitySample { track_angle: direction_of(gx, gy), speed: speed_of(gx, gy) }
    }

    #[test]
    fn four_point_circle_settles_on_no_wind() {
        let wind = flying_estimator();
        for track in [0.0, 90.0, 180.0, 270.0] {
            wind.on_receive(&sample(track, 10.0));
        }
        assert!(wind.has_enough_points());

        for _ in 0..50 {
            assert!(wind.estimate());
        }
        let est = wind.estimate_snapshot();
        assert!(est.valid);
        assert_abs_diff_eq!(est.wind_speed, 0.0, epsilon = 0.05);
        assert_abs_diff_eq!(est.airspeed, 10.0, epsilon = 0.05);
        assert!(est.error < 0.05);
    }

    #[test]
    fn narrow_arc_is_never_enough() {
        let wind = flying_estimator();
        for i in 0..500 {
            let track = 40.0 + (i % 101) as f32;
            wind.on_receive(&sample(track, 8.0 + (i % 3) as f32));
            assert!(!wind.has_enough_points());
            assert!(!wind.estimate());
        }
        assert!(!wind.estimate_snapshot().valid);
    }

    #[test]
    fn finds_offset_wind() {
        let wind = flying_estimator();
        for k in 0..8 {
            wind.on_receive(&circling(22.5 + 45.0 * k as f32, 11.0, 3.0, -1.0));
        }
        assert_eq!(wind.bin_counts(), [1; BIN_COUNT]);

        for _ in 0..200 {
            wind.estimate();
        }
        let est = wind.estimate_snapshot();
        assert_abs_diff_eq!(est.wind_speed, libm::sqrtf(10.0), epsilon = 0.15);
        assert_abs_diff_eq!(est.airspeed, 11.0, epsilon = 0.15);
        assert_abs_diff_eq!(est.wind_direction, libm::atan2f(3.0, -1.0), epsilon = 0.05);
        assert_abs_diff_eq!(est.wind_direction_from, libm::atan2f(3.0, -1.0) + PI, epsilon = 0.05);

        // Flying due north into that wind
        wind.on_receive(&circling(0.0, 11.0, 3.0, -1.0));
        assert_abs_diff_eq!(wind.estimate_snapshot().airspeed_live, 11.0, epsilon = 0.2);
    }

    #[test]
    fn error_counts_every_sample() {
        let wind = flying_estimator();
        for track in [0.0, 90.0, 180.0, 270.0] {
            wind.on_receive(&sample(track, 8.0));
            wind.on_receive(&sample(track, 12.0));
        }
        for _ in 0..50 {
            wind.estimate();
        }
        // Bin means sit on the circle; the samples are 2 m/s off it
        let (x, y) = wind.representatives().into_iter().flatten().find(|&(x, _)| x > 5.0).unwrap();
        assert_abs_diff_eq!(x, 10.0, epsilon = 1e-4);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-4);
        let est = wind.estimate_snapshot();
        assert_abs_diff_eq!(est.wind_speed, 0.0, epsilon = 0.05);
        assert_abs_diff_eq!(est.airspeed, 10.0, epsilon = 0.05);
        assert_abs_diff_eq!(est.error, 2.0, epsilon = 0.01);
    }

    #[test]
    fn half_circle_gap_is_not_enough() {
        let wind = flying_estimator();
        // Bins 2..=5 only
        for track in [100.0, 140.0, 190.0, 240.0] {
            wind.on_receive(&sample(track, 10.0));
        }
        assert_eq!(wind.bin_counts(), [0, 0, 1, 1, 1, 1, 0, 0]);
        assert!(!wind.has_enough_points());
        assert!(!wind.estimate());
    }

    #[test]
    fn arc_across_north_is_not_enough() {
        let wind = flying_estimator();
        for i in 0..=100 {
            let track = (310.0 + i as f32) % 360.0;
            wind.on_receive(&sample(track, 9.0));
        }
        assert_eq!(wind.bin_counts().map(|n| n > 0), [true, true, false, false, false, false, true, true]);
        assert!(!wind.has_enough_points());
        assert!(!wind.estimate());
        assert!(!wind.estimate_snapshot().valid);
    }

    #[test]
    fn bins_are_rings() {
        let wind = flying_estimator();
        for _ in 0..(SAMPLES_PER_BIN + 5) {
            wind.on_receive(&sample(10.0, 9.0));
        }
        assert_eq!(wind.bin_counts()[0], SAMPLES_PER_BIN);
        assert_eq!(wind.estimate_snapshot().recent_bin, Some(0));

        wind.on_receive(&sample(359.9, 9.0));
        assert_eq!(wind.estimate_snapshot().recent_bin, Some(7));
    }

    #[test]
    fn ignores_samples_on_the_ground() {
        let wind = WindEstimator::new(&VarioConfig::default());
        wind.on_receive(&sample(10.0, 9.0));
        assert_eq!(wind.bin_counts(), [0; BIN_COUNT]);
    }

    #[test]
    fn clear_resets_everything() {
        let wind = flying_estimator();
        for track in [0.0, 90.0, 180.0, 270.0] {
            wind.on_receive(&sample(track, 10.0));
        }
        wind.estimate();
        wind.clear();

        let est = wind.estimate_snapshot();
        assert!(!est.valid);
        assert_eq!(est.airspeed, 9.0);
        assert_eq!(est.error, f32::MAX);
        assert_eq!(est.recent_bin, None);
        assert!(!wind.has_enough_points());
    }
}
