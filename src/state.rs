//! Message and snapshot types exchanged between drivers, estimators and
//! consumers.
//!
//! Field order of the bus messages is part of the external interface;
//! subscribers outside this crate are compiled against it. All samples are
//! `Copy` so the bus can hand out references without ownership concerns.
use crate::time::Instant;

/// Longest NMEA sentence kept on the bus (82 + CR/LF).
pub const NMEA_MAX_LEN: usize = 84;
/// Longest diagnostic comment kept on the bus.
pub const COMMENT_MAX_LEN: usize = 96;

// ── Bus messages ──────────────────────────────────────────────────────────────

/// One temperature-compensated pressure reading.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PressureSample {
    pub time: Instant,
    /// Hundredths of millibar (Pa).
    pub pressure: i32,
}

/// One motion-sensor frame. Either half may be missing.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotionSample {
    pub time: Instant,
    pub has_accel: bool,
    /// Body-frame acceleration, g.
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    pub has_orientation: bool,
    /// Vector part of the orientation quaternion; `w >= 0` is implied.
    pub qx: f32,
    pub qy: f32,
    pub qz: f32,
}

impl MotionSample {
    pub fn empty(time: Instant) -> Self {
        Self {
            time,
            has_accel: false,
            ax: 0.0,
            ay: 0.0,
            az: 0.0,
            has_orientation: false,
            qx: 0.0,
            qy: 0.0,
            qz: 0.0,
        }
    }
}

/// Ground track and speed from a GPS fix.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GroundVelocitySample {
    /// Radians East of North, in `[0, 2π)`.
    pub track_angle: f32,
    /// m/s
    pub speed: f32,
}

/// A raw NMEA sentence as received from the GPS.
#[derive(Clone, Debug, PartialEq)]
pub struct GpsSentence {
    pub time: Instant,
    pub nmea: heapless::String<NMEA_MAX_LEN>,
}

/// Free-form diagnostic text, recorded in the bus log.
#[derive(Clone, Debug, PartialEq)]
pub struct Comment {
    pub time: Instant,
    pub text: heapless::String<COMMENT_MAX_LEN>,
}

impl Comment {
    /// Formats a comment, truncating what does not fit.
    pub fn new(time: Instant, args: core::fmt::Arguments<'_>) -> Self {
        let mut text = heapless::String::new();
        let _ = core::fmt::write(&mut Truncating(&mut text), args);
        Self { time, text }
    }
}

struct Truncating<'a, const N: usize>(&'a mut heapless::String<N>);

impl<const N: usize> core::fmt::Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ── Outputs ───────────────────────────────────────────────────────────────────

/// Altitudes derived from one pressure reading.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Altitude {
    /// Pressure altitude against 1013.25 hPa, m.
    pub standard_m: f32,
    /// Altitude against the current altimeter setting, cm.
    pub adjusted_cm: i32,
    /// `adjusted_cm` minus the launch altitude, cm.
    pub above_launch_cm: i32,
}

/// Climb rate as presented to consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Climb {
    /// Instantaneous Kalman velocity, m/s.
    pub raw_mps: f32,
    /// Short running average, cm/s. Drives the audio and the vario bar.
    pub filtered_cms: i32,
    /// Several-second average, cm/s.
    pub average_cms: f32,
}

/// Latest wind fit.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WindEstimate {
    /// m/s
    pub wind_speed: f32,
    /// Direction the wind blows toward, radians East of North.
    pub wind_direction: f32,
    /// Direction the wind blows from, radians East of North.
    pub wind_direction_from: f32,
    /// Fitted constant airspeed, m/s.
    pub airspeed: f32,
    /// Airspeed implied by the latest ground velocity, m/s.
    pub airspeed_live: f32,
    /// RMS deviation of the binned points from the fitted circle, m/s.
    pub error: f32,
    pub valid: bool,
    /// Bin that received the latest sample.
    pub recent_bin: Option<u8>,
}

/// Everything a display/audio/log consumer reads, copied out in one go.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VarioSnapshot {
    pub altitude: Option<Altitude>,
    pub climb: Climb,
    pub wind: WindEstimate,
}
