//! Tunables passed in at startup.
//!
//! Persisting these is the settings store's job; this crate only validates
//! what it is handed and returns adjusted values for the store to save.

/// Altimeter setting at standard pressure, inHg.
pub const STANDARD_ALTIMETER_SETTING: f32 = 29.921;
pub const MIN_ALTIMETER_SETTING: f32 = 28.0;
pub const MAX_ALTIMETER_SETTING: f32 = 32.0;

/// Upper bound on the climb running-average window.
pub const MAX_CLIMB_FILTER_SAMPLES: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VarioConfig {
    /// inHg
    pub altimeter_setting: f32,
    /// Running-average length for the displayed climb rate.
    pub climb_filter_samples: usize,
    /// Pressure cycles per temperature conversion.
    pub temperature_every: u8,
    /// Kalman position measurement variance, m².
    pub position_variance: f32,
    /// Kalman acceleration process variance, (m/s²)².
    pub acceleration_variance: f32,
    /// Motion samples averaged before the gravity estimate goes exponential.
    pub warmup_samples: u32,
    /// Initial airspeed guess for the wind fit, m/s.
    pub standard_airspeed: f32,
    /// Coordinate-descent step of the wind fit, m/s.
    pub wind_step: f32,
}

impl Default for VarioConfig {
    fn default() -> Self {
        Self {
            altimeter_setting: STANDARD_ALTIMETER_SETTING,
            climb_filter_samples: 3,
            temperature_every: 20,
            position_variance: 0.1 * 0.1,
            acceleration_variance: 0.3 * 0.3,
            warmup_samples: 60,
            standard_airspeed: 9.0,
            wind_step: 0.1,
        }
    }
}

impl VarioConfig {
    /// Replaces out-of-range values loaded from storage with defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !altimeter_setting_in_range(self.altimeter_setting) {
            defmt_or_log::warn!("stored altimeter setting out of range, using standard");
            self.altimeter_setting = defaults.altimeter_setting;
        }
        if self.climb_filter_samples == 0 || self.climb_filter_samples > MAX_CLIMB_FILTER_SAMPLES {
            self.climb_filter_samples = defaults.climb_filter_samples;
        }
        if self.temperature_every == 0 {
            self.temperature_every = defaults.temperature_every;
        }
        if !(self.position_variance > 0.0) || !(self.acceleration_variance > 0.0) {
            self.position_variance = defaults.position_variance;
            self.acceleration_variance = defaults.acceleration_variance;
        }
        if !(self.standard_airspeed > 0.0) {
            self.standard_airspeed = defaults.standard_airspeed;
        }
        if !(self.wind_step > 0.0) {
            self.wind_step = defaults.wind_step;
        }
        self
    }
}

/// Open interval check used on load.
pub fn altimeter_setting_in_range(setting: f32) -> bool {
    setting > MIN_ALTIMETER_SETTING && setting < MAX_ALTIMETER_SETTING
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_valid_values() {
        let cfg = VarioConfig { altimeter_setting: 30.12, ..Default::default() };
        assert_eq!(cfg.sanitized(), cfg);
    }

    #[test]
    fn sanitize_replaces_garbage() {
        let cfg = VarioConfig {
            altimeter_setting: 0.0,
            climb_filter_samples: 50,
            temperature_every: 0,
            position_variance: f32::NAN,
            standard_airspeed: -1.0,
            ..Default::default()
        }
        .sanitized();
        let defaults = VarioConfig::default();
        assert_eq!(cfg.altimeter_setting, defaults.altimeter_setting);
        assert_eq!(cfg.climb_filter_samples, defaults.climb_filter_samples);
        assert_eq!(cfg.temperature_every, defaults.temperature_every);
        assert_eq!(cfg.position_variance, defaults.position_variance);
        assert_eq!(cfg.standard_airspeed, defaults.standard_airspeed);
    }

    #[test]
    fn range_is_open() {
        assert!(!altimeter_setting_in_range(28.0));
        assert!(!altimeter_setting_in_range(32.0));
        assert!(altimeter_setting_in_range(29.921));
    }
}
