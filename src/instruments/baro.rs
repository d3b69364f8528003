//! Barometric altimeter: MS5611 compensation, altitudes, altimeter setting and
//! the climb rate shown to the pilot.
//!
//! The climb rate itself comes from the vertical Kalman filter run by the
//! motion processor; this module only post-filters it. Pressure arrives on
//! the bus, the climb post-filter runs from the scheduler's pressure slot.

use core::cell::RefCell;

use crate::bus::Subscriber;
use crate::drivers::filter::RunningAverage;
use crate::error::AltimeterError;
use crate::settings::{
    altimeter_setting_in_range, VarioConfig, MAX_ALTIMETER_SETTING, MAX_CLIMB_FILTER_SAMPLES,
    MIN_ALTIMETER_SETTING, STANDARD_ALTIMETER_SETTING,
};
use crate::state::{Altitude, Climb, PressureSample};

/// Standard sea-level pressure, Pa.
pub const STANDARD_PRESSURE_PA: f64 = 101_325.0;
/// Pa per inHg.
pub const PA_PER_INHG: f64 = 3386.389;

const ALTITUDE_SCALE_M: f64 = 44_330.0;
const ALTITUDE_EXPONENT: f64 = 0.190_264;

/// Long-term climb average: 4 s at 20 samples/s.
const CLIMB_AVERAGE_SAMPLES: f32 = 4.0 * 20.0;

// ── Compensation ─────────────────────────────────────────────────────────────

/// Factory PROM words 1..=6 of the MS5611.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationCoefficients {
    pub sens: u16,     // C1 pressure sensitivity
    pub off: u16,      // C2 pressure offset
    pub tcs: u16,      // C3 temp coefficient of sensitivity
    pub tco: u16,      // C4 temp coefficient of offset
    pub tref: u16,     // C5 reference temperature
    pub tempsens: u16, // C6 temp coefficient of temperature
}

impl CalibrationCoefficients {
    pub fn from_prom(words: [u16; 6]) -> Self {
        Self {
            sens: words[0],
            off: words[1],
            tcs: words[2],
            tco: words[3],
            tref: words[4],
            tempsens: words[5],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Compensated {
    /// Hundredths of °C.
    pub temperature: i32,
    /// Hundredths of mbar.
    pub pressure: i32,
}

/// Datasheet second-order compensation of raw pressure `d1` and raw
/// temperature `d2`.
pub fn compensate(c: &CalibrationCoefficients, d1: u32, d2: u32) -> Compensated {
    let dt = d2 as i64 - ((c.tref as i64) << 8);
    let mut temp = 2000 + dt * c.tempsens as i64 / (1 << 23);

    let mut off = ((c.off as i64) << 16) + c.tco as i64 * dt / (1 << 7);
    let mut sens = ((c.sens as i64) << 15) + c.tcs as i64 * dt / (1 << 8);

    let mut t2 = 0;
    let mut off2 = 0;
    let mut sens2 = 0;
    if temp < 2000 {
        let cold = (temp - 2000) * (temp - 2000);
        t2 = dt * dt / (1i64 << 31);
        off2 = 5 * cold / 2;
        sens2 = 5 * cold / 4;
    }
    if temp < -1500 {
        let very_cold = (temp + 1500) * (temp + 1500);
        off2 += 7 * very_cold;
        sens2 += 11 * very_cold / 2;
    }
    temp -= t2;
    off -= off2;
    sens -= sens2;

    let pressure = (d1 as i64 * sens / (1 << 21) - off) / (1 << 15);

    Compensated {
        temperature: temp as i32,
        pressure: pressure as i32,
    }
}

// ── Barometric formula ───────────────────────────────────────────────────────

/// Altitude (m) of `pressure_pa` against reference pressure `reference_pa`.
pub fn pressure_altitude(pressure_pa: f64, reference_pa: f64) -> f64 {
    ALTITUDE_SCALE_M * (1.0 - libm::pow(pressure_pa / reference_pa, ALTITUDE_EXPONENT))
}

/// Altimeter setting (inHg) under which `pressure_pa` reads `altitude_m`.
pub fn setting_for_altitude(pressure_pa: i32, altitude_m: f32) -> Result<f32, AltimeterError> {
    let ratio = 1.0 - altitude_m as f64 / ALTITUDE_SCALE_M;
    if !(ratio > 0.0) {
        return Err(AltimeterError::SettingOutOfRange);
    }
    let setting = pressure_pa as f64 / (PA_PER_INHG * libm::pow(ratio, 1.0 / ALTITUDE_EXPONENT));
    if !setting.is_finite() {
        return Err(AltimeterError::SettingOutOfRange);
    }
    Ok(setting as f32)
}

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AltimeterState {
    Uninitialized,
    WaitingForFirstReading,
    Ready,
    Sleeping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AltimeterEvent {
    Init,
    FirstReading,
    Sleep,
    Wake,
}

const TRANSITIONS: &[(AltimeterState, AltimeterEvent, AltimeterState)] = &[
    (AltimeterState::Uninitialized, AltimeterEvent::Init, AltimeterState::WaitingForFirstReading),
    (AltimeterState::WaitingForFirstReading, AltimeterEvent::FirstReading, AltimeterState::Ready),
    (AltimeterState::Ready, AltimeterEvent::Sleep, AltimeterState::Sleeping),
    (AltimeterState::Sleeping, AltimeterEvent::Wake, AltimeterState::Ready),
];

pub fn next_state(
    from: AltimeterState,
    event: AltimeterEvent,
) -> Result<AltimeterState, AltimeterError> {
    TRANSITIONS
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
        .ok_or(AltimeterError::InvalidTransition { from, event })
}

// ── Altimeter ────────────────────────────────────────────────────────────────

struct Inner {
    state: AltimeterState,
    setting_inhg: f32,
    pressure: i32,
    altitude: Altitude,
    launch_cm: i32,
    climb: Climb,
    climb_filter: RunningAverage<MAX_CLIMB_FILTER_SAMPLES>,
    first_climb: bool,
    filter_pending: bool,
}

impl Inner {
    fn apply(&mut self, event: AltimeterEvent) -> Result<(), AltimeterError> {
        self.state = next_state(self.state, event)?;
        Ok(())
    }

    fn calculate_altitudes(&mut self) {
        let p = self.pressure as f64;
        let standard = pressure_altitude(p, STANDARD_PRESSURE_PA);
        if !standard.is_finite() {
            fatal!("standard altitude invalid for pressure {}", self.pressure);
        }
        let adjusted = pressure_altitude(p, self.setting_inhg as f64 * PA_PER_INHG);
        if !adjusted.is_finite() {
            fatal!("adjusted altitude invalid, setting {}", self.setting_inhg);
        }
        let adjusted_cm = (adjusted * 100.0) as i32;
        self.altitude = Altitude {
            standard_m: standard as f32,
            adjusted_cm,
            above_launch_cm: adjusted_cm - self.launch_cm,
        };
    }

    fn zero_climb(&mut self) {
        self.climb = Climb::default();
    }

    fn filter_climb(&mut self, velocity: f32) {
        if !velocity.is_finite() {
            fatal!("climb rate invalid: {}", velocity);
        }
        // No previous estimate to compare against on (re)start
        if self.first_climb {
            self.zero_climb();
            self.first_climb = false;
            return;
        }
        self.climb_filter.update(velocity);
        let filtered = self.climb_filter.average();
        if !filtered.is_finite() {
            fatal!("filtered climb invalid: {}", filtered);
        }
        let filtered_cms = (filtered * 100.0) as i32;
        let average = (self.climb.average_cms * (CLIMB_AVERAGE_SAMPLES - 1.0) + filtered_cms as f32)
            / CLIMB_AVERAGE_SAMPLES;
        self.climb = Climb {
            raw_mps: velocity,
            filtered_cms,
            average_cms: average,
        };
    }
}

/// Barometric altimeter, shared by reference between the bus and the
/// scheduler.
pub struct Altimeter {
    inner: RefCell<Inner>,
}

impl Altimeter {
    pub fn new(config: &VarioConfig) -> Self {
        let setting = if altimeter_setting_in_range(config.altimeter_setting) {
            config.altimeter_setting
        } else {
            STANDARD_ALTIMETER_SETTING
        };
        Self {
            inner: RefCell::new(Inner {
                state: AltimeterState::Uninitialized,
                setting_inhg: setting,
                pressure: 0,
                altitude: Altitude::default(),
                launch_cm: 0,
                climb: Climb::default(),
                climb_filter: RunningAverage::new(config.climb_filter_samples),
                first_climb: true,
                filter_pending: false,
            }),
        }
    }

    pub fn init(&self) -> Result<(), AltimeterError> {
        self.inner.borrow_mut().apply(AltimeterEvent::Init)
    }

    pub fn state(&self) -> AltimeterState {
        self.inner.borrow().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AltimeterState::Ready
    }

    /// Stops climb output until [`Altimeter::wake`].
    pub fn sleep(&self) -> Result<(), AltimeterError> {
        let mut inner = self.inner.borrow_mut();
        inner.apply(AltimeterEvent::Sleep)?;
        inner.zero_climb();
        inner.first_climb = true;
        inner.filter_pending = false;
        Ok(())
    }

    pub fn wake(&self) -> Result<(), AltimeterError> {
        let mut inner = self.inner.borrow_mut();
        inner.apply(AltimeterEvent::Wake)?;
        inner.first_climb = true;
        inner.climb_filter.reset();
        Ok(())
    }

    /// Post-filters the Kalman climb rate after a new pressure reading.
    /// `velocity` is `None` until the Kalman filter has been seeded.
    pub fn update(&self, velocity: Option<f32>) {
        let mut inner = self.inner.borrow_mut();
        let state = inner.state;
        match state {
            AltimeterState::Sleeping => {
                inner.zero_climb();
                inner.first_climb = true;
            }
            AltimeterState::Ready if inner.filter_pending => {
                if let Some(v) = velocity {
                    inner.filter_climb(v);
                    inner.filter_pending = false;
                }
            }
            _ => {}
        }
    }

    pub fn set_filter_samples(&self, samples: usize) {
        self.inner.borrow_mut().climb_filter.set_window(samples);
    }

    pub fn setting(&self) -> f32 {
        self.inner.borrow().setting_inhg
    }

    /// Nudges the altimeter setting and returns the new value for storage.
    ///
    /// `count` is how long the button has been held: one step is .001 inHg,
    /// x10 from the first repeat, x50 from the eighth.
    pub fn adjust_setting(&self, dir: i8, count: u8) -> f32 {
        let mut step = 0.001;
        if count >= 1 {
            step *= 10.0;
        }
        if count >= 8 {
            step *= 5.0;
        }

        let mut inner = self.inner.borrow_mut();
        if dir >= 1 {
            inner.setting_inhg = (inner.setting_inhg + step).min(MAX_ALTIMETER_SETTING);
        } else if dir <= -1 {
            inner.setting_inhg = (inner.setting_inhg - step).max(MIN_ALTIMETER_SETTING);
        }
        if inner.state != AltimeterState::Uninitialized
            && inner.state != AltimeterState::WaitingForFirstReading
        {
            inner.calculate_altitudes();
        }
        inner.setting_inhg
    }

    /// Solves for the setting that makes the current pressure read
    /// `altitude_m` (e.g. GPS altitude), applies it and returns it.
    pub fn sync_to_altitude(&self, altitude_m: f32) -> Result<f32, AltimeterError> {
        let mut inner = self.inner.borrow_mut();
        if inner.state != AltimeterState::Ready {
            return Err(AltimeterError::NotReady(inner.state));
        }
        let setting = setting_for_altitude(inner.pressure, altitude_m)?;
        if !(MIN_ALTIMETER_SETTING..=MAX_ALTIMETER_SETTING).contains(&setting) {
            return Err(AltimeterError::SettingOutOfRange);
        }
        inner.setting_inhg = setting;
        inner.calculate_altitudes();
        defmt_or_log::info!("altimeter synced to {} m, setting {} inHg", altitude_m, setting);
        Ok(setting)
    }

    pub fn reset_launch(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.launch_cm = inner.altitude.adjusted_cm;
        inner.altitude.above_launch_cm = 0;
    }

    pub fn try_altitude(&self) -> Result<Altitude, AltimeterError> {
        let inner = self.inner.borrow();
        match inner.state {
            AltimeterState::Ready => Ok(inner.altitude),
            state => Err(AltimeterError::NotReady(state)),
        }
    }

    /// Altitudes from the last reading. Halts when not ready.
    pub fn altitude(&self) -> Altitude {
        match self.try_altitude() {
            Ok(a) => a,
            Err(e) => fatal!("altitude read while not ready: {:?}", e),
        }
    }

    /// Standard-pressure altitude for the Kalman filter, `None` when not ready.
    pub fn standard_altitude(&self) -> Option<f32> {
        self.try_altitude().ok().map(|a| a.standard_m)
    }

    /// Climb rates. Zero while sleeping; halts before the first reading.
    pub fn try_climb(&self) -> Result<Climb, AltimeterError> {
        let inner = self.inner.borrow();
        match inner.state {
            AltimeterState::Ready => Ok(inner.climb),
            AltimeterState::Sleeping => Ok(Climb::default()),
            state => Err(AltimeterError::NotReady(state)),
        }
    }

    pub fn climb(&self) -> Climb {
        match self.try_climb() {
            Ok(c) => c,
            Err(e) => fatal!("climb read while not ready: {:?}", e),
        }
    }

    /// Last compensated pressure, Pa.
    pub fn pressure(&self) -> i32 {
        self.inner.borrow().pressure
    }
}

impl Subscriber<PressureSample> for Altimeter {
    fn on_receive(&self, msg: &PressureSample) {
        let mut inner = self.inner.borrow_mut();
        let state = inner.state;
        match state {
            AltimeterState::Uninitialized => {}
            AltimeterState::WaitingForFirstReading => {
                inner.pressure = msg.pressure;
                inner.launch_cm = 0;
                inner.calculate_altitudes();
                inner.launch_cm = inner.altitude.adjusted_cm;
                inner.altitude.above_launch_cm = 0;
                inner.first_climb = true;
                // Always legal from this state
                let _ = inner.apply(AltimeterEvent::FirstReading);
                defmt_or_log::info!("first pressure reading {} Pa", msg.pressure);
            }
            AltimeterState::Ready => {
                inner.pressure = msg.pressure;
                inner.calculate_altitudes();
                inner.filter_pending = true;
            }
            AltimeterState::Sleeping => {
                inner.pressure = msg.pressure;
                inner.calculate_altitudes();
            }
        }
    }
}
