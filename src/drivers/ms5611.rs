use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::bus::MessageBus;
use crate::error::SensorError;
use crate::instruments::baro::{compensate, CalibrationCoefficients};
use crate::state::PressureSample;
use crate::time::{Clock, Duration, Instant};

const ADDR: u8 = 0x77;
const CMD_RESET: u8 = 0x1E;
const CMD_PROM_READ: u8 = 0xA0; // | (addr << 1)
const CMD_CONVERT_PRESSURE: u8 = 0x48; // D1, OSR 4096
const CMD_CONVERT_TEMP: u8 = 0x58; // D2, OSR 4096
const CMD_ADC_READ: u8 = 0x00;

/// Minimum time between a convert command and reading the ADC.
pub const CONVERSION_TIME: Duration = Duration::micros(9_000);
const RESET_TIME_MS: u32 = 3;

// Stand-in for a zero read before any good value exists
const MISREAD_FALLBACK: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ms5611State {
    Uninitialized,
    Idle,
    MeasuringPressure,
    MeasuringTemperature,
}

/// Outcome of one [`Ms5611::poll`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PressureUpdate {
    /// No cycle running and none requested.
    Idle,
    /// Conversion still settling.
    Busy,
    /// A conversion was started.
    Converting,
    /// Cycle finished; the sample is already on the bus.
    Published(PressureSample),
}

/// MS5611 over I2C, stepped from the scheduler without blocking.
pub struct Ms5611<I2C> {
    i2c: I2C,
    state: Ms5611State,
    coeffs: CalibrationCoefficients,
    // Last good raw readings
    d1: u32,
    d2: u32,
    temperature: i32,
    started_at: Instant,
    cycle: u8,
    temperature_every: u8,
    measure_temperature: bool,
}

impl<I2C: I2c> Ms5611<I2C> {
    pub fn new(i2c: I2C, temperature_every: u8) -> Self {
        Self {
            i2c,
            state: Ms5611State::Uninitialized,
            coeffs: CalibrationCoefficients::default(),
            d1: MISREAD_FALLBACK,
            d2: MISREAD_FALLBACK,
            temperature: 0,
            started_at: Instant::from_ticks(0),
            cycle: 0,
            temperature_every: temperature_every.max(1),
            measure_temperature: false,
        }
    }

    /// Resets the sensor and reads the factory calibration.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<CalibrationCoefficients, SensorError> {
        self.command(CMD_RESET)?;
        delay.delay_ms(RESET_TIME_MS);

        let mut words = [0u16; 6];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read_prom(i as u8 + 1)?;
        }
        self.coeffs = CalibrationCoefficients::from_prom(words);
        self.state = Ms5611State::Idle;
        self.cycle = 0;

        defmt_or_log::info!("ms5611 calibration read: {:?}", self.coeffs);
        Ok(self.coeffs)
    }

    pub fn i2c_mut(&mut self) -> &mut I2C {
        &mut self.i2c
    }

    pub fn state(&self) -> Ms5611State {
        self.state
    }

    pub fn coefficients(&self) -> CalibrationCoefficients {
        self.coeffs
    }

    /// Sensor die temperature from the last cycle, hundredths of °C.
    pub fn temperature(&self) -> i32 {
        self.temperature
    }

    /// Advances the conversion state machine. Starts a new cycle only when
    /// idle and `start_cycle` is set. A finished cycle is published on `bus`.
    pub fn poll<C: Clock>(
        &mut self,
        bus: &MessageBus<'_, C>,
        start_cycle: bool,
    ) -> Result<PressureUpdate, SensorError> {
        let result = self.step(bus, start_cycle);
        if result.is_err() && self.state != Ms5611State::Uninitialized {
            // Retry from a fresh cycle
            self.state = Ms5611State::Idle;
        }
        result
    }

    fn step<C: Clock>(
        &mut self,
        bus: &MessageBus<'_, C>,
        start_cycle: bool,
    ) -> Result<PressureUpdate, SensorError> {
        let now = bus.clock().now();
        match self.state {
            Ms5611State::Uninitialized => Err(SensorError::NotInitialized),
            Ms5611State::Idle => {
                if !start_cycle {
                    return Ok(PressureUpdate::Idle);
                }
                self.command(CMD_CONVERT_PRESSURE)?;
                self.started_at = now;
                self.state = Ms5611State::MeasuringPressure;
                self.measure_temperature = self.cycle == 0;
                self.cycle = (self.cycle + 1) % self.temperature_every;
                Ok(PressureUpdate::Converting)
            }
            Ms5611State::MeasuringPressure => {
                if !self.settled(now) {
                    return Ok(PressureUpdate::Busy);
                }
                let raw = self.read_adc()?;
                self.d1 = substitute_misread("pressure", raw, self.d1);

                if self.measure_temperature {
                    self.command(CMD_CONVERT_TEMP)?;
                    self.started_at = now;
                    self.state = Ms5611State::MeasuringTemperature;
                    Ok(PressureUpdate::Converting)
                } else {
                    Ok(PressureUpdate::Published(self.publish(bus, now)))
                }
            }
            Ms5611State::MeasuringTemperature => {
                if !self.settled(now) {
                    return Ok(PressureUpdate::Busy);
                }
                let raw = self.read_adc()?;
                self.d2 = substitute_misread("temperature", raw, self.d2);
                Ok(PressureUpdate::Published(self.publish(bus, now)))
            }
        }
    }

    fn settled(&self, now: Instant) -> bool {
        now.checked_duration_since(self.started_at)
            .is_some_and(|elapsed| elapsed > CONVERSION_TIME)
    }

    fn publish<C: Clock>(&mut self, bus: &MessageBus<'_, C>, now: Instant) -> PressureSample {
        let compensated = compensate(&self.coeffs, self.d1, self.d2);
        self.temperature = compensated.temperature;
        self.state = Ms5611State::Idle;

        let sample = PressureSample {
            time: now,
            pressure: compensated.pressure,
        };
        bus.publish(&sample);
        sample
    }

    fn command(&mut self, cmd: u8) -> Result<(), SensorError> {
        self.i2c.write(ADDR, &[cmd]).map_err(SensorError::i2c)
    }

    fn read_prom(&mut self, addr: u8) -> Result<u16, SensorError> {
        self.command(CMD_PROM_READ | (addr << 1))?;
        let mut buf = [0u8; 2];
        self.i2c.read(ADDR, &mut buf).map_err(SensorError::i2c)?;
        Ok(u16::from_be_bytes(buf))
    }

    // 24-bit result of the last conversion
    fn read_adc(&mut self) -> Result<u32, SensorError> {
        self.command(CMD_ADC_READ)?;
        let mut buf = [0u8; 3];
        self.i2c.read(ADDR, &mut buf).map_err(SensorError::i2c)?;
        Ok(((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32))
    }
}

// Zero is what the sensor returns when the read raced the conversion.
fn substitute_misread(what: &str, raw: u32, last_good: u32) -> u32 {
    if raw == 0 {
        defmt_or_log::debug!("ms5611 {} misread, reusing {}", what, last_good);
        last_good
    } else {
        raw
    }
}
