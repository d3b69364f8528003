//! Recoverable error types.
//!
//! Anything in here is reported to the scheduler's fault sink and the task is
//! retried on its next slot. Conditions that must halt the device go through
//! `fatal!` instead.

use thiserror::Error;

use crate::instruments::baro::{AltimeterEvent, AltimeterState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    #[error("i2c transfer failed: {0:?}")]
    I2c(embedded_hal::i2c::ErrorKind),
    #[error("spi transfer failed: {0:?}")]
    Spi(embedded_hal::spi::ErrorKind),
    #[error("chip select pin failed")]
    Pin,
    #[error("sensor used before init")]
    NotInitialized,
    #[error("orientation out of range")]
    InvalidOrientation,
    #[error("acceleration out of range")]
    InvalidAcceleration,
}

impl SensorError {
    pub fn i2c<E: embedded_hal::i2c::Error>(e: E) -> Self {
        SensorError::I2c(e.kind())
    }

    pub fn spi<E: embedded_hal::spi::Error>(e: E) -> Self {
        SensorError::Spi(e.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AltimeterError {
    #[error("altimeter not ready (state {0:?})")]
    NotReady(AltimeterState),
    #[error("altimeter cannot handle {event:?} while {from:?}")]
    InvalidTransition {
        from: AltimeterState,
        event: AltimeterEvent,
    },
    #[error("altitude out of range for altimeter setting")]
    SettingOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    #[error("no free subscriber slot")]
    NoFreeSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VarioError {
    #[error("sensor: {0}")]
    Sensor(#[from] SensorError),
    #[error("altimeter: {0}")]
    Altimeter(#[from] AltimeterError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}
