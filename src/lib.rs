//! Flight-instrument core of a wearable variometer.
//!
//! Everything in this crate runs on one cooperative loop driven by
//! [`tasks::Scheduler`]. Sensor drivers publish typed samples on the
//! [`bus::MessageBus`], estimators subscribe to them, and consumers copy
//! results out through plain accessors.
//!
//! The crate is `no_std`; host builds enable the `log` feature, firmware
//! builds enable `defmt` (see `src/main.rs`).
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fatal;

pub mod bus;
pub mod buslog;
pub mod drivers;
pub mod error;
pub mod instruments;
pub mod settings;
pub mod state;
pub mod tasks;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

pub use error::VarioError;
pub use settings::VarioConfig;
