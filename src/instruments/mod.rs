//! Estimators fed from the bus: altimeter, motion processing and wind.

pub mod baro;
pub mod imu;
pub mod wind;

pub use baro::Altimeter;
pub use imu::MotionProcessor;
pub use wind::WindEstimator;
