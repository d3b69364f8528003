pub mod ahrs;
pub mod filter;
pub mod gps;
pub mod icm42688;
pub mod imu;
pub mod kalman;
pub mod ms5611;
