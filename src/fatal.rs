/// Halts the device with a diagnostic.
///
/// Reserved for invariant violations where continuing would show the pilot
/// wrong flight data: non-finite estimator state, reading an estimator that
/// never produced a value, or losing the bus lock.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        defmt_or_log::error!($($arg)*);
        panic!($($arg)*)
    }};
}
