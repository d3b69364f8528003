//! The cooperative main loop: a fixed slot table stepped by a 10 ms tick.

pub mod schedule;
pub mod scheduler;

pub use schedule::{AmbientStep, Due, Task, TaskSchedule};
pub use scheduler::{ExternalTasks, Instruments, PowerState, Scheduler, Sensors, TickFlags};
