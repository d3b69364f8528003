use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::bus::MessageBus;
use crate::drivers::gps::{Gps, GpsStream};
use crate::drivers::imu::{MotionFrontEnd, MotionSource};
use crate::drivers::ms5611::{Ms5611, PressureUpdate};
use crate::error::{BusError, VarioError};
use crate::instruments::{Altimeter, MotionProcessor, WindEstimator};
use crate::state::{GroundVelocitySample, MotionSample, PressureSample, VarioSnapshot};
use crate::tasks::schedule::{AmbientStep, Due, Task, TaskSchedule};
use crate::time::Clock;

// ── Tick flags ────────────────────────────────────────────────────────────────

/// Set from the timer interrupts, consumed by the loop. The handlers do
/// nothing but raise these.
pub struct TickFlags {
    slice: AtomicBool,
    charge: AtomicBool,
}

impl Default for TickFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl TickFlags {
    pub const fn new() -> Self {
        Self {
            slice: AtomicBool::new(false),
            charge: AtomicBool::new(false),
        }
    }

    /// 10 ms timer.
    pub fn on_slice_tick(&self) {
        self.slice.store(true, Ordering::Release);
    }

    /// 500 ms timer.
    pub fn on_charge_tick(&self) {
        self.charge.store(true, Ordering::Release);
    }

    pub fn take_slice(&self) -> bool {
        self.slice.swap(false, Ordering::AcqRel)
    }

    pub fn take_charge(&self) -> bool {
        self.charge.swap(false, Ordering::AcqRel)
    }

    pub fn slice_pending(&self) -> bool {
        self.slice.load(Ordering::Acquire)
    }
}

// ── Collaborators ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    On,
    /// Switched off but charging over USB.
    OffUsb,
}

/// Work the loop schedules but does not own: UI, audio, storage, radio and
/// power management. Every hook defaults to doing nothing.
pub trait ExternalTasks {
    fn buttons(&mut self) {}
    fn power(&mut self) {}
    fn log(&mut self) {}
    fn display(&mut self, _snapshot: &VarioSnapshot) {}
    fn ambient(&mut self, _step: AmbientStep) {}
    fn storage(&mut self) {}
    fn radio(&mut self, _snapshot: &VarioSnapshot) {}

    fn power_state(&self) -> PowerState {
        PowerState::On
    }

    /// Gates wind sampling.
    fn is_flying(&self) -> bool {
        false
    }

    /// Recoverable failure of `task`; it runs again on its next slot.
    fn on_fault(&mut self, task: Task, error: VarioError) {
        defmt_or_log::warn!("{:?} task failed: {:?}", task, error);
    }
}

/// Hardware the loop steps directly.
pub struct Sensors<I2C, M, G> {
    pub pressure: Ms5611<I2C>,
    pub motion: MotionFrontEnd<M>,
    pub gps: Gps<G>,
}

/// Estimators fed from the bus. Shared so consumers can read them too.
#[derive(Clone, Copy)]
pub struct Instruments<'a> {
    pub altimeter: &'a Altimeter,
    pub motion: &'a MotionProcessor<'a>,
    pub wind: &'a WindEstimator,
}

impl<'a> Instruments<'a> {
    pub fn subscribe<C: Clock>(&self, bus: &MessageBus<'a, C>) -> Result<(), BusError> {
        bus.subscribe::<PressureSample>(self.altimeter)?;
        bus.subscribe::<MotionSample>(self.motion)?;
        bus.subscribe::<GroundVelocitySample>(self.wind)?;
        Ok(())
    }

    pub fn snapshot(&self) -> VarioSnapshot {
        VarioSnapshot {
            altitude: self.altimeter.try_altitude().ok(),
            climb: self.altimeter.try_climb().unwrap_or_default(),
            wind: self.wind.estimate_snapshot(),
        }
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

pub struct Scheduler<'a, C: Clock, I2C, M, G, X> {
    bus: MessageBus<'a, C>,
    flags: &'a TickFlags,
    schedule: TaskSchedule,
    sensors: Sensors<I2C, M, G>,
    instruments: Instruments<'a>,
    external: X,
    power_state: PowerState,
}

impl<'a, C, I2C, M, G, X> Scheduler<'a, C, I2C, M, G, X>
where
    C: Clock,
    I2C: I2c,
    M: MotionSource,
    G: GpsStream,
    X: ExternalTasks,
{
    pub fn new(
        clock: &'a C,
        flags: &'a TickFlags,
        sensors: Sensors<I2C, M, G>,
        instruments: Instruments<'a>,
        external: X,
    ) -> Self {
        Self {
            bus: MessageBus::new(clock),
            flags,
            schedule: TaskSchedule::new(),
            sensors,
            instruments,
            external,
            power_state: PowerState::On,
        }
    }

    /// Brings up the pressure sensor and wires the estimators to the bus.
    /// The motion sensor is expected to be configured already.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<(), VarioError> {
        self.sensors.pressure.init(delay)?;
        self.instruments.subscribe(&self.bus)?;
        self.instruments.altimeter.init()?;
        defmt_or_log::info!("scheduler ready");
        Ok(())
    }

    pub fn bus(&self) -> &MessageBus<'a, C> {
        &self.bus
    }

    pub fn instruments(&self) -> Instruments<'a> {
        self.instruments
    }

    pub fn sensors_mut(&mut self) -> &mut Sensors<I2C, M, G> {
        &mut self.sensors
    }

    pub fn external(&self) -> &X {
        &self.external
    }

    pub fn external_mut(&mut self) -> &mut X {
        &mut self.external
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    pub fn snapshot(&self) -> VarioSnapshot {
        self.instruments.snapshot()
    }

    /// One pass of the main loop. Returns the slot that ran, if a slice was
    /// due. Call it as often as possible; it never blocks.
    pub fn run_once(&mut self) -> Option<Due> {
        self.instruments.wind.set_flying(self.external.is_flying());

        let power_state = self.external.power_state();
        if power_state != self.power_state {
            self.switch_power(power_state);
        }

        match self.power_state {
            PowerState::OffUsb => {
                if self.flags.take_charge() {
                    self.run_charge_loop();
                }
                None
            }
            PowerState::On => {
                if !self.flags.take_slice() {
                    return None;
                }
                let due = self.schedule.advance();
                for task in due.tasks.iter() {
                    self.run_task(task, &due);
                }
                self.drain_gps();
                Some(due)
            }
        }
    }

    fn run_task(&mut self, task: Task, due: &Due) {
        match task {
            Task::Pressure => {
                match self.sensors.pressure.poll(&self.bus, due.start_pressure_cycle) {
                    Ok(PressureUpdate::Published(_)) => {
                        let altimeter = self.instruments.altimeter;
                        altimeter.update(self.instruments.motion.velocity());
                    }
                    Ok(_) => {}
                    Err(e) => self.external.on_fault(task, e.into()),
                }
            }
            Task::Buttons => self.external.buttons(),
            Task::Motion => {
                if let Err(e) = self.sensors.motion.step(&self.bus) {
                    self.external.on_fault(task, e.into());
                }
            }
            Task::Wind => {
                // Too few points is not a fault
                self.instruments.wind.estimate();
            }
            Task::Gps => {
                self.sensors.gps.update(self.bus.clock().now());
            }
            Task::Power => self.external.power(),
            Task::Log => self.external.log(),
            Task::Display => {
                let snapshot = self.instruments.snapshot();
                self.external.display(&snapshot);
            }
            Task::Ambient => {
                if let Some(step) = due.ambient {
                    self.external.ambient(step);
                }
            }
            Task::Storage => self.external.storage(),
            Task::Radio => {
                let snapshot = self.instruments.snapshot();
                self.external.radio(&snapshot);
            }
        }
    }

    // Uses what is left of the slice; stops as soon as the next one is due.
    fn drain_gps(&mut self) {
        while !self.flags.slice_pending() {
            if !self.sensors.gps.drain_byte(&self.bus) {
                break;
            }
        }
    }

    fn run_charge_loop(&mut self) {
        let snapshot = self.instruments.snapshot();
        self.external.display(&snapshot);
        self.external.storage();
        self.external.power();
        self.external.buttons();
    }

    fn switch_power(&mut self, next: PowerState) {
        defmt_or_log::info!("power {:?} -> {:?}", self.power_state, next);
        let result = match next {
            PowerState::OffUsb => self.instruments.altimeter.sleep(),
            PowerState::On => {
                self.instruments.motion.wake();
                // Stale ticks from the charge loop
                self.flags.take_slice();
                self.instruments.altimeter.wake()
            }
        };
        if let Err(e) = result {
            self.external.on_fault(Task::Power, e.into());
        }
        self.power_state = next;
    }
}
