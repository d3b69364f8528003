//! Host-side stand-ins for hardware shared by the unit tests.

use core::cell::Cell;

use crate::time::{Clock, Duration, Instant};

/// Clock that only moves when told to.
pub struct ManualClock {
    now_us: Cell<u64>,
    auto_step_us: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now_us: Cell::new(0), auto_step_us: 0 }
    }

    /// Clock that advances by `step` every time it is read.
    pub fn auto_advancing(step: Duration) -> Self {
        Self { now_us: Cell::new(0), auto_step_us: step.ticks() }
    }

    pub fn advance(&self, by: Duration) {
        self.now_us.set(self.now_us.get() + by.ticks());
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let now = self.now_us.get();
        self.now_us.set(now + self.auto_step_us);
        Instant::from_ticks(now)
    }
}

pub fn at_ms(ms: u64) -> Instant {
    Instant::from_ticks(ms * 1_000)
}

/// Delay that returns immediately.
pub struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Simulated MS5611: answers PROM reads and returns D1/D2 for the last
/// conversion started.
pub struct FakeMs5611 {
    pub prom: [u16; 8],
    pub d1: u32,
    pub d2: u32,
    pub commands: Vec<u8>,
    pub fail: bool,
    last_cmd: u8,
    converting: Option<u8>,
}

impl FakeMs5611 {
    const CONVERT_D1: u8 = 0x48;
    const CONVERT_D2: u8 = 0x58;

    /// Datasheet example chip reading 100009 Pa at 20.07 °C.
    pub fn new() -> Self {
        Self {
            prom: [0, 40127, 36924, 23317, 23282, 33464, 28312, 0],
            d1: 9_085_466,
            d2: 8_569_150,
            commands: Vec::new(),
            fail: false,
            last_cmd: 0xFF,
            converting: None,
        }
    }
}

impl embedded_hal::i2c::ErrorType for FakeMs5611 {
    type Error = embedded_hal::i2c::ErrorKind;
}

impl embedded_hal::i2c::I2c for FakeMs5611 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [embedded_hal::i2c::Operation<'_>],
    ) -> Result<(), Self::Error> {
        use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource, Operation};

        assert_eq!(address, 0x77);
        if self.fail {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => {
                    let cmd = bytes[0];
                    self.commands.push(cmd);
                    if cmd == Self::CONVERT_D1 || cmd == Self::CONVERT_D2 {
                        self.converting = Some(cmd);
                    }
                    self.last_cmd = cmd;
                }
                Operation::Read(buf) => {
                    if self.last_cmd & 0xF0 == 0xA0 {
                        let word = self.prom[((self.last_cmd >> 1) & 0x07) as usize];
                        buf.copy_from_slice(&word.to_be_bytes());
                    } else if self.last_cmd == 0x00 {
                        let value = match self.converting.take() {
                            Some(Self::CONVERT_D1) => self.d1,
                            Some(Self::CONVERT_D2) => self.d2,
                            _ => 0,
                        };
                        buf.copy_from_slice(&value.to_be_bytes()[1..]);
                    }
                }
            }
        }
        Ok(())
    }
}
