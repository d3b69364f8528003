use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::error::SensorError;

const REG_DEVICE_CONFIG: u8 = 0x11;
const REG_ACCEL_DATA_X1: u8 = 0x1F;
const REG_PWR_MGMT0: u8 = 0x4E;
const REG_WHO_AM_I: u8 = 0x75;

const WHO_AM_I: u8 = 0x47;

/// ±16 g full scale
pub const ACCEL_LSB_PER_G: f32 = 2048.0;
/// ±2000 dps full scale
pub const GYRO_LSB_PER_DPS: f32 = 16.4;

/// ICM-42688 on a SPI bus with a dedicated chip select.
pub struct Icm42688<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI: SpiBus, CS: OutputPin> Icm42688<SPI, CS> {
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    fn select<R>(&mut self, f: impl FnOnce(&mut SPI) -> Result<R, SPI::Error>) -> Result<R, SensorError> {
        self.cs.set_low().map_err(|_| SensorError::Pin)?;
        let res = f(&mut self.spi).and_then(|r| self.spi.flush().map(|_| r));
        // Release the bus even if the transfer failed
        self.cs.set_high().map_err(|_| SensorError::Pin)?;
        res.map_err(SensorError::spi)
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError> {
        let buf = [reg & 0x7F, value];
        self.select(|spi| spi.write(&buf))
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, SensorError> {
        let mut buf = [reg | 0x80, 0x00];
        self.select(|spi| spi.transfer_in_place(&mut buf))?;
        Ok(buf[1])
    }

    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<(), SensorError> {
        // Soft reset
        self.write_reg(REG_DEVICE_CONFIG, 0x01)?;
        delay.delay_ms(10);

        let id = self.read_reg(REG_WHO_AM_I)?;
        if id != WHO_AM_I {
            defmt_or_log::warn!("icm42688 unexpected WHO_AM_I {}", id);
        }

        // Gyro and accel in low noise mode
        self.write_reg(REG_PWR_MGMT0, 0x0F)?;
        delay.delay_ms(50);

        Ok(())
    }

    pub fn read_who_am_i(&mut self) -> Result<u8, SensorError> {
        self.read_reg(REG_WHO_AM_I)
    }

    /// Raw accel and gyro counts, big-endian burst from ACCEL_DATA_X1.
    pub fn read_all(&mut self) -> Result<([i16; 3], [i16; 3]), SensorError> {
        let mut buf = [0u8; 13];
        buf[0] = REG_ACCEL_DATA_X1 | 0x80;
        self.select(|spi| spi.transfer_in_place(&mut buf))?;

        let word = |i: usize| i16::from_be_bytes([buf[i], buf[i + 1]]);
        Ok((
            [word(1), word(3), word(5)],
            [word(7), word(9), word(11)],
        ))
    }
}
