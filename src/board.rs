use embassy_stm32::dma::NoDma;
use embassy_stm32::gpio::{AnyPin, Input, Level, Output, Pin, Pull, Speed};
use embassy_stm32::i2c::I2c;
use embassy_stm32::peripherals::{DMA1_CH1, I2C1, SPI1, USART3};
use embassy_stm32::rcc::*;
use embassy_stm32::spi::{Config as SpiConfig, Spi};
use embassy_stm32::time::Hertz as TimeHertz;
use embassy_stm32::usart::{Config as UsartConfig, Uart, UartRx};
use embassy_stm32::{bind_interrupts, peripherals, Config};

bind_interrupts!(struct Irqs {
    I2C1_EV  => embassy_stm32::i2c::EventInterruptHandler<peripherals::I2C1>;
    I2C1_ER  => embassy_stm32::i2c::ErrorInterruptHandler<peripherals::I2C1>;
    USART3   => embassy_stm32::usart::InterruptHandler<peripherals::USART3>;
});

pub type BaroI2c = I2c<'static, I2C1, NoDma, NoDma>;
pub type ImuSpi = Spi<'static, SPI1, NoDma, NoDma>;
pub type ImuCs = Output<'static, AnyPin>;
pub type GpsRx = UartRx<'static, USART3, DMA1_CH1>;

/// Everything the vario uses, configured.
pub struct Board {
    pub baro_i2c: BaroI2c,
    pub imu_spi: ImuSpi,
    pub imu_cs: ImuCs,
    pub gps_rx: GpsRx,
    pub led: Output<'static, AnyPin>,
    /// High while USB power is present.
    pub vbus: Input<'static, AnyPin>,
    /// Low while the power switch is off.
    pub power_switch: Input<'static, AnyPin>,
    pub usb: peripherals::USB_OTG_FS,
    pub usb_dp: peripherals::PA12,
    pub usb_dm: peripherals::PA11,
}

impl Board {
    pub fn init() -> Self {
        let mut config = Config::default();
        config.rcc.hse = Some(Hse {
            freq: TimeHertz(8_000_000),
            mode: HseMode::Oscillator,
        });
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL168,
            divp: Some(PllPDiv::DIV2), // 168 MHz
            divq: Some(PllQDiv::DIV7), // 48 MHz for USB
            divr: None,
        });
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;

        let p = embassy_stm32::init(config);

        // MS5611 @ 400 kHz (SCL=PB8, SDA=PB9)
        let baro_i2c = I2c::new(
            p.I2C1,
            p.PB8,
            p.PB9,
            Irqs,
            NoDma,
            NoDma,
            TimeHertz(400_000),
            Default::default(),
        );

        // ICM-42688 @ 10 MHz (SCK=PA5, MOSI=PA7, MISO=PA6, CS=PB12)
        let mut spi_config = SpiConfig::default();
        spi_config.frequency = TimeHertz(10_000_000);
        let imu_spi = Spi::new(p.SPI1, p.PA5, p.PA7, p.PA6, NoDma, NoDma, spi_config);
        let imu_cs = Output::new(p.PB12.degrade(), Level::High, Speed::VeryHigh);

        // GPS NMEA @ 9600 (TX=PB10, RX=PB11); the receiver is never written to
        let mut gps_config = UsartConfig::default();
        gps_config.baudrate = 9_600;
        let gps_rx = match Uart::new(
            p.USART3, p.PB11, p.PB10, Irqs, p.DMA1_CH3, p.DMA1_CH1, gps_config,
        ) {
            Ok(uart) => uart.split().1,
            Err(e) => defmt::panic!("gps uart config rejected: {}", defmt::Debug2Format(&e)),
        };

        Self {
            baro_i2c,
            imu_spi,
            imu_cs,
            gps_rx,
            led: Output::new(p.PC13.degrade(), Level::High, Speed::Low),
            vbus: Input::new(p.PA9.degrade(), Pull::Down),
            power_switch: Input::new(p.PB4.degrade(), Pull::Up),
            usb: p.USB_OTG_FS,
            usb_dp: p.PA12,
            usb_dm: p.PA11,
        }
    }
}
