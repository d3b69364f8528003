#![no_std]
#![no_main]

mod board;
mod usb;

use embassy_executor::{InterruptExecutor, Spawner};
use embassy_futures::yield_now;
use embassy_stm32::gpio::{AnyPin, Input, Output};
use embassy_stm32::interrupt;
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Sender};
use embassy_sync::pipe::Pipe;
use embassy_time::{Delay, Duration, Ticker, Timer};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use vario_fusion::buslog::{BusLogger, LogSink};
use vario_fusion::drivers::gps::{Gps, GpsStream};
use vario_fusion::drivers::icm42688::Icm42688;
use vario_fusion::drivers::imu::MotionFrontEnd;
use vario_fusion::drivers::ms5611::Ms5611;
use vario_fusion::instruments::{Altimeter, MotionProcessor, WindEstimator};
use vario_fusion::state::VarioSnapshot;
use vario_fusion::tasks::{ExternalTasks, Instruments, PowerState, Scheduler, Sensors, TickFlags};
use vario_fusion::time::{Clock, Instant};
use vario_fusion::VarioConfig;

use crate::board::{Board, GpsRx};

/// Height above launch that counts as airborne for wind sampling, cm.
const FLYING_ABOVE_LAUNCH_CM: i32 = 3_000;

static FLAGS: TickFlags = TickFlags::new();
// Tick tasks preempt the thread-mode loop so a drain sees the next slice
static TICK_EXECUTOR: InterruptExecutor = InterruptExecutor::new();
static CLOCK: EmbassyClock = EmbassyClock;

// Raw NMEA from the UART task to the scheduler's drain
static GPS_PIPE: Pipe<CriticalSectionRawMutex, 512> = Pipe::new();
// Cap=1: the debug port only wants the latest snapshot.
static SNAPSHOT_CHAN: Channel<CriticalSectionRawMutex, VarioSnapshot, 1> = Channel::new();

static ALTIMETER: StaticCell<Altimeter> = StaticCell::new();
static PROCESSOR: StaticCell<MotionProcessor<'static>> = StaticCell::new();
static WIND: StaticCell<WindEstimator> = StaticCell::new();
static BUS_LOG: StaticCell<BusLogger<DefmtSink>> = StaticCell::new();

// ── Glue ─────────────────────────────────────────────────────────────────────

struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(embassy_time::Instant::now().as_micros())
    }
}

struct PipeStream;

impl GpsStream for PipeStream {
    fn read_byte(&mut self) -> Option<u8> {
        let mut b = [0u8; 1];
        match GPS_PIPE.try_read(&mut b) {
            Ok(1) => Some(b[0]),
            _ => None,
        }
    }
}

/// Bus log over RTT until a card writer exists.
struct DefmtSink;

impl LogSink for DefmtSink {
    fn write_line(&mut self, line: &str) {
        defmt::println!("{=str}", line);
    }
}

/// Board-level hooks for the scheduler.
struct Vario {
    led: Output<'static, AnyPin>,
    vbus: Input<'static, AnyPin>,
    power_switch: Input<'static, AnyPin>,
    snapshot_tx: Sender<'static, CriticalSectionRawMutex, VarioSnapshot, 1>,
    flying: bool,
}

impl ExternalTasks for Vario {
    fn power(&mut self) {
        self.led.toggle();
    }

    fn display(&mut self, snapshot: &VarioSnapshot) {
        if let Some(altitude) = snapshot.altitude {
            self.flying = altitude.above_launch_cm.abs() > FLYING_ABOVE_LAUNCH_CM;
        }
        // Older snapshot still queued: drop this one
        let _ = self.snapshot_tx.try_send(*snapshot);
    }

    fn power_state(&self) -> PowerState {
        if self.power_switch.is_low() && self.vbus.is_high() {
            PowerState::OffUsb
        } else {
            PowerState::On
        }
    }

    fn is_flying(&self) -> bool {
        self.flying
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

// UART5 is unused on this board and serves as the tick executor's software IRQ
#[interrupt]
unsafe fn UART5() {
    TICK_EXECUTOR.on_interrupt()
}

#[embassy_executor::task]
async fn slice_tick_task() {
    let mut ticker = Ticker::every(Duration::from_millis(10));
    loop {
        ticker.next().await;
        FLAGS.on_slice_tick();
    }
}

#[embassy_executor::task]
async fn charge_tick_task() {
    let mut ticker = Ticker::every(Duration::from_millis(500));
    loop {
        ticker.next().await;
        FLAGS.on_charge_tick();
    }
}

#[embassy_executor::task]
async fn gps_uart_task(mut gps_rx: GpsRx) {
    let mut buf = [0u8; 128];
    loop {
        match gps_rx.read_until_idle(&mut buf).await {
            Ok(n) => {
                // A full pipe means the loop is behind; drop the burst
                let _ = GPS_PIPE.try_write(&buf[..n]);
            }
            Err(e) => defmt::warn!("gps uart: {}", defmt::Debug2Format(&e)),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let board = Board::init();
    let config = VarioConfig::default().sanitized();

    let (usb_dev, usb_serial) = usb::init(board.usb, board.usb_dp, board.usb_dm);
    defmt::unwrap!(spawner.spawn(usb::usb_task(usb_dev)));
    defmt::unwrap!(spawner.spawn(usb::debug_task(usb_serial, SNAPSHOT_CHAN.receiver())));

    // IMU bring-up before the loop owns it
    Timer::after(Duration::from_millis(100)).await;
    let mut imu = Icm42688::new(board.imu_spi, board.imu_cs);
    if let Err(e) = imu.init(&mut Delay) {
        defmt::error!("imu init failed: {}", e);
    }

    let altimeter: &'static Altimeter = ALTIMETER.init(Altimeter::new(&config));
    let processor: &'static MotionProcessor<'static> =
        PROCESSOR.init(MotionProcessor::new(altimeter, &config));
    let wind: &'static WindEstimator = WIND.init(WindEstimator::new(&config));

    let sensors = Sensors {
        pressure: Ms5611::new(board.baro_i2c, config.temperature_every),
        motion: MotionFrontEnd::new(imu),
        gps: Gps::new(PipeStream),
    };
    let instruments = Instruments { altimeter, motion: processor, wind };
    let external = Vario {
        led: board.led,
        vbus: board.vbus,
        power_switch: board.power_switch,
        snapshot_tx: SNAPSHOT_CHAN.sender(),
        flying: false,
    };

    let mut scheduler = Scheduler::new(&CLOCK, &FLAGS, sensors, instruments, external);
    if let Err(e) = scheduler.init(&mut Delay) {
        defmt::panic!("vario init failed: {}", e);
    }

    let bus_log: &'static BusLogger<DefmtSink> = BUS_LOG.init(BusLogger::new(DefmtSink));
    if let Err(e) = bus_log.start(scheduler.bus()) {
        defmt::warn!("bus log off: {}", e);
    }

    defmt::unwrap!(spawner.spawn(gps_uart_task(board.gps_rx)));

    interrupt::UART5.set_priority(Priority::P6);
    let tick_spawner = TICK_EXECUTOR.start(interrupt::UART5);
    defmt::unwrap!(tick_spawner.spawn(slice_tick_task()));
    defmt::unwrap!(tick_spawner.spawn(charge_tick_task()));

    loop {
        scheduler.run_once();
        yield_now().await;
    }
}
