use core::fmt::Write;
use core::mem::MaybeUninit;

use embassy_stm32::usb_otg::{self, Driver};
use embassy_stm32::{bind_interrupts, peripherals};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use embassy_usb::class::cdc_acm::{CdcAcmClass, State};
use embassy_usb::{Builder, Config, UsbDevice};

use vario_fusion::state::VarioSnapshot;

bind_interrupts!(pub struct Irqs {
    OTG_FS => usb_otg::InterruptHandler<peripherals::USB_OTG_FS>;
});

pub type UsbDriver = Driver<'static, peripherals::USB_OTG_FS>;
pub type UsbSerial<'a> = CdcAcmClass<'a, UsbDriver>;

struct UsbResources<'a> {
    config_desc: [u8; 256],
    bos_desc: [u8; 256],
    control_buf: [u8; 64],
    state: MaybeUninit<State<'a>>,
    ep_out_buffer: [u8; 256],
}

impl UsbResources<'_> {
    const fn new() -> Self {
        Self {
            config_desc: [0; 256],
            bos_desc: [0; 256],
            control_buf: [0; 64],
            state: MaybeUninit::uninit(),
            ep_out_buffer: [0; 256],
        }
    }
}

// Handed out once, from `init`
static mut USB_RES: UsbResources<'static> = UsbResources::new();

#[embassy_executor::task]
pub async fn usb_task(mut device: UsbDevice<'static, UsbDriver>) -> ! {
    device.run().await
}

/// CDC-ACM serial for the debug readout. Call once.
pub fn init(
    usb_periph: peripherals::USB_OTG_FS,
    pa12: peripherals::PA12,
    pa11: peripherals::PA11,
) -> (UsbDevice<'static, UsbDriver>, UsbSerial<'static>) {
    // SAFETY: `init` runs once, so these are the only references to USB_RES.
    let res = unsafe { &mut *(&raw mut USB_RES) };

    let mut usb_config = usb_otg::Config::default();
    usb_config.vbus_detection = false;
    let driver = Driver::new_fs(usb_periph, Irqs, pa12, pa11, &mut res.ep_out_buffer, usb_config);

    let mut config = Config::new(0xc0de, 0xcafe);
    config.manufacturer = Some("vario-fusion");
    config.product = Some("Vario debug port");
    config.serial_number = Some("00000001");

    let mut builder = Builder::new(
        driver,
        config,
        &mut res.config_desc,
        &mut res.bos_desc,
        &mut [], // msos_descs
        &mut res.control_buf,
    );
    let state = res.state.write(State::new());
    let class = CdcAcmClass::new(&mut builder, state, 64);
    (builder.build(), class)
}

/// Prints each snapshot the display slot hands over while a host listens.
#[embassy_executor::task]
pub async fn debug_task(
    mut usb_serial: UsbSerial<'static>,
    snapshot_rx: Receiver<'static, CriticalSectionRawMutex, VarioSnapshot, 1>,
) {
    loop {
        let snapshot = snapshot_rx.receive().await;
        if !usb_serial.dtr() {
            continue;
        }

        let mut m = heapless::String::<128>::new();
        match snapshot.altitude {
            Some(a) => {
                let _ = write!(
                    m,
                    "[ALT] std={:.1}m adj={}cm agl={}cm\r\n",
                    a.standard_m, a.adjusted_cm, a.above_launch_cm
                );
            }
            None => {
                let _ = write!(m, "[ALT] waiting\r\n");
            }
        }
        let _ = usb_serial.write_packet(m.as_bytes()).await;

        let c = snapshot.climb;
        let mut m = heapless::String::<128>::new();
        let _ = write!(
            m,
            "[VARIO] v={:.2}m/s bar={}cm/s avg={:.0}cm/s\r\n",
            c.raw_mps, c.filtered_cms, c.average_cms
        );
        let _ = usb_serial.write_packet(m.as_bytes()).await;

        let w = snapshot.wind;
        if w.valid {
            let mut m = heapless::String::<128>::new();
            let _ = write!(
                m,
                "[WIND] {:.1}m/s from {:.0}deg as={:.1} err={:.2}\r\n",
                w.wind_speed,
                w.wind_direction_from.to_degrees(),
                w.airspeed,
                w.error
            );
            let _ = usb_serial.write_packet(m.as_bytes()).await;
        }
    }
}
