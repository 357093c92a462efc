//! A virtual host controller with one dummy device plugged in
//!
//! Registers a single-port controller, connects a full-speed device as
//! soon as the kernel powers the port, and answers the handful of control
//! requests the USB core needs to enumerate it. Run it as root (or make
//! `/dev/usb-vhci` accessible) with the `usb-vhci-hcd` module loaded,
//! then watch `dmesg` or `lsusb` pick up the device.

use std::sync::{Arc, Condvar, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use usb_vhci::{
    request, Controller, DataRate, PortTriggers, Urb, WorkKind,
};

const DEVICE_DESCRIPTOR: [u8; 18] = [
    18,   // descriptor length
    1,    // type: device
    0x00, 0x02, // bcd usb release
    0,    // class: per interface
    0,    // subclass
    0,    // protocol
    64,   // max packet size
    0xad, 0xde, // vendor id
    0xef, 0xbe, // product id
    0x38, 0x11, // bcd device release
    0,    // manufacturer string
    1,    // product string
    0,    // serial number string
    1,    // number of configurations
];

const CONFIG_DESCRIPTOR: [u8; 18] = [
    9,    // descriptor length
    2,    // type: configuration
    18, 0, // total length (configuration + interface)
    1,    // number of interfaces
    1,    // configuration value
    0,    // configuration string
    0x80, // attributes
    0,    // max power
    9,    // descriptor length
    4,    // type: interface
    0,    // interface number
    0,    // alternate setting
    0,    // number of endpoints
    0,    // class
    0,    // subclass
    0,    // protocol
    0,    // interface string
];

const STRING0_DESCRIPTOR: [u8; 4] = [4, 3, 0x09, 0x04]; // lang id: en-US

#[rustfmt::skip]
const STRING_PRODUCT: [u8; 26] = [
    26, 3,
    b'H', 0, b'e', 0, b'l', 0, b'l', 0, b'o', 0, b' ', 0,
    b'W', 0, b'o', 0, b'r', 0, b'l', 0, b'd', 0, b'!', 0,
];

#[derive(Debug, Parser)]
#[command(about = "Expose a dummy USB device through a virtual host controller")]
struct Args {
    /// Default log filter (RUST_LOG overrides).
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    usb_vhci::setup_logging(&args.log)?;

    let hcd = Controller::new(1)
        .context("failed to register controller (is the usb-vhci-hcd module loaded?)")?;
    info!("created {} (bus #{})", hcd.bus_id(), hcd.bus_number());

    // Wake the main loop whenever the pump queues new work.
    let signal = Arc::new((Mutex::new(true), Condvar::new()));
    let notify = Arc::clone(&signal);
    hcd.add_work_enqueued_callback(move || {
        let (flag, condvar) = &*notify;
        *flag.lock().unwrap() = true;
        condvar.notify_one();
    })?;

    let mut more_pending = false;
    loop {
        if !more_pending {
            let (flag, condvar) = &*signal;
            let mut has_work = flag.lock().unwrap();
            while !*has_work {
                has_work = condvar.wait(has_work).unwrap();
            }
            *has_work = false;
        }

        let (work, pending) = hcd.next_work();
        more_pending = pending;
        let Some(mut work) = work else {
            continue;
        };

        let port = work.port();
        match work.kind_mut() {
            WorkKind::PortStat { stat, triggers } => {
                debug!(
                    "port {} stat: status={:#06x} change={:#06x} triggers={:?}",
                    port,
                    stat.status.bits(),
                    stat.change.bits(),
                    triggers
                );
                handle_port_stat(&hcd, *triggers)?;
            }
            WorkKind::ProcessUrb(urb) => process_urb(urb),
            WorkKind::CancelUrb { handle } => {
                info!("urb {:#x} canceled", handle);
            }
        }
        hcd.finish_work(work);
    }
}

fn handle_port_stat(hcd: &Controller, triggers: PortTriggers) -> Result<()> {
    if triggers.contains(PortTriggers::POWER_OFF) {
        info!("port is powered off");
    }
    if triggers.contains(PortTriggers::POWER_ON) {
        info!("port is powered on, connecting device");
        hcd.port_connect(1, DataRate::Full)?;
    }
    if triggers.contains(PortTriggers::RESET) {
        info!("port is resetting");
        if hcd.port_stat(1)?.connection() {
            hcd.port_reset_done(1, true)?;
        }
    }
    if triggers.contains(PortTriggers::RESUMING) {
        info!("port is resuming");
        if hcd.port_stat(1)?.connection() {
            hcd.port_resumed(1)?;
        }
    }
    if triggers.contains(PortTriggers::SUSPEND) {
        info!("port is suspended");
    }
    if triggers.contains(PortTriggers::DISABLE) {
        info!("port is disabled");
    }
    Ok(())
}

fn process_urb(urb: &mut Urb) {
    if !urb.is_control() {
        warn!("non-control transfer on the dummy device");
        return;
    }
    if urb.endpoint_number() != 0 {
        urb.stall();
        return;
    }

    let setup = *urb.setup();
    match (setup.request_type, setup.request) {
        (0x00, request::SET_ADDRESS) => {
            // Already answered by the controller; nothing to do here.
            info!("SET_ADDRESS");
        }
        (0x00, request::SET_CONFIGURATION) => {
            info!("SET_CONFIGURATION");
            urb.ack();
        }
        (0x00, request::SET_INTERFACE) => {
            info!("SET_INTERFACE");
            urb.ack();
        }
        (0x80, request::GET_DESCRIPTOR) => get_descriptor(urb, setup.value),
        _ => urb.stall(),
    }
}

fn get_descriptor(urb: &mut Urb, value: u16) {
    match value >> 8 {
        1 => {
            info!("GET_DESCRIPTOR: device");
            write_descriptor(urb, &DEVICE_DESCRIPTOR);
        }
        2 => {
            info!("GET_DESCRIPTOR: configuration");
            write_descriptor(urb, &CONFIG_DESCRIPTOR);
        }
        3 => match value & 0xff {
            0 => write_descriptor(urb, &STRING0_DESCRIPTOR),
            1 => {
                info!("GET_DESCRIPTOR: product string");
                write_descriptor(urb, &STRING_PRODUCT);
            }
            _ => urb.stall(),
        },
        _ => urb.stall(),
    }
}

fn write_descriptor(urb: &mut Urb, descriptor: &[u8]) {
    let n = descriptor
        .len()
        .min(urb.setup().length as usize)
        .min(urb.buffer_length());
    urb.buffer_mut()[..n].copy_from_slice(&descriptor[..n]);
    urb.set_buffer_actual(n);
    urb.ack();
}
