//! User-space driver library for the Linux VHCI virtual host controller
//!
//! This crate drives the `usb-vhci-hcd` kernel driver through its
//! character device, letting an application impersonate a complete USB
//! host controller together with the devices plugged into its root-hub
//! ports. The kernel's USB core talks to the virtual controller exactly as
//! it would to real hardware; every URB it queues and every root-hub
//! request it makes ends up as a work item this library hands to the
//! application.
//!
//! # Architecture
//!
//! A [`Controller`] registers the virtual controller and spawns one
//! background thread, the work pump. The pump fetches events from the
//! kernel, derives port-state edges, resolves device addresses to ports
//! (intercepting SET_ADDRESS on the way) and queues typed [`Work`] items.
//! The application drains the queue with [`Controller::next_work`],
//! completes each item and returns it with [`Controller::finish_work`].
//!
//! ```no_run
//! use usb_vhci::{Controller, DataRate, PortTriggers, WorkKind};
//!
//! let hcd = Controller::new(1)?;
//! let (work, _more) = hcd.next_work();
//! if let Some(work) = work {
//!     if let WorkKind::PortStat { triggers, .. } = work.kind() {
//!         if triggers.contains(PortTriggers::POWER_ON) {
//!             hcd.port_connect(1, DataRate::Full)?;
//!         }
//!     }
//!     hcd.finish_work(work);
//! }
//! # Ok::<(), usb_vhci::Error>(())
//! ```

pub mod controller;
pub mod device;
pub mod error;
pub mod logging;
pub mod port;
pub mod status;
pub mod urb;
pub mod work;

mod pump;
mod sys;

pub use controller::Controller;
pub use device::VhciDevice;
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use port::{
    DataRate, PortChange, PortFlags, PortStat, PortStatus, PortTriggers, ADDRESS_UNSET,
};
pub use status::UrbStatus;
pub use urb::{request, IsoPacket, SetupPacket, Urb, UrbFlags, UrbKind, UrbRecord};
pub use work::{CallbackId, Work, WorkKind};
