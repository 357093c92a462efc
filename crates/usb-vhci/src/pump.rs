//! Background work pump
//!
//! A single dedicated thread drains the kernel's event stream and turns it
//! into work items: port status changes become `PortStat` work with
//! derived triggers, URBs are fetched (payload included), wrapped and
//! routed to the port their device address is bound to, and cancellations
//! are applied to the queue.
//!
//! The pump never exits on a transient failure. Fetch errors are logged
//! and the loop continues; allocation failures back off for 100 ms and
//! retry until they succeed or shutdown is requested. Buffers are
//! allocated outside the lock, the finished item is published under it.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::controller::Shared;
use crate::device::{KernelEvent, VhciChannel};
use crate::error::Error;
use crate::port::{PortStat, PortTable};
use crate::urb::{request, IsoPacket, Urb, UrbRecord};
use crate::work::{Work, WorkKind};

/// How long one fetch-work call may block inside the kernel.
const FETCH_TIMEOUT_MS: i16 = 100;

/// Back-off between allocation attempts when memory is tight.
const ALLOC_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) fn run<C: VhciChannel>(shared: &Shared<C>) {
    debug!("work pump running");
    while !shared.is_shutdown() {
        pump_once(shared);
    }
    debug!("work pump stopped");
}

/// One pump iteration: fetch a single event and apply it.
pub(crate) fn pump_once<C: VhciChannel>(shared: &Shared<C>) {
    let event = match shared.chan.fetch_work(FETCH_TIMEOUT_MS) {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(e) => {
            warn!("fetch_work failed: {}", e);
            return;
        }
    };

    match event {
        KernelEvent::PortStat { port, stat } => handle_port_stat(shared, port, stat),
        KernelEvent::ProcessUrb { record, needs_data } => {
            handle_process_urb(shared, record, needs_data)
        }
        KernelEvent::CancelUrb { handle } => {
            shared.cancel_process_urb_work(handle);
        }
    }
}

fn handle_port_stat<C: VhciChannel>(shared: &Shared<C>, port: u8, stat: PortStat) {
    if port == 0 || port > shared.port_count {
        debug!(port, "port stat for unknown port dropped");
        return;
    }

    loop {
        {
            let mut state = shared.state();
            let prev = state.ports.snapshot(port);
            let triggers = stat.triggers_since(&prev);
            let work = Work::new(port, WorkKind::PortStat { stat, triggers });
            if state.queue.enqueue(work).is_ok() {
                state.ports.commit_stat(port, stat);
                state.queue.fire_callbacks();
                return;
            }
        }
        warn!(port, "queueing port stat failed, retrying");
        thread::sleep(ALLOC_RETRY_DELAY);
        if shared.is_shutdown() {
            return;
        }
    }
}

fn handle_process_urb<C: VhciChannel>(shared: &Shared<C>, record: UrbRecord, needs_data: bool) {
    let handle = record.handle;

    let Some(buffer) = alloc_vec::<u8, C>(shared, record.buffer_length) else {
        return;
    };
    let Some(iso_packets) = alloc_vec::<IsoPacket, C>(shared, record.packet_count) else {
        return;
    };

    let mut urb = match Urb::new(record, buffer, iso_packets) {
        Ok(urb) => urb,
        Err(e) => {
            warn!(handle, "dropping malformed urb: {}", e);
            return;
        }
    };

    if needs_data {
        match shared.chan.fetch_data(&mut urb) {
            Ok(()) => {}
            Err(Error::Canceled) => {
                debug!(handle, "urb canceled before its data was fetched");
                return;
            }
            Err(e) => {
                warn!(handle, "fetch_data failed: {}", e);
                return;
            }
        }
    }

    if urb.device_address() > 0x7f {
        debug!(handle, "urb for unaddressed device dropped");
        return;
    }

    loop {
        urb = {
            let mut state = shared.state();
            let port = state.ports.port_of(urb.device_address());
            if port == 0 {
                debug!(
                    handle,
                    address = urb.device_address(),
                    "no port bound to device address, urb dropped"
                );
                return;
            }

            let rollback_address = state.ports.address_of(port);
            intercept_set_address(&mut state.ports, port, &mut urb);

            let work = Work::new(port, WorkKind::ProcessUrb(urb));
            match state.queue.enqueue(work) {
                Ok(()) => {
                    state.queue.fire_callbacks();
                    return;
                }
                Err(work) => {
                    // Undo the address binding before retrying outside
                    // the lock; the intercept runs again on the next
                    // attempt.
                    state.ports.set_address(port, rollback_address);
                    match work.into_kind() {
                        WorkKind::ProcessUrb(urb) => urb,
                        _ => unreachable!(),
                    }
                }
            }
        };
        warn!(handle, "queueing urb failed, retrying");
        thread::sleep(ALLOC_RETRY_DELAY);
        if shared.is_shutdown() {
            return;
        }
    }
}

/// Handle SET_ADDRESS on the controller's behalf: the request binds the
/// port to the new device address, so it never reaches the client
/// unanswered. The work item is still enqueued for observability.
fn intercept_set_address(ports: &mut PortTable, port: u8, urb: &mut Urb) {
    if !urb.is_control() || urb.endpoint_number() != 0 {
        return;
    }
    let setup = *urb.setup();
    if setup.request_type != 0 || setup.request != request::SET_ADDRESS {
        return;
    }
    if setup.value > 0x7f {
        urb.stall();
    } else {
        urb.ack();
        ports.set_address(port, setup.value as u8);
        debug!(port, address = setup.value, "set_address intercepted");
    }
}

/// Allocate a zero-initialized vector, backing off while memory is tight.
/// Returns `None` only when shutdown was requested during the wait.
fn alloc_vec<T: Clone + Default, C: VhciChannel>(
    shared: &Shared<C>,
    len: usize,
) -> Option<Vec<T>> {
    loop {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(len).is_ok() {
            buf.resize(len, T::default());
            return Some(buf);
        }
        warn!(len, "buffer allocation failed, retrying");
        thread::sleep(ALLOC_RETRY_DELAY);
        if shared.is_shutdown() {
            return None;
        }
    }
}
