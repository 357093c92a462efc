//! Controller facade
//!
//! [`Controller`] is the public surface of the library. Constructing one
//! registers a virtual host controller with the kernel and spawns the
//! background work pump; dropping it shuts the pump down and joins it
//! before the device is closed.
//!
//! One mutex guards the work queue, the port table and the callback list
//! together. The critical sections are short and the three structures are
//! updated in lockstep, so splitting the lock would only buy races. A
//! second, separate mutex guards the pump thread handle against double
//! joins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, warn};

use crate::device::{VhciChannel, VhciDevice};
use crate::error::{Error, Result};
use crate::port::{DataRate, PortChange, PortStat, PortStatus, PortTable};
use crate::pump;
use crate::status::UrbStatus;
use crate::work::{CallbackId, Work, WorkKind, WorkQueue};

/// Everything guarded by the controller lock.
pub(crate) struct State {
    pub(crate) ports: PortTable,
    pub(crate) queue: WorkQueue,
}

/// State shared between the facade and the work pump.
pub(crate) struct Shared<C: VhciChannel> {
    pub(crate) chan: C,
    pub(crate) port_count: u8,
    state: Mutex<State>,
    shutdown: AtomicBool,
}

impl<C: VhciChannel> Shared<C> {
    pub(crate) fn new(chan: C, port_count: u8) -> Self {
        Self {
            chan,
            port_count,
            state: Mutex::new(State {
                ports: PortTable::new(port_count),
                queue: WorkQueue::new(),
            }),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("controller state lock poisoned")
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn check_port(&self, port: u8) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidArgument("port"));
        }
        if port > self.port_count {
            return Err(Error::OutOfRange("port"));
        }
        Ok(())
    }

    pub(crate) fn port_stat(&self, port: u8) -> Result<PortStat> {
        self.check_port(port)?;
        Ok(self.state().ports.snapshot(port))
    }

    fn write_port_stat(&self, port: u8, stat: PortStat) -> Result<()> {
        self.check_port(port)?;
        let _state = self.state();
        self.chan.port_stat(port, stat)
    }

    pub(crate) fn port_connect(&self, port: u8, rate: DataRate) -> Result<()> {
        let stat = PortStat::new(
            PortStatus::CONNECTION | rate.status_bits(),
            PortChange::CONNECTION,
            Default::default(),
        );
        self.write_port_stat(port, stat)
    }

    pub(crate) fn port_disconnect(&self, port: u8) -> Result<()> {
        let stat = PortStat::new(
            PortStatus::empty(),
            PortChange::CONNECTION,
            Default::default(),
        );
        self.write_port_stat(port, stat)
    }

    pub(crate) fn port_disable(&self, port: u8) -> Result<()> {
        let stat = PortStat::new(PortStatus::empty(), PortChange::ENABLE, Default::default());
        self.write_port_stat(port, stat)
    }

    pub(crate) fn port_resumed(&self, port: u8) -> Result<()> {
        let stat = PortStat::new(PortStatus::empty(), PortChange::SUSPEND, Default::default());
        self.write_port_stat(port, stat)
    }

    pub(crate) fn port_overcurrent(&self, port: u8, set: bool) -> Result<()> {
        let status = if set {
            PortStatus::OVERCURRENT
        } else {
            PortStatus::empty()
        };
        let stat = PortStat::new(status, PortChange::OVERCURRENT, Default::default());
        self.write_port_stat(port, stat)
    }

    pub(crate) fn port_reset_done(&self, port: u8, enable: bool) -> Result<()> {
        let status = if enable {
            PortStatus::ENABLE
        } else {
            PortStatus::empty()
        };
        let mut change = PortChange::RESET;
        if !enable {
            change |= PortChange::ENABLE;
        }
        let stat = PortStat::new(status, change, Default::default());
        self.write_port_stat(port, stat)
    }

    pub(crate) fn next_work(&self) -> (Option<Work>, bool) {
        self.state().queue.next_work()
    }

    /// Complete a work item. For URB work this gives the URB back to the
    /// kernel with whatever status the client set.
    pub(crate) fn finish_work(&self, work: Work) {
        let mut state = self.state();
        if let WorkKind::ProcessUrb(urb) = work.kind() {
            if let Err(e) = self.chan.giveback(urb) {
                warn!(handle = urb.handle(), "urb giveback failed: {}", e);
            }
        }
        state.queue.remove_processing(&work);
    }

    /// Cancel the `ProcessUrb` work with this handle.
    ///
    /// Returns `true` when the item is in the client's hands; the client
    /// will observe a `CancelUrb` item and is still expected to finish the
    /// URB. Returns `false` when the item was still queued (it has been
    /// given back as canceled and will never surface) or is unknown.
    pub(crate) fn cancel_process_urb_work(&self, handle: u64) -> bool {
        let mut state = self.state();

        if let Some(mut work) = state.queue.take_queued_urb(handle) {
            work.cancel();
            if let Some(urb) = work.urb_mut() {
                urb.set_status(UrbStatus::Canceled);
            }
            if let Some(urb) = work.urb() {
                if let Err(e) = self.chan.giveback(urb) {
                    warn!(handle, "canceled urb giveback failed: {}", e);
                }
            }
            debug!(handle, "urb canceled while queued");
            return false;
        }

        let port = match state.queue.find_in_flight(handle) {
            Some(entry) => {
                entry.canceled = true;
                entry.port
            }
            None => return false,
        };
        let notice = Work::new(port, WorkKind::CancelUrb { handle });
        match state.queue.enqueue(notice) {
            Ok(()) => state.queue.fire_callbacks(),
            Err(_) => warn!(handle, "cancel notice dropped: queue allocation failed"),
        }
        debug!(handle, "urb canceled in flight");
        true
    }
}

/// A virtual USB host controller driven from user space.
///
/// The controller owns a background thread that pumps kernel events into
/// a work queue. Clients drain the queue with [`next_work`], complete each
/// item and return it with [`finish_work`]. Port operations push root-hub
/// changes toward the kernel.
///
/// [`next_work`]: Controller::next_work
/// [`finish_work`]: Controller::finish_work
pub struct Controller {
    shared: Arc<Shared<VhciDevice>>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Controller {
    /// Register a controller with `port_count` root-hub ports (1 to 31)
    /// and start its work pump.
    pub fn new(port_count: u8) -> Result<Self> {
        if port_count == 0 {
            return Err(Error::InvalidArgument("port_count"));
        }
        let dev = VhciDevice::open(port_count)?;
        debug!(
            bus_id = dev.bus_id(),
            bus_number = dev.bus_number(),
            "controller registered"
        );

        let shared = Arc::new(Shared::new(dev, port_count));
        let pump_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("vhci-pump".to_string())
            .spawn(move || pump::run(&*pump_shared))
            .map_err(Error::Io)?;

        Ok(Self {
            shared,
            pump: Mutex::new(Some(handle)),
        })
    }

    /// Number of root-hub ports.
    pub fn port_count(&self) -> u8 {
        self.shared.port_count
    }

    /// Controller id assigned by the kernel.
    pub fn controller_id(&self) -> i32 {
        self.shared.chan.controller_id()
    }

    /// Number of the USB bus backing this controller.
    pub fn bus_number(&self) -> i32 {
        self.shared.chan.bus_number()
    }

    /// Bus identifier string, typically `vhci_hcd.<id>`.
    pub fn bus_id(&self) -> &str {
        self.shared.chan.bus_id()
    }

    /// Snapshot of the current status of a port.
    pub fn port_stat(&self, port: u8) -> Result<PortStat> {
        self.shared.port_stat(port)
    }

    /// Plug a device into a port at the given data rate.
    pub fn port_connect(&self, port: u8, rate: DataRate) -> Result<()> {
        self.shared.port_connect(port, rate)
    }

    /// Unplug the device from a port.
    pub fn port_disconnect(&self, port: u8) -> Result<()> {
        self.shared.port_disconnect(port)
    }

    /// Drop a port out of the enabled state.
    pub fn port_disable(&self, port: u8) -> Result<()> {
        self.shared.port_disable(port)
    }

    /// Report resume signalling on a port as finished.
    pub fn port_resumed(&self, port: u8) -> Result<()> {
        self.shared.port_resumed(port)
    }

    /// Raise or clear the overcurrent indicator of a port.
    pub fn port_overcurrent(&self, port: u8, set: bool) -> Result<()> {
        self.shared.port_overcurrent(port, set)
    }

    /// Report a port reset as completed, usually leaving the port enabled.
    pub fn port_reset_done(&self, port: u8, enable: bool) -> Result<()> {
        self.shared.port_reset_done(port, enable)
    }

    /// Pop the next pending work item.
    ///
    /// Never blocks. The boolean reports whether more work is already
    /// queued behind the returned item. Register a work-enqueued callback
    /// to wake a worker when the queue refills.
    pub fn next_work(&self) -> (Option<Work>, bool) {
        self.shared.next_work()
    }

    /// Complete a work item obtained from [`next_work`](Self::next_work).
    pub fn finish_work(&self, work: Work) {
        self.shared.finish_work(work)
    }

    /// Cancel pending URB work by kernel handle.
    ///
    /// Returns `true` when the work is currently in the client's hands;
    /// a `CancelUrb` item follows and the client must still finish the
    /// URB. Returns `false` when the work was still queued (it has been
    /// given back as canceled and will never surface) or is unknown.
    pub fn cancel_process_urb_work(&self, handle: u64) -> bool {
        self.shared.cancel_process_urb_work(handle)
    }

    /// Subscribe to the work-enqueued event.
    ///
    /// The callback runs on the pump thread while the controller lock is
    /// held: it must only signal (set a flag, notify a condvar) and must
    /// not call back into the controller.
    pub fn add_work_enqueued_callback(
        &self,
        callback: impl Fn() + Send + 'static,
    ) -> Result<CallbackId> {
        Ok(self.shared.state().queue.add_callback(Box::new(callback))?)
    }

    /// Drop a previously registered callback. Returns `false` when the id
    /// is unknown.
    pub fn remove_work_enqueued_callback(&self, id: CallbackId) -> bool {
        self.shared.state().queue.remove_callback(id)
    }

    fn join_pump(&self) {
        let mut guard = self.pump.lock().expect("pump handle lock poisoned");
        if let Some(handle) = guard.take() {
            self.shared.request_shutdown();
            if handle.join().is_err() {
                warn!("work pump panicked");
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.join_pump();
    }
}
