//! Work items and the pending-work queue
//!
//! The pump turns kernel events into [`Work`] items and appends them to an
//! inbox. Clients drain the inbox with `next_work`, act on the item, and
//! return it with `finish_work`. Between those two calls the queue tracks
//! the item in a processing list so that a cancellation arriving from the
//! kernel can still find it.

use std::collections::{TryReserveError, VecDeque};

use crate::port::{PortStat, PortTriggers};
use crate::urb::Urb;

/// Payload of a work item.
#[derive(Debug)]
pub enum WorkKind {
    /// A port status snapshot together with the edges derived from the
    /// previous snapshot of the same port.
    PortStat {
        stat: PortStat,
        triggers: PortTriggers,
    },
    /// An URB to process; the work item owns it.
    ProcessUrb(Urb),
    /// The kernel canceled the URB with this handle after it was already
    /// handed to the client. Informational.
    CancelUrb { handle: u64 },
}

/// One unit of work for the client.
#[derive(Debug)]
pub struct Work {
    seq: u64,
    port: u8,
    canceled: bool,
    kind: WorkKind,
}

impl Work {
    pub(crate) fn new(port: u8, kind: WorkKind) -> Self {
        debug_assert!(port != 0);
        Self {
            seq: 0,
            port,
            canceled: false,
            kind,
        }
    }

    /// Root-hub port this work belongs to (1-based).
    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn kind(&self) -> &WorkKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut WorkKind {
        &mut self.kind
    }

    /// The URB of a `ProcessUrb` item.
    pub fn urb(&self) -> Option<&Urb> {
        match &self.kind {
            WorkKind::ProcessUrb(urb) => Some(urb),
            _ => None,
        }
    }

    pub fn urb_mut(&mut self) -> Option<&mut Urb> {
        match &mut self.kind {
            WorkKind::ProcessUrb(urb) => Some(urb),
            _ => None,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn into_kind(self) -> WorkKind {
        self.kind
    }

    pub(crate) fn cancel(&mut self) {
        self.canceled = true;
    }

    fn urb_handle(&self) -> Option<u64> {
        self.urb().map(|u| u.handle())
    }
}

/// Identity of a registered work-enqueued callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type WorkCallback = Box<dyn Fn() + Send>;

/// Bookkeeping entry for a work item the client currently holds.
#[derive(Debug)]
pub(crate) struct InFlight {
    seq: u64,
    pub(crate) port: u8,
    pub(crate) urb_handle: Option<u64>,
    pub(crate) canceled: bool,
}

/// Pending and in-flight work of one controller. Callers hold the
/// controller lock.
pub(crate) struct WorkQueue {
    inbox: VecDeque<Work>,
    processing: Vec<InFlight>,
    callbacks: Vec<(CallbackId, WorkCallback)>,
    next_seq: u64,
    next_callback: u64,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            inbox: VecDeque::new(),
            processing: Vec::new(),
            callbacks: Vec::new(),
            next_seq: 1,
            next_callback: 1,
        }
    }

    /// Append a work item. Fails without queuing when the inbox cannot
    /// grow; the item is handed back so the caller can retry.
    pub(crate) fn enqueue(&mut self, mut work: Work) -> Result<(), Work> {
        if self.inbox.try_reserve(1).is_err() {
            return Err(work);
        }
        work.seq = self.next_seq;
        self.next_seq += 1;
        self.inbox.push_back(work);
        Ok(())
    }

    /// Pop the next live work item. The second element reports whether
    /// more items are already waiting, so callers can skip one blocking
    /// turn.
    pub(crate) fn next_work(&mut self) -> (Option<Work>, bool) {
        while let Some(work) = self.inbox.pop_front() {
            if work.is_canceled() {
                continue;
            }
            let more = !self.inbox.is_empty();
            self.processing.push(InFlight {
                seq: work.seq,
                port: work.port,
                urb_handle: work.urb_handle(),
                canceled: false,
            });
            return (Some(work), more);
        }
        (None, false)
    }

    /// Drop the processing entry of a finished item.
    pub(crate) fn remove_processing(&mut self, work: &Work) {
        self.processing.retain(|e| e.seq != work.seq());
    }

    /// Remove and return the queued `ProcessUrb` item with this handle.
    pub(crate) fn take_queued_urb(&mut self, handle: u64) -> Option<Work> {
        let idx = self
            .inbox
            .iter()
            .position(|w| !w.is_canceled() && w.urb_handle() == Some(handle))?;
        self.inbox.remove(idx)
    }

    /// Find the in-flight entry for the `ProcessUrb` item with this
    /// handle.
    pub(crate) fn find_in_flight(&mut self, handle: u64) -> Option<&mut InFlight> {
        self.processing
            .iter_mut()
            .find(|e| e.urb_handle == Some(handle))
    }

    pub(crate) fn add_callback(
        &mut self,
        callback: WorkCallback,
    ) -> Result<CallbackId, TryReserveError> {
        self.callbacks.try_reserve(1)?;
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.callbacks.push((id, callback));
        Ok(id)
    }

    /// Returns false when no callback with this id is registered.
    pub(crate) fn remove_callback(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cid, _)| *cid != id);
        self.callbacks.len() != before
    }

    /// Notify subscribers that new work arrived. Runs inside the critical
    /// section, so callbacks must not call back into the controller.
    pub(crate) fn fire_callbacks(&self) {
        for (_, callback) in &self.callbacks {
            callback();
        }
    }

    #[cfg(test)]
    pub(crate) fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    #[cfg(test)]
    pub(crate) fn processing_len(&self) -> usize {
        self.processing.len()
    }
}
