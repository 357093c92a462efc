//! Owned USB Request Blocks
//!
//! An [`Urb`] is the library's representation of one transfer the kernel's
//! USB core has queued toward a device behind the virtual root hub. It owns
//! its payload buffer and, for isochronous transfers, the packet
//! descriptor array. Clients receive URBs inside work items, fill in the
//! result (data, actual length, completion status) and hand them back
//! through `finish_work`, which gives them back to the kernel.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::status::UrbStatus;
use crate::sys;

/// Standard control request codes (`bRequest` values).
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

/// Transfer type of an URB. The discriminants match the kernel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UrbKind {
    Isochronous = sys::URB_TYPE_ISO,
    Interrupt = sys::URB_TYPE_INT,
    Control = sys::URB_TYPE_CONTROL,
    Bulk = sys::URB_TYPE_BULK,
}

impl UrbKind {
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            sys::URB_TYPE_ISO => Some(UrbKind::Isochronous),
            sys::URB_TYPE_INT => Some(UrbKind::Interrupt),
            sys::URB_TYPE_CONTROL => Some(UrbKind::Control),
            sys::URB_TYPE_BULK => Some(UrbKind::Bulk),
            _ => None,
        }
    }
}

bitflags! {
    /// Transfer flags carried by an URB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UrbFlags: u16 {
        /// A short IN transfer is to be treated as an error.
        const SHORT_NOT_OK = sys::URB_FLAGS_SHORT_NOT_OK;
        /// Schedule the iso transfer as soon as bandwidth allows.
        const ISO_ASAP = sys::URB_FLAGS_ISO_ASAP;
        /// Terminate a bulk OUT divisible by the packet size with a zero
        /// length packet.
        const ZERO_PACKET = sys::URB_FLAGS_ZERO_PACKET;
    }
}

/// The setup stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    /// `bmRequestType`: direction, type and recipient.
    pub request_type: u8,
    /// `bRequest`.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
    /// `wLength`.
    pub length: u16,
}

/// One packet of an isochronous transfer.
///
/// `offset` and `length` locate the packet inside the URB buffer; `actual`
/// and `status` are filled in by the client before giveback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual: u32,
    pub status: UrbStatus,
}

impl IsoPacket {
    pub fn ack(&mut self) {
        self.status = UrbStatus::Success;
    }

    pub fn stall(&mut self) {
        self.status = UrbStatus::Stall;
    }
}

impl Default for IsoPacket {
    fn default() -> Self {
        Self {
            offset: 0,
            length: 0,
            actual: 0,
            status: UrbStatus::Pending,
        }
    }
}

/// Flat URB header, the wire shape without the owned buffers.
///
/// Only the fields meaningful for `kind` may be non-zero; [`Urb::new`]
/// rejects anything else.
#[derive(Debug, Clone, Copy)]
pub struct UrbRecord {
    pub handle: u64,
    pub kind: UrbKind,
    pub status: UrbStatus,
    pub buffer_length: usize,
    pub buffer_actual: usize,
    pub packet_count: usize,
    pub error_count: u32,
    pub flags: UrbFlags,
    pub interval: i32,
    pub devadr: u8,
    pub epadr: u8,
    pub setup: SetupPacket,
}

impl UrbRecord {
    /// A zeroed header for the given transfer type, status pending.
    pub fn new(handle: u64, kind: UrbKind) -> Self {
        Self {
            handle,
            kind,
            status: UrbStatus::Pending,
            buffer_length: 0,
            buffer_actual: 0,
            packet_count: 0,
            error_count: 0,
            flags: UrbFlags::empty(),
            interval: 0,
            devadr: 0,
            epadr: 0,
            setup: SetupPacket::default(),
        }
    }
}

/// An in-flight USB Request Block together with its payload.
///
/// Cloning is a deep copy of the buffer and the iso descriptors.
#[derive(Debug, Clone)]
pub struct Urb {
    handle: u64,
    kind: UrbKind,
    status: UrbStatus,
    buffer: Vec<u8>,
    buffer_actual: usize,
    iso_packets: Vec<IsoPacket>,
    error_count: u32,
    flags: UrbFlags,
    interval: i32,
    devadr: u8,
    epadr: u8,
    setup: SetupPacket,
}

impl Urb {
    /// Build an URB from a wire header, taking ownership of the payload
    /// buffer and iso descriptor array.
    ///
    /// Fields that are meaningless for the transfer type must be zero;
    /// the error names the offending field.
    pub fn new(record: UrbRecord, buffer: Vec<u8>, iso_packets: Vec<IsoPacket>) -> Result<Self> {
        if record.kind != UrbKind::Control {
            let s = &record.setup;
            if s.request_type != 0 {
                return Err(Error::InvalidArgument("request_type"));
            }
            if s.request != 0 {
                return Err(Error::InvalidArgument("request"));
            }
            if s.value != 0 {
                return Err(Error::InvalidArgument("value"));
            }
            if s.index != 0 {
                return Err(Error::InvalidArgument("index"));
            }
            if s.length != 0 {
                return Err(Error::InvalidArgument("length"));
            }
        }
        if record.kind != UrbKind::Isochronous {
            if record.packet_count != 0 {
                return Err(Error::InvalidArgument("packet_count"));
            }
            if !iso_packets.is_empty() {
                return Err(Error::InvalidArgument("iso_packets"));
            }
            if record.error_count != 0 {
                return Err(Error::InvalidArgument("error_count"));
            }
        } else {
            if record.packet_count > 0 && record.buffer_length == 0 {
                return Err(Error::InvalidArgument("packet_count"));
            }
            if iso_packets.len() != record.packet_count {
                return Err(Error::InvalidArgument("iso_packets"));
            }
        }
        if record.kind == UrbKind::Bulk && record.interval != 0 {
            return Err(Error::InvalidArgument("interval"));
        }
        if buffer.len() != record.buffer_length {
            return Err(Error::InvalidArgument("buffer"));
        }
        if record.buffer_actual > record.buffer_length {
            return Err(Error::InvalidArgument("buffer_actual"));
        }

        Ok(Self {
            handle: record.handle,
            kind: record.kind,
            status: record.status,
            buffer,
            buffer_actual: record.buffer_actual,
            iso_packets,
            error_count: record.error_count,
            flags: record.flags,
            interval: record.interval,
            devadr: record.devadr,
            epadr: record.epadr,
            setup: record.setup,
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn kind(&self) -> UrbKind {
        self.kind
    }

    pub fn is_isochronous(&self) -> bool {
        self.kind == UrbKind::Isochronous
    }

    pub fn is_interrupt(&self) -> bool {
        self.kind == UrbKind::Interrupt
    }

    pub fn is_control(&self) -> bool {
        self.kind == UrbKind::Control
    }

    pub fn is_bulk(&self) -> bool {
        self.kind == UrbKind::Bulk
    }

    /// Device address the transfer is aimed at.
    pub fn device_address(&self) -> u8 {
        self.devadr
    }

    /// Raw endpoint address byte, direction bit included.
    pub fn endpoint_address(&self) -> u8 {
        self.epadr
    }

    /// Endpoint number, the low four bits of the endpoint address.
    pub fn endpoint_number(&self) -> u8 {
        self.epadr & 0x0f
    }

    /// IN transfers move data device to host.
    pub fn is_in(&self) -> bool {
        self.epadr & 0x80 != 0
    }

    pub fn is_out(&self) -> bool {
        !self.is_in()
    }

    pub fn status(&self) -> UrbStatus {
        self.status
    }

    pub fn set_status(&mut self, status: UrbStatus) {
        self.status = status;
    }

    /// Complete successfully.
    pub fn ack(&mut self) {
        self.status = UrbStatus::Success;
    }

    /// Complete with an endpoint stall.
    pub fn stall(&mut self) {
        self.status = UrbStatus::Stall;
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable payload access; IN transfers are answered by writing here
    /// and setting the actual length.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn buffer_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer_actual(&self) -> usize {
        self.buffer_actual
    }

    /// Set the number of bytes actually transferred. Must not exceed the
    /// buffer length.
    pub fn set_buffer_actual(&mut self, actual: usize) {
        debug_assert!(actual <= self.buffer.len());
        self.buffer_actual = actual;
    }

    pub fn iso_packets(&self) -> &[IsoPacket] {
        &self.iso_packets
    }

    pub fn iso_packets_mut(&mut self) -> &mut [IsoPacket] {
        &mut self.iso_packets
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn interval(&self) -> i32 {
        self.interval
    }

    pub fn flags(&self) -> UrbFlags {
        self.flags
    }

    pub fn short_not_ok(&self) -> bool {
        self.flags.contains(UrbFlags::SHORT_NOT_OK)
    }

    pub fn zero_packet(&self) -> bool {
        self.flags.contains(UrbFlags::ZERO_PACKET)
    }

    /// Setup stage of a control transfer. Zeroed for other kinds.
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    /// Derive the URB completion from the per-packet statuses of an
    /// isochronous transfer.
    ///
    /// Counts the failed packets into `error_count`, marks the URB
    /// successful unless every packet failed, and forces the actual length
    /// to the full buffer for IN transfers. Idempotent.
    pub fn set_iso_results(&mut self) -> Result<()> {
        if !self.is_isochronous() {
            return Err(Error::InvalidArgument("urb is not isochronous"));
        }

        let errors = self
            .iso_packets
            .iter()
            .filter(|p| !p.status.is_success())
            .count();
        self.error_count = errors as u32;

        if errors == self.iso_packets.len() {
            self.status = UrbStatus::AllIsoPacketsFailed;
        } else {
            self.status = UrbStatus::Success;
        }

        if self.is_in() {
            self.buffer_actual = self.buffer.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_record(handle: u64) -> UrbRecord {
        let mut r = UrbRecord::new(handle, UrbKind::Control);
        r.setup = SetupPacket {
            request_type: 0x80,
            request: request::GET_DESCRIPTOR,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        r.buffer_length = 18;
        r.epadr = 0x80;
        r
    }

    #[test]
    fn test_control_urb_construction() {
        let urb = Urb::new(control_record(7), vec![0; 18], Vec::new()).unwrap();
        assert_eq!(urb.handle(), 7);
        assert!(urb.is_control());
        assert!(urb.is_in());
        assert_eq!(urb.endpoint_number(), 0);
        assert_eq!(urb.setup().request, request::GET_DESCRIPTOR);
        assert_eq!(urb.status(), UrbStatus::Pending);
    }

    #[test]
    fn test_non_control_rejects_setup_fields() {
        let mut r = UrbRecord::new(1, UrbKind::Bulk);
        r.setup.request = request::SET_ADDRESS;
        let err = Urb::new(r, Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument("request")));
    }

    #[test]
    fn test_non_iso_rejects_packet_count() {
        let mut r = UrbRecord::new(1, UrbKind::Interrupt);
        r.packet_count = 2;
        let err = Urb::new(r, Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument("packet_count")));
    }

    #[test]
    fn test_iso_packets_require_buffer() {
        let mut r = UrbRecord::new(1, UrbKind::Isochronous);
        r.packet_count = 2;
        let err = Urb::new(r, Vec::new(), vec![IsoPacket::default(); 2]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument("packet_count")));
    }

    #[test]
    fn test_iso_descriptor_count_must_match() {
        let mut r = UrbRecord::new(1, UrbKind::Isochronous);
        r.packet_count = 2;
        r.buffer_length = 8;
        let err = Urb::new(r, vec![0; 8], vec![IsoPacket::default(); 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument("iso_packets")));
    }

    #[test]
    fn test_bulk_rejects_interval() {
        let mut r = UrbRecord::new(1, UrbKind::Bulk);
        r.interval = 8;
        let err = Urb::new(r, Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument("interval")));
    }

    #[test]
    fn test_buffer_must_match_declared_length() {
        let mut r = UrbRecord::new(1, UrbKind::Bulk);
        r.buffer_length = 4;
        let err = Urb::new(r, vec![0; 3], Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument("buffer")));
    }

    #[test]
    fn test_ack_and_stall() {
        let mut urb = Urb::new(control_record(1), vec![0; 18], Vec::new()).unwrap();
        urb.ack();
        assert_eq!(urb.status(), UrbStatus::Success);
        urb.stall();
        assert_eq!(urb.status(), UrbStatus::Stall);
    }

    #[test]
    fn test_endpoint_decoding() {
        let mut r = UrbRecord::new(1, UrbKind::Interrupt);
        r.epadr = 0x83;
        r.interval = 10;
        let urb = Urb::new(r, Vec::new(), Vec::new()).unwrap();
        assert!(urb.is_in());
        assert_eq!(urb.endpoint_number(), 3);
        assert_eq!(urb.endpoint_address(), 0x83);
        assert_eq!(urb.interval(), 10);
    }

    fn iso_urb(packets: usize, epadr: u8) -> Urb {
        let mut r = UrbRecord::new(9, UrbKind::Isochronous);
        r.packet_count = packets;
        r.buffer_length = packets * 4;
        r.epadr = epadr;
        let iso = (0..packets)
            .map(|i| IsoPacket {
                offset: (i * 4) as u32,
                length: 4,
                actual: 0,
                status: UrbStatus::Pending,
            })
            .collect();
        Urb::new(r, vec![0; packets * 4], iso).unwrap()
    }

    #[test]
    fn test_iso_results_mixed() {
        let mut urb = iso_urb(3, 0x81);
        urb.iso_packets_mut()[0].ack();
        urb.iso_packets_mut()[1].stall();
        urb.iso_packets_mut()[2].ack();
        urb.set_iso_results().unwrap();
        assert_eq!(urb.error_count(), 1);
        assert_eq!(urb.status(), UrbStatus::Success);
        // IN iso completions always report the full buffer.
        assert_eq!(urb.buffer_actual(), urb.buffer_length());
    }

    #[test]
    fn test_iso_results_all_failed() {
        let mut urb = iso_urb(2, 0x01);
        urb.iso_packets_mut()[0].stall();
        urb.iso_packets_mut()[1].stall();
        urb.set_iso_results().unwrap();
        assert_eq!(urb.error_count(), 2);
        assert_eq!(urb.status(), UrbStatus::AllIsoPacketsFailed);
    }

    #[test]
    fn test_iso_results_idempotent() {
        let mut urb = iso_urb(3, 0x81);
        urb.iso_packets_mut()[1].stall();
        urb.iso_packets_mut()[0].ack();
        urb.iso_packets_mut()[2].ack();
        urb.set_iso_results().unwrap();
        let first = (urb.error_count(), urb.status(), urb.buffer_actual());
        urb.set_iso_results().unwrap();
        assert_eq!(first, (urb.error_count(), urb.status(), urb.buffer_actual()));
    }

    #[test]
    fn test_iso_results_rejects_other_kinds() {
        let mut urb = Urb::new(control_record(1), vec![0; 18], Vec::new()).unwrap();
        assert!(urb.set_iso_results().is_err());
    }

    #[test]
    fn test_clone_is_deep() {
        let mut urb = Urb::new(control_record(1), vec![0; 18], Vec::new()).unwrap();
        let copy = urb.clone();
        urb.buffer_mut()[0] = 0xaa;
        assert_eq!(copy.buffer()[0], 0);
    }
}
