//! Kernel ABI for the VHCI character device
//!
//! This module mirrors the ioctl interface of the `usb-vhci-hcd` kernel
//! driver. The driver exposes a single character device (`/dev/usb-vhci`);
//! one `REGISTER` ioctl turns the open file into a host controller with a
//! fixed number of root-hub ports, after which the remaining ioctls move
//! work between the kernel's USB core and user space.
//!
//! All records are native-endian C structs passed by pointer. Pointer
//! fields inside `IocUrbData` and `IocGiveback` point into caller-owned
//! buffers; the kernel reads or fills them during the ioctl only.

use std::mem::size_of;

/// The character device the driver registers.
pub(crate) const DEVICE_FILE: &std::ffi::CStr = c"/dev/usb-vhci";

/// Largest number of root-hub ports a controller can be registered with.
pub(crate) const MAX_PORT_COUNT: u8 = 31;

// Work record discriminator.
pub(crate) const WORK_TYPE_PORT_STAT: u8 = 0;
pub(crate) const WORK_TYPE_PROCESS_URB: u8 = 1;
pub(crate) const WORK_TYPE_CANCEL_URB: u8 = 2;

// URB transfer type codes. These match the kernel header exactly.
pub(crate) const URB_TYPE_ISO: u8 = 0;
pub(crate) const URB_TYPE_INT: u8 = 1;
pub(crate) const URB_TYPE_CONTROL: u8 = 2;
pub(crate) const URB_TYPE_BULK: u8 = 3;

// URB flag bits.
pub(crate) const URB_FLAGS_SHORT_NOT_OK: u16 = 0x0001;
pub(crate) const URB_FLAGS_ISO_ASAP: u16 = 0x0002;
pub(crate) const URB_FLAGS_ZERO_PACKET: u16 = 0x0040;

/// Port flag bit: the port is in the resume signalling phase.
pub(crate) const PORT_STAT_FLAG_RESUMING: u8 = 0x01;

/// Controller registration, filled by the kernel on `IOCREGISTER`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct IocRegister {
    pub id: i32,
    pub usb_busnum: i32,
    pub bus_id: [u8; 20],
    pub port_count: u8,
}

/// Root-hub port status, both directions.
///
/// Read out of the work union on a port-stat event; written through
/// `IOCPORTSTAT` when user space changes a port.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IocPortStat {
    pub status: u16,
    pub change: u16,
    pub index: u8,
    pub flags: u8,
    pub reserved1: u8,
    pub reserved2: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IocSetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

/// URB header as delivered inside a fetch-work record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IocUrb {
    pub setup_packet: IocSetupPacket,
    pub buffer_length: i32,
    pub interval: i32,
    pub packet_count: i32,
    pub flags: u16,
    pub address: u8,
    pub endpoint: u8,
    pub type_: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union IocWorkUnion {
    pub urb: IocUrb,
    pub port: IocPortStat,
}

/// One unit of work fetched from the kernel.
///
/// `timeout` is an input (milliseconds the ioctl may block); everything
/// else is output. `type_` selects the live union member.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IocWork {
    pub handle: u64,
    pub work: IocWorkUnion,
    pub timeout: i16,
    pub type_: u8,
}

/// Iso descriptor delivered by `IOCFETCHDATA`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IocIsoPacketData {
    pub offset: u32,
    pub packet_length: u32,
}

/// Payload fetch request. `buffer` receives OUT data, `iso_packets` the
/// per-packet offsets and lengths.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct IocUrbData {
    pub handle: u64,
    pub buffer: *mut u8,
    pub iso_packets: *mut IocIsoPacketData,
    pub buffer_length: i32,
    pub packet_count: i32,
}

/// Iso completion record handed back with `IOCGIVEBACK`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IocIsoPacketGiveback {
    pub packet_actual: u32,
    pub status: i32,
}

/// URB completion. `status` is in the kernel's negative-errno space.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct IocGiveback {
    pub handle: u64,
    pub buffer: *const u8,
    pub iso_packets: *const IocIsoPacketGiveback,
    pub status: i32,
    pub buffer_actual: i32,
    pub packet_count: i32,
    pub error_count: i32,
}

// ioctl request number encoding (asm-generic flavour, which every
// architecture this driver exists on uses).
const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const IOC_MAGIC: u64 = 138;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << IOC_DIRSHIFT)
        | (IOC_MAGIC << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

pub(crate) const IOCREGISTER: u64 = ioc(IOC_READ | IOC_WRITE, 0, size_of::<IocRegister>());
pub(crate) const IOCPORTSTAT: u64 = ioc(IOC_WRITE, 1, size_of::<IocPortStat>());
pub(crate) const IOCFETCHWORK: u64 = ioc(IOC_READ | IOC_WRITE, 2, size_of::<IocWork>());
pub(crate) const IOCGIVEBACK: u64 = ioc(IOC_WRITE, 3, size_of::<IocGiveback>());
pub(crate) const IOCFETCHDATA: u64 = ioc(IOC_WRITE, 4, size_of::<IocUrbData>());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_direction_bits() {
        // REGISTER and FETCHWORK are bidirectional, the rest write-only.
        assert_eq!(IOCREGISTER >> IOC_DIRSHIFT, IOC_READ | IOC_WRITE);
        assert_eq!(IOCFETCHWORK >> IOC_DIRSHIFT, IOC_READ | IOC_WRITE);
        assert_eq!(IOCPORTSTAT >> IOC_DIRSHIFT, IOC_WRITE);
        assert_eq!(IOCGIVEBACK >> IOC_DIRSHIFT, IOC_WRITE);
        assert_eq!(IOCFETCHDATA >> IOC_DIRSHIFT, IOC_WRITE);
    }

    #[test]
    fn test_ioctl_numbers_are_distinct() {
        let nr = |req: u64| (req >> IOC_NRSHIFT) & 0xff;
        assert_eq!(nr(IOCREGISTER), 0);
        assert_eq!(nr(IOCPORTSTAT), 1);
        assert_eq!(nr(IOCFETCHWORK), 2);
        assert_eq!(nr(IOCGIVEBACK), 3);
        assert_eq!(nr(IOCFETCHDATA), 4);
    }

    #[test]
    fn test_work_union_is_large_enough() {
        assert!(size_of::<IocWorkUnion>() >= size_of::<IocUrb>());
        assert!(size_of::<IocWorkUnion>() >= size_of::<IocPortStat>());
    }
}
