//! Kernel channel
//!
//! The lowest layer of the library: a thin wrapper around `/dev/usb-vhci`
//! and the five ioctls the kernel driver understands. Opening the device
//! and issuing `REGISTER` creates a new virtual host controller; after
//! that, `fetch_work` drains the kernel's event stream, `fetch_data` pulls
//! URB payloads, `port_stat` pushes root-hub port changes and `giveback`
//! completes URBs.
//!
//! All `unsafe` of the crate lives here: the ioctl calls themselves and
//! the reads of the fetch-work union, whose live member is selected by the
//! record's type byte.

use std::os::unix::io::RawFd;
use std::ptr;

use tracing::trace;

use crate::error::{Error, Result};
use crate::port::{PortChange, PortFlags, PortStat, PortStatus};
use crate::status::UrbStatus;
use crate::sys;
use crate::urb::{SetupPacket, Urb, UrbFlags, UrbKind, UrbRecord};

/// One event fetched from the kernel.
#[derive(Debug)]
pub(crate) enum KernelEvent {
    /// A root-hub port changed state.
    PortStat { port: u8, stat: PortStat },
    /// The USB core queued an URB toward one of our devices. `needs_data`
    /// is set when a `fetch_data` call must follow to obtain the payload
    /// or the iso descriptors.
    ProcessUrb { record: UrbRecord, needs_data: bool },
    /// The USB core withdrew a previously delivered URB.
    CancelUrb { handle: u64 },
}

/// Operations the work pump needs from the kernel side.
///
/// Implemented by [`VhciDevice`]; test code substitutes a scripted
/// channel.
pub(crate) trait VhciChannel: Send + Sync {
    /// Wait up to `timeout_ms` for the next event. `Ok(None)` means the
    /// wait ended without one (timeout or a benign interruption).
    fn fetch_work(&self, timeout_ms: i16) -> Result<Option<KernelEvent>>;

    /// Fill the URB's payload buffer and iso descriptors.
    fn fetch_data(&self, urb: &mut Urb) -> Result<()>;

    /// Push a new status for one root-hub port.
    fn port_stat(&self, port: u8, stat: PortStat) -> Result<()>;

    /// Return a completed URB to the USB core.
    fn giveback(&self, urb: &Urb) -> Result<()>;
}

/// An open virtual host controller.
pub struct VhciDevice {
    fd: RawFd,
    id: i32,
    busnum: i32,
    bus_id: String,
}

impl VhciDevice {
    /// Open `/dev/usb-vhci` and register a controller with `port_count`
    /// root-hub ports.
    pub fn open(port_count: u8) -> Result<Self> {
        if port_count == 0 || port_count > sys::MAX_PORT_COUNT {
            return Err(Error::InvalidArgument("port_count"));
        }

        let fd = unsafe { libc::open(sys::DEVICE_FILE.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let mut reg = sys::IocRegister {
            id: 0,
            usb_busnum: 0,
            bus_id: [0; 20],
            port_count,
        };
        let res = unsafe { libc::ioctl(fd, sys::IOCREGISTER as libc::c_ulong, &mut reg) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            close_retrying(fd);
            return Err(Error::Io(err));
        }

        let len = reg.bus_id.iter().position(|&b| b == 0).unwrap_or(reg.bus_id.len());
        let bus_id = String::from_utf8_lossy(&reg.bus_id[..len]).into_owned();

        Ok(Self {
            fd,
            id: reg.id,
            busnum: reg.usb_busnum,
            bus_id,
        })
    }

    /// Controller id assigned by the kernel.
    pub fn controller_id(&self) -> i32 {
        self.id
    }

    /// Number of the USB bus backing this controller.
    pub fn bus_number(&self) -> i32 {
        self.busnum
    }

    /// Bus identifier string, typically `vhci_hcd.<id>`.
    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    fn ioctl<T>(&self, request: u64, arg: *mut T) -> std::io::Result<()> {
        let res = unsafe { libc::ioctl(self.fd, request as libc::c_ulong, arg) };
        if res < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl VhciChannel for VhciDevice {
    fn fetch_work(&self, timeout_ms: i16) -> Result<Option<KernelEvent>> {
        let mut work = sys::IocWork {
            handle: 0,
            work: sys::IocWorkUnion {
                urb: sys::IocUrb::default(),
            },
            timeout: timeout_ms,
            type_: 0,
        };
        if let Err(err) = self.ioctl(sys::IOCFETCHWORK, &mut work) {
            return match err.raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) | Some(libc::ENODATA) => Ok(None),
                _ => Err(Error::Io(err)),
            };
        }
        decode_work(&work).map(Some)
    }

    fn fetch_data(&self, urb: &mut Urb) -> Result<()> {
        let packet_count = urb.iso_packets().len();
        let mut iso_raw = vec![sys::IocIsoPacketData::default(); packet_count];

        let mut data = sys::IocUrbData {
            handle: urb.handle(),
            buffer: if urb.buffer_length() > 0 {
                urb.buffer_mut().as_mut_ptr()
            } else {
                ptr::null_mut()
            },
            iso_packets: if packet_count > 0 {
                iso_raw.as_mut_ptr()
            } else {
                ptr::null_mut()
            },
            buffer_length: urb.buffer_length() as i32,
            packet_count: packet_count as i32,
        };
        if let Err(err) = self.ioctl(sys::IOCFETCHDATA, &mut data) {
            return if err.raw_os_error() == Some(libc::ECANCELED) {
                Err(Error::Canceled)
            } else {
                Err(Error::Io(err))
            };
        }

        for (packet, raw) in urb.iso_packets_mut().iter_mut().zip(&iso_raw) {
            packet.offset = raw.offset;
            packet.length = raw.packet_length;
            packet.actual = 0;
            packet.status = UrbStatus::Pending;
        }
        Ok(())
    }

    fn port_stat(&self, port: u8, stat: PortStat) -> Result<()> {
        let mut raw = sys::IocPortStat {
            status: stat.status.bits(),
            change: stat.change.bits(),
            index: port,
            flags: stat.flags.bits(),
            reserved1: 0,
            reserved2: 0,
        };
        trace!(port, status = raw.status, change = raw.change, "port stat write");
        self.ioctl(sys::IOCPORTSTAT, &mut raw)?;
        Ok(())
    }

    fn giveback(&self, urb: &Urb) -> Result<()> {
        let iso = urb.is_isochronous();
        let mut gb = sys::IocGiveback {
            handle: urb.handle(),
            buffer: ptr::null(),
            iso_packets: ptr::null(),
            status: urb.status().to_errno(iso),
            buffer_actual: urb.buffer_actual() as i32,
            packet_count: 0,
            error_count: 0,
        };

        if urb.is_in() && urb.buffer_actual() > 0 {
            gb.buffer = urb.buffer().as_ptr();
        }

        let iso_gb: Vec<sys::IocIsoPacketGiveback>;
        if iso {
            iso_gb = urb
                .iso_packets()
                .iter()
                .map(|p| sys::IocIsoPacketGiveback {
                    packet_actual: p.actual,
                    status: p.status.to_iso_packet_errno(),
                })
                .collect();
            gb.iso_packets = iso_gb.as_ptr();
            gb.packet_count = iso_gb.len() as i32;
            gb.error_count = urb.error_count() as i32;
        }

        if let Err(err) = self.ioctl(sys::IOCGIVEBACK, &mut gb) {
            // The kernel reports an URB it already canceled; nothing left
            // for the caller to do.
            if err.raw_os_error() == Some(libc::ECANCELED) {
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }
}

impl Drop for VhciDevice {
    fn drop(&mut self) {
        close_retrying(self.fd);
    }
}

fn close_retrying(fd: RawFd) {
    loop {
        let res = unsafe { libc::close(fd) };
        if res == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

/// Turn a raw fetch-work record into a typed event.
fn decode_work(work: &sys::IocWork) -> Result<KernelEvent> {
    match work.type_ {
        sys::WORK_TYPE_PORT_STAT => {
            let port = unsafe { work.work.port };
            Ok(KernelEvent::PortStat {
                port: port.index,
                stat: PortStat::new(
                    PortStatus::from_bits_truncate(port.status),
                    PortChange::from_bits_truncate(port.change),
                    PortFlags::from_bits_truncate(port.flags),
                ),
            })
        }
        sys::WORK_TYPE_PROCESS_URB => {
            let raw = unsafe { work.work.urb };
            let kind = UrbKind::from_raw(raw.type_).ok_or(Error::BadMessage("urb type"))?;

            let mut record = UrbRecord::new(work.handle, kind);
            record.buffer_length = raw.buffer_length.max(0) as usize;
            record.devadr = raw.address;
            record.epadr = raw.endpoint;
            match kind {
                UrbKind::Isochronous => {
                    record.packet_count = raw.packet_count.max(0) as usize;
                    record.interval = raw.interval;
                }
                UrbKind::Interrupt => {
                    record.interval = raw.interval;
                }
                UrbKind::Control => {
                    record.setup = SetupPacket {
                        request_type: raw.setup_packet.bm_request_type,
                        request: raw.setup_packet.b_request,
                        value: raw.setup_packet.w_value,
                        index: raw.setup_packet.w_index,
                        length: raw.setup_packet.w_length,
                    };
                }
                UrbKind::Bulk => {
                    record.flags = UrbFlags::from_bits_truncate(raw.flags)
                        & (UrbFlags::SHORT_NOT_OK | UrbFlags::ZERO_PACKET);
                }
            }

            // OUT transfers and iso transfers carry their payload length
            // up front; for plain IN transfers the data flows back at
            // giveback time instead.
            let is_out = raw.endpoint & 0x80 == 0;
            if is_out || kind == UrbKind::Isochronous {
                record.buffer_actual = record.buffer_length;
            }
            let needs_data = record.buffer_actual > 0 || record.packet_count > 0;

            Ok(KernelEvent::ProcessUrb { record, needs_data })
        }
        sys::WORK_TYPE_CANCEL_URB => Ok(KernelEvent::CancelUrb {
            handle: work.handle,
        }),
        _ => Err(Error::BadMessage("work type")),
    }
}
