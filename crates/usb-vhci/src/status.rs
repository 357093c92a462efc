//! URB completion status codes
//!
//! The library-facing status space and its mapping onto the kernel's
//! negative-errno completion space. The mapping is not a bijection: the
//! kernel folds several conditions onto `-EPROTO`, and two errnos mean
//! "canceled". Decoding normalizes those cases.

/// Completion status of an URB (or of a single iso packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrbStatus {
    /// Transfer completed.
    Success,
    /// Still owned by user space; set on every freshly fetched URB.
    Pending,
    /// IN transfer ended before the requested length was reached.
    ShortPacket,
    /// Unspecified transfer failure.
    Error,
    /// The kernel withdrew the URB.
    Canceled,
    Timedout,
    /// The device at the other end is disabled.
    DeviceDisabled,
    DeviceDisconnected,
    BitStuff,
    Crc,
    NoResponse,
    Babble,
    /// Endpoint stalled (request not supported or halted).
    Stall,
    BufferOverrun,
    BufferUnderrun,
    /// Every packet of an isochronous URB failed.
    AllIsoPacketsFailed,
}

impl UrbStatus {
    /// Encode for the kernel. `iso` selects the iso-specific errnos for the
    /// two statuses that have them.
    pub fn to_errno(self, iso: bool) -> i32 {
        match self {
            UrbStatus::Success => 0,
            UrbStatus::Pending => -libc::EINPROGRESS,
            UrbStatus::ShortPacket => -libc::EREMOTEIO,
            UrbStatus::Error => {
                if iso {
                    -libc::EXDEV
                } else {
                    -libc::EPROTO
                }
            }
            UrbStatus::Canceled => -libc::ECONNRESET,
            UrbStatus::Timedout => -libc::ETIMEDOUT,
            UrbStatus::DeviceDisabled => -libc::ESHUTDOWN,
            UrbStatus::DeviceDisconnected => -libc::ENODEV,
            UrbStatus::BitStuff => -libc::EPROTO,
            UrbStatus::Crc => -libc::EILSEQ,
            UrbStatus::NoResponse => -libc::ETIME,
            UrbStatus::Babble => -libc::EOVERFLOW,
            UrbStatus::Stall => -libc::EPIPE,
            UrbStatus::BufferOverrun => -libc::ECOMM,
            UrbStatus::BufferUnderrun => -libc::ENOSR,
            UrbStatus::AllIsoPacketsFailed => {
                if iso {
                    -libc::EINVAL
                } else {
                    -libc::EPROTO
                }
            }
        }
    }

    /// Decode a kernel completion code. Codes outside the documented set
    /// come back as [`UrbStatus::Error`].
    pub fn from_errno(errno: i32, iso: bool) -> Self {
        match -errno {
            0 => UrbStatus::Success,
            libc::EINPROGRESS => UrbStatus::Pending,
            libc::EREMOTEIO => UrbStatus::ShortPacket,
            libc::ENOENT | libc::ECONNRESET => UrbStatus::Canceled,
            libc::ETIMEDOUT => UrbStatus::Timedout,
            libc::ESHUTDOWN => UrbStatus::DeviceDisabled,
            libc::ENODEV => UrbStatus::DeviceDisconnected,
            libc::EPROTO => UrbStatus::BitStuff,
            libc::EILSEQ => UrbStatus::Crc,
            libc::ETIME => UrbStatus::NoResponse,
            libc::EOVERFLOW => UrbStatus::Babble,
            libc::EPIPE => UrbStatus::Stall,
            libc::ECOMM => UrbStatus::BufferOverrun,
            libc::ENOSR => UrbStatus::BufferUnderrun,
            libc::EINVAL => {
                if iso {
                    UrbStatus::AllIsoPacketsFailed
                } else {
                    UrbStatus::Error
                }
            }
            _ => UrbStatus::Error,
        }
    }

    /// Encode a single iso packet status. Packet statuses always use the
    /// non-iso errno column.
    pub fn to_iso_packet_errno(self) -> i32 {
        self.to_errno(false)
    }

    /// Decode a single iso packet status.
    pub fn from_iso_packet_errno(errno: i32) -> Self {
        Self::from_errno(errno, false)
    }

    pub fn is_success(self) -> bool {
        self == UrbStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [UrbStatus; 16] = [
        UrbStatus::Success,
        UrbStatus::Pending,
        UrbStatus::ShortPacket,
        UrbStatus::Error,
        UrbStatus::Canceled,
        UrbStatus::Timedout,
        UrbStatus::DeviceDisabled,
        UrbStatus::DeviceDisconnected,
        UrbStatus::BitStuff,
        UrbStatus::Crc,
        UrbStatus::NoResponse,
        UrbStatus::Babble,
        UrbStatus::Stall,
        UrbStatus::BufferOverrun,
        UrbStatus::BufferUnderrun,
        UrbStatus::AllIsoPacketsFailed,
    ];

    #[test]
    fn test_errno_table_non_iso() {
        assert_eq!(UrbStatus::Success.to_errno(false), 0);
        assert_eq!(UrbStatus::Pending.to_errno(false), -libc::EINPROGRESS);
        assert_eq!(UrbStatus::ShortPacket.to_errno(false), -libc::EREMOTEIO);
        assert_eq!(UrbStatus::Error.to_errno(false), -libc::EPROTO);
        assert_eq!(UrbStatus::Canceled.to_errno(false), -libc::ECONNRESET);
        assert_eq!(UrbStatus::Timedout.to_errno(false), -libc::ETIMEDOUT);
        assert_eq!(UrbStatus::DeviceDisabled.to_errno(false), -libc::ESHUTDOWN);
        assert_eq!(UrbStatus::DeviceDisconnected.to_errno(false), -libc::ENODEV);
        assert_eq!(UrbStatus::BitStuff.to_errno(false), -libc::EPROTO);
        assert_eq!(UrbStatus::Crc.to_errno(false), -libc::EILSEQ);
        assert_eq!(UrbStatus::NoResponse.to_errno(false), -libc::ETIME);
        assert_eq!(UrbStatus::Babble.to_errno(false), -libc::EOVERFLOW);
        assert_eq!(UrbStatus::Stall.to_errno(false), -libc::EPIPE);
        assert_eq!(UrbStatus::BufferOverrun.to_errno(false), -libc::ECOMM);
        assert_eq!(UrbStatus::BufferUnderrun.to_errno(false), -libc::ENOSR);
        assert_eq!(
            UrbStatus::AllIsoPacketsFailed.to_errno(false),
            -libc::EPROTO
        );
    }

    #[test]
    fn test_errno_table_iso_overrides() {
        assert_eq!(UrbStatus::Error.to_errno(true), -libc::EXDEV);
        assert_eq!(UrbStatus::AllIsoPacketsFailed.to_errno(true), -libc::EINVAL);
    }

    #[test]
    fn test_decode_is_inverse_on_decodable_codes() {
        // from_errno . to_errno is the identity wherever the encoding is
        // unambiguous. Without the iso flag, Error and AllIsoPacketsFailed
        // both encode to EPROTO, which decodes to BitStuff; those two rows
        // are the only fold.
        for iso in [false, true] {
            for status in ALL {
                let folded = !iso
                    && matches!(status, UrbStatus::Error | UrbStatus::AllIsoPacketsFailed);
                if folded {
                    continue;
                }
                assert_eq!(
                    UrbStatus::from_errno(status.to_errno(iso), iso),
                    status,
                    "status {:?} iso {}",
                    status,
                    iso
                );
            }
        }
    }

    #[test]
    fn test_canceled_pair_normalizes() {
        assert_eq!(
            UrbStatus::from_errno(-libc::ENOENT, false),
            UrbStatus::Canceled
        );
        assert_eq!(
            UrbStatus::from_errno(-libc::ECONNRESET, false),
            UrbStatus::Canceled
        );
        assert_eq!(UrbStatus::Canceled.to_errno(false), -libc::ECONNRESET);
    }

    #[test]
    fn test_unknown_errno_maps_to_error() {
        assert_eq!(UrbStatus::from_errno(-libc::EIO, false), UrbStatus::Error);
        assert_eq!(UrbStatus::from_errno(-12345, true), UrbStatus::Error);
    }

    #[test]
    fn test_iso_packet_mapping_uses_non_iso_column() {
        assert_eq!(
            UrbStatus::AllIsoPacketsFailed.to_iso_packet_errno(),
            -libc::EPROTO
        );
        assert_eq!(
            UrbStatus::from_iso_packet_errno(-libc::EPIPE),
            UrbStatus::Stall
        );
    }
}
