//! Root-hub port state
//!
//! Port numbers are 1-based; `0` means "no port" throughout the library.
//! A port snapshot is the triple of status bits, change latches and flag
//! bits the kernel reports for one root-hub port. Comparing two adjacent
//! snapshots yields the edge-triggered [`PortTriggers`] set that clients
//! act on (power on, reset started, and so on).

use bitflags::bitflags;

use crate::sys;

bitflags! {
    /// Port status bits, as defined by the USB hub protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 0x0001;
        const ENABLE = 0x0002;
        const SUSPEND = 0x0004;
        const OVERCURRENT = 0x0008;
        const RESET = 0x0010;
        const POWER = 0x0100;
        const LOW_SPEED = 0x0200;
        const HIGH_SPEED = 0x0400;
    }

    /// Change latches. The kernel clears these after user space has seen
    /// them; they share the low five bit positions with [`PortStatus`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChange: u16 {
        const CONNECTION = 0x0001;
        const ENABLE = 0x0002;
        const SUSPEND = 0x0004;
        const OVERCURRENT = 0x0008;
        const RESET = 0x0010;
    }

    /// Out-of-band port flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortFlags: u8 {
        const RESUMING = sys::PORT_STAT_FLAG_RESUMING;
    }

    /// Edges derived from two adjacent snapshots.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortTriggers: u8 {
        const DISABLE = 0x01;
        const SUSPEND = 0x02;
        const RESUMING = 0x04;
        const RESET = 0x08;
        const POWER_ON = 0x10;
        const POWER_OFF = 0x20;
    }
}

/// Data rate of a device being connected to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    /// Full speed, 12 Mbps.
    Full,
    /// Low speed, 1.5 Mbps.
    Low,
    /// High speed, 480 Mbps.
    High,
}

impl DataRate {
    /// The port status bit advertising this rate. Full speed is the
    /// absence of both speed bits.
    pub fn status_bits(self) -> PortStatus {
        match self {
            DataRate::Full => PortStatus::empty(),
            DataRate::Low => PortStatus::LOW_SPEED,
            DataRate::High => PortStatus::HIGH_SPEED,
        }
    }
}

/// Snapshot of one root-hub port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStat {
    pub status: PortStatus,
    pub change: PortChange,
    pub flags: PortFlags,
}

impl PortStat {
    pub fn new(status: PortStatus, change: PortChange, flags: PortFlags) -> Self {
        Self {
            status,
            change,
            flags,
        }
    }

    pub fn connection(&self) -> bool {
        self.status.contains(PortStatus::CONNECTION)
    }

    pub fn enabled(&self) -> bool {
        self.status.contains(PortStatus::ENABLE)
    }

    pub fn suspended(&self) -> bool {
        self.status.contains(PortStatus::SUSPEND)
    }

    pub fn in_reset(&self) -> bool {
        self.status.contains(PortStatus::RESET)
    }

    pub fn powered(&self) -> bool {
        self.status.contains(PortStatus::POWER)
    }

    pub fn resuming(&self) -> bool {
        self.flags.contains(PortFlags::RESUMING)
    }

    /// Edge set relative to the previous snapshot of the same port.
    pub fn triggers_since(&self, prev: &PortStat) -> PortTriggers {
        let mut t = PortTriggers::empty();
        if !self.enabled() && prev.enabled() {
            t |= PortTriggers::DISABLE;
        }
        if self.suspended() && !prev.suspended() {
            t |= PortTriggers::SUSPEND;
        }
        if self.resuming() && !prev.resuming() {
            t |= PortTriggers::RESUMING;
        }
        if self.in_reset() && !prev.in_reset() {
            t |= PortTriggers::RESET;
        }
        if self.powered() && !prev.powered() {
            t |= PortTriggers::POWER_ON;
        } else if !self.powered() && prev.powered() {
            t |= PortTriggers::POWER_OFF;
        }
        t
    }
}

/// Device address value meaning "no address bound".
pub const ADDRESS_UNSET: u8 = 0xff;

#[derive(Debug, Clone, Copy)]
struct PortRecord {
    address: u8,
    last_stat: PortStat,
}

impl Default for PortRecord {
    fn default() -> Self {
        Self {
            address: ADDRESS_UNSET,
            last_stat: PortStat::default(),
        }
    }
}

/// Per-port bookkeeping: the last status snapshot seen from the kernel and
/// the device address currently bound to the port.
///
/// All methods take 1-based port numbers the caller has already validated.
#[derive(Debug)]
pub(crate) struct PortTable {
    ports: Vec<PortRecord>,
}

impl PortTable {
    pub(crate) fn new(port_count: u8) -> Self {
        Self {
            ports: vec![PortRecord::default(); port_count as usize],
        }
    }

    pub(crate) fn snapshot(&self, port: u8) -> PortStat {
        self.ports[port as usize - 1].last_stat
    }

    /// Record a new snapshot and apply its address side effects: a
    /// connection change unbinds the address, and a completed reset that
    /// left the port enabled puts the device at the default address 0.
    pub(crate) fn commit_stat(&mut self, port: u8, stat: PortStat) {
        let rec = &mut self.ports[port as usize - 1];
        rec.last_stat = stat;
        if stat.change.contains(PortChange::CONNECTION) {
            rec.address = ADDRESS_UNSET;
        }
        if stat.change.contains(PortChange::RESET) && !stat.in_reset() && stat.enabled() {
            rec.address = 0x00;
        }
    }

    pub(crate) fn set_address(&mut self, port: u8, address: u8) {
        debug_assert!(address <= 0x7f || address == ADDRESS_UNSET);
        self.ports[port as usize - 1].address = address;
    }

    pub(crate) fn address_of(&self, port: u8) -> u8 {
        self.ports[port as usize - 1].address
    }

    /// Reverse lookup; returns 0 when no port is bound to `address`.
    pub(crate) fn port_of(&self, address: u8) -> u8 {
        debug_assert!(address <= 0x7f);
        for (i, rec) in self.ports.iter().enumerate() {
            if rec.address == address {
                return i as u8 + 1;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_bits(status: u16, change: u16, flags: u8) -> PortStat {
        PortStat::new(
            PortStatus::from_bits_truncate(status),
            PortChange::from_bits_truncate(change),
            PortFlags::from_bits_truncate(flags),
        )
    }

    #[test]
    fn test_triggers_exhaustive() {
        // Drive every combination of the five bits that feed the edge
        // rules, on both sides, and compare against the rules written out
        // directly.
        for p in 0u32..32 {
            for c in 0u32..32 {
                let build = |b: u32| {
                    let mut status = PortStatus::empty();
                    let mut flags = PortFlags::empty();
                    if b & 1 != 0 {
                        status |= PortStatus::ENABLE;
                    }
                    if b & 2 != 0 {
                        status |= PortStatus::SUSPEND;
                    }
                    if b & 4 != 0 {
                        flags |= PortFlags::RESUMING;
                    }
                    if b & 8 != 0 {
                        status |= PortStatus::RESET;
                    }
                    if b & 16 != 0 {
                        status |= PortStatus::POWER;
                    }
                    PortStat::new(status, PortChange::empty(), flags)
                };
                let prev = build(p);
                let cur = build(c);
                let t = cur.triggers_since(&prev);
                assert_eq!(
                    t.contains(PortTriggers::DISABLE),
                    p & 1 != 0 && c & 1 == 0
                );
                assert_eq!(
                    t.contains(PortTriggers::SUSPEND),
                    p & 2 == 0 && c & 2 != 0
                );
                assert_eq!(
                    t.contains(PortTriggers::RESUMING),
                    p & 4 == 0 && c & 4 != 0
                );
                assert_eq!(t.contains(PortTriggers::RESET), p & 8 == 0 && c & 8 != 0);
                assert_eq!(
                    t.contains(PortTriggers::POWER_ON),
                    p & 16 == 0 && c & 16 != 0
                );
                assert_eq!(
                    t.contains(PortTriggers::POWER_OFF),
                    p & 16 != 0 && c & 16 == 0
                );
            }
        }
    }

    #[test]
    fn test_power_on_trigger_from_cold() {
        let prev = PortStat::default();
        let cur = stat_bits(0x0100, 0, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::POWER_ON);
    }

    #[test]
    fn test_reset_completion_has_no_triggers() {
        let prev = stat_bits(0x0111, 0x0010, 0);
        let cur = stat_bits(0x0103, 0x0010, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::empty());
    }

    #[test]
    fn test_table_starts_unbound() {
        let table = PortTable::new(3);
        for port in 1..=3 {
            assert_eq!(table.address_of(port), ADDRESS_UNSET);
        }
        assert_eq!(table.port_of(0x00), 0);
    }

    #[test]
    fn test_reset_complete_binds_default_address() {
        let mut table = PortTable::new(1);
        table.commit_stat(1, stat_bits(0x0103, 0x0010, 0));
        assert_eq!(table.address_of(1), 0x00);
        assert_eq!(table.port_of(0x00), 1);
    }

    #[test]
    fn test_reset_still_asserted_does_not_bind() {
        let mut table = PortTable::new(1);
        table.commit_stat(1, stat_bits(0x0113, 0x0010, 0));
        assert_eq!(table.address_of(1), ADDRESS_UNSET);
    }

    #[test]
    fn test_connection_change_unbinds() {
        let mut table = PortTable::new(1);
        table.set_address(1, 42);
        assert_eq!(table.port_of(42), 1);
        table.commit_stat(1, stat_bits(0x0100, 0x0001, 0));
        assert_eq!(table.address_of(1), ADDRESS_UNSET);
        assert_eq!(table.port_of(42), 0);
    }

    #[test]
    fn test_address_roundtrip() {
        let mut table = PortTable::new(4);
        table.set_address(3, 0x2a);
        assert_eq!(table.port_of(table.address_of(3)), 3);
    }

    #[test]
    fn test_data_rate_bits() {
        assert_eq!(DataRate::Full.status_bits(), PortStatus::empty());
        assert_eq!(DataRate::Low.status_bits(), PortStatus::LOW_SPEED);
        assert_eq!(DataRate::High.status_bits(), PortStatus::HIGH_SPEED);
    }
}
