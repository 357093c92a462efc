//! Integration tests for port state handling
//!
//! Exercises the public port types: status bit layout, edge-trigger
//! derivation between snapshots, and the data rate encoding.

use usb_vhci::{DataRate, PortChange, PortFlags, PortStat, PortStatus, PortTriggers};

fn stat(status: u16, change: u16, flags: u8) -> PortStat {
    PortStat::new(
        PortStatus::from_bits_truncate(status),
        PortChange::from_bits_truncate(change),
        PortFlags::from_bits_truncate(flags),
    )
}

mod bit_layout {
    use super::*;

    #[test]
    fn test_status_bits_match_hub_protocol() {
        assert_eq!(PortStatus::CONNECTION.bits(), 0x0001);
        assert_eq!(PortStatus::ENABLE.bits(), 0x0002);
        assert_eq!(PortStatus::SUSPEND.bits(), 0x0004);
        assert_eq!(PortStatus::OVERCURRENT.bits(), 0x0008);
        assert_eq!(PortStatus::RESET.bits(), 0x0010);
        assert_eq!(PortStatus::POWER.bits(), 0x0100);
        assert_eq!(PortStatus::LOW_SPEED.bits(), 0x0200);
        assert_eq!(PortStatus::HIGH_SPEED.bits(), 0x0400);
    }

    #[test]
    fn test_change_bits_share_the_low_five() {
        assert_eq!(PortChange::CONNECTION.bits(), PortStatus::CONNECTION.bits());
        assert_eq!(PortChange::ENABLE.bits(), PortStatus::ENABLE.bits());
        assert_eq!(PortChange::SUSPEND.bits(), PortStatus::SUSPEND.bits());
        assert_eq!(
            PortChange::OVERCURRENT.bits(),
            PortStatus::OVERCURRENT.bits()
        );
        assert_eq!(PortChange::RESET.bits(), PortStatus::RESET.bits());
        assert_eq!(PortChange::all().bits(), 0x001f);
    }

    #[test]
    fn test_accessors_reflect_bits() {
        let s = stat(0x0113, 0, 0x01);
        assert!(s.connection());
        assert!(s.enabled());
        assert!(!s.suspended());
        assert!(s.in_reset());
        assert!(s.powered());
        assert!(s.resuming());
    }
}

mod triggers {
    use super::*;

    #[test]
    fn test_power_on_from_cold_port() {
        let prev = stat(0, 0, 0);
        let cur = stat(0x0100, 0, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::POWER_ON);
    }

    #[test]
    fn test_power_off() {
        let prev = stat(0x0100, 0, 0);
        let cur = stat(0, 0, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::POWER_OFF);
    }

    #[test]
    fn test_reset_rising_edge() {
        let prev = stat(0x0101, 0, 0);
        let cur = stat(0x0111, 0, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::RESET);
    }

    #[test]
    fn test_reset_completion_is_edge_free() {
        // Reset bit falls, enable rises; neither direction is a trigger.
        let prev = stat(0x0111, 0x0010, 0);
        let cur = stat(0x0103, 0x0010, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::empty());
    }

    #[test]
    fn test_disable_falling_edge() {
        let prev = stat(0x0103, 0, 0);
        let cur = stat(0x0101, 0, 0);
        assert_eq!(cur.triggers_since(&prev), PortTriggers::DISABLE);
    }

    #[test]
    fn test_suspend_and_resume_flags() {
        let prev = stat(0x0103, 0, 0);
        let suspended = stat(0x0107, 0, 0);
        assert_eq!(suspended.triggers_since(&prev), PortTriggers::SUSPEND);

        let resuming = stat(0x0107, 0, 0x01);
        assert_eq!(resuming.triggers_since(&suspended), PortTriggers::RESUMING);
    }

    #[test]
    fn test_simultaneous_edges_accumulate() {
        let prev = stat(0x0006, 0, 0);
        let cur = stat(0x0100, 0, 0);
        let t = cur.triggers_since(&prev);
        assert!(t.contains(PortTriggers::DISABLE));
        assert!(t.contains(PortTriggers::POWER_ON));
        assert!(!t.contains(PortTriggers::SUSPEND));
    }

    #[test]
    fn test_steady_state_has_no_triggers() {
        let s = stat(0x0103, 0, 0);
        assert_eq!(s.triggers_since(&s), PortTriggers::empty());
    }
}

mod data_rate {
    use super::*;

    #[test]
    fn test_rate_to_status_bits() {
        assert_eq!(DataRate::Full.status_bits(), PortStatus::empty());
        assert_eq!(DataRate::Low.status_bits(), PortStatus::LOW_SPEED);
        assert_eq!(DataRate::High.status_bits(), PortStatus::HIGH_SPEED);
    }

    #[test]
    fn test_speed_bits_are_mutually_exclusive() {
        for rate in [DataRate::Full, DataRate::Low, DataRate::High] {
            let bits = rate.status_bits();
            assert!(
                !bits.contains(PortStatus::LOW_SPEED | PortStatus::HIGH_SPEED),
                "rate {:?} sets both speed bits",
                rate
            );
        }
    }
}
