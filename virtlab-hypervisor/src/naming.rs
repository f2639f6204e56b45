//! Deterministic device naming across storage controllers.
//!
//! Each controller owns a contiguous 16-slot window of the bus's device
//! namespace; slot letters run `a`..`z`, then `aa`, `ab`, ... Allocation
//! always returns one past the highest occupied slot on a controller and
//! never reuses a freed mid-sequence slot, so names stay stable for the
//! lifetime of the domain.

use crate::error::{HypervisorError, Result};
use crate::types::{DiskBus, DomainConfig};

/// Device slots per controller.
pub const SLOTS_PER_CONTROLLER: u32 = 16;

/// First absolute slot of a controller's window.
pub fn controller_base(controller_index: u32) -> u32 {
    controller_index * SLOTS_PER_CONTROLLER
}

/// Compute the next free slot on the given controller.
///
/// Scans disks already addressed to the exact (bus, index) pair and returns
/// one past the maximum observed slot, or the window base if none. Callers
/// must serialize allocation per domain; repeated calls with no intervening
/// attach return the same slot.
pub fn next_free_slot(config: &DomainConfig, bus: DiskBus, controller_index: u32) -> Result<u32> {
    let base = controller_base(controller_index);

    let highest = config
        .disks
        .iter()
        .filter(|d| d.address.bus == bus && d.address.controller == controller_index)
        .map(|d| d.address.slot)
        .max();

    let next = match highest {
        Some(slot) => slot + 1,
        None => base,
    };

    if next >= base + SLOTS_PER_CONTROLLER {
        return Err(HypervisorError::SlotInUse(format!(
            "{} controller {} has no free slot",
            bus.as_str(),
            controller_index
        )));
    }

    Ok(next)
}

/// Render an absolute slot as a letter run: 0 -> "a", 25 -> "z", 26 -> "aa".
pub fn slot_letters(slot: u32) -> String {
    let mut letters = Vec::new();
    let mut n = slot + 1;
    while n > 0 {
        n -= 1;
        letters.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8(letters).expect("slot letters are ASCII")
}

/// Parse a letter run back to an absolute slot.
pub fn letters_to_slot(letters: &str) -> Result<u32> {
    if letters.is_empty() {
        return Err(HypervisorError::Xml("empty device letters".to_string()));
    }
    let mut slot: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_lowercase() {
            return Err(HypervisorError::Xml(format!(
                "invalid device letters '{letters}'"
            )));
        }
        slot = slot * 26 + (c as u32 - 'a' as u32 + 1);
    }
    Ok(slot - 1)
}

/// Full device name for a slot on a bus, e.g. "sdq" for SCSI slot 16.
pub fn device_name(bus: DiskBus, slot: u32) -> String {
    format!("{}{}", bus.device_prefix(), slot_letters(slot))
}

/// Split a device name into its bus prefix remainder and absolute slot.
pub fn slot_from_device_name(bus: DiskBus, name: &str) -> Result<u32> {
    let letters = name.strip_prefix(bus.device_prefix()).ok_or_else(|| {
        HypervisorError::Xml(format!(
            "device '{name}' does not match prefix '{}'",
            bus.device_prefix()
        ))
    })?;
    letters_to_slot(letters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskAddress, DiskConfig};

    fn config_with_slots(bus: DiskBus, controller: u32, slots: &[u32]) -> DomainConfig {
        let mut config = DomainConfig::new("naming-test");
        for &slot in slots {
            config.disks.push(DiskConfig::new(
                format!("pool/vol{slot}"),
                DiskAddress::new(bus, controller, slot),
            ));
        }
        config
    }

    #[test]
    fn test_first_slot_is_window_base() {
        let config = config_with_slots(DiskBus::Scsi, 0, &[]);
        assert_eq!(next_free_slot(&config, DiskBus::Scsi, 0).unwrap(), 0);

        let config = config_with_slots(DiskBus::Scsi, 1, &[]);
        assert_eq!(next_free_slot(&config, DiskBus::Scsi, 1).unwrap(), 16);
    }

    #[test]
    fn test_three_disks_then_d() {
        // scsi/0 holding slots a, b, c -> next is d
        let config = config_with_slots(DiskBus::Scsi, 0, &[0, 1, 2]);
        let slot = next_free_slot(&config, DiskBus::Scsi, 0).unwrap();
        assert_eq!(slot, 3);
        assert_eq!(device_name(DiskBus::Scsi, slot), "sdd");
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let config = config_with_slots(DiskBus::Virtio, 0, &[0, 1]);
        let first = next_free_slot(&config, DiskBus::Virtio, 0).unwrap();
        let second = next_free_slot(&config, DiskBus::Virtio, 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_freed_slots_are_not_reused() {
        // slots a and c occupied, b freed earlier: next is d, not b
        let config = config_with_slots(DiskBus::Scsi, 0, &[0, 2]);
        assert_eq!(next_free_slot(&config, DiskBus::Scsi, 0).unwrap(), 3);
    }

    #[test]
    fn test_other_controllers_do_not_interfere() {
        let mut config = config_with_slots(DiskBus::Scsi, 0, &[0, 1, 2]);
        config.disks.push(DiskConfig::new(
            "pool/other",
            DiskAddress::new(DiskBus::Scsi, 1, 18),
        ));
        // controller 1's occupancy is invisible to controller 0
        assert_eq!(next_free_slot(&config, DiskBus::Scsi, 0).unwrap(), 3);
        // and vice versa
        assert_eq!(next_free_slot(&config, DiskBus::Scsi, 1).unwrap(), 19);
    }

    #[test]
    fn test_full_controller_errors() {
        let slots: Vec<u32> = (0..16).collect();
        let config = config_with_slots(DiskBus::Scsi, 0, &slots);
        match next_free_slot(&config, DiskBus::Scsi, 0) {
            Err(HypervisorError::SlotInUse(_)) => {}
            other => panic!("expected SlotInUse, got {other:?}"),
        }
    }

    #[test]
    fn test_slot_letters_roundtrip() {
        assert_eq!(slot_letters(0), "a");
        assert_eq!(slot_letters(15), "p");
        assert_eq!(slot_letters(16), "q");
        assert_eq!(slot_letters(25), "z");
        assert_eq!(slot_letters(26), "aa");
        assert_eq!(slot_letters(27), "ab");
        assert_eq!(slot_letters(16 * 2), "ag");

        for slot in [0u32, 1, 15, 16, 25, 26, 51, 52, 701, 702] {
            assert_eq!(letters_to_slot(&slot_letters(slot)).unwrap(), slot);
        }
    }

    #[test]
    fn test_slot_from_device_name() {
        assert_eq!(slot_from_device_name(DiskBus::Scsi, "sda").unwrap(), 0);
        assert_eq!(slot_from_device_name(DiskBus::Virtio, "vdq").unwrap(), 16);
        assert!(slot_from_device_name(DiskBus::Ide, "sda").is_err());
    }
}
