//! Trace switches and the class table.
//!
//! The class table and the initial trace settings live in `usbclass.toml`,
//! compiled into the library so the core has no runtime file dependencies.
//! The trace switches themselves are runtime state: a bitmask of subsystems
//! plus an optional single-device address filter, adjustable while the core
//! runs.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use lazy_static::lazy_static;
use serde::Deserialize;

bitflags! {
    /// Subsystems whose trace output is enabled.
    pub struct TraceFlags: u32 {
        /// Transfer submissions.
        const TRANSFERS = 1 << 0;
        /// Transfer completions.
        const COMPLETIONS = 1 << 1;
        /// Hub port status changes.
        const HUB = 1 << 2;
        /// Enumeration steps.
        const ENUMERATION = 1 << 3;
        /// Debugger handoff device handling.
        const HANDOFF = 1 << 4;
        /// Failed transfers, beyond what the subsystems log themselves.
        const ERRORS = 1 << 5;
    }
}

#[derive(Deserialize)]
pub struct ClassEntry {
    pub class: u8,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
    pub id: String,
}

#[derive(Deserialize)]
struct DebugConfig {
    transfers: bool,
    completions: bool,
    hub: bool,
    enumeration: bool,
    handoff: bool,
    errors: bool,
    /// Restrict trace output to this bus address; absent means all devices.
    address: Option<u8>,
}

#[derive(Deserialize)]
pub struct CoreConfig {
    pub classes: Vec<ClassEntry>,
    debug: DebugConfig,
}

struct TraceState {
    flags: AtomicU32,
    /// A device address to filter on, zero for no filter. Address zero is
    /// only ever transiently occupied during enumeration, so it doubles as
    /// the off value.
    address: AtomicU8,
}

lazy_static! {
    pub static ref CORE_CONFIG: CoreConfig =
        toml::from_slice(include_bytes!("../usbclass.toml"))
            .expect("usbcore: failed to parse usbclass.toml");
    static ref TRACE: TraceState = {
        let debug = &CORE_CONFIG.debug;
        let mut flags = TraceFlags::empty();
        for (on, flag) in [
            (debug.transfers, TraceFlags::TRANSFERS),
            (debug.completions, TraceFlags::COMPLETIONS),
            (debug.hub, TraceFlags::HUB),
            (debug.enumeration, TraceFlags::ENUMERATION),
            (debug.handoff, TraceFlags::HANDOFF),
            (debug.errors, TraceFlags::ERRORS),
        ] {
            if on {
                flags |= flag;
            }
        }
        TraceState {
            flags: AtomicU32::new(flags.bits()),
            address: AtomicU8::new(debug.address.unwrap_or(0)),
        }
    };
}

pub fn trace_flags() -> TraceFlags {
    TraceFlags::from_bits_truncate(TRACE.flags.load(Ordering::Relaxed))
}

pub fn set_trace_flags(flags: TraceFlags) {
    TRACE.flags.store(flags.bits(), Ordering::Relaxed);
}

/// Restricts trace output to one bus address, `None` lifts the filter.
pub fn set_trace_address(address: Option<u8>) {
    TRACE.address.store(address.unwrap_or(0), Ordering::Relaxed);
}

/// Whether a trace site for `flag` concerning the device at `address`
/// should emit.
pub(crate) fn trace_enabled(flag: TraceFlags, address: u8) -> bool {
    if !trace_flags().contains(flag) {
        return false;
    }
    let filter = TRACE.address.load(Ordering::Relaxed);
    filter == 0 || filter == address
}

/// Looks up the OS class identifier for a class triple. An entry with a
/// matching subclass and protocol beats a bare class entry.
pub fn class_id(class: u8, subclass: u8, protocol: u8) -> Option<&'static str> {
    let mut fallback = None;
    for entry in &CORE_CONFIG.classes {
        if entry.class != class {
            continue;
        }
        match (entry.subclass, entry.protocol) {
            (Some(s), Some(p)) if s == subclass && p == protocol => return Some(&entry.id),
            (Some(s), None) if s == subclass => fallback = Some(entry.id.as_str()),
            (None, None) if fallback.is_none() => fallback = Some(entry.id.as_str()),
            _ => {}
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_entries_win() {
        assert_eq!(class_id(0x03, 0x01, 0x01), Some("Keyboard"));
        assert_eq!(class_id(0x03, 0x01, 0x02), Some("Mouse"));
        assert_eq!(class_id(0x03, 0x00, 0x00), Some("Human Input Device"));
    }

    #[test]
    fn bare_classes_resolve() {
        assert_eq!(class_id(0x09, 0, 0), Some("Hub"));
        assert_eq!(class_id(0x08, 0x06, 0x50), Some("Mass Storage"));
        assert_eq!(class_id(0xFF, 0, 0), None);
    }

    #[test]
    fn address_filter_gates_trace_sites() {
        set_trace_flags(TraceFlags::HUB);
        assert!(trace_enabled(TraceFlags::HUB, 3));
        assert!(!trace_enabled(TraceFlags::TRANSFERS, 3));

        set_trace_address(Some(4));
        assert!(trace_enabled(TraceFlags::HUB, 4));
        assert!(!trace_enabled(TraceFlags::HUB, 3));

        set_trace_address(None);
        assert!(trace_enabled(TraceFlags::HUB, 3));
        set_trace_flags(TraceFlags::empty());
    }
}
