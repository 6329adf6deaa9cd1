//! Hub class wire formats (USB 2.0 chapter 11).

/// The hub class descriptor, type 0x29.
///
/// The variable-length DeviceRemovable and PortPwrCtrlMask bitmaps that
/// trail this header are not interesting to the core and are left in the
/// transfer buffer.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptor {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    /// Time from port power-on until the port is usable, in 2 ms units.
    pub power_on_good: u8,
    pub current: u8,
}

unsafe impl plain::Plain for HubDescriptor {}

impl HubDescriptor {
    pub const DESCRIPTOR_KIND: u8 = 0x29;

    /// Largest size the descriptor can reach with both port bitmaps present.
    pub const MAX_SIZE: usize = core::mem::size_of::<Self>() + 64;
}

/// wHubCharacteristics bit: the hub has port indicator LEDs.
pub const HUB_CHARACTERISTIC_INDICATORS: u16 = 1 << 7;

/// Port indicator selector placed in the high byte of wIndex for
/// SET_FEATURE(PORT_INDICATOR). Zero selects hardware-controlled colors.
pub const HUB_INDICATOR_AUTOMATIC: u16 = 0 << 8;

/// Hub class feature selectors addressed at the hub itself
/// (USB 2.0 table 11-17).
#[derive(Clone, Copy, Debug)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// Hub class feature selectors addressed at a port (USB 2.0 table 11-17).
#[derive(Clone, Copy, Debug)]
#[repr(u16)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
    PortTest = 21,
    PortIndicator = 22,
}

/// Hub status change bits, i.e. the upper half of the 4-byte GET_STATUS
/// response for the hub itself.
#[derive(Clone, Copy, Debug)]
#[repr(u16)]
pub enum HubStatusChange {
    LocalPower = 1 << 0,
    OverCurrent = 1 << 1,
}

/// Bit offset separating wPortStatus from wPortChange in the 4-byte port
/// GET_STATUS response.
pub const HUB_PORT_CHANGE_SHIFT: u32 = 16;

bitflags::bitflags! {
    /// A port's combined wPortStatus and wPortChange words, as returned by
    /// GET_STATUS on a port (USB 2.0 section 11.24.2.7).
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
        // bits 13-15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        const SUSPEND_CHANGED = 1 << 18;
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
        // bits 21-31 reserved
    }
}

unsafe impl plain::Plain for HubPortStatus {}

impl HubPortStatus {
    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }

    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }

    pub fn speed(&self) -> super::DeviceSpeed {
        if self.contains(Self::HIGH_SPEED) {
            super::DeviceSpeed::High
        } else if self.contains(Self::LOW_SPEED) {
            super::DeviceSpeed::Low
        } else {
            super::DeviceSpeed::Full
        }
    }
}
