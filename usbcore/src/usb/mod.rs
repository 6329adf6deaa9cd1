//! USB 2.0 wire formats.
//!
//! Everything in this module is laid out exactly as it travels over the bus,
//! so the structures are `#[repr(C, packed)]` and read out of transfer
//! buffers with [`plain`]. The parsed, heap-allocated views that class
//! drivers consume live in [`crate::desc`].

pub use self::config::ConfigDescriptor;
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::hub::{
    HubDescriptor, HubFeature, HubPortFeature, HubPortStatus, HubStatusChange,
    HUB_CHARACTERISTIC_INDICATORS, HUB_INDICATOR_AUTOMATIC, HUB_PORT_CHANGE_SHIFT,
};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{ReqDirection, ReqRecipient, ReqType, Setup, SetupReq};
pub use self::string::{
    decode_languages, decode_string, StringDescriptor, STRING_DESCRIPTOR_MAX_SIZE,
};

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod hub;
pub(crate) mod interface;
pub(crate) mod setup;
pub(crate) mod string;

/// Descriptor type codes from USB 2.0 section 9.4, plus the hub class
/// descriptor from chapter 11.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Hid = 33,
    Hub = 41,
}

/// LANGID for US English, the only language this core reads strings in.
pub const LANGUAGE_ENGLISH_US: u16 = 0x0409;

/// Device class codes this core has to recognize itself. Everything else is
/// forwarded to class drivers untouched.
pub mod class {
    /// Class information lives in the interface descriptors.
    pub const USE_INTERFACE: u8 = 0x00;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
}

/// Standard feature selectors (USB 2.0 table 9-6).
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
    pub const TEST_MODE: u16 = 2;
}

/// Bus speeds a device can enumerate at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
}
