//! USB host core.
//!
//! Sits between host controller drivers below and class drivers above.
//! Controllers register their schedule through [`host::HostControllerOps`]
//! and hand completed transfers back; the core owns bus addressing, the
//! device tree, hub maintenance and transfer dispatch, and publishes
//! enumerated devices to the OS through [`host::OsBus`].
//!
//! Locks nest in one direction only: a hub device's child lock, then the
//! controller's enumeration lock, then a device's state lock, then a hub's
//! port state lock. Transfer state itself is a lock-free atomic word, see
//! [`transfer`].

pub mod desc;
pub mod device;
pub mod error;
pub mod host;
pub mod hub;
pub mod transfer;
pub mod usb;

mod enumeration;
mod trace;
mod work;

pub use self::device::{Device, DeviceIds, Endpoint};
pub use self::enumeration::enumerate_interface;
pub use self::error::{Result, TransferError, UsbError};
pub use self::host::{
    EndpointConfig, EndpointHandle, HandoffDevice, HostCapabilities, HostController,
    HostControllerOps, OsBus, OsDeviceId, OsDeviceInfo, TransferHandle, UsbCore,
    HOST_INTERFACE_VERSION,
};
pub use self::trace::{set_trace_address, set_trace_flags, trace_flags, TraceFlags};
pub use self::hub::Hub;
pub use self::transfer::{Transfer, TransferCompletion, TransferFlags};
