//! The device descriptor (USB 2.0 section 9.6.1).

/// A USB device descriptor.
///
/// There is exactly one per device and it applies to every configuration.
/// Field offsets follow USB 2.0 table 9-8.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// The length of this descriptor in bytes.
    pub length: u8,
    /// The descriptor type, always `DescriptorKind::Device`.
    pub kind: u8,
    /// The USB standard version in binary-coded decimal, e.g. 0x0200.
    pub usb: u16,
    /// The device class code. Zero defers class information to the
    /// interfaces; 0xFF is vendor specific.
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// The maximum packet size for endpoint zero. Reading this field is the
    /// whole point of the initial 8-byte descriptor fetch during enumeration.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    /// The device release number in binary-coded decimal.
    pub release: u16,
    /// String descriptor index for the manufacturer name, 0 if absent.
    pub manufacturer_str: u8,
    /// String descriptor index for the product name, 0 if absent.
    pub product_str: u8,
    /// String descriptor index for the serial number, 0 if absent.
    pub serial_str: u8,
    /// The number of configurations this device offers.
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

/// The first 8 bytes of the device descriptor.
///
/// Enumeration asks for only this much first: a freshly reset device is on
/// address zero with an unknown endpoint-zero packet size, and 8 bytes is
/// the largest request guaranteed to fit in a single packet at any speed.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl plain::Plain for DeviceDescriptor8Byte {}
