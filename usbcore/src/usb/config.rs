/// A configuration descriptor header (USB 2.0 section 9.6.3).
///
/// On the wire this header is followed by the interface, endpoint and class
/// specific descriptors of the whole configuration, `total_length` bytes in
/// all. See [`crate::desc::ConfDesc`] for the parsed form.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    /// Combined length of this descriptor and everything trailing it.
    pub total_length: u16,
    pub interfaces: u8,
    /// The value to pass in SET_CONFIGURATION to select this configuration.
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    /// Maximum bus power draw in 2 mA units.
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}
