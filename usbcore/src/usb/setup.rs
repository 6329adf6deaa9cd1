use super::DescriptorKind;

/// The 8-byte packet that opens every control transfer (USB 2.0 section 9.3).
///
/// By convention the setup packet occupies the first 8 bytes of a control
/// transfer's buffer, followed directly by the data stage.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqType {
    /// Standard chapter 9 requests, issued by the core itself.
    Standard = 0,
    /// Class specific requests, e.g. the hub requests in chapter 11.
    Class = 1,
    /// Vendor specific requests, passed through for class drivers.
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    // 4..=30 are reserved
    VendorSpecific = 31,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;

impl Setup {
    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }

    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }

    pub const fn req_recipient(&self) -> u8 {
        self.kind & USB_SETUP_RECIPIENT_MASK
    }

    const fn kind(direction: ReqDirection, ty: ReqType, recipient: ReqRecipient) -> u8 {
        ((direction as u8) << 7) | ((ty as u8) << USB_SETUP_REQ_TY_SHIFT) | recipient as u8
    }

    pub const fn get_status(recipient: ReqRecipient, index: u16) -> Self {
        Self {
            kind: Self::kind(ReqDirection::DeviceToHost, ReqType::Standard, recipient),
            request: SetupReq::GetStatus as u8,
            value: 0,
            index,
            length: 2,
        }
    }

    pub const fn clear_feature(recipient: ReqRecipient, feature: u16, index: u16) -> Self {
        Self {
            kind: Self::kind(ReqDirection::HostToDevice, ReqType::Standard, recipient),
            request: SetupReq::ClearFeature as u8,
            value: feature,
            index,
            length: 0,
        }
    }

    pub const fn set_feature(recipient: ReqRecipient, feature: u16, index: u16) -> Self {
        Self {
            kind: Self::kind(ReqDirection::HostToDevice, ReqType::Standard, recipient),
            request: SetupReq::SetFeature as u8,
            value: feature,
            index,
            length: 0,
        }
    }

    pub const fn set_address(address: u8) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::HostToDevice,
                ReqType::Standard,
                ReqRecipient::Device,
            ),
            request: SetupReq::SetAddress as u8,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::DeviceToHost,
                ReqType::Standard,
                ReqRecipient::Device,
            ),
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::HostToDevice,
                ReqType::Standard,
                ReqRecipient::Device,
            ),
            request: SetupReq::SetConfiguration as u8,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::HostToDevice,
                ReqType::Standard,
                ReqRecipient::Interface,
            ),
            request: SetupReq::SetInterface as u8,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }

    /// Hub class GET_DESCRIPTOR, which uses the class request type rather
    /// than the standard one (USB 2.0 section 11.24.2.5).
    pub const fn get_hub_descriptor(length: u16) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::DeviceToHost,
                ReqType::Class,
                ReqRecipient::Device,
            ),
            request: SetupReq::GetDescriptor as u8,
            value: (DescriptorKind::Hub as u16) << 8,
            index: 0,
            length,
        }
    }

    /// Hub class GET_STATUS for the hub itself (index 0) or a port.
    pub const fn get_hub_status(port: u16) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::DeviceToHost,
                ReqType::Class,
                if port == 0 {
                    ReqRecipient::Device
                } else {
                    ReqRecipient::Other
                },
            ),
            request: SetupReq::GetStatus as u8,
            value: 0,
            index: port,
            length: 4,
        }
    }

    /// Hub class SET_FEATURE/CLEAR_FEATURE. Port 0 addresses the hub itself.
    pub const fn hub_feature(set: bool, feature: u16, port: u16) -> Self {
        Self {
            kind: Self::kind(
                ReqDirection::HostToDevice,
                ReqType::Class,
                if port == 0 {
                    ReqRecipient::Device
                } else {
                    ReqRecipient::Other
                },
            ),
            request: if set {
                SetupReq::SetFeature as u8
            } else {
                SetupReq::ClearFeature as u8
            },
            value: feature,
            index: port,
            length: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_fields() {
        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
        assert_eq!(setup.direction(), ReqDirection::DeviceToHost);
        assert_eq!(setup.req_ty(), ReqType::Standard as u8);
        assert_eq!(setup.req_recipient(), ReqRecipient::Device as u8);
        assert_eq!({ setup.value }, 0x0100);
        assert_eq!({ setup.length }, 18);
    }

    #[test]
    fn hub_requests_use_class_type() {
        let setup = Setup::get_hub_status(3);
        assert_eq!(setup.req_ty(), ReqType::Class as u8);
        assert_eq!(setup.req_recipient(), ReqRecipient::Other as u8);
        assert_eq!({ setup.index }, 3);

        let setup = Setup::hub_feature(true, 4, 1);
        assert_eq!(setup.request, SetupReq::SetFeature as u8);
        assert_eq!({ setup.value }, 4);
    }
}
