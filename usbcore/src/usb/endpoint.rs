use std::fmt;

use plain::Plain;

/// An endpoint descriptor (USB 2.0 section 9.6.6).
///
/// These only arrive embedded in a configuration descriptor read; they
/// cannot be requested individually.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    /// Endpoint number in bits 0..4, direction in bit 7 (1 = IN).
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    /// Polling interval for interrupt and isochronous endpoints, in frames.
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

/// Mask applied to [`EndpointDescriptor::attributes`] to get the transfer type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDP_ADDR_DIR_IN: u8 = 1 << 7;
pub const ENDP_ADDR_NUM_MASK: u8 = 0x0F;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl fmt::Display for EndpointTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointTy::Ctrl => "control",
            EndpointTy::Isoch => "isochronous",
            EndpointTy::Bulk => "bulk",
            EndpointTy::Interrupt => "interrupt",
        })
    }
}

impl EndpointDescriptor {
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            3 => EndpointTy::Interrupt,
            _ => unreachable!(),
        }
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDP_ADDR_DIR_IN != 0
    }

    pub fn number(&self) -> u8 {
        self.address & ENDP_ADDR_NUM_MASK
    }
}
