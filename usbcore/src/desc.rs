//! Parsed descriptor trees.
//!
//! Class drivers never walk raw descriptor buffers; they get these owned,
//! serializable views instead. The parser here turns the single blob a
//! configuration read returns into the configuration/interface/endpoint
//! hierarchy, keeping unrecognized class descriptors (HID and friends)
//! attached to the interface they followed.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::UsbError;
use crate::usb::{
    ConfigDescriptor, DescriptorKind, EndpointDescriptor, EndpointTy, InterfaceDescriptor,
};

/// Summary of a fully enumerated device, as handed to class drivers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevDesc {
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub config_descs: SmallVec<[ConfDesc; 1]>,
}

/// One parsed configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfDesc {
    /// The zero-based index this configuration was requested at.
    pub index: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: SmallVec<[IfDesc; 1]>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IfDesc {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub endpoints: SmallVec<[EndpDesc; 4]>,
    /// Class specific descriptors that followed this interface in the blob.
    pub other: SmallVec<[UnknownDesc; 2]>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EndpDesc {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// A descriptor the core does not interpret, kept raw for class drivers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnknownDesc {
    pub kind: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpDirection {
    In,
    Out,
    Bidirectional,
}

impl std::fmt::Display for EndpDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EndpDirection::In => "IN",
            EndpDirection::Out => "OUT",
            EndpDirection::Bidirectional => "bidirectional",
        })
    }
}

impl EndpDesc {
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & crate::usb::ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            3 => EndpointTy::Interrupt,
            _ => unreachable!(),
        }
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn direction(&self) -> EndpDirection {
        if self.ty() == EndpointTy::Ctrl {
            EndpDirection::Bidirectional
        } else if self.address & 0x80 != 0 {
            EndpDirection::In
        } else {
            EndpDirection::Out
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.ty() == EndpointTy::Interrupt
    }
}

impl ConfDesc {
    /// Parses a complete configuration blob as returned by GET_DESCRIPTOR
    /// (configuration). `raw` must start at the configuration descriptor
    /// header and cover every transferred byte.
    pub fn parse(index: u8, raw: &[u8]) -> Result<Self, UsbError> {
        let header = plain::from_bytes::<ConfigDescriptor>(
            raw.get(..core::mem::size_of::<ConfigDescriptor>())
                .ok_or(UsbError::InvalidConfiguration)?,
        )
        .map_err(|_| UsbError::InvalidConfiguration)?;

        let mut conf = ConfDesc {
            index,
            configuration_value: header.configuration_value,
            attributes: header.attributes,
            max_power: header.max_power,
            interfaces: SmallVec::new(),
        };

        let mut offset = header.length as usize;
        while offset + 1 < raw.len() {
            let length = raw[offset] as usize;
            let kind = raw[offset + 1];
            if length < 2 || offset + length > raw.len() {
                return Err(UsbError::InvalidConfiguration);
            }
            let body = &raw[offset..offset + length];

            if kind == DescriptorKind::Interface as u8 {
                if length < core::mem::size_of::<InterfaceDescriptor>() {
                    return Err(UsbError::InvalidConfiguration);
                }
                let desc = plain::from_bytes::<InterfaceDescriptor>(
                    &body[..core::mem::size_of::<InterfaceDescriptor>()],
                )
                .map_err(|_| UsbError::InvalidConfiguration)?;
                conf.interfaces.push(IfDesc {
                    number: desc.number,
                    alternate_setting: desc.alternate_setting,
                    class: desc.class,
                    sub_class: desc.sub_class,
                    protocol: desc.protocol,
                    endpoints: SmallVec::new(),
                    other: SmallVec::new(),
                });
            } else if kind == DescriptorKind::Endpoint as u8 {
                if length < core::mem::size_of::<EndpointDescriptor>() {
                    return Err(UsbError::InvalidConfiguration);
                }
                let desc = plain::from_bytes::<EndpointDescriptor>(
                    &body[..core::mem::size_of::<EndpointDescriptor>()],
                )
                .map_err(|_| UsbError::InvalidConfiguration)?;
                // An endpoint with no preceding interface is illegal.
                let interface = conf
                    .interfaces
                    .last_mut()
                    .ok_or(UsbError::InvalidConfiguration)?;
                interface.endpoints.push(EndpDesc {
                    address: desc.address,
                    attributes: desc.attributes,
                    max_packet_size: desc.max_packet_size,
                    interval: desc.interval,
                });
            } else if let Some(interface) = conf.interfaces.last_mut() {
                // HID descriptors and other class material nestle in here.
                interface.other.push(UnknownDesc {
                    kind,
                    data: body[2..].to_vec(),
                });
            }

            offset += length;
        }

        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_header(total_length: u16, value: u8) -> Vec<u8> {
        vec![
            9,
            2,
            total_length as u8,
            (total_length >> 8) as u8,
            1,
            value,
            0,
            0xA0,
            50,
        ]
    }

    fn interface(number: u8, class: u8, endpoints: u8) -> Vec<u8> {
        vec![9, 4, number, 0, endpoints, class, 0, 0, 0]
    }

    fn endpoint(address: u8, attributes: u8) -> Vec<u8> {
        vec![7, 5, address, attributes, 0x40, 0x00, 10]
    }

    #[test]
    fn parses_interfaces_and_endpoints() {
        let mut raw = config_header(9 + 9 + 7 + 7, 1);
        raw.extend(interface(0, 9, 2));
        raw.extend(endpoint(0x81, 0x03));
        raw.extend(endpoint(0x02, 0x02));

        let conf = ConfDesc::parse(0, &raw).unwrap();
        assert_eq!(conf.configuration_value, 1);
        assert_eq!(conf.interfaces.len(), 1);
        let iface = &conf.interfaces[0];
        assert_eq!(iface.endpoints.len(), 2);
        assert_eq!(iface.endpoints[0].ty(), EndpointTy::Interrupt);
        assert_eq!(iface.endpoints[0].direction(), EndpDirection::In);
        assert_eq!(iface.endpoints[1].ty(), EndpointTy::Bulk);
        assert_eq!(iface.endpoints[1].direction(), EndpDirection::Out);
    }

    #[test]
    fn hid_descriptor_attaches_to_interface() {
        let mut raw = config_header(9 + 9 + 9 + 7, 1);
        raw.extend(interface(0, 3, 1));
        raw.extend(vec![9, 33, 0x11, 0x01, 0, 1, 34, 0x3F, 0]);
        raw.extend(endpoint(0x81, 0x03));

        let conf = ConfDesc::parse(0, &raw).unwrap();
        let iface = &conf.interfaces[0];
        assert_eq!(iface.other.len(), 1);
        assert_eq!(iface.other[0].kind, 33);
        assert_eq!(iface.endpoints.len(), 1);
    }

    #[test]
    fn endpoint_before_interface_is_rejected() {
        let mut raw = config_header(9 + 7, 1);
        raw.extend(endpoint(0x81, 0x03));
        assert!(matches!(
            ConfDesc::parse(0, &raw),
            Err(UsbError::InvalidConfiguration)
        ));
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let mut raw = config_header(9 + 9, 1);
        raw.extend(interface(0, 9, 0));
        raw.truncate(raw.len() - 3);
        assert!(ConfDesc::parse(0, &raw).is_err());
    }

    #[test]
    fn descriptions_serialize() {
        let mut raw = config_header(9 + 9, 1);
        raw.extend(interface(0, 9, 0));
        let conf = ConfDesc::parse(0, &raw).unwrap();
        let json = serde_json::to_string(&conf).unwrap();
        let back: ConfDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.configuration_value, 1);
    }
}
