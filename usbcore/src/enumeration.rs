//! Device enumeration.
//!
//! Bringing a freshly reset device up goes through a fixed sequence: read
//! the first 8 descriptor bytes to learn the default endpoint's packet
//! size, read the whole descriptor, assign an address, read strings and
//! configurations, then publish the device to the OS. Everything up to the
//! address assignment happens at address zero, so the controller's
//! enumeration lock serializes the whole sequence per bus.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::device::Device;
use crate::error::{Result, UsbError};
use crate::host::{HostController, OsDeviceId, OsDeviceInfo};
use crate::hub::Hub;
use crate::trace::{class_id, trace_enabled, TraceFlags};
use crate::usb::{
    class, decode_languages, DescriptorKind, DeviceDescriptor, DeviceDescriptor8Byte, DeviceSpeed,
    Setup, LANGUAGE_ENGLISH_US,
};

/// How many times a descriptor read is retried before the device is given
/// up on. Devices coming out of reset routinely miss the first requests.
const ENUMERATION_TRIES: u32 = 5;
const ENUMERATION_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Recovery time after SET_ADDRESS (USB 2.0 section 9.2.6.3).
const SET_ADDRESS_SETTLE: Duration = Duration::from_millis(2);

/// Creates the virtual device for a controller's integrated hub and starts
/// the hub engine on it. The root hub never sees control transfers; its hub
/// operations route to the controller.
pub(crate) fn enumerate_root_hub(controller: &Arc<HostController>) -> Result<()> {
    let device = Device::new(controller, None, 0, controller.speed())?;
    device.mark_hub();
    {
        let mut ids = device.ids_mut();
        ids.class = class::HUB;
        ids.product_name = Some(String::from("USB Root Hub"));
    }

    let core = controller.core().ok_or(UsbError::Host("core is gone"))?;
    let os_device = core.bus().create_device(&OsDeviceInfo {
        device_id: String::from("USB\\RootHub"),
        class_id: Some(String::from("Hub")),
        parent: None,
    })?;
    device.set_os_device(os_device);
    core.register_token(os_device, &device, None);

    controller.set_root_device(device.clone());
    let hub = Hub::new_root(controller, &device)?;
    hub.start()?;
    controller.set_root_hub(hub);
    info!("usb: controller {} root hub online", controller.id());
    Ok(())
}

/// Enumerates the device behind a freshly reset hub port. The caller holds
/// the parent's child lock and links the returned device in itself.
pub(crate) fn enumerate_device(
    controller: &Arc<HostController>,
    hub: &Hub,
    port: u8,
    speed: DeviceSpeed,
) -> Result<Arc<Device>> {
    let _enumeration = controller.lock_enumeration();

    let parent = hub.device().clone();
    let device = Device::new(controller, Some(&parent), port, speed)?;
    match enumerate_inner(controller, hub, port, &device) {
        Ok(()) => Ok(device),
        Err(err) => {
            remove_device(&device);
            Err(err)
        }
    }
}

fn enumerate_inner(
    controller: &Arc<HostController>,
    hub: &Hub,
    port: u8,
    device: &Arc<Device>,
) -> Result<()> {
    read_initial_descriptor(hub, port, device)?;
    // The prefix read may have ended in a stall on devices with an 8 byte
    // default endpoint. A fresh reset puts the device back in a known state
    // before the full descriptor read.
    hub.reset_port(port)?;
    let descriptor = read_full_descriptor(device)?;
    assign_address(controller, device)?;

    if descriptor.class == class::HUB {
        device.mark_hub();
    }
    device.set_configuration_count(descriptor.configurations);
    if let Err(err) = read_device_strings(device, &descriptor) {
        // Strings are nice to have, a device without them still works.
        debug!("usb: string read failed: {}", err);
    }
    read_configurations(device)?;

    if let Some(handoff) = controller.handoff() {
        // Address allocation only hands the reserved address to the device
        // sitting on the handoff's port path, so the address identifies the
        // debug device.
        if device.address() == handoff.address {
            let ids = device.ids();
            if ids.vendor != handoff.vendor || ids.product != handoff.product {
                warn!(
                    "usb: device at the debug handoff spot is {:04X}:{:04X}, expected {:04X}:{:04X}",
                    ids.vendor, ids.product, handoff.vendor, handoff.product
                );
            }
            // The debugger already owns this device. Restore the
            // configuration it expects and keep it away from the OS.
            device.set_configuration(handoff.configuration_value)?;
            if trace_enabled(TraceFlags::HANDOFF, device.address()) {
                debug!(
                    "usb: debug device restored to configuration {}",
                    handoff.configuration_value
                );
            }
            info!(
                "usb: restored debug device {:04X}:{:04X} at address {}",
                ids.vendor,
                ids.product,
                device.address()
            );
            return Ok(());
        }
    }

    resolve_device_class(device)?;
    publish_os_device(device)?;

    if device.is_hub() {
        let hub = Hub::attach(device)?;
        hub.start()?;
    }

    let ids = device.ids();
    info!(
        "usb: enumerated {:04x}:{:04x} at address {}, port {}, {:?}",
        ids.vendor,
        ids.product,
        device.address(),
        port,
        device.speed()
    );
    Ok(())
}

/// Reads the 8 byte descriptor prefix to learn the real max packet size of
/// the default endpoint, resetting the port again between failed tries.
fn read_initial_descriptor(hub: &Hub, port: u8, device: &Arc<Device>) -> Result<()> {
    let mut last = UsbError::DeviceNotConnected;
    for attempt in 0..ENUMERATION_TRIES {
        if attempt != 0 {
            thread::sleep(ENUMERATION_RETRY_DELAY);
            if let Err(err) = hub.reset_port(port) {
                last = err;
                continue;
            }
        }
        let size = core::mem::size_of::<DeviceDescriptor8Byte>();
        match device.read_descriptor(DescriptorKind::Device, 0, 0, size as u16) {
            Ok(raw) if raw.len() == size => {
                let prefix = match plain::from_bytes::<DeviceDescriptor8Byte>(&raw) {
                    Ok(prefix) => *prefix,
                    Err(_) => {
                        last = UsbError::DataLengthMismatch;
                        continue;
                    }
                };
                device.update_default_max_packet_size(prefix.packet_size as u32)?;
                return Ok(());
            }
            Ok(_) => last = UsbError::DataLengthMismatch,
            Err(err) => last = err,
        }
        if trace_enabled(TraceFlags::ENUMERATION, device.address()) {
            debug!("usb: initial descriptor read {} failed: {}", attempt, last);
        }
    }
    Err(UsbError::EnumerationFailed {
        tries: ENUMERATION_TRIES,
        source: Box::new(last),
    })
}

fn read_full_descriptor(device: &Arc<Device>) -> Result<DeviceDescriptor> {
    let size = core::mem::size_of::<DeviceDescriptor>();
    let mut last = UsbError::DeviceNotConnected;
    for attempt in 0..ENUMERATION_TRIES {
        if attempt != 0 {
            thread::sleep(ENUMERATION_RETRY_DELAY);
        }
        match device.read_descriptor(DescriptorKind::Device, 0, 0, size as u16) {
            Ok(raw) if raw.len() == size => {
                let descriptor = *plain::from_bytes::<DeviceDescriptor>(&raw)
                    .map_err(|_| UsbError::DataLengthMismatch)?;
                device.update_default_max_packet_size(descriptor.packet_size as u32)?;
                let mut ids = device.ids_mut();
                ids.vendor = { descriptor.vendor };
                ids.product = { descriptor.product };
                ids.usb = { descriptor.usb };
                ids.release = { descriptor.release };
                ids.class = descriptor.class;
                ids.sub_class = descriptor.sub_class;
                ids.protocol = descriptor.protocol;
                return Ok(descriptor);
            }
            Ok(_) => last = UsbError::DataLengthMismatch,
            Err(err) => last = err,
        }
    }
    Err(UsbError::EnumerationFailed {
        tries: ENUMERATION_TRIES,
        source: Box::new(last),
    })
}

/// Picks a free bus address and moves the device off address zero.
fn assign_address(controller: &Arc<HostController>, device: &Arc<Device>) -> Result<()> {
    let address = controller.allocate_address(device)?;
    // The request goes out while the device still answers at address zero.
    let result = device.send_control(Setup::set_address(address), None);
    if let Err(err) = result {
        controller.release_address(address);
        return Err(err);
    }
    device.set_address(address);
    thread::sleep(SET_ADDRESS_SETTLE);
    Ok(())
}

/// Reads the manufacturer, product and serial number strings. Nothing is
/// read unless the device advertises US English.
fn read_device_strings(device: &Arc<Device>, descriptor: &DeviceDescriptor) -> Result<()> {
    if descriptor.manufacturer_str == 0
        && descriptor.product_str == 0
        && descriptor.serial_str == 0
    {
        return Ok(());
    }

    let raw = device.read_descriptor(
        DescriptorKind::String,
        0,
        0,
        crate::usb::STRING_DESCRIPTOR_MAX_SIZE as u16,
    )?;
    let languages = decode_languages(&raw);
    if !languages.contains(&LANGUAGE_ENGLISH_US) {
        return Ok(());
    }

    let mut read = |index: u8| -> Option<String> {
        if index == 0 {
            return None;
        }
        device.read_string(index, LANGUAGE_ENGLISH_US).ok()
    };
    let manufacturer = read(descriptor.manufacturer_str);
    let product_name = read(descriptor.product_str);
    let serial_number = read(descriptor.serial_str);

    let mut ids = device.ids_mut();
    ids.manufacturer = manufacturer;
    ids.product_name = product_name;
    ids.serial_number = serial_number;
    Ok(())
}

fn read_configurations(device: &Arc<Device>) -> Result<()> {
    let mut last = UsbError::InvalidConfiguration;
    for attempt in 0..ENUMERATION_TRIES {
        if attempt != 0 {
            thread::sleep(ENUMERATION_RETRY_DELAY);
        }
        match device.configuration(0) {
            Ok(_) => return Ok(()),
            Err(err) => last = err,
        }
    }
    Err(UsbError::EnumerationFailed {
        tries: ENUMERATION_TRIES,
        source: Box::new(last),
    })
}

/// Devices that defer their class to a sole interface get that interface's
/// class triple promoted to the device.
fn resolve_device_class(device: &Arc<Device>) -> Result<()> {
    if device.ids().class != class::USE_INTERFACE {
        return Ok(());
    }
    let conf = device.configuration(0)?;
    if conf.interfaces.len() != 1 {
        return Ok(());
    }
    let interface = &conf.interfaces[0];
    let mut ids = device.ids_mut();
    ids.class = interface.class;
    ids.sub_class = interface.sub_class;
    ids.protocol = interface.protocol;
    Ok(())
}

fn publish_os_device(device: &Arc<Device>) -> Result<()> {
    let controller = device.controller();
    let core = controller.core().ok_or(UsbError::Host("core is gone"))?;
    let ids = device.ids();

    let info = OsDeviceInfo {
        device_id: format!("USB\\VID_{:04X}&PID_{:04X}", ids.vendor, ids.product),
        class_id: class_id(ids.class, ids.sub_class, ids.protocol).map(String::from),
        parent: device.parent().and_then(|p| p.os_device()),
    };
    let os_device = core.bus().create_device(&info)?;
    device.set_os_device(os_device);
    core.register_token(os_device, device, None);
    Ok(())
}

/// Publishes a separate OS device for one interface of a compound device.
/// The new device is parented by the USB device itself and the interface is
/// claimed on behalf of the driver that will bind to it.
pub fn enumerate_interface(device: &Arc<Device>, interface: u8) -> Result<OsDeviceId> {
    let claimed = device.claim_interface(interface)?;
    let controller = device.controller();
    let core = controller.core().ok_or(UsbError::Host("core is gone"))?;
    let ids = device.ids();

    let info = OsDeviceInfo {
        device_id: format!(
            "USB\\VID_{:04X}&PID_{:04X}_{:02X}",
            ids.vendor, ids.product, interface
        ),
        class_id: class_id(claimed.class, claimed.sub_class, claimed.protocol).map(String::from),
        parent: device.os_device(),
    };
    let os_device = core.bus().create_device(&info)?;
    device.record_interface_device(interface, os_device);
    core.register_token(os_device, device, Some(interface));
    Ok(os_device)
}

/// Tears a device and its whole subtree down: children first, then
/// outstanding transfers, the bus address, and the OS device.
pub(crate) fn remove_device(device: &Arc<Device>) {
    if let Some(hub) = device.hub_engine() {
        hub.detach();
    }

    let children: Vec<Arc<Device>> = std::mem::take(&mut *device.lock_children());
    for child in &children {
        remove_device(child);
    }

    device.disconnect();

    let address = device.address();
    if address != 0 {
        device.controller().release_address(address);
    }

    if let Some(core) = device.controller().core() {
        for (_, os_device) in device.interface_devices() {
            core.forget_token(os_device);
            core.bus().remove_device(os_device);
        }
        if let Some(os_device) = device.os_device() {
            core.forget_token(os_device);
            core.bus().remove_device(os_device);
        }
    }
    debug!("usb: removed device at address {}", address);
}
