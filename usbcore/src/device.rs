//! The device model.
//!
//! Devices form a tree rooted at each controller's root hub. A device owns
//! its default control endpoint from creation to destruction, grows data
//! endpoints when a class driver claims an interface, and keeps weak
//! references to every transfer allocated against it so removal can cancel
//! them all.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, warn};

use smallvec::SmallVec;

use crate::desc::{ConfDesc, DevDesc, EndpDirection, IfDesc};
use crate::error::{Result, UsbError};
use crate::host::{EndpointConfig, EndpointHandle, HostController, OsDeviceId};
use crate::transfer::{Transfer, TransferFlags, SETUP_SIZE};
use crate::usb::{
    decode_string, feature, DescriptorKind, DeviceSpeed, EndpointTy, ReqRecipient, Setup,
};

/// Largest string descriptor, and the size of the speculative first read of
/// a configuration descriptor.
pub const INITIAL_CONFIGURATION_LENGTH: u16 = 0xFF;

pub struct Endpoint {
    address: u8,
    ty: EndpointTy,
    direction: EndpDirection,
    max_packet_size: AtomicU32,
    poll_rate: u32,
    /// Interface this endpoint belongs to, `None` for the default endpoint.
    interface: Option<u8>,
    handle: EndpointHandle,
    controller: Weak<HostController>,
}

impl Endpoint {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn ty(&self) -> EndpointTy {
        self.ty
    }

    pub fn direction(&self) -> EndpDirection {
        self.direction
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size.load(Ordering::Acquire)
    }

    pub fn poll_rate(&self) -> u32 {
        self.poll_rate
    }

    pub(crate) fn handle(&self) -> &EndpointHandle {
        &self.handle
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.ops().destroy_endpoint(&self.handle);
        }
    }
}

/// Identity read out of the device descriptor, plus any strings.
#[derive(Clone, Default)]
pub struct DeviceIds {
    pub vendor: u16,
    pub product: u16,
    /// bcdUSB out of the device descriptor.
    pub usb: u16,
    /// bcdDevice out of the device descriptor.
    pub release: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
}

pub(crate) struct DeviceState {
    connected: bool,
    transfers: Vec<Weak<Transfer>>,
}

struct ConfigState {
    cached: Vec<ConfDesc>,
    active_value: Option<u8>,
}

pub struct Device {
    weak_self: Weak<Device>,
    controller: Arc<HostController>,
    parent: Weak<Device>,
    /// One based port number on the parent hub, zero for a root hub.
    port: u8,
    depth: u8,
    speed: DeviceSpeed,
    address: AtomicU8,
    hub: AtomicBool,
    configuration_count: AtomicU8,
    endpoint_zero: Arc<Endpoint>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    state: Mutex<DeviceState>,
    children: Mutex<Vec<Arc<Device>>>,
    config: Mutex<ConfigState>,
    ids: Mutex<DeviceIds>,
    os_device: Mutex<Option<OsDeviceId>>,
    /// OS devices reported for individual interfaces of a composite device.
    interface_devices: Mutex<Vec<(u8, OsDeviceId)>>,
    /// Present on hub devices once the hub engine has attached. Cleared on
    /// removal to break the reference cycle with the engine.
    hub_engine: Mutex<Option<Arc<crate::hub::Hub>>>,
}

impl Device {
    /// Creates a device answering at the default address. The default
    /// endpoint starts out with the smallest legal max packet size until
    /// the first descriptor read reveals the real one.
    pub(crate) fn new(
        controller: &Arc<HostController>,
        parent: Option<&Arc<Device>>,
        port: u8,
        speed: DeviceSpeed,
    ) -> Result<Arc<Device>> {
        let (hub_address, hub_port) = split_transaction_info(parent, port, speed);
        let endpoint_zero = create_endpoint_raw(
            controller,
            &EndpointConfig {
                number: 0,
                ty: EndpointTy::Ctrl,
                direction: EndpDirection::Bidirectional,
                max_packet_size: 8,
                poll_rate: 0,
                speed,
                hub_address,
                hub_port,
            },
            0,
            None,
        )?;

        Ok(Arc::new_cyclic(|weak| Device {
            weak_self: weak.clone(),
            controller: controller.clone(),
            parent: parent.map_or_else(Weak::new, Arc::downgrade),
            port,
            depth: parent.map_or(0, |p| p.depth + 1),
            speed,
            address: AtomicU8::new(0),
            hub: AtomicBool::new(false),
            configuration_count: AtomicU8::new(0),
            endpoint_zero,
            endpoints: Mutex::new(Vec::new()),
            state: Mutex::new(DeviceState {
                connected: true,
                transfers: Vec::new(),
            }),
            children: Mutex::new(Vec::new()),
            config: Mutex::new(ConfigState {
                cached: Vec::new(),
                active_value: None,
            }),
            ids: Mutex::new(DeviceIds::default()),
            os_device: Mutex::new(None),
            interface_devices: Mutex::new(Vec::new()),
            hub_engine: Mutex::new(None),
        }))
    }

    pub fn controller(&self) -> &Arc<HostController> {
        &self.controller
    }

    pub fn parent(&self) -> Option<Arc<Device>> {
        self.parent.upgrade()
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn address(&self) -> u8 {
        self.address.load(Ordering::Acquire)
    }

    pub(crate) fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::Release);
    }

    pub fn is_hub(&self) -> bool {
        self.hub.load(Ordering::Acquire)
    }

    pub(crate) fn mark_hub(&self) {
        self.hub.store(true, Ordering::Release);
    }

    pub fn configuration_count(&self) -> u8 {
        self.configuration_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_configuration_count(&self, count: u8) {
        self.configuration_count.store(count, Ordering::Release);
    }

    pub fn ids(&self) -> DeviceIds {
        self.ids.lock().unwrap().clone()
    }

    pub(crate) fn ids_mut(&self) -> MutexGuard<'_, DeviceIds> {
        self.ids.lock().unwrap()
    }

    pub fn hub_engine(&self) -> Option<Arc<crate::hub::Hub>> {
        self.hub_engine.lock().unwrap().clone()
    }

    pub(crate) fn set_hub_engine(&self, hub: Arc<crate::hub::Hub>) {
        *self.hub_engine.lock().unwrap() = Some(hub);
    }

    pub(crate) fn clear_hub_engine(&self) {
        *self.hub_engine.lock().unwrap() = None;
    }

    pub fn os_device(&self) -> Option<OsDeviceId> {
        *self.os_device.lock().unwrap()
    }

    pub(crate) fn set_os_device(&self, id: OsDeviceId) {
        *self.os_device.lock().unwrap() = Some(id);
    }

    pub(crate) fn record_interface_device(&self, interface: u8, id: OsDeviceId) {
        self.interface_devices.lock().unwrap().push((interface, id));
    }

    pub(crate) fn interface_devices(&self) -> Vec<(u8, OsDeviceId)> {
        self.interface_devices.lock().unwrap().clone()
    }

    /// Port numbers from the root port down to this device, one entry per
    /// hub leg. Empty for a root hub.
    pub fn port_path(&self) -> Vec<u8> {
        let mut path = Vec::new();
        let mut device = self.weak_self.upgrade();
        while let Some(current) = device {
            if current.port != 0 {
                path.push(current.port);
            }
            device = current.parent();
        }
        path.reverse();
        path
    }

    /// Whether this device's controller can run transfers to completion by
    /// polling, with interrupts effectively off.
    pub fn is_polled_io_supported(&self) -> bool {
        self.controller
            .capabilities()
            .contains(crate::host::HostCapabilities::POLLED_SUBMIT)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Locks device state and fails if the device is gone. Submission holds
    /// this guard across the handoff to the controller.
    pub(crate) fn connected_guard(&self) -> Result<MutexGuard<'_, DeviceState>> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(UsbError::DeviceNotConnected);
        }
        Ok(state)
    }

    /// Child list guard. Hub port processing and enumeration both hold this
    /// while they rearrange a hub's children.
    pub(crate) fn lock_children(&self) -> MutexGuard<'_, Vec<Arc<Device>>> {
        self.children.lock().unwrap()
    }

    /// Snapshot of the devices currently attached below this one.
    pub fn children(&self) -> Vec<Arc<Device>> {
        self.children.lock().unwrap().clone()
    }

    pub fn endpoint_zero(&self) -> &Arc<Endpoint> {
        &self.endpoint_zero
    }

    /// Looks up an endpoint by its descriptor address. Zero selects the
    /// default endpoint.
    pub fn endpoint(&self, address: u8) -> Result<Arc<Endpoint>> {
        if address == 0 {
            return Ok(self.endpoint_zero.clone());
        }
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.address == address)
            .cloned()
            .ok_or(UsbError::InvalidParameter)
    }

    /// Pushes the default endpoint's true max packet size down to the
    /// controller once the first descriptor read reveals it.
    pub(crate) fn update_default_max_packet_size(&self, max_packet_size: u32) -> Result<()> {
        if self.endpoint_zero.max_packet_size() == max_packet_size {
            return Ok(());
        }
        self.endpoint_zero
            .max_packet_size
            .store(max_packet_size, Ordering::Release);
        self.controller
            .ops()
            .reset_endpoint(self.endpoint_zero.handle(), max_packet_size)
    }

    pub(crate) fn link_transfer(&self, transfer: &Arc<Transfer>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(UsbError::DeviceNotConnected);
        }
        state.transfers.push(Arc::downgrade(transfer));
        Ok(())
    }

    pub(crate) fn prune_transfers(&self) {
        self.state
            .lock()
            .unwrap()
            .transfers
            .retain(|t| t.strong_count() != 0);
    }

    /// Marks the device disconnected and cancels every outstanding transfer,
    /// waiting for each to retire. New submissions fail from the moment the
    /// state lock is released.
    pub(crate) fn disconnect(&self) {
        let transfers: Vec<Arc<Transfer>> = {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.transfers.iter().filter_map(Weak::upgrade).collect()
        };
        for transfer in &transfers {
            match transfer.cancel_sync() {
                Ok(()) | Err(UsbError::TooEarly) => {}
                Err(err) => warn!("usb: cancel on disconnect failed: {}", err),
            }
        }
    }

    /// Sends a control transfer on the default endpoint and returns the data
    /// stage bytes, which for an OUT request is empty.
    pub fn send_control(&self, setup: Setup, out: Option<&[u8]>) -> Result<Vec<u8>> {
        let this = self
            .weak_self
            .upgrade()
            .ok_or(UsbError::DeviceNotConnected)?;
        let length = { setup.length } as usize;
        let transfer = Transfer::allocate(&this, 0, length, TransferFlags::empty())?;
        transfer.fill_control(setup, out)?;
        let transferred = transfer.submit_sync()?;
        let data_len = transferred.saturating_sub(SETUP_SIZE).min(length);
        let buffer = transfer.buffer();
        Ok(buffer[SETUP_SIZE..SETUP_SIZE + data_len].to_vec())
    }

    /// GET_STATUS for the given recipient. The status word is mandatory, a
    /// short response is an error.
    pub fn get_status(&self, recipient: ReqRecipient, index: u16) -> Result<u16> {
        let data = self.send_control(Setup::get_status(recipient, index), None)?;
        if data.len() < 2 {
            return Err(UsbError::DataLengthMismatch);
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn set_feature(
        &self,
        recipient: ReqRecipient,
        feature: u16,
        index: u16,
    ) -> Result<()> {
        check_feature(recipient, feature)?;
        self.send_control(Setup::set_feature(recipient, feature, index), None)?;
        Ok(())
    }

    /// CLEAR_FEATURE. Clearing an endpoint halt also resets the endpoint in
    /// the controller so its data toggle starts over.
    pub fn clear_feature(
        &self,
        recipient: ReqRecipient,
        feature: u16,
        index: u16,
    ) -> Result<()> {
        check_feature(recipient, feature)?;
        self.send_control(Setup::clear_feature(recipient, feature, index), None)?;
        if recipient == ReqRecipient::Endpoint && feature == feature::ENDPOINT_HALT {
            let endpoint = self.endpoint(index as u8)?;
            self.controller
                .ops()
                .reset_endpoint(endpoint.handle(), endpoint.max_packet_size())?;
        }
        Ok(())
    }

    pub fn read_descriptor(
        &self,
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        self.send_control(Setup::get_descriptor(kind, index, language, length), None)
    }

    /// Reads and decodes one string descriptor. The header is read first so
    /// the full request asks for exactly as many bytes as the descriptor
    /// holds; some devices stall when asked for more.
    pub fn read_string(&self, index: u8, language: u16) -> Result<String> {
        let head = self.read_descriptor(DescriptorKind::String, index, language, 4)?;
        let length = *head.first().ok_or(UsbError::DataLengthMismatch)? as usize;
        if length < 2 {
            return Err(UsbError::DataLengthMismatch);
        }
        let raw = if length <= head.len() {
            head
        } else {
            self.read_descriptor(DescriptorKind::String, index, language, length as u16)?
        };
        decode_string(&raw).ok_or(UsbError::DataLengthMismatch)
    }

    /// Returns the parsed configuration at `index`, fetching and caching it
    /// on first use.
    pub fn configuration(&self, index: u8) -> Result<ConfDesc> {
        let mut config = self.config.lock().unwrap();
        if let Some(found) = config.cached.iter().find(|c| c.index == index) {
            return Ok(found.clone());
        }

        // The first read guesses a length that covers most configurations
        // outright. Only a bigger total length forces a second round trip.
        let mut raw = self.read_descriptor(
            DescriptorKind::Configuration,
            index,
            0,
            INITIAL_CONFIGURATION_LENGTH,
        )?;
        if raw.len() < core::mem::size_of::<crate::usb::ConfigDescriptor>() {
            return Err(UsbError::InvalidConfiguration);
        }
        let total_length = u16::from_le_bytes([raw[2], raw[3]]);
        if total_length as usize > raw.len() {
            raw = self.read_descriptor(DescriptorKind::Configuration, index, 0, total_length)?;
            if raw.len() < total_length as usize {
                return Err(UsbError::DataLengthMismatch);
            }
        }

        let parsed = ConfDesc::parse(index, &raw)?;
        config.cached.push(parsed.clone());
        Ok(parsed)
    }

    /// Finds the configuration with the given bConfigurationValue, fetching
    /// by index until it turns up.
    pub fn configuration_by_value(&self, value: u8) -> Result<ConfDesc> {
        for index in 0..self.configuration_count() {
            let conf = self.configuration(index)?;
            if conf.configuration_value == value {
                return Ok(conf);
            }
        }
        Err(UsbError::InvalidConfiguration)
    }

    /// Selects a configuration by bConfigurationValue. Zero deconfigures the
    /// device. SET_CONFIGURATION clears every data toggle on the device, so
    /// the controller side of each endpoint is reset to match.
    pub fn set_configuration(&self, value: u8) -> Result<()> {
        self.send_control(Setup::set_configuration(value), None)?;
        self.config.lock().unwrap().active_value = if value == 0 { None } else { Some(value) };
        self.controller.ops().reset_endpoint(
            self.endpoint_zero.handle(),
            self.endpoint_zero.max_packet_size(),
        )?;
        for endpoint in self.endpoints.lock().unwrap().iter() {
            self.controller
                .ops()
                .reset_endpoint(endpoint.handle(), endpoint.max_packet_size())?;
        }
        Ok(())
    }

    pub fn active_configuration(&self) -> Option<u8> {
        self.config.lock().unwrap().active_value
    }

    /// Selects an alternate setting on an interface. The alternate may change
    /// endpoint characteristics, so the interface's endpoints are reset.
    pub fn set_interface(&self, number: u8, alternate_setting: u8) -> Result<()> {
        self.send_control(Setup::set_interface(number, alternate_setting), None)?;
        for endpoint in self.endpoints.lock().unwrap().iter() {
            if endpoint.interface == Some(number) {
                self.controller
                    .ops()
                    .reset_endpoint(endpoint.handle(), endpoint.max_packet_size())?;
            }
        }
        Ok(())
    }

    /// Summary of the device for class drivers: identity, strings and every
    /// configuration, fetched and cached as needed.
    pub fn description(&self) -> Result<DevDesc> {
        let ids = self.ids();
        let mut config_descs = SmallVec::new();
        for index in 0..self.configuration_count() {
            config_descs.push(self.configuration(index)?);
        }
        Ok(DevDesc {
            usb: ids.usb,
            class: ids.class,
            sub_class: ids.sub_class,
            protocol: ids.protocol,
            packet_size: self.endpoint_zero.max_packet_size() as u8,
            vendor: ids.vendor,
            product: ids.product,
            release: ids.release,
            manufacturer: ids.manufacturer,
            product_name: ids.product_name,
            serial_number: ids.serial_number,
            config_descs,
        })
    }

    /// Claims an interface of the active configuration for a class driver,
    /// creating controller endpoints for each of its endpoint descriptors.
    /// Claiming an already claimed interface is a no-op.
    pub fn claim_interface(&self, number: u8) -> Result<IfDesc> {
        let value = self
            .active_configuration()
            .ok_or(UsbError::InvalidConfiguration)?;
        let conf = self.configuration_by_value(value)?;
        let interface = conf
            .interfaces
            .iter()
            .find(|i| i.number == number)
            .ok_or(UsbError::InvalidParameter)?
            .clone();

        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.iter().any(|e| e.interface == Some(number)) {
            return Ok(interface);
        }

        let (hub_address, hub_port) =
            split_transaction_info(self.parent().as_ref(), self.port, self.speed);
        let mut created = Vec::with_capacity(interface.endpoints.len());
        for desc in &interface.endpoints {
            let ty = desc.ty();
            let poll_rate = decode_poll_rate(self.speed, ty, desc.direction(), desc.interval);
            let endpoint = create_endpoint_raw(
                &self.controller,
                &EndpointConfig {
                    number: desc.number(),
                    ty,
                    direction: desc.direction(),
                    max_packet_size: desc.max_packet_size as u32,
                    poll_rate,
                    speed: self.speed,
                    hub_address,
                    hub_port,
                },
                desc.address,
                Some(number),
            )?;
            created.push(endpoint);
        }
        // Dropping `created` on an earlier error already unwound the
        // controller state through Endpoint::drop.
        endpoints.extend(created);
        debug!(
            "usb: device {} claimed interface {}",
            self.address(),
            number
        );
        Ok(interface)
    }

    /// Releases a claimed interface and destroys its endpoints.
    pub fn release_interface(&self, number: u8) {
        self.endpoints
            .lock()
            .unwrap()
            .retain(|e| e.interface != Some(number));
    }
}

/// Converts a descriptor's bInterval into the poll rate the controller
/// schedules with. High speed interrupt and full/high speed isochronous
/// endpoints encode an exponent, giving `2^(bInterval - 1)` (micro)frames.
/// Low and full speed interrupt endpoints give a frame count directly. High
/// speed control and bulk OUT endpoints reuse the field as a NAK rate in
/// microframes. Everything else takes no bandwidth reservation.
fn decode_poll_rate(
    speed: DeviceSpeed,
    ty: EndpointTy,
    direction: EndpDirection,
    interval: u8,
) -> u32 {
    match ty {
        EndpointTy::Isoch if matches!(speed, DeviceSpeed::Full | DeviceSpeed::High) => {
            1 << (interval.clamp(1, 16) - 1)
        }
        EndpointTy::Interrupt => match speed {
            DeviceSpeed::Low | DeviceSpeed::Full => interval as u32,
            DeviceSpeed::High | DeviceSpeed::Super => 1 << (interval.clamp(1, 16) - 1),
        },
        EndpointTy::Ctrl if speed == DeviceSpeed::High => interval as u32,
        EndpointTy::Bulk
            if speed == DeviceSpeed::High && direction == EndpDirection::Out =>
        {
            interval as u32
        }
        _ => 0,
    }
}

/// Address and port of the translating hub for split transactions, when the
/// device runs at a lower speed than the bus above it.
fn split_transaction_info(
    parent: Option<&Arc<Device>>,
    port: u8,
    speed: DeviceSpeed,
) -> (u8, u8) {
    match parent {
        Some(parent)
            if matches!(speed, DeviceSpeed::Low | DeviceSpeed::Full)
                && parent.speed() == DeviceSpeed::High =>
        {
            (parent.address(), port)
        }
        _ => (0, 0),
    }
}

/// Only halt is a settable endpoint feature and only remote wakeup a
/// settable device feature; anything else is a malformed request.
fn check_feature(recipient: ReqRecipient, feature_selector: u16) -> Result<()> {
    let valid = match recipient {
        ReqRecipient::Endpoint => feature_selector == feature::ENDPOINT_HALT,
        ReqRecipient::Device => feature_selector == feature::DEVICE_REMOTE_WAKEUP,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(UsbError::InvalidParameter)
    }
}

fn create_endpoint_raw(
    controller: &Arc<HostController>,
    config: &EndpointConfig,
    address: u8,
    interface: Option<u8>,
) -> Result<Arc<Endpoint>> {
    let handle = controller.ops().create_endpoint(config)?;
    Ok(Arc::new(Endpoint {
        address,
        ty: config.ty,
        direction: config.direction,
        max_packet_size: AtomicU32::new(config.max_packet_size),
        poll_rate: config.poll_rate,
        interface,
        handle,
        controller: Arc::downgrade(controller),
    }))
}
