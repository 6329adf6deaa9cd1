//! Host controller registration and the controller object.
//!
//! A host controller driver implements [`HostControllerOps`] and registers it
//! with [`UsbCore::register_controller`]. The core owns everything above the
//! schedule: the device tree, addressing, hub handling, and completion
//! dispatch. The controller driver owns the schedule itself and reports
//! finished transfers back through
//! [`HostController::process_completed_transfer`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use log::{debug, warn};

use crate::desc::EndpDirection;
use crate::device::Device;
use crate::error::{Result, UsbError};
use crate::hub::Hub;
use crate::transfer::{Transfer, TransferCompletion};
use crate::usb::{DeviceSpeed, EndpointTy, HubPortStatus};
use crate::work::{CompletionQueue, HubWork, Workers};

/// Opaque per-endpoint state owned by the controller driver.
pub type EndpointHandle = Box<dyn Any + Send + Sync>;
/// Opaque per-transfer state owned by the controller driver.
pub type TransferHandle = Box<dyn Any + Send + Sync>;

bitflags! {
    pub struct HostCapabilities: u32 {
        /// The controller can submit and reap a transfer with interrupts off.
        const POLLED_SUBMIT = 1 << 0;
        /// The controller can flush an endpoint's completed but unreaped
        /// transfers, required before any polled submission.
        const FLUSH_ENDPOINT = 1 << 1;
    }
}

/// Everything a controller needs to schedule an endpoint.
pub struct EndpointConfig {
    pub number: u8,
    pub ty: EndpointTy,
    pub direction: EndpDirection,
    pub max_packet_size: u32,
    /// Service interval in (micro)frames, zero for asynchronous endpoints.
    pub poll_rate: u32,
    pub speed: DeviceSpeed,
    /// Address of the nearest high speed hub, for split transactions.
    pub hub_address: u8,
    pub hub_port: u8,
}

/// The interface a host controller driver provides to the core.
///
/// All methods may be called from multiple threads; implementations guard
/// their schedule internally. `submit_transfer` receives the transfer by
/// `Arc` and must keep a clone until it hands the transfer back through
/// [`HostController::process_completed_transfer`].
pub trait HostControllerOps: Send + Sync {
    fn create_endpoint(&self, config: &EndpointConfig) -> Result<EndpointHandle>;
    /// Re-reads the endpoint configuration, used after the real max packet
    /// size of a default endpoint becomes known and after a halt.
    fn reset_endpoint(&self, endpoint: &EndpointHandle, max_packet_size: u32) -> Result<()>;
    fn flush_endpoint(&self, _endpoint: &EndpointHandle) -> Result<()> {
        Err(UsbError::NotSupported)
    }
    fn destroy_endpoint(&self, endpoint: &EndpointHandle);

    fn create_transfer(&self, endpoint: &EndpointHandle, max_size: usize) -> Result<TransferHandle>;
    fn destroy_transfer(&self, endpoint: &EndpointHandle, transfer: &TransferHandle);
    fn submit_transfer(&self, endpoint: &EndpointHandle, transfer: &Arc<Transfer>) -> Result<()>;
    /// Runs a transfer to completion with polling instead of interrupts and
    /// returns its completion report directly.
    fn submit_polled_transfer(
        &self,
        _endpoint: &EndpointHandle,
        _transfer: &Arc<Transfer>,
    ) -> Result<TransferCompletion> {
        Err(UsbError::NotSupported)
    }
    /// Attempts to pull the transfer out of the schedule. Failure means the
    /// hardware already owns it and completion will arrive normally.
    fn cancel_transfer(&self, endpoint: &EndpointHandle, transfer: &Arc<Transfer>) -> Result<()>;

    fn root_hub_status(&self, status: &mut [HubPortStatus]) -> Result<()>;
    fn set_root_hub_status(&self, port: usize, status: HubPortStatus) -> Result<()>;
    fn port_count(&self) -> u8;
}

/// Version of [`HostControllerOps`] the core was built against. Controller
/// drivers pass the version they were compiled with to
/// [`UsbCore::register_controller`], which rejects anything older.
pub const HOST_INTERFACE_VERSION: u32 = 1;

/// A debug device the firmware or kernel debugger already configured. Its
/// addresses stay reserved and the core restores its configuration during
/// enumeration instead of creating an OS device for it.
#[derive(Clone, Debug)]
pub struct HandoffDevice {
    /// Port numbers from the root port down to the device, one per hub leg.
    pub port_path: Vec<u8>,
    pub address: u8,
    /// Address of the hub the device hangs off, zero when it sits directly
    /// on a root port. The hub's address is reserved too, so re-enumeration
    /// assigns the hub the address the debugger already programmed.
    pub hub_address: u8,
    pub configuration_value: u8,
    pub vendor: u16,
    pub product: u16,
}

const ADDRESS_SEGMENT_COUNT: usize = 8;
const ADDRESSES_PER_SEGMENT: usize = 16;

enum AddressSlot {
    Free,
    /// Held for a handoff device that has not been enumerated yet.
    Reserved,
    Claimed(Weak<Device>),
}

struct AddressState {
    /// Segments are allocated on first use and freed again when their last
    /// address goes. Most buses never leave the first one.
    segments: [Option<Box<[AddressSlot; ADDRESSES_PER_SEGMENT]>>; ADDRESS_SEGMENT_COUNT],
    full: bool,
}

impl AddressState {
    fn new() -> Self {
        AddressState {
            segments: Default::default(),
            full: false,
        }
    }

    fn indices(address: u8) -> Result<(usize, usize)> {
        let segment = address as usize / ADDRESSES_PER_SEGMENT;
        if address == 0 || segment >= ADDRESS_SEGMENT_COUNT {
            return Err(UsbError::InvalidParameter);
        }
        Ok((segment, address as usize % ADDRESSES_PER_SEGMENT))
    }

    fn reserve(&mut self, address: u8) -> Result<()> {
        let (segment, slot) = Self::indices(address)?;
        let seg = self.segments[segment].get_or_insert_with(new_segment);
        match seg[slot] {
            AddressSlot::Free => {
                seg[slot] = AddressSlot::Reserved;
                Ok(())
            }
            _ => Err(UsbError::AddressInUse(address)),
        }
    }

    /// Hands a reserved address to the device it was held for.
    fn claim_reserved(&mut self, address: u8, device: &Arc<Device>) -> bool {
        let Ok((segment, slot)) = Self::indices(address) else {
            return false;
        };
        let seg = self.segments[segment].get_or_insert_with(new_segment);
        if let AddressSlot::Reserved = seg[slot] {
            seg[slot] = AddressSlot::Claimed(Arc::downgrade(device));
            true
        } else {
            false
        }
    }

    fn claim_any(&mut self, device: &Arc<Device>) -> Result<u8> {
        for segment in 0..ADDRESS_SEGMENT_COUNT {
            let seg = self.segments[segment].get_or_insert_with(new_segment);
            for slot in 0..ADDRESSES_PER_SEGMENT {
                // Address zero is the default address, never assigned.
                if segment == 0 && slot == 0 {
                    continue;
                }
                if let AddressSlot::Free = seg[slot] {
                    seg[slot] = AddressSlot::Claimed(Arc::downgrade(device));
                    return Ok((segment * ADDRESSES_PER_SEGMENT + slot) as u8);
                }
            }
        }
        self.full = true;
        Err(UsbError::BusFull)
    }

    fn release(&mut self, address: u8) {
        let Ok((segment, slot)) = Self::indices(address) else {
            return;
        };
        if let Some(seg) = &mut self.segments[segment] {
            seg[slot] = AddressSlot::Free;
            self.full = false;
            if seg.iter().all(|s| matches!(s, AddressSlot::Free)) {
                self.segments[segment] = None;
            }
        }
    }

    #[cfg(test)]
    fn segment_allocated(&self, segment: usize) -> bool {
        self.segments[segment].is_some()
    }
}

fn new_segment() -> Box<[AddressSlot; ADDRESSES_PER_SEGMENT]> {
    Box::new([
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
        AddressSlot::Free,
    ])
}

static NEXT_CONTROLLER_ID: AtomicU32 = AtomicU32::new(0);

pub struct HostController {
    id: u32,
    weak_self: Weak<HostController>,
    ops: Arc<dyn HostControllerOps>,
    capabilities: HostCapabilities,
    speed: DeviceSpeed,
    handoff: Option<HandoffDevice>,
    core: Weak<UsbCore>,
    /// Serializes enumeration, since an unaddressed device answers at
    /// address zero.
    enumeration_lock: Mutex<()>,
    addresses: Mutex<AddressState>,
    root_device: Mutex<Option<Arc<Device>>>,
    root_hub: Mutex<Option<Arc<Hub>>>,
    queue: Arc<CompletionQueue>,
    /// One root-change work item in flight at a time; interrupts that fire
    /// while it is queued fold into the same pass.
    root_change_queued: AtomicBool,
}

impl HostController {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ops(&self) -> &Arc<dyn HostControllerOps> {
        &self.ops
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn handoff(&self) -> Option<&HandoffDevice> {
        self.handoff.as_ref()
    }

    pub fn core(&self) -> Option<Arc<UsbCore>> {
        self.core.upgrade()
    }

    pub fn root_device(&self) -> Option<Arc<Device>> {
        self.root_device.lock().unwrap().clone()
    }

    pub(crate) fn set_root_device(&self, device: Arc<Device>) {
        *self.root_device.lock().unwrap() = Some(device);
    }

    pub fn root_hub(&self) -> Option<Arc<Hub>> {
        self.root_hub.lock().unwrap().clone()
    }

    pub(crate) fn set_root_hub(&self, hub: Arc<Hub>) {
        *self.root_hub.lock().unwrap() = Some(hub);
    }

    pub(crate) fn lock_enumeration(&self) -> std::sync::MutexGuard<'_, ()> {
        self.enumeration_lock.lock().unwrap()
    }

    /// Marks an address as spoken for before any device claims it. Used for
    /// handoff devices whose addresses must survive until enumeration finds
    /// them.
    pub(crate) fn reserve_address(&self, address: u8) -> Result<()> {
        self.addresses.lock().unwrap().reserve(address)
    }

    /// Finds a free address and claims it for `device`. A device sitting
    /// where the handoff says, or a hub directly above that spot, gets the
    /// address the debugger already programmed into it.
    pub(crate) fn allocate_address(&self, device: &Arc<Device>) -> Result<u8> {
        let mut state = self.addresses.lock().unwrap();

        if let Some(handoff) = &self.handoff {
            let path = device.port_path();
            if path == handoff.port_path {
                if state.claim_reserved(handoff.address, device) {
                    return Ok(handoff.address);
                }
            } else if handoff.hub_address != 0
                && !handoff.port_path.is_empty()
                && path[..] == handoff.port_path[..handoff.port_path.len() - 1]
                && state.claim_reserved(handoff.hub_address, device)
            {
                return Ok(handoff.hub_address);
            }
        }

        state.claim_any(device).map_err(|err| {
            warn!("usb: controller {}: out of device addresses", self.id);
            err
        })
    }

    pub(crate) fn release_address(&self, address: u8) {
        self.addresses.lock().unwrap().release(address);
    }

    /// Entry point for controller drivers: hands a finished transfer back to
    /// the core. Runs in the controller's interrupt context, so the heavy
    /// lifting (callbacks, event signalling) happens on a worker thread.
    pub fn process_completed_transfer(&self, transfer: &Arc<Transfer>, completion: TransferCompletion) {
        transfer.record_completion(&completion);

        if transfer.is_paging() {
            if let Some(core) = self.core.upgrade() {
                if let Some(queue) = core.paging_queue() {
                    queue.push(transfer.clone());
                    return;
                }
            }
            warn!("usb: paging transfer completed without a paging queue");
        }
        self.queue.push(transfer.clone());
    }

    /// Called by the controller driver when its root hub interrupt fires.
    /// Port inspection happens on the hub worker.
    pub fn notify_root_hub_change(&self) {
        if self.root_change_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.workers()
                .queue_hub_work(HubWork::RootChange(self.weak_self.clone()));
        }
    }

    /// Rearms root-change notification. The hub worker calls this before it
    /// reads the port status so a change racing the read queues fresh work.
    pub(crate) fn rearm_root_change(&self) {
        self.root_change_queued.store(false, Ordering::Release);
    }
}

/// Identifier the OS bus layer returns for a published device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OsDeviceId(pub u64);

pub struct OsDeviceInfo {
    pub device_id: String,
    pub class_id: Option<String>,
    pub parent: Option<OsDeviceId>,
}

/// The services the core needs from the operating system's device layer.
pub trait OsBus: Send + Sync {
    fn create_device(&self, info: &OsDeviceInfo) -> Result<OsDeviceId>;
    fn remove_device(&self, id: OsDeviceId);
    /// Tells the OS that the children of `id` changed and should be
    /// re-queried.
    fn notify_topology_change(&self, id: OsDeviceId);
}

/// The core subsystem instance. Controller drivers register with it, the OS
/// bus layer queries it, and it owns the worker threads that drive transfer
/// completion and hub maintenance.
pub struct UsbCore {
    weak_self: Weak<UsbCore>,
    bus: Box<dyn OsBus>,
    controllers: Mutex<Vec<Arc<HostController>>>,
    workers: Workers,
    /// Devices looked up by the OS identifier they were published under.
    tokens: Mutex<HashMap<u64, TokenEntry>>,
    /// A dedicated completion path for transfers that service page-outs, so
    /// they never wait behind ordinary completions. Created once, first
    /// caller wins.
    paging_queue: Mutex<Option<Arc<CompletionQueue>>>,
}

struct TokenEntry {
    device: Weak<Device>,
    /// Set when the OS device stands for one interface of a composite
    /// device rather than the device itself.
    interface: Option<u8>,
}

impl UsbCore {
    pub fn new(bus: Box<dyn OsBus>) -> Arc<Self> {
        Arc::new_cyclic(|weak| UsbCore {
            weak_self: weak.clone(),
            bus,
            controllers: Mutex::new(Vec::new()),
            workers: Workers::start(),
            tokens: Mutex::new(HashMap::new()),
            paging_queue: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &dyn OsBus {
        &*self.bus
    }

    pub(crate) fn workers(&self) -> &Workers {
        &self.workers
    }

    /// Registers a controller with the core. The returned controller is
    /// inert until [`UsbCore::start_controller`] enumerates its root hub.
    /// `version` is the [`HOST_INTERFACE_VERSION`] the driver was built
    /// against.
    pub fn register_controller(
        &self,
        version: u32,
        ops: Arc<dyn HostControllerOps>,
        capabilities: HostCapabilities,
        speed: DeviceSpeed,
        handoff: Option<HandoffDevice>,
    ) -> Result<Arc<HostController>> {
        if version < HOST_INTERFACE_VERSION {
            return Err(UsbError::NotSupported);
        }
        // A root hub with no ports can never carry a device.
        if ops.port_count() == 0 {
            return Err(UsbError::InvalidParameter);
        }
        // Polled submission reuses endpoint state behind the schedule's
        // back, which only works if the endpoint can be flushed first.
        if capabilities.contains(HostCapabilities::POLLED_SUBMIT)
            && !capabilities.contains(HostCapabilities::FLUSH_ENDPOINT)
        {
            return Err(UsbError::InvalidParameter);
        }

        let controller = Arc::new_cyclic(|weak| HostController {
            id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
            weak_self: weak.clone(),
            ops,
            capabilities,
            speed,
            handoff,
            core: self.weak_self.clone(),
            enumeration_lock: Mutex::new(()),
            addresses: Mutex::new(AddressState::new()),
            root_device: Mutex::new(None),
            root_hub: Mutex::new(None),
            queue: Workers::start_completion_worker(),
            root_change_queued: AtomicBool::new(false),
        });

        if let Some(handoff) = &controller.handoff {
            controller.reserve_address(handoff.address)?;
            if handoff.hub_address != 0 {
                controller.reserve_address(handoff.hub_address)?;
            }
        }

        debug!("usb: registered controller {}", controller.id);
        self.controllers.lock().unwrap().push(controller.clone());
        Ok(controller)
    }

    /// Enumerates the controller's root hub and powers its ports, bringing
    /// the bus segment below it to life.
    pub fn start_controller(&self, controller: &Arc<HostController>) -> Result<()> {
        crate::enumeration::enumerate_root_hub(controller)
    }

    pub fn unregister_controller(&self, controller: &Arc<HostController>) {
        let mut controllers = self.controllers.lock().unwrap();
        controllers.retain(|c| !Arc::ptr_eq(c, controller));
        if let Some(root) = controller.root_device() {
            crate::enumeration::remove_device(&root);
        }
        debug!("usb: unregistered controller {}", controller.id);
    }

    /// Creates the paging completion queue if nobody has yet. Subsequent
    /// calls keep the existing queue.
    pub fn enable_paging_completions(&self) {
        let mut slot = self.paging_queue.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Workers::start_completion_worker());
        }
    }

    pub(crate) fn paging_queue(&self) -> Option<Arc<CompletionQueue>> {
        self.paging_queue.lock().unwrap().clone()
    }

    pub(crate) fn register_token(
        &self,
        id: OsDeviceId,
        device: &Arc<Device>,
        interface: Option<u8>,
    ) {
        self.tokens.lock().unwrap().insert(
            id.0,
            TokenEntry {
                device: Arc::downgrade(device),
                interface,
            },
        );
    }

    pub(crate) fn forget_token(&self, id: OsDeviceId) {
        self.tokens.lock().unwrap().remove(&id.0);
    }

    /// Resolves the OS identifier of a published device back to the device
    /// it stands for. Class drivers start here.
    pub fn device_for_token(&self, id: OsDeviceId) -> Option<Arc<Device>> {
        self.tokens
            .lock()
            .unwrap()
            .get(&id.0)
            .and_then(|entry| entry.device.upgrade())
    }

    /// The interface an OS device stands for, when it was published for one
    /// interface of a composite device. `None` for whole-device tokens.
    pub fn designated_interface(&self, id: OsDeviceId) -> Option<u8> {
        self.tokens
            .lock()
            .unwrap()
            .get(&id.0)
            .and_then(|entry| entry.interface)
    }

    /// Detaches a device on request, for instance when a class driver gives
    /// up on it. The subtree comes down exactly as on a physical unplug,
    /// and the freed addresses become available again.
    pub fn detach_device(&self, device: &Arc<Device>) {
        let parent = device.parent();
        if let Some(parent) = &parent {
            parent
                .lock_children()
                .retain(|child| !Arc::ptr_eq(child, device));
        }
        crate::enumeration::remove_device(device);
        if let Some(parent_os) = parent.and_then(|p| p.os_device()) {
            self.bus().notify_topology_change(parent_os);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_segments_are_freed() {
        let mut state = AddressState::new();
        state.reserve(17).unwrap();
        state.reserve(18).unwrap();
        assert!(state.segment_allocated(1));

        state.release(17);
        assert!(state.segment_allocated(1));
        state.release(18);
        assert!(!state.segment_allocated(1));

        // The segment comes back on demand.
        state.reserve(17).unwrap();
        assert!(state.segment_allocated(1));
    }

    #[test]
    fn double_reservation_is_rejected() {
        let mut state = AddressState::new();
        state.reserve(5).unwrap();
        assert!(matches!(
            state.reserve(5),
            Err(UsbError::AddressInUse(5))
        ));
        assert!(matches!(
            state.reserve(0),
            Err(UsbError::InvalidParameter)
        ));
    }
}
