//! The hub engine.
//!
//! Hubs are the only class the core drives itself. An attached hub keeps a
//! software copy of every port's status; the hardware bits are folded into
//! it whenever a port is queried, and the accumulated change bits steer
//! topology maintenance. Port work runs on the hub worker thread because it
//! issues synchronous control transfers, which need the completion worker
//! free to finish them.
//!
//! Lock order within a hub: the hub device's child lock, then the port
//! state lock. The controller's enumeration lock nests inside the child
//! lock via [`crate::enumeration::enumerate_device`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::Timeout;
use log::{debug, error, info, warn};

use crate::device::Device;
use crate::error::{Result, TransferError, UsbError};
use crate::host::{HostController, OsDeviceId};
use crate::trace::{trace_enabled, TraceFlags};
use crate::transfer::{Transfer, TransferFlags};
use crate::usb::{
    feature, DeviceSpeed, HubDescriptor, HubFeature, HubPortFeature, HubPortStatus,
    HubStatusChange, ReqRecipient, Setup, HUB_CHARACTERISTIC_INDICATORS,
    HUB_INDICATOR_AUTOMATIC, HUB_PORT_CHANGE_SHIFT,
};
use crate::work::HubWork;

/// Connection debounce interval (USB 2.0 section 7.1.7.3).
const DEBOUNCE: Duration = Duration::from_millis(100);
/// How long the reset signal is held on a port (TDRST).
const PORT_RESET_HOLD: Duration = Duration::from_millis(5);
/// Recovery interval after reset is released (TRSTRCY).
const PORT_RESET_RECOVERY: Duration = Duration::from_millis(25);
/// Extra settling time before the first request to a freshly reset port.
const POST_RESET_SETTLE: Duration = Duration::from_millis(20);
/// Upper bound on waiting for an over-current condition to drain.
const OVER_CURRENT_WAIT: Duration = Duration::from_secs(1);

/// Hub-level GET_STATUS words: wHubStatus in the low half, wHubChange in
/// the high half. The status and change words use the same bit positions.
const HUB_CHANGE_LOCAL_POWER: u32 =
    (HubStatusChange::LocalPower as u32) << HUB_PORT_CHANGE_SHIFT;
const HUB_CHANGE_OVER_CURRENT: u32 =
    (HubStatusChange::OverCurrent as u32) << HUB_PORT_CHANGE_SHIFT;
const HUB_STATUS_OVER_CURRENT: u32 = HubStatusChange::OverCurrent as u32;

const PORT_CHANGE_BITS: u32 = 0x1F << HUB_PORT_CHANGE_SHIFT;

struct PortState {
    status: HubPortStatus,
    speed: DeviceSpeed,
}

impl PortState {
    fn clear(&mut self) {
        self.status = HubPortStatus::empty();
        self.speed = DeviceSpeed::Full;
    }
}

pub struct Hub {
    weak_self: std::sync::Weak<Hub>,
    controller: Arc<HostController>,
    device: Arc<Device>,
    is_root: bool,
    port_count: u8,
    /// Power-on-to-power-good time in 2 ms units, from the hub descriptor.
    power_on_good: u8,
    has_indicators: bool,
    ports: Mutex<Vec<PortState>>,
    interrupt_transfer: Mutex<Option<Arc<Transfer>>>,
    interrupt_length: usize,
    /// Bitmap from the last status interrupt, bit 0 is the hub itself.
    changed: AtomicU32,
    /// The status endpoint stalled and needs recovery on the hub worker.
    stalled: AtomicBool,
}

fn empty_ports(count: u8) -> Vec<PortState> {
    (0..count)
        .map(|_| PortState {
            status: HubPortStatus::empty(),
            speed: DeviceSpeed::Full,
        })
        .collect()
}

impl Hub {
    /// Builds the engine for a controller's integrated hub. Root hubs have
    /// no descriptors and no status endpoint; everything routes to the
    /// controller.
    pub(crate) fn new_root(
        controller: &Arc<HostController>,
        device: &Arc<Device>,
    ) -> Result<Arc<Hub>> {
        let port_count = controller.ops().port_count();
        let hub = Arc::new_cyclic(|weak| Hub {
            weak_self: weak.clone(),
            controller: controller.clone(),
            device: device.clone(),
            is_root: true,
            port_count,
            power_on_good: 1,
            has_indicators: false,
            ports: Mutex::new(empty_ports(port_count)),
            interrupt_transfer: Mutex::new(None),
            interrupt_length: 0,
            changed: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
        });
        device.set_hub_engine(hub.clone());
        Ok(hub)
    }

    /// Configures an enumerated hub device and builds its engine: selects
    /// the first configuration, reads the hub descriptor, claims the sole
    /// interface and sets up the status change interrupt transfer.
    pub(crate) fn attach(device: &Arc<Device>) -> Result<Arc<Hub>> {
        let conf = device.configuration(0)?;
        device.set_configuration(conf.configuration_value)?;

        let raw = device.send_control(
            Setup::get_hub_descriptor(HubDescriptor::MAX_SIZE as u16),
            None,
        )?;
        let header = raw
            .get(..core::mem::size_of::<HubDescriptor>())
            .and_then(|slice| plain::from_bytes::<HubDescriptor>(slice).ok())
            .ok_or(UsbError::InvalidConfiguration)?;
        let port_count = header.ports;
        let power_on_good = header.power_on_good;
        let has_indicators = { header.characteristics } & HUB_CHARACTERISTIC_INDICATORS != 0;

        let interface = conf
            .interfaces
            .first()
            .ok_or(UsbError::InvalidConfiguration)?;
        let interface = device.claim_interface(interface.number)?;
        let status_endpoint = interface
            .endpoints
            .iter()
            .find(|e| e.is_interrupt() && e.address & 0x80 != 0)
            .ok_or(UsbError::InvalidConfiguration)?;

        // One bit per port plus one for the hub itself.
        let interrupt_length = (port_count as usize + 1 + 7) / 8;
        let transfer = Transfer::allocate(
            device,
            status_endpoint.address,
            interrupt_length,
            TransferFlags::empty(),
        )?;
        transfer.set_length(interrupt_length);

        let hub = Arc::new_cyclic(|weak| Hub {
            weak_self: weak.clone(),
            controller: device.controller().clone(),
            device: device.clone(),
            is_root: false,
            port_count,
            power_on_good,
            has_indicators,
            ports: Mutex::new(empty_ports(port_count)),
            interrupt_transfer: Mutex::new(Some(transfer.clone())),
            interrupt_length,
            changed: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&hub);
        transfer.set_callback(Arc::new(move |transfer| {
            if let Some(hub) = weak.upgrade() {
                hub.interrupt_complete(transfer);
            }
        }));

        device.set_hub_engine(hub.clone());
        info!(
            "usb: hub at address {} with {} ports",
            device.address(),
            port_count
        );
        Ok(hub)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// Powers the ports and, for real hubs, starts the status interrupt.
    pub(crate) fn start(&self) -> Result<()> {
        self.power_up()?;
        self.submit_interrupt()
    }

    /// Restart after an over-current trip: stop the status interrupt,
    /// repower every port and resume.
    fn reset(&self) -> Result<()> {
        if let Some(transfer) = self.interrupt_transfer.lock().unwrap().clone() {
            loop {
                match transfer.cancel_sync() {
                    Ok(()) | Err(UsbError::TooEarly) => break,
                    Err(_) if !self.device.is_connected() => {
                        return Err(UsbError::DeviceNotConnected)
                    }
                    Err(_) => thread::yield_now(),
                }
            }
        }
        self.power_up()?;
        self.submit_interrupt()
    }

    fn power_up(&self) -> Result<()> {
        let _children = self.device.lock_children();
        for state in self.ports.lock().unwrap().iter_mut() {
            state.clear();
        }
        for port in 1..=self.port_count {
            self.enable_port_power(port)?;
        }
        thread::sleep(Duration::from_millis(u64::from(self.power_on_good) * 2));
        self.refresh_all()
    }

    fn submit_interrupt(&self) -> Result<()> {
        match self.interrupt_transfer.lock().unwrap().as_ref() {
            Some(transfer) => transfer.submit(),
            None => Ok(()),
        }
    }

    fn enable_port_power(&self, port: u8) -> Result<()> {
        if self.is_root {
            let status = HubPortStatus::POWER;
            self.ports.lock().unwrap()[port as usize - 1].status |= status;
            return self
                .controller
                .ops()
                .set_root_hub_status(port as usize, status);
        }
        self.device.send_control(
            Setup::hub_feature(true, HubPortFeature::PortPower as u16, port as u16),
            None,
        )?;
        if self.has_indicators {
            self.device.send_control(
                Setup::hub_feature(
                    true,
                    HubPortFeature::PortIndicator as u16,
                    port as u16 | HUB_INDICATOR_AUTOMATIC,
                ),
                None,
            )?;
        }
        Ok(())
    }

    /// Cached software status of a port.
    fn port_state(&self, port: u8) -> (HubPortStatus, DeviceSpeed) {
        let ports = self.ports.lock().unwrap();
        let state = &ports[port as usize - 1];
        (state.status, state.speed)
    }

    fn modify_port<F: FnOnce(&mut HubPortStatus)>(&self, port: u8, f: F) -> HubPortStatus {
        let mut ports = self.ports.lock().unwrap();
        let state = &mut ports[port as usize - 1];
        f(&mut state.status);
        state.status
    }

    /// Folds a hardware status word into the software view. Change bits
    /// accumulate: the hardware's own change report is merged with any
    /// difference against the previous software status.
    fn fold_port_status(&self, port: u8, hw: HubPortStatus) {
        let mut ports = self.ports.lock().unwrap();
        let state = &mut ports[port as usize - 1];

        let mut new = HubPortStatus::empty();
        if hw.contains(HubPortStatus::CONNECTION) {
            new |= HubPortStatus::CONNECTION;
            state.speed = hw.speed();
        }
        for bit in [
            HubPortStatus::ENABLE,
            HubPortStatus::SUSPEND,
            HubPortStatus::OVER_CURRENT,
            HubPortStatus::POWER,
        ] {
            if hw.contains(bit) {
                new |= bit;
            }
        }

        let old = state.status.bits();
        let diff_change = ((old ^ new.bits()) & 0x1F) << HUB_PORT_CHANGE_SHIFT;
        let change =
            (old & PORT_CHANGE_BITS) | diff_change | (hw.bits() & PORT_CHANGE_BITS);
        state.status = HubPortStatus::from_bits_truncate(new.bits() | change);

        if trace_enabled(TraceFlags::HUB, self.device.address()) {
            debug!(
                "usb: hub {} port {} status {:?}",
                self.device.address(),
                port,
                state.status
            );
        }
    }

    /// Reads a port's hardware status, folds it in and acknowledges the
    /// hardware change bits.
    fn refresh_port(&self, port: u8) -> Result<()> {
        if self.is_root {
            return self.refresh_all();
        }
        let raw = self
            .device
            .send_control(Setup::get_hub_status(port as u16), None)?;
        if raw.len() < 4 {
            return Err(UsbError::DataLengthMismatch);
        }
        let hw = HubPortStatus::from_bits_truncate(u32::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3],
        ]));

        for (bit, feature) in [
            (
                HubPortStatus::CONNECTION_CHANGED,
                HubPortFeature::CPortConnection,
            ),
            (HubPortStatus::ENABLE_CHANGED, HubPortFeature::CPortEnable),
            (HubPortStatus::SUSPEND_CHANGED, HubPortFeature::CPortSuspend),
            (
                HubPortStatus::OVER_CURRENT_CHANGED,
                HubPortFeature::CPortOverCurrent,
            ),
            (HubPortStatus::RESET_CHANGED, HubPortFeature::CPortReset),
        ] {
            if hw.contains(bit) {
                self.device.send_control(
                    Setup::hub_feature(false, feature as u16, port as u16),
                    None,
                )?;
            }
        }

        self.fold_port_status(port, hw);
        Ok(())
    }

    fn refresh_all(&self) -> Result<()> {
        if self.is_root {
            let mut hw = vec![HubPortStatus::empty(); self.port_count as usize];
            self.controller.ops().root_hub_status(&mut hw)?;
            for (index, status) in hw.into_iter().enumerate() {
                self.fold_port_status(index as u8 + 1, status);
            }
            return Ok(());
        }
        for port in 1..=self.port_count {
            self.refresh_port(port)?;
        }
        Ok(())
    }

    /// Pushes the software status of a port to the hardware and consumes
    /// the change bits that drove the request.
    fn apply_port_status(&self, port: u8) -> Result<()> {
        let (status, _) = self.port_state(port);

        if self.is_root {
            self.controller
                .ops()
                .set_root_hub_status(port as usize, status)?;
        } else {
            if status.contains(HubPortStatus::ENABLE_CHANGED)
                && !status.contains(HubPortStatus::ENABLE)
            {
                self.device.send_control(
                    Setup::hub_feature(false, HubPortFeature::PortEnable as u16, port as u16),
                    None,
                )?;
            }
            if status.contains(HubPortStatus::RESET_CHANGED)
                && status.contains(HubPortStatus::RESET)
            {
                self.device.send_control(
                    Setup::hub_feature(true, HubPortFeature::PortReset as u16, port as u16),
                    None,
                )?;
            }
            if status.contains(HubPortStatus::SUSPEND_CHANGED) {
                self.device.send_control(
                    Setup::hub_feature(
                        status.contains(HubPortStatus::SUSPEND),
                        HubPortFeature::PortSuspend as u16,
                        port as u16,
                    ),
                    None,
                )?;
            }
        }

        self.modify_port(port, |s| {
            s.remove(
                HubPortStatus::ENABLE_CHANGED
                    | HubPortStatus::RESET_CHANGED
                    | HubPortStatus::SUSPEND_CHANGED,
            )
        });
        Ok(())
    }

    /// Resets a port and waits out the mandated recovery times. Returns
    /// `Ok` with the port disabled if the device disappeared mid-reset, and
    /// [`UsbError::PortNotReady`] if the port never came back enabled.
    pub(crate) fn reset_port(&self, port: u8) -> Result<()> {
        self.modify_port(port, |s| {
            s.insert(
                HubPortStatus::RESET
                    | HubPortStatus::RESET_CHANGED
                    | HubPortStatus::ENABLE_CHANGED,
            );
            s.remove(HubPortStatus::ENABLE);
        });
        self.apply_port_status(port)?;
        thread::sleep(PORT_RESET_HOLD);

        self.modify_port(port, |s| {
            s.remove(HubPortStatus::RESET);
            s.insert(
                HubPortStatus::ENABLE
                    | HubPortStatus::RESET_CHANGED
                    | HubPortStatus::ENABLE_CHANGED,
            );
        });
        self.apply_port_status(port)?;
        thread::sleep(PORT_RESET_RECOVERY);

        self.refresh_port(port)?;
        let status = self.modify_port(port, |s| {
            s.remove(HubPortStatus::RESET_CHANGED | HubPortStatus::ENABLE_CHANGED)
        });
        if !status.contains(HubPortStatus::CONNECTION) {
            return Ok(());
        }
        if !status.contains(HubPortStatus::ENABLE) {
            warn!("usb: port {} did not enable after reset", port);
            return Err(UsbError::PortNotReady);
        }
        thread::sleep(POST_RESET_SETTLE);
        Ok(())
    }

    /// Status interrupt completion, runs on the completion worker. Anything
    /// that needs another transfer is punted to the hub worker.
    fn interrupt_complete(&self, transfer: &Arc<Transfer>) {
        let status = transfer.status();
        match status.error {
            TransferError::None => {}
            TransferError::Cancelled => return,
            TransferError::Stalled => {
                self.stalled.store(true, Ordering::Release);
                self.queue_work();
                return;
            }
            error if error.is_transient_io() => {
                warn!("usb: hub status interrupt failed: {}, retrying", error);
                if let Err(err) = transfer.submit() {
                    error!("usb: hub status resubmission failed: {}", err);
                }
                return;
            }
            error => {
                error!("usb: hub status interrupt failed for good: {}", error);
                return;
            }
        }

        let mut bitmap = 0u32;
        if status.bytes_transferred == self.interrupt_length {
            let buffer = transfer.buffer();
            for (index, byte) in buffer[..self.interrupt_length.min(4)].iter().enumerate() {
                bitmap |= (*byte as u32) << (index * 8);
            }
        }

        if bitmap != 0 {
            self.changed.fetch_or(bitmap, Ordering::AcqRel);
            self.queue_work();
        } else if let Err(err) = transfer.submit() {
            error!("usb: hub status resubmission failed: {}", err);
        }
    }

    fn queue_work(&self) {
        if let Some(core) = self.controller.core() {
            core.workers()
                .queue_hub_work(HubWork::PortChange(self.weak_self.clone()));
        }
    }

    /// Hub worker entry: services whatever the last status interrupt
    /// reported, then restarts the interrupt.
    pub(crate) fn process_port_changes(&self) -> Result<()> {
        if self.stalled.swap(false, Ordering::AcqRel) {
            return self.recover_stall();
        }

        let changed = self.changed.swap(0, Ordering::AcqRel);

        if changed & 1 != 0 && !self.is_root {
            match self.process_hub_change() {
                Ok(true) => {
                    // The hub was reset, which already restarted the
                    // interrupt.
                    self.notify_topology_change();
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => warn!(
                    "usb: hub at address {} status change handling failed: {}",
                    self.device.address(),
                    err
                ),
            }
        }

        let mut topology_changed = false;
        {
            let _children = self.device.lock_children();
            for port in 1..=self.port_count {
                // Root hubs have no change bitmap, every port gets looked
                // at. The bitmap only reaches port 31.
                let bit = 1u32.checked_shl(u32::from(port)).unwrap_or(0);
                if !self.is_root && changed & bit == 0 {
                    continue;
                }
                // One misbehaving port must not keep the others from being
                // serviced, nor the status interrupt from restarting.
                match self.service_port(port) {
                    Ok(connection_changed) => topology_changed |= connection_changed,
                    Err(err) => warn!("usb: servicing port {} failed: {}", port, err),
                }
            }
        }

        if topology_changed {
            self.notify_topology_change();
        }
        self.submit_interrupt()
    }

    /// Refreshes one port and clears whatever non-topology condition it
    /// reports. Returns true when the connection state changed, which is
    /// left set for [`Hub::query_children`] to act on.
    fn service_port(&self, port: u8) -> Result<bool> {
        self.refresh_port(port)?;
        let (status, _) = self.port_state(port);
        if status.contains(HubPortStatus::OVER_CURRENT_CHANGED) {
            self.recover_port_over_current(port)?;
        }
        Ok(self
            .port_state(port)
            .0
            .contains(HubPortStatus::CONNECTION_CHANGED))
    }

    /// Services a change on the hub itself. Returns true if the hub was
    /// reset, which resubmits the status interrupt as a side effect.
    fn process_hub_change(&self) -> Result<bool> {
        let raw = self.device.send_control(Setup::get_hub_status(0), None)?;
        if raw.len() < 4 {
            return Err(UsbError::DataLengthMismatch);
        }
        let word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

        if word & HUB_CHANGE_LOCAL_POWER != 0 {
            self.device.send_control(
                Setup::hub_feature(false, HubFeature::CHubLocalPower as u16, 0),
                None,
            )?;
        }

        if word & HUB_CHANGE_OVER_CURRENT != 0 {
            warn!(
                "usb: hub at address {} reported over-current",
                self.device.address()
            );
            let timeout = Timeout::new(OVER_CURRENT_WAIT);
            loop {
                let raw = self.device.send_control(Setup::get_hub_status(0), None)?;
                if raw.len() < 4 {
                    return Err(UsbError::DataLengthMismatch);
                }
                let word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if word & HUB_STATUS_OVER_CURRENT == 0 {
                    break;
                }
                if timeout.run().is_err() {
                    return Err(UsbError::PortNotReady);
                }
            }
            self.device.send_control(
                Setup::hub_feature(false, HubFeature::CHubOverCurrent as u16, 0),
                None,
            )?;
            self.reset()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// An over-current trip powered the port down. Wait for the condition
    /// to drain, then repower.
    fn recover_port_over_current(&self, port: u8) -> Result<()> {
        self.modify_port(port, |s| s.remove(HubPortStatus::OVER_CURRENT_CHANGED));

        let timeout = Timeout::new(OVER_CURRENT_WAIT);
        while self.port_state(port).0.contains(HubPortStatus::OVER_CURRENT) {
            if timeout.run().is_err() {
                warn!("usb: port {} over-current did not clear", port);
                return Err(UsbError::PortNotReady);
            }
            self.refresh_port(port)?;
        }

        self.modify_port(port, |s| *s = HubPortStatus::empty());
        if self.is_root {
            self.reset_port(port)?;
        } else {
            self.enable_port_power(port)?;
            thread::sleep(Duration::from_millis(u64::from(self.power_on_good) * 2));
        }
        self.refresh_port(port)
    }

    fn recover_stall(&self) -> Result<()> {
        let transfer = match self.interrupt_transfer.lock().unwrap().clone() {
            Some(transfer) => transfer,
            None => return Ok(()),
        };
        let endpoint = transfer.endpoint().address();
        if let Err(err) =
            self.device
                .clear_feature(ReqRecipient::Endpoint, feature::ENDPOINT_HALT, endpoint as u16)
        {
            error!("usb: hub status endpoint stall recovery failed: {}", err);
            return Err(err);
        }
        transfer.submit()
    }

    fn notify_topology_change(&self) {
        if let (Some(core), Some(os_device)) =
            (self.controller.core(), self.device.os_device())
        {
            core.bus().notify_topology_change(os_device);
        }
    }

    /// Re-evaluates every port whose connection changed: tears down the old
    /// child, enumerates the new device, and reports the surviving children.
    /// This is the answer to the OS re-querying a hub after a topology
    /// change notification.
    pub fn query_children(&self) -> Result<Vec<OsDeviceId>> {
        let mut children = self.device.lock_children();

        for port in 1..=self.port_count {
            let (status, _) = self.port_state(port);
            if !status.contains(HubPortStatus::CONNECTION_CHANGED) {
                continue;
            }

            if let Some(position) = children.iter().position(|c| c.port() == port) {
                let child = children.remove(position);
                info!(
                    "usb: device at address {} left port {}",
                    child.address(),
                    port
                );
                crate::enumeration::remove_device(&child);
            }
            self.modify_port(port, |s| s.remove(HubPortStatus::CONNECTION_CHANGED));

            if status.contains(HubPortStatus::CONNECTION) {
                match self.add_device(port) {
                    Ok(Some(device)) => children.push(device),
                    Ok(None) => {}
                    Err(err) => warn!("usb: port {} enumeration failed: {}", port, err),
                }
            }
        }

        Ok(children.iter().filter_map(|c| c.os_device()).collect())
    }

    /// Brings up the device on a newly connected port. Returns `Ok(None)`
    /// when the device disappears during debounce or reset.
    fn add_device(&self, port: u8) -> Result<Option<Arc<Device>>> {
        thread::sleep(DEBOUNCE);
        self.refresh_port(port)?;
        if !self.port_state(port).0.contains(HubPortStatus::CONNECTION) {
            return Ok(None);
        }

        self.reset_port(port)?;
        let (status, speed) = self.port_state(port);
        if !status.contains(HubPortStatus::CONNECTION) {
            return Ok(None);
        }

        let device = crate::enumeration::enumerate_device(&self.controller, self, port, speed)?;
        Ok(Some(device))
    }

    /// Tears the engine down: stops the status interrupt and breaks the
    /// device's reference to the engine.
    pub(crate) fn detach(&self) {
        if let Some(transfer) = self.interrupt_transfer.lock().unwrap().take() {
            let _ = transfer.cancel_sync();
        }
        self.device.clear_hub_engine();
    }
}

/// Hub worker entry for a root hub change notification from the controller.
pub(crate) fn process_root_hub_changes(controller: &Arc<HostController>) -> Result<()> {
    controller.rearm_root_change();
    let hub = match controller.root_hub() {
        Some(hub) => hub,
        None => return Ok(()),
    };
    hub.process_port_changes()
}
