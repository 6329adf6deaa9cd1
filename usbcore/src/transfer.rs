//! Transfer allocation, submission and completion.
//!
//! A transfer's life cycle is tracked with a single atomic word so that
//! submission, cancellation and completion can race without a lock:
//!
//! `Inactive -> Active -> InCallback -> Inactive`
//!
//! A callback may resubmit its own transfer, which moves `InCallback`
//! straight back to `Active`. Cancellation never transitions the state
//! itself; a cancelled transfer flows through the completion path with a
//! [`TransferError::Cancelled`] status.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{trace, warn};

use bitflags::bitflags;
use common::dma::DMA_ALIGNMENT;
use common::Dma;

use crate::device::{Device, Endpoint};
use crate::error::{Result, TransferError, UsbError};
use crate::trace::{trace_enabled, TraceFlags};
use crate::usb::{EndpointTy, Setup};

const STATE_INACTIVE: u32 = 1;
const STATE_ACTIVE: u32 = 2;
const STATE_IN_CALLBACK: u32 = 3;

/// Size of the setup packet at the head of every control transfer buffer.
pub const SETUP_SIZE: usize = core::mem::size_of::<Setup>();

bitflags! {
    pub struct TransferFlags: u32 {
        /// The transfer services paging I/O and completes on the paging
        /// queue when one exists.
        const PAGING = 1 << 0;
        /// Terminate the transfer with a zero length packet if the payload
        /// is a multiple of the packet size.
        const FORCE_SHORT = 1 << 1;
        /// Set internally by [`Transfer::submit_sync`].
        const SYNCHRONOUS = 1 << 31;
    }
}

/// What the controller reports when a transfer finishes. For control
/// transfers `bytes_transferred` includes the setup packet, matching the
/// transfer length convention.
#[derive(Clone, Copy, Debug)]
pub struct TransferCompletion {
    pub error: TransferError,
    pub bytes_transferred: usize,
}

pub type TransferCallback = Arc<dyn Fn(&Arc<Transfer>) + Send + Sync>;

struct TransferFields {
    length: usize,
    flags: TransferFlags,
    callback: Option<TransferCallback>,
}

struct Completion {
    error: TransferError,
    bytes_transferred: usize,
}

pub struct Transfer {
    weak_self: Weak<Transfer>,
    device: Weak<Device>,
    endpoint: Arc<Endpoint>,
    max_size: usize,
    state: AtomicU32,
    device_address: AtomicU8,
    fields: Mutex<TransferFields>,
    completion: Mutex<Completion>,
    buffer: Mutex<Dma<[u8]>>,
    hc_handle: crate::host::TransferHandle,
    event: Mutex<bool>,
    event_signal: Condvar,
}

impl Transfer {
    /// Allocates a transfer on one of `device`'s endpoints. `endpoint_address`
    /// zero selects the default endpoint. `max_size` bounds the payload of
    /// every future submission; control transfers get the setup packet on
    /// top of it.
    pub fn allocate(
        device: &Arc<Device>,
        endpoint_address: u8,
        max_size: usize,
        flags: TransferFlags,
    ) -> Result<Arc<Transfer>> {
        let endpoint = device.endpoint(endpoint_address)?;
        let buffer_size = if endpoint.ty() == EndpointTy::Ctrl {
            max_size + SETUP_SIZE
        } else {
            max_size
        };

        let controller = device.controller();
        let hc_handle = controller
            .ops()
            .create_transfer(endpoint.handle(), buffer_size)?;

        let transfer = Arc::new_cyclic(|weak| Transfer {
            weak_self: weak.clone(),
            device: Arc::downgrade(device),
            endpoint,
            max_size,
            state: AtomicU32::new(STATE_INACTIVE),
            device_address: AtomicU8::new(0),
            fields: Mutex::new(TransferFields {
                length: 0,
                flags,
                callback: None,
            }),
            completion: Mutex::new(Completion {
                error: TransferError::None,
                bytes_transferred: 0,
            }),
            buffer: Mutex::new(Dma::new_slice(buffer_size)),
            hc_handle,
            event: Mutex::new(false),
            event_signal: Condvar::new(),
        });

        device.link_transfer(&transfer)?;
        Ok(transfer)
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The address the device answered at when this transfer was submitted.
    pub fn device_address(&self) -> u8 {
        self.device_address.load(Ordering::Acquire)
    }

    pub fn length(&self) -> usize {
        self.fields.lock().unwrap().length
    }

    pub fn flags(&self) -> TransferFlags {
        self.fields.lock().unwrap().flags
    }

    pub(crate) fn is_paging(&self) -> bool {
        self.flags().contains(TransferFlags::PAGING)
    }

    pub fn buffer(&self) -> std::sync::MutexGuard<'_, Dma<[u8]>> {
        self.buffer.lock().unwrap()
    }

    pub fn set_callback(&self, callback: TransferCallback) {
        self.fields.lock().unwrap().callback = Some(callback);
    }

    /// Sets the payload length for the next submission.
    pub fn set_length(&self, length: usize) {
        self.fields.lock().unwrap().length = length;
    }

    /// Writes a setup packet and optional outgoing data into the buffer and
    /// sets the length accordingly. A control transfer's length covers the
    /// setup packet plus the data stage, so it is never zero.
    pub fn fill_control(&self, setup: Setup, data: Option<&[u8]>) -> Result<()> {
        let data_len = data.map_or(0, <[u8]>::len);
        if data_len > self.max_size {
            return Err(UsbError::InvalidParameter);
        }
        let mut buffer = self.buffer.lock().unwrap();
        buffer[..SETUP_SIZE].copy_from_slice(unsafe { plain::as_bytes(&setup) });
        if let Some(data) = data {
            buffer[SETUP_SIZE..SETUP_SIZE + data_len].copy_from_slice(data);
        }
        drop(buffer);
        self.set_length(SETUP_SIZE + { setup.length } as usize);
        Ok(())
    }

    /// Status of the most recent completion.
    pub fn status(&self) -> TransferCompletion {
        let completion = self.completion.lock().unwrap();
        TransferCompletion {
            error: completion.error,
            bytes_transferred: completion.bytes_transferred,
        }
    }

    fn set_status(&self, error: TransferError, bytes_transferred: usize) {
        let mut completion = self.completion.lock().unwrap();
        completion.error = error;
        completion.bytes_transferred = bytes_transferred;
    }

    /// Submits the transfer for asynchronous execution. The callback runs on
    /// the completion worker once the controller finishes or fails it, and
    /// may resubmit the transfer from within the callback.
    ///
    /// Panics if the transfer is still in flight, since a double submission
    /// would let the hardware scribble over a buffer the caller believes it
    /// owns.
    pub fn submit(&self) -> Result<()> {
        self.submit_inner(false)
    }

    fn submit_inner(&self, synchronous: bool) -> Result<()> {
        // Resubmission from the transfer's own callback is the only path
        // allowed to go Active while the callback runs.
        if self
            .state
            .compare_exchange(
                STATE_IN_CALLBACK,
                STATE_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            if let Err(state) = self.state.compare_exchange(
                STATE_INACTIVE,
                STATE_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                if state == STATE_ACTIVE {
                    // Resubmitting an in-flight transfer means the caller has
                    // lost track of its I/O. Its buffer may be rewritten under
                    // the hardware at any moment, so there is no safe recovery.
                    self.set_status(TransferError::SubmittedWhileStillActive, 0);
                    panic!(
                        "usb: transfer resubmitted while active, endpoint {:#x}",
                        self.endpoint.address()
                    );
                }
                return Err(UsbError::InvalidParameter);
            }
        }

        if let Err(err) = self.validate(synchronous) {
            self.state.store(STATE_INACTIVE, Ordering::Release);
            self.set_status(TransferError::IncorrectlyFilledOut, 0);
            return Err(err);
        }

        self.set_status(TransferError::NotStarted, 0);

        let device = match self.device.upgrade() {
            Some(device) => device,
            None => {
                self.state.store(STATE_INACTIVE, Ordering::Release);
                return Err(UsbError::DeviceNotConnected);
            }
        };
        self.device_address.store(device.address(), Ordering::Release);

        // The outgoing portion has to hit memory before the schedule sees
        // the transfer. Control transfers always carry a setup packet out.
        self.buffer.lock().unwrap().sync_for_device();

        // Holding the device state lock across submission keeps removal from
        // racing new I/O onto a disconnecting device.
        let _state = match device.connected_guard() {
            Ok(guard) => guard,
            Err(err) => {
                self.state.store(STATE_INACTIVE, Ordering::Release);
                self.set_status(TransferError::DeviceNotConnected, 0);
                return Err(err);
            }
        };

        if trace_enabled(TraceFlags::TRANSFERS, device.address()) {
            trace!(
                "usb: submit {} {} transfer, endpoint {:#x}, length {}",
                self.endpoint.ty(),
                self.endpoint.direction(),
                self.endpoint.address(),
                self.length()
            );
        }

        let this = match self.weak_self.upgrade() {
            Some(this) => this,
            None => {
                self.state.store(STATE_INACTIVE, Ordering::Release);
                self.set_status(TransferError::AllocatedIncorrectly, 0);
                return Err(UsbError::InvalidParameter);
            }
        };
        let controller = device.controller();
        if let Err(err) = controller
            .ops()
            .submit_transfer(self.endpoint.handle(), &this)
        {
            let _ = self
                .state
                .compare_exchange(
                    STATE_ACTIVE,
                    STATE_INACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            self.set_status(TransferError::FailedToSubmit, 0);
            return Err(err);
        }
        Ok(())
    }

    /// Submits the transfer and blocks until its completion has been
    /// processed. Returns the number of bytes transferred.
    pub fn submit_sync(&self) -> Result<usize> {
        {
            let mut fields = self.fields.lock().unwrap();
            fields.flags |= TransferFlags::SYNCHRONOUS;
        }
        *self.event.lock().unwrap() = false;

        self.submit_inner(true)?;

        let mut signalled = self.event.lock().unwrap();
        while !*signalled {
            signalled = self.event_signal.wait(signalled).unwrap();
        }
        drop(signalled);

        let status = self.status();
        match status.error {
            TransferError::None => Ok(status.bytes_transferred),
            error => Err(UsbError::Transfer(error)),
        }
    }

    /// Runs the transfer with interrupts effectively off: the controller
    /// polls it to completion before returning. No callback is invoked.
    /// Intended for crash dump writeout, so it skips the device state lock.
    pub fn submit_polled(&self) -> Result<usize> {
        let device = self.device.upgrade().ok_or(UsbError::DeviceNotConnected)?;
        let controller = device.controller();
        if !controller
            .capabilities()
            .contains(crate::host::HostCapabilities::POLLED_SUBMIT)
        {
            return Err(UsbError::NotSupported);
        }

        // Completed but unreaped transfers on this endpoint would confuse
        // the polled reap, flush them out first.
        controller.ops().flush_endpoint(self.endpoint.handle())?;

        if self
            .state
            .compare_exchange(
                STATE_INACTIVE,
                STATE_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(UsbError::ResourceInUse);
        }
        if let Err(err) = self.validate(true) {
            self.state.store(STATE_INACTIVE, Ordering::Release);
            self.set_status(TransferError::IncorrectlyFilledOut, 0);
            return Err(err);
        }
        self.set_status(TransferError::NotStarted, 0);
        self.device_address.store(device.address(), Ordering::Release);
        self.buffer.lock().unwrap().sync_for_device();

        let this = match self.weak_self.upgrade() {
            Some(this) => this,
            None => {
                self.state.store(STATE_INACTIVE, Ordering::Release);
                self.set_status(TransferError::AllocatedIncorrectly, 0);
                return Err(UsbError::InvalidParameter);
            }
        };
        let result = controller
            .ops()
            .submit_polled_transfer(self.endpoint.handle(), &this);
        self.state.store(STATE_INACTIVE, Ordering::Release);

        let completion = result?;
        self.set_status(completion.error, completion.bytes_transferred);
        self.buffer.lock().unwrap().sync_for_cpu();
        match completion.error {
            TransferError::None => Ok(completion.bytes_transferred),
            error => Err(UsbError::Transfer(error)),
        }
    }

    /// Asks the controller to pull the transfer out of its schedule.
    ///
    /// `TooEarly` means the transfer was not active. `TooLate` means the
    /// hardware already owns it. Either way a completion (with a
    /// `Cancelled` status on success) still flows through the normal path.
    pub fn cancel(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) != STATE_ACTIVE {
            return Err(UsbError::TooEarly);
        }
        let device = self.device.upgrade().ok_or(UsbError::DeviceNotConnected)?;
        let this = self.weak_self.upgrade().ok_or(UsbError::InvalidParameter)?;
        let controller = device.controller();
        controller
            .ops()
            .cancel_transfer(self.endpoint.handle(), &this)
            .map_err(|_| UsbError::TooLate)
    }

    /// Cancels the transfer and waits for the completion path to finish
    /// with it.
    pub fn cancel_sync(&self) -> Result<()> {
        let result = self.cancel();
        match result {
            Ok(()) | Err(UsbError::TooLate) => {
                while self.state.load(Ordering::Acquire) != STATE_INACTIVE {
                    std::thread::yield_now();
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_INACTIVE
    }

    /// Records the controller's completion report. Called from the
    /// controller's completion context before the transfer is queued.
    pub(crate) fn record_completion(&self, completion: &TransferCompletion) {
        self.buffer.lock().unwrap().sync_for_cpu();
        self.set_status(completion.error, completion.bytes_transferred);
    }

    fn validate(&self, synchronous: bool) -> Result<()> {
        let limit = if self.endpoint.ty() == EndpointTy::Ctrl {
            self.max_size + SETUP_SIZE
        } else {
            self.max_size
        };
        let fields = self.fields.lock().unwrap();
        if fields.length == 0 || fields.length > limit {
            return Err(UsbError::InvalidParameter);
        }
        if !synchronous && fields.callback.is_none() {
            return Err(UsbError::InvalidParameter);
        }
        drop(fields);
        let buffer = self.buffer.lock().unwrap();
        if buffer.physical() % DMA_ALIGNMENT != 0 {
            self.set_status(TransferError::BufferNotAligned, 0);
            return Err(UsbError::InvalidParameter);
        }
        Ok(())
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            let controller = device.controller();
            controller
                .ops()
                .destroy_transfer(self.endpoint.handle(), &self.hc_handle);
            device.prune_transfers();
        }
    }
}

/// Runs on the completion worker for every finished transfer: invokes the
/// callback and retires the transfer unless the callback resubmitted it.
pub(crate) fn finish_transfer(transfer: &Arc<Transfer>) {
    if transfer
        .state
        .compare_exchange(
            STATE_ACTIVE,
            STATE_IN_CALLBACK,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        warn!("usb: completed transfer was not active");
        return;
    }

    let status = transfer.status();
    let address = transfer.device_address();
    if trace_enabled(TraceFlags::COMPLETIONS, address) {
        trace!(
            "usb: transfer complete, error {:?}, {} bytes",
            status.error,
            status.bytes_transferred
        );
    }
    if status.error != TransferError::None && trace_enabled(TraceFlags::ERRORS, address) {
        warn!(
            "usb: transfer failed on endpoint {:#x}: {}",
            transfer.endpoint.address(),
            status.error
        );
    }

    let (callback, synchronous) = {
        let fields = transfer.fields.lock().unwrap();
        (
            fields.callback.clone(),
            fields.flags.contains(TransferFlags::SYNCHRONOUS),
        )
    };
    if let Some(callback) = callback {
        callback(transfer);
    }

    // Fails exactly when the callback resubmitted the transfer.
    let retired = transfer
        .state
        .compare_exchange(
            STATE_IN_CALLBACK,
            STATE_INACTIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();

    if retired && synchronous {
        let mut signalled = transfer.event.lock().unwrap();
        *signalled = true;
        transfer.event_signal.notify_all();
    }
}
