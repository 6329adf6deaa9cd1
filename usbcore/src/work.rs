//! Worker threads.
//!
//! Every controller gets its own completion worker, so a callback stalling
//! on one bus never starves another. Hub maintenance runs on a further
//! thread of its own: it issues synchronous control transfers, and those
//! only finish once a completion worker runs their callbacks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::error;

use crate::host::HostController;
use crate::hub::Hub;
use crate::transfer::Transfer;

/// A queue of finished transfers waiting for their callbacks to run.
pub struct CompletionQueue {
    items: Mutex<VecDeque<Arc<Transfer>>>,
    wake: Sender<()>,
}

impl CompletionQueue {
    fn new(wake: Sender<()>) -> Arc<Self> {
        Arc::new(CompletionQueue {
            items: Mutex::new(VecDeque::new()),
            wake,
        })
    }

    /// Queues a finished transfer. Only the transition from empty wakes the
    /// worker, which drains the whole queue per wakeup.
    pub(crate) fn push(&self, transfer: Arc<Transfer>) {
        let was_empty = {
            let mut items = self.items.lock().unwrap();
            let was_empty = items.is_empty();
            items.push_back(transfer);
            was_empty
        };
        if was_empty {
            let _ = self.wake.send(());
        }
    }

    fn drain(&self) -> VecDeque<Arc<Transfer>> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }
}

fn run_completions(queue: Arc<CompletionQueue>, wakeups: Receiver<()>) {
    while wakeups.recv().is_ok() {
        for transfer in queue.drain() {
            crate::transfer::finish_transfer(&transfer);
        }
    }
}

pub(crate) enum HubWork {
    /// A hub's status interrupt reported changed ports.
    PortChange(Weak<Hub>),
    /// A controller's root hub reported a port change.
    RootChange(Weak<HostController>),
}

fn run_hub_work(work: Receiver<HubWork>) {
    while let Ok(item) = work.recv() {
        match item {
            HubWork::PortChange(hub) => {
                if let Some(hub) = hub.upgrade() {
                    if let Err(err) = hub.process_port_changes() {
                        error!("usb: hub maintenance failed: {}", err);
                    }
                }
            }
            HubWork::RootChange(controller) => {
                if let Some(controller) = controller.upgrade() {
                    if let Err(err) = crate::hub::process_root_hub_changes(&controller) {
                        error!("usb: root hub maintenance failed: {}", err);
                    }
                }
            }
        }
    }
}

pub(crate) struct Workers {
    hub_work: Sender<HubWork>,
}

impl Workers {
    pub fn start() -> Self {
        let (hub_tx, hub_rx) = crossbeam_channel::unbounded();
        thread::spawn(move || run_hub_work(hub_rx));

        Workers { hub_work: hub_tx }
    }

    /// Spawns a completion worker with its own queue. Each controller runs
    /// one, and the paging path gets another.
    pub fn start_completion_worker() -> Arc<CompletionQueue> {
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        let queue = CompletionQueue::new(wake_tx);
        {
            let queue = queue.clone();
            thread::spawn(move || run_completions(queue, wake_rx));
        }
        queue
    }

    pub fn queue_hub_work(&self, work: HubWork) {
        let _ = self.hub_work.send(work);
    }
}
