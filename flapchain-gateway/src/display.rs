//! Shared display handle and its synchronization worker
//!
//! Application tasks change module values and mark them dirty. A single
//! worker task owns the [`GatewayDriver`] and brings the chain in line with
//! the collection whenever it is woken.
//!
//! ```text
//! app task ──mark_dirty──► Collection (mutex) ◄──ChainModel── worker ──► chain
//!     │                                                         ▲   │
//!     └──────────────────── desynchronized ─────────────────────┘   │
//!     ◄──────────────────── synchronized ───────────────────────────┘
//! ```
//!
//! The mutex is only held for one bitmask update or one handler call, never
//! across a bus transaction.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, TimeoutError};
use embedded_hal::delay::DelayNs;
use flapchain_hal::GatewayUart;
use flapchain_protocol::{NodeError, NodeState, PropertyId};

use crate::collection::{Collection, Operation, SyncMethod};
use crate::driver::GatewayDriver;
use crate::error::GatewayError;
use crate::model::ChainModel;

/// Modules of one display, shared between the application and the worker
pub struct Display<R: RawMutex, M, const N: usize> {
    collection: Mutex<R, RefCell<Collection<M, N>>>,
    desynchronized: Signal<R, ()>,
    synchronized: Signal<R, ()>,
}

impl<R: RawMutex, M, const N: usize> Display<R, M, N> {
    pub const fn new() -> Self {
        Self {
            collection: Mutex::new(RefCell::new(Collection::new())),
            desynchronized: Signal::new(),
            synchronized: Signal::new(),
        }
    }

    /// Run `f` on the collection inside a critical section
    pub fn lock<T>(&self, f: impl FnOnce(&mut Collection<M, N>) -> T) -> T {
        self.collection.lock(|c| f(&mut c.borrow_mut()))
    }

    /// Mark `property` stale on every module and wake the worker
    pub fn mark_dirty(&self, property: PropertyId, method: SyncMethod) {
        self.lock(|c| c.mark_dirty(property, method));
        self.desynchronized.signal(());
    }

    /// Mark `property` stale on module `index` and wake the worker
    pub fn mark_module_dirty(&self, index: usize, property: PropertyId) -> bool {
        let marked = self.lock(|c| c.mark_module_dirty(index, property));
        if marked {
            self.desynchronized.signal(());
        }
        marked
    }

    /// Change module `index` and schedule a write of `property` to it
    pub fn update_module(
        &self,
        index: usize,
        property: PropertyId,
        f: impl FnOnce(&mut M),
    ) -> bool {
        let updated = self.lock(|c| match c.module_mut(index) {
            Some(module) => {
                f(module);
                c.mark_module_dirty(index, property)
            }
            None => false,
        });
        if updated {
            self.desynchronized.signal(());
        }
        updated
    }

    /// Wait for the end of the next worker pass
    pub async fn wait_synchronized(&self) {
        self.synchronized.wait().await
    }

    /// Wake the worker and wait until it has finished a pass
    pub async fn synchronize(&self, timeout: Duration) -> Result<(), TimeoutError> {
        self.synchronized.reset();
        self.desynchronized.signal(());
        with_timeout(timeout, self.wait_synchronized()).await
    }
}

impl<R: RawMutex, M: Default, const N: usize> Display<R, M, N> {
    /// Worker loop, the only user of `driver`; never returns
    pub async fn run<U, D>(&self, mut driver: GatewayDriver<'_, M, U, D>)
    where
        U: GatewayUart,
        D: DelayNs,
    {
        loop {
            self.desynchronized.wait().await;
            self.sync_pass(&mut driver);
        }
    }

    /// Bring every stale property in sync once
    ///
    /// Failed properties other than unsupported ones stay dirty for the
    /// next pass. Always ends with the synchronized signal.
    pub fn sync_pass<U, D>(&self, driver: &mut GatewayDriver<'_, M, U, D>)
    where
        U: GatewayUart,
        D: DelayNs,
    {
        let table = driver.table();
        let properties =
            move || (0..=PropertyId::MAX).filter_map(move |id| table.get(PropertyId(id)));

        self.lock(|c| {
            for def in properties() {
                c.promote(def);
            }
        });

        for def in properties() {
            let property = def.id;
            let Some(operation) = self.lock(|c| c.pending_operation(property)) else {
                continue;
            };
            let mut view = Locked(self);
            let node_count = view.node_count();

            let result = match operation {
                Operation::ReadAll => driver.read_all(&mut view, property),
                Operation::Broadcast | Operation::WriteSeq if node_count == 0 => {
                    debug!("no modules to write {} to", def.name);
                    continue;
                }
                Operation::Broadcast => broadcast(driver, &mut view, property, node_count),
                Operation::WriteSeq => driver.write_seq(&mut view, property),
            };

            match result {
                Ok(()) => self.lock(|c| c.mark_clean(property)),
                Err(e) if e.is_not_supported() => {
                    warn!("{} not supported by the chain", def.name);
                    self.lock(|c| c.mark_clean(property));
                }
                Err(e) => warn!("sync of {} failed: {}", def.name, e),
            }
        }

        self.synchronized.signal(());
    }
}

impl<R: RawMutex, M, const N: usize> Default for Display<R, M, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast with immediate retries
fn broadcast<M, U, D, T>(
    driver: &mut GatewayDriver<'_, M, U, D>,
    model: &mut T,
    property: PropertyId,
    node_count: u16,
) -> Result<(), GatewayError>
where
    U: GatewayUart,
    D: DelayNs,
    T: ChainModel<Module = M>,
{
    let retries = driver.config().write_retries;
    let mut attempt = 0;
    loop {
        match driver.write_all(model, property, node_count, false, true) {
            Err(e) if attempt < retries && e.is_retryable() => {
                attempt += 1;
                debug!("broadcast failed ({}), retry {}", e, attempt);
                driver.recover();
            }
            result => return result,
        }
    }
}

/// Collection view that locks per callback
struct Locked<'d, R: RawMutex, M, const N: usize>(&'d Display<R, M, N>);

impl<R: RawMutex, M: Default, const N: usize> ChainModel for Locked<'_, R, M, N> {
    type Module = M;

    fn node_count(&self) -> u16 {
        self.0.lock(|c| c.node_count())
    }

    fn capacity(&self) -> u16 {
        N.min(u16::MAX as usize) as u16
    }

    fn with_module<T>(&self, index: u16, f: impl FnOnce(&M) -> T) -> Option<T> {
        self.0.lock(|c| c.with_module(index, f))
    }

    fn with_module_mut<T>(&mut self, index: u16, f: impl FnOnce(&mut M) -> T) -> Option<T> {
        self.0.lock(|c| c.with_module_mut(index, f))
    }

    fn on_node_count_changed(&mut self, count: u16) {
        self.0.lock(|c| c.on_node_count_changed(count))
    }

    fn must_write(&self, index: u16, property: PropertyId) -> bool {
        self.0.lock(|c| c.must_write(index, property))
    }

    fn on_node_error(&mut self, index: u16, error: NodeError, state: Option<NodeState>) {
        self.0.lock(|c| c.on_node_error(index, error, state))
    }
}
