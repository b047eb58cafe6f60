use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering::SeqCst};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::connection::ConnInner;
use crate::{Error, ObjectState, Oid, Persistable, Result, Tid};

/// Where a live object stands relative to its committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    /// Only the oid is in memory. The state is loaded the next
    /// time the object is read or written.
    Ghost,
    /// The state is loaded and matches what was read.
    Saved,
    /// The state was changed in the current transaction.
    Changed,
    /// Loaded and in use by a `read` call, so the cache will
    /// not turn it back into a ghost.
    Sticky,
}

impl ObjectStatus {
    fn to_u8(self) -> u8 {
        match self {
            ObjectStatus::Ghost => 0,
            ObjectStatus::Saved => 1,
            ObjectStatus::Changed => 2,
            ObjectStatus::Sticky => 3,
        }
    }

    fn from_u8(raw: u8) -> ObjectStatus {
        match raw {
            0 => ObjectStatus::Ghost,
            1 => ObjectStatus::Saved,
            2 => ObjectStatus::Changed,
            _ => ObjectStatus::Sticky,
        }
    }
}

pub(crate) struct Slot {
    pub serial: Tid,
    pub state: Option<Box<dyn ObjectState>>,
}

/// A persistent object as seen through one connection.
///
/// A connection hands out at most one `PObject` per oid, so
/// `Arc::ptr_eq` on two handles for the same oid from the same
/// connection is always true while either is alive.
pub struct PObject {
    oid: Oid,
    jar: Weak<ConnInner>,
    status: AtomicU8,
    slot: Mutex<Slot>,
}

impl fmt::Debug for PObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PObject")
            .field("oid", &self.oid)
            .field("status", &self.status())
            .finish()
    }
}

impl PObject {
    pub(crate) fn new_loaded(oid: Oid, jar: Weak<ConnInner>, serial: Tid, state: Box<dyn ObjectState>) -> PObject {
        PObject {
            oid,
            jar,
            status: AtomicU8::new(ObjectStatus::Saved.to_u8()),
            slot: Mutex::new(Slot {
                serial,
                state: Some(state),
            }),
        }
    }

    pub(crate) fn new_added(oid: Oid, jar: Weak<ConnInner>, state: Box<dyn ObjectState>) -> PObject {
        PObject {
            oid,
            jar,
            status: AtomicU8::new(ObjectStatus::Changed.to_u8()),
            slot: Mutex::new(Slot {
                serial: Tid::ZERO,
                state: Some(state),
            }),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The TID of the revision the state was loaded from, or
    /// `Tid::ZERO` for objects that were never committed.
    pub fn serial(&self) -> Tid {
        self.slot.lock().serial
    }

    pub fn status(&self) -> ObjectStatus {
        ObjectStatus::from_u8(self.status.load(SeqCst))
    }

    pub fn is_ghost(&self) -> bool {
        self.status() == ObjectStatus::Ghost
    }

    fn set_status(&self, status: ObjectStatus) {
        self.status.store(status.to_u8(), SeqCst);
    }

    fn jar(&self) -> Result<Arc<ConnInner>> {
        self.jar.upgrade().ok_or_else(|| {
            Error::ConnectionState(format!("the connection that loaded {} is gone", self.oid))
        })
    }

    /// Loads the state if this is a ghost.
    pub fn activate(&self) -> Result<()> {
        if !self.is_ghost() {
            return Ok(());
        }
        let jar = self.jar()?;
        let (serial, state) = jar.load_state(self.oid)?;

        let mut slot = self.slot.lock();
        // another reader may have won the race
        if slot.state.is_none() {
            slot.serial = serial;
            slot.state = Some(state);
            self.set_status(ObjectStatus::Saved);
        }
        Ok(())
    }

    /// Runs `f` on the object's state, loading it first if needed.
    ///
    /// The object is locked while `f` runs, so `f` must not commit
    /// or abort the transaction of this object's connection.
    pub fn read<T, R, F>(&self, f: F) -> Result<R>
    where
        T: Persistable,
        F: FnOnce(&T) -> R,
    {
        self.activate()?;

        let slot = self.slot.lock();
        let state = self.loaded_state(&slot)?;
        let value = self.downcast_ref::<T>(state)?;

        let pinned = self
            .status
            .compare_exchange(
                ObjectStatus::Saved.to_u8(),
                ObjectStatus::Sticky.to_u8(),
                SeqCst,
                SeqCst,
            )
            .is_ok();

        let ret = f(value);

        if pinned {
            let _ = self.status.compare_exchange(
                ObjectStatus::Sticky.to_u8(),
                ObjectStatus::Saved.to_u8(),
                SeqCst,
                SeqCst,
            );
        }
        drop(slot);

        if let Ok(jar) = self.jar() {
            jar.touch(self.oid);
        }

        Ok(ret)
    }

    /// Runs `f` on the object's state and marks the object as
    /// changed in the current transaction of its connection.
    pub fn write<T, R, F>(&self, f: F) -> Result<R>
    where
        T: Persistable,
        F: FnOnce(&mut T) -> R,
    {
        self.activate()?;

        {
            let slot = self.slot.lock();
            let state = self.loaded_state(&slot)?;
            self.downcast_ref::<T>(state)?;
        }

        let jar = self.jar()?;
        if self.status() != ObjectStatus::Changed {
            jar.register(self.oid)?;
        }

        // a concurrent invalidation may have ghosted the object
        // while it was being registered
        self.activate()?;

        let mut slot = self.slot.lock();
        let oid = self.oid;
        let state = slot
            .state
            .as_mut()
            .ok_or_else(|| Error::ConnectionState(format!("{oid} was invalidated while being written")))?;
        let found = state.class_id();
        let value = state
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| Error::WrongType {
                oid,
                expected: type_name::<T>(),
                found: found.to_owned(),
            })?;

        let ret = f(value);
        self.set_status(ObjectStatus::Changed);
        drop(slot);

        jar.touch(self.oid);

        Ok(ret)
    }

    /// Turns the object back into a ghost if it holds no
    /// uncommitted changes. Returns whether it did.
    pub fn deactivate(&self) -> bool {
        self.try_ghostify()
    }

    fn loaded_state<'a>(&self, slot: &'a Slot) -> Result<&'a dyn ObjectState> {
        slot.state.as_deref().ok_or_else(|| {
            Error::ConnectionState(format!("{} was invalidated while being read", self.oid))
        })
    }

    fn downcast_ref<'a, T: Persistable>(&self, state: &'a dyn ObjectState) -> Result<&'a T> {
        state.as_any().downcast_ref::<T>().ok_or_else(|| Error::WrongType {
            oid: self.oid,
            expected: type_name::<T>(),
            found: state.class_id().to_owned(),
        })
    }

    /// The pickle of the current state, for commit and savepoints.
    pub(crate) fn snapshot_state(&self, serialize: impl FnOnce(&dyn ObjectState) -> Result<Vec<u8>>) -> Result<Option<(Tid, Vec<u8>)>> {
        let slot = self.slot.lock();
        match slot.state.as_deref() {
            Some(state) => Ok(Some((slot.serial, serialize(state)?))),
            None => Ok(None),
        }
    }

    /// Drops the state unconditionally.
    pub(crate) fn invalidate(&self) {
        let mut slot = self.slot.lock();
        slot.state = None;
        self.set_status(ObjectStatus::Ghost);
    }

    /// Drops the state if the object is loaded, unchanged and not
    /// in use. Never blocks.
    pub(crate) fn try_ghostify(&self) -> bool {
        let mut slot = match self.slot.try_lock() {
            Some(slot) => slot,
            None => return false,
        };
        if self.status() != ObjectStatus::Saved {
            return false;
        }
        slot.state = None;
        self.set_status(ObjectStatus::Ghost);
        true
    }

    /// Records that the state now matches revision `serial`.
    pub(crate) fn mark_saved(&self, serial: Tid) {
        let mut slot = self.slot.lock();
        slot.serial = serial;
        if slot.state.is_some() {
            self.set_status(ObjectStatus::Saved);
        } else {
            self.set_status(ObjectStatus::Ghost);
        }
    }
}
