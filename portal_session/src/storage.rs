//! Storage for the session descriptor

use std::sync::{Arc, Mutex, PoisonError};

use crate::SessionDescriptor;

/// Tab-scoped storage for a single session descriptor
///
/// Only [`SessionGuard`][crate::SessionGuard] reads or writes through this
/// trait.
pub trait SessionStorage: Send + Sync {
    /// Loads the stored descriptor, if any
    fn load(&self) -> Option<SessionDescriptor>;

    /// Replaces the stored descriptor
    fn store(&self, descriptor: SessionDescriptor);

    /// Removes the stored descriptor
    fn remove(&self);
}

impl<T: SessionStorage + ?Sized> SessionStorage for Arc<T> {
    fn load(&self) -> Option<SessionDescriptor> {
        (**self).load()
    }

    fn store(&self, descriptor: SessionDescriptor) {
        (**self).store(descriptor)
    }

    fn remove(&self) {
        (**self).remove()
    }
}

/// Session storage that lives only as long as the process
#[derive(Debug, Default)]
pub struct InMemorySessionStorage {
    slot: Mutex<Option<SessionDescriptor>>,
}

impl InMemorySessionStorage {
    /// Constructs empty in-memory storage
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl SessionStorage for InMemorySessionStorage {
    fn load(&self) -> Option<SessionDescriptor> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, descriptor: SessionDescriptor) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(descriptor);
    }

    fn remove(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
