use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;

use crate::AccessToken;

const EVENT_CAPACITY: usize = 16;

/// A change in the lifecycle of the held access token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenEvent {
    /// A new access token is available
    Updated,
    /// The access token was removed, by logout or after a failed refresh
    Cleared,
    /// A refresh attempt failed and the session must be re-authenticated
    Expired,
}

/// Process-local holder of the current access token
///
/// The token is only ever held in memory. Clones share the same slot, and
/// every `set`/`clear` is announced to subscribers so dependent state can
/// react without polling. Separate stores are fully independent of one
/// another.
#[derive(Clone, Debug)]
pub struct TokenStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    slot: RwLock<Slot>,
    events: broadcast::Sender<TokenEvent>,
}

#[derive(Debug, Default)]
struct Slot {
    token: Option<AccessToken>,
    generation: u64,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    /// Constructs an empty token store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                slot: RwLock::new(Slot::default()),
                events,
            }),
        }
    }

    /// Replaces the held token
    pub fn set(&self, token: AccessToken) {
        {
            let mut slot = self.write();
            slot.token = Some(token);
            slot.generation += 1;
        }
        tracing::trace!("access token updated");
        self.publish(TokenEvent::Updated);
    }

    /// Gets a copy of the held token, if any
    pub fn get(&self) -> Option<AccessToken> {
        self.read().token.clone()
    }

    /// Removes the held token
    ///
    /// Subscribers are only notified if a token was actually held.
    pub fn clear(&self) {
        let had_token = {
            let mut slot = self.write();
            slot.generation += 1;
            slot.token.take().is_some()
        };
        if had_token {
            tracing::trace!("access token cleared");
            self.publish(TokenEvent::Cleared);
        }
    }

    /// Subscribes to token lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.inner.events.subscribe()
    }

    /// A counter that increments with every mutation of the store
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Sets the token only if the store has not been mutated since `generation`
    pub(crate) fn set_if_generation(&self, token: AccessToken, generation: u64) -> bool {
        {
            let mut slot = self.write();
            if slot.generation != generation {
                return false;
            }
            slot.token = Some(token);
            slot.generation += 1;
        }
        self.publish(TokenEvent::Updated);
        true
    }

    /// Clears the token only if the store has not been mutated since `generation`
    pub(crate) fn clear_if_generation(&self, generation: u64) -> bool {
        let had_token = {
            let mut slot = self.write();
            if slot.generation != generation {
                return false;
            }
            slot.generation += 1;
            slot.token.take().is_some()
        };
        if had_token {
            self.publish(TokenEvent::Cleared);
        }
        true
    }

    pub(crate) fn publish(&self, event: TokenEvent) {
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, Slot> {
        self.inner.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slot> {
        self.inner.slot.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    #[test]
    fn set_get_and_clear() {
        let store = TokenStore::new();
        assert_eq!(store.get(), None);

        store.set(AccessToken::from_static("first"));
        assert_eq!(store.get().as_deref().map(|t| t.as_str()), Some("first"));

        store.clear();
        assert_eq!(store.get(), None);
    }

    #[test]
    fn mutations_are_announced() {
        let store = TokenStore::new();
        let mut events = store.subscribe();

        store.set(AccessToken::from_static("first"));
        store.clear();
        store.clear();

        assert_eq!(events.try_recv(), Ok(TokenEvent::Updated));
        assert_eq!(events.try_recv(), Ok(TokenEvent::Cleared));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn conditional_set_is_rejected_after_a_mutation() {
        let store = TokenStore::new();
        let generation = store.generation();

        store.clear();

        assert!(!store.set_if_generation(AccessToken::from_static("stale"), generation));
        assert_eq!(store.get(), None);
    }

    #[test]
    fn clones_share_a_slot_but_stores_are_independent() {
        let tab_a = TokenStore::new();
        let tab_a_clone = tab_a.clone();
        let tab_b = TokenStore::new();

        tab_b.set(AccessToken::from_static("tab-b"));
        tab_a_clone.set(AccessToken::from_static("tab-a"));

        assert_eq!(tab_a.get().as_deref().map(|t| t.as_str()), Some("tab-a"));
        assert_eq!(tab_b.get().as_deref().map(|t| t.as_str()), Some("tab-b"));
    }
}
