use crate::algebra::State;
use crate::locks::KeyLocks;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Application side of a [`crate::StateMachine`]: key selection and storage.
#[async_trait]
pub trait StateBackend: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    type Event: Send + Sync;

    /// Pick the single key this event belongs to and report its state.
    ///
    /// Must not wait on `locks`; a key with a transition in flight reports
    /// [`State::busy`].
    fn active_key_state(
        &self,
        event: &Self::Event,
        locks: &KeyLocks<Self::Key>,
    ) -> (Self::Key, State);

    fn stored_state(&self, key: &Self::Key) -> Option<State>;

    /// Called with the key lock held.
    async fn persist_state(&self, key: &Self::Key, state: &State) -> anyhow::Result<()>;
}

/// In-memory key -> state map. Keys set back to idle are dropped.
#[derive(Debug)]
pub struct MemoryStateStore<K>
where
    K: Eq + Hash,
{
    states: DashMap<K, State>,
}

impl<K> Default for MemoryStateStore<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

impl<K> MemoryStateStore<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<State> {
        self.states.get(key).map(|s| s.value().clone())
    }

    pub fn set(&self, key: &K, state: &State) {
        if state.is_idle() {
            self.states.remove(key);
        } else {
            self.states.insert(key.clone(), state.clone());
        }
    }

    /// State as seen by a query: busy while locked, idle when unset.
    pub fn observe(&self, locks: &KeyLocks<K>, key: &K) -> State {
        if locks.is_locked(key) {
            return State::busy();
        }
        self.get(key).unwrap_or_else(State::idle)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_keys_are_dropped_and_locked_keys_report_busy() {
        let store = MemoryStateStore::new();
        let locks = KeyLocks::new();
        let waiting = State::new("store.waiting").expect("leaf");

        store.set(&"chat:1", &waiting);
        assert_eq!(store.observe(&locks, &"chat:1"), waiting);
        assert_eq!(store.observe(&locks, &"chat:2"), State::idle());

        let guard = locks.acquire(&"chat:1").await;
        assert!(store.observe(&locks, &"chat:1").is_busy());
        drop(guard);

        store.set(&"chat:1", &State::idle());
        assert!(store.is_empty());
    }
}
