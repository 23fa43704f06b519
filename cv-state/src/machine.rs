//! Keyed state machine engine.
//!
//! Transitions for one key are serialized through [`KeyLocks`]; different
//! keys proceed independently. Every transition first cancels timeout jobs
//! tagged with the key, then hands the new state to the backend.

use crate::algebra::State;
use crate::error::{Result, StateError};
use crate::locks::KeyLocks;
use crate::scheduler::{JobCallback, JobHandle, JobScheduler};
use crate::store::StateBackend;
use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT_JOB_PREFIX: &str = "state-timeout";
const KEY_TAG_BYTES: usize = 8;

pub struct StateMachine<B: StateBackend> {
    backend: Arc<B>,
    locks: KeyLocks<B::Key>,
    scheduler: Arc<dyn JobScheduler>,
}

impl<B: StateBackend> Clone for StateMachine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            locks: self.locks.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<B: StateBackend> StateMachine<B> {
    pub fn new(backend: Arc<B>, scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            backend,
            locks: KeyLocks::new(),
            scheduler,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn locks(&self) -> &KeyLocks<B::Key> {
        &self.locks
    }

    pub fn get_active_key_state(&self, event: &B::Event) -> (B::Key, State) {
        self.backend.active_key_state(event, &self.locks)
    }

    pub fn get_state(&self, key: &B::Key) -> State {
        if self.locks.is_locked(key) {
            return State::busy();
        }
        self.backend
            .stored_state(key)
            .unwrap_or_else(State::idle)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = ?key, state = %state))]
    pub async fn set_state(&self, key: &B::Key, state: &State) -> Result<()> {
        ensure_storable(state)?;
        let _guard = self.locks.acquire(key).await;
        self.apply(key, state).await
    }

    /// Like [`Self::set_state`] but returns [`StateError::Locked`] instead of
    /// waiting for a transition already in progress.
    #[tracing::instrument(level = "debug", skip_all, fields(key = ?key, state = %state))]
    pub async fn set_state_nowait(&self, key: &B::Key, state: &State) -> Result<()> {
        ensure_storable(state)?;
        let Some(_guard) = self.locks.try_acquire(key) else {
            return Err(StateError::Locked(format!("{key:?}")));
        };
        self.apply(key, state).await
    }

    /// Run `callback` after `when`, unless a transition on any of
    /// `cancel_keys` happens first.
    pub fn schedule_timeout(
        &self,
        callback: JobCallback,
        when: Duration,
        cancel_keys: &[B::Key],
    ) -> Result<Arc<dyn JobHandle>> {
        let name = timeout_job_name(cancel_keys);
        Ok(self.scheduler.run_once(callback, when, name)?)
    }

    /// Reset `key` to idle after `after` of inactivity.
    ///
    /// A transition that reaches the key lock before the reset does wins: the
    /// reset re-checks its own cancellation once it holds the lock.
    pub fn schedule_reset(&self, key: &B::Key, after: Duration) -> Result<Arc<dyn JobHandle>> {
        let machine = self.clone();
        let reset_key = key.clone();
        let callback: JobCallback = Box::new(move |job: Arc<dyn JobHandle>| {
            async move {
                match machine.reset_unless_superseded(&reset_key, &*job).await {
                    Ok(true) => {
                        tracing::info!(key = ?reset_key, "conversation timed out; reset to idle")
                    }
                    Ok(false) => {
                        tracing::debug!(key = ?reset_key, "timeout superseded by a transition")
                    }
                    Err(e) => tracing::warn!(key = ?reset_key, error = %e, "timeout reset failed"),
                }
            }
            .boxed()
        });
        self.schedule_timeout(callback, after, std::slice::from_ref(key))
    }

    async fn reset_unless_superseded(&self, key: &B::Key, job: &dyn JobHandle) -> Result<bool> {
        let _guard = self.locks.acquire(key).await;
        if job.is_cancelled() {
            return Ok(false);
        }
        self.apply(key, &State::idle()).await?;
        Ok(true)
    }

    async fn apply(&self, key: &B::Key, state: &State) -> Result<()> {
        for job in self.scheduler.jobs_matching(&key_tag(key)) {
            tracing::debug!(job = %job.name(), "cancelling stale timeout");
            job.cancel();
        }
        self.backend
            .persist_state(key, state)
            .await
            .map_err(StateError::Storage)
    }
}

fn ensure_storable(state: &State) -> Result<()> {
    if state.is_any() {
        return Err(StateError::AnyNotAllowed);
    }
    Ok(())
}

pub(crate) fn timeout_job_name<K: Debug>(keys: &[K]) -> String {
    let mut name = TIMEOUT_JOB_PREFIX.to_string();
    for key in keys {
        name.push_str(&key_tag(key));
    }
    name
}

pub(crate) fn key_tag<K: Debug>(key: &K) -> String {
    let digest = Sha256::digest(format!("{key:?}").as_bytes());
    format!("[k:{}]", to_lower_hex(&digest[..KEY_TAG_BYTES]))
}

fn to_lower_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioJobScheduler;
    use crate::store::MemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::watch;

    struct ChatBackend {
        store: MemoryStateStore<String>,
        gate: watch::Sender<bool>,
        hold: Duration,
        inside: AtomicUsize,
        max_inside: AtomicUsize,
        fail: AtomicBool,
    }

    impl ChatBackend {
        fn new(hold: Duration) -> Self {
            Self {
                store: MemoryStateStore::new(),
                gate: watch::Sender::new(true),
                hold,
                inside: AtomicUsize::new(0),
                max_inside: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl StateBackend for ChatBackend {
        type Key = String;
        type Event = String;

        fn active_key_state(&self, event: &String, locks: &KeyLocks<String>) -> (String, State) {
            let key = event.clone();
            let state = self.store.observe(locks, &key);
            (key, state)
        }

        fn stored_state(&self, key: &String) -> Option<State> {
            self.store.get(key)
        }

        async fn persist_state(&self, key: &String, state: &State) -> anyhow::Result<()> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(now, Ordering::SeqCst);
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            tokio::time::sleep(self.hold).await;
            self.inside.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("disk full"));
            }
            self.store.set(key, state);
            Ok(())
        }
    }

    fn machine(hold: Duration) -> (StateMachine<ChatBackend>, Arc<TokioJobScheduler>) {
        let scheduler = Arc::new(TokioJobScheduler::new());
        let machine = StateMachine::new(Arc::new(ChatBackend::new(hold)), scheduler.clone());
        (machine, scheduler)
    }

    #[tokio::test]
    async fn unset_keys_are_idle_and_set_state_is_visible() {
        let (machine, _) = machine(Duration::ZERO);
        let asking = State::new("machine.visible.asking").expect("leaf");
        let key = "chat:visible".to_string();

        assert_eq!(machine.get_active_key_state(&key), (key.clone(), State::idle()));
        machine.set_state(&key, &asking).await.expect("set");
        assert_eq!(machine.get_active_key_state(&key).1, asking);
        assert_eq!(machine.get_state(&key), asking);
        assert!(machine.locks().is_empty(), "lock entry reclaimed");
    }

    #[tokio::test]
    async fn any_is_rejected_as_active_state() {
        let (machine, _) = machine(Duration::ZERO);
        let key = "chat:any".to_string();
        let err = machine
            .set_state(&key, &State::any())
            .await
            .expect_err("ANY is not storable");
        assert!(matches!(err, StateError::AnyNotAllowed));
        let err = machine
            .set_state_nowait(&key, &State::any())
            .await
            .expect_err("ANY is not storable");
        assert!(!err.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_transitions_are_serialized() {
        let (machine, _) = machine(Duration::from_millis(50));
        let a = State::new("machine.serial.a").expect("leaf");
        let b = State::new("machine.serial.b").expect("leaf");
        let key = "chat:serial".to_string();

        let first = tokio::spawn({
            let (machine, key) = (machine.clone(), key.clone());
            async move { machine.set_state(&key, &a).await }
        });
        let second = tokio::spawn({
            let (machine, key) = (machine.clone(), key.clone());
            async move { machine.set_state(&key, &b).await }
        });
        first.await.expect("join").expect("first set");
        second.await.expect("join").expect("second set");

        assert_eq!(machine.backend().max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_transition_concurrently() {
        let (machine, _) = machine(Duration::from_millis(50));
        let s = State::new("machine.parallel.s").expect("leaf");

        let started = tokio::time::Instant::now();
        let tasks: Vec<_> = ["chat:p1", "chat:p2"]
            .into_iter()
            .map(|key| {
                let (machine, s) = (machine.clone(), s.clone());
                tokio::spawn(async move { machine.set_state(&key.to_string(), &s).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("set");
        }

        assert_eq!(machine.backend().max_inside.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn nowait_reports_contention_while_hook_blocks() {
        let (machine, _) = machine(Duration::ZERO);
        let s1 = State::new("machine.nowait.s1").expect("leaf");
        let s2 = State::new("machine.nowait.s2").expect("leaf");
        let key = "chat:1".to_string();

        machine.set_state(&key, &State::idle()).await.expect("idle");

        machine.backend().gate.send_replace(false);
        let pending = tokio::spawn({
            let (machine, key, s1) = (machine.clone(), key.clone(), s1.clone());
            async move { machine.set_state(&key, &s1).await }
        });
        tokio::task::yield_now().await;

        let err = machine
            .set_state_nowait(&key, &s2)
            .await
            .expect_err("key is held by the blocked transition");
        assert!(err.is_locked());
        assert!(machine.get_active_key_state(&key).1.is_busy());

        machine.backend().gate.send_replace(true);
        pending.await.expect("join").expect("blocked set");
        assert_eq!(machine.get_state(&key), s1);

        machine.set_state_nowait(&key, &s2).await.expect("free again");
        assert_eq!(machine.get_state(&key), s2);
    }

    #[tokio::test(start_paused = true)]
    async fn transition_cancels_pending_timeout() {
        let (machine, scheduler) = machine(Duration::ZERO);
        let next = State::new("machine.cancel.next").expect("leaf");
        let key = "chat:timeout".to_string();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        machine
            .schedule_timeout(
                Box::new(move |_job: Arc<dyn JobHandle>| {
                    async move {
                        flag.store(true, Ordering::SeqCst);
                    }
                    .boxed()
                }),
                Duration::from_secs(5),
                &[key.clone(), "chat:other".to_string()],
            )
            .expect("schedule");
        assert_eq!(scheduler.pending(), 1);

        machine.set_state(&key, &next).await.expect("set");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_reset_returns_key_to_idle() {
        let (machine, _) = machine(Duration::ZERO);
        let busy_talking = State::new("machine.reset.talking").expect("leaf");
        let key = "chat:reset".to_string();

        machine.set_state(&key, &busy_talking).await.expect("set");
        machine
            .schedule_reset(&key, Duration::from_secs(30))
            .expect("schedule reset");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(machine.get_state(&key), State::idle());
        assert!(machine.backend().store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_transition_beats_an_elapsed_reset() {
        let (machine, scheduler) = machine(Duration::ZERO);
        let first = State::new("machine.race.first").expect("leaf");
        let second = State::new("machine.race.second").expect("leaf");
        let key = "chat:race".to_string();

        machine.set_state(&key, &first).await.expect("set");
        machine
            .schedule_reset(&key, Duration::from_secs(30))
            .expect("schedule reset");

        tokio::time::sleep(Duration::from_secs(29)).await;
        let held = machine.locks().acquire(&key).await;
        let queued = tokio::spawn({
            let (machine, key, second) = (machine.clone(), key.clone(), second.clone());
            async move { machine.set_state(&key, &second).await }
        });
        tokio::task::yield_now().await;

        // The timer elapses while the transition is still queued.
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(held);
        queued.await.expect("join").expect("queued set");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(machine.get_state(&key), second);
        assert_eq!(scheduler.pending(), 0);
        assert!(machine.locks().is_empty());
    }

    #[tokio::test]
    async fn storage_failures_propagate() {
        let (machine, _) = machine(Duration::ZERO);
        let s = State::new("machine.storage.s").expect("leaf");
        machine.backend().fail.store(true, Ordering::SeqCst);

        let err = machine
            .set_state(&"chat:storage".to_string(), &s)
            .await
            .expect_err("hook fails");
        assert!(matches!(err, StateError::Storage(_)));
        assert!(err.to_string().contains("storage hook failed"));
    }

    #[test]
    fn job_names_tag_every_cancel_key() {
        let name = timeout_job_name(&["chat:1", "user:2"]);
        assert!(name.starts_with(TIMEOUT_JOB_PREFIX));
        assert!(name.contains(&key_tag(&"chat:1")));
        assert!(name.contains(&key_tag(&"user:2")));
        assert_eq!(key_tag(&"chat:1"), key_tag(&"chat:1"));
        assert_ne!(key_tag(&"chat:1"), key_tag(&"chat:2"));
        assert_eq!(key_tag(&"x").len(), "[k:]".len() + KEY_TAG_BYTES * 2);
    }
}
