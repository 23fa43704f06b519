//! Demo conversation driven by the keyed state machine.
//!
//! `/start` asks for a name, then a favourite color, then finishes. `/cancel`
//! works from any state. Every step arms an inactivity reset.

use async_trait::async_trait;
use cv_channels::{ChatId, InboundUpdate, UserId};
use cv_state::{KeyLocks, MemoryStateStore, State, StateBackend, StateError, StateMachine};
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;

const BUSY_REPLY: &str = "Still working on your previous message, try again in a moment.";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Chat(ChatId),
    Member { chat: ChatId, user: UserId },
}

impl ConversationKey {
    /// Where a fresh conversation for this update lives: per member in
    /// groups, per chat otherwise.
    fn for_new(update: &InboundUpdate) -> Self {
        match (&update.sender_id, update.is_group) {
            (Some(user), true) => Self::member(update, user),
            _ => Self::Chat(update.chat_id.clone()),
        }
    }

    fn member(update: &InboundUpdate, user: &UserId) -> Self {
        Self::Member {
            chat: update.chat_id.clone(),
            user: user.clone(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(chat) => write!(f, "chat:{chat}"),
            Self::Member { chat, user } => write!(f, "chat:{chat}/user:{user}"),
        }
    }
}

/// Flow states, registered once per process.
#[derive(Debug, Clone)]
pub struct Flow {
    pub asking_name: State,
    pub asking_color: State,
    pub in_progress: State,
}

impl Flow {
    pub fn register() -> cv_state::Result<Self> {
        let asking_name = leaf("profile.asking_name")?;
        let asking_color = leaf("profile.asking_color")?;
        let in_progress = &asking_name | &asking_color;
        Ok(Self {
            asking_name,
            asking_color,
            in_progress,
        })
    }
}

fn leaf(uid: &str) -> cv_state::Result<State> {
    match State::new(uid) {
        Err(StateError::DuplicateUid(_)) => {
            State::registered(uid).ok_or_else(|| StateError::InvalidUid(uid.to_string()))
        }
        other => other,
    }
}

/// Conversation state plus the answers collected so far.
#[derive(Default)]
pub struct ConversationBackend {
    states: MemoryStateStore<ConversationKey>,
    names: DashMap<ConversationKey, String>,
}

impl ConversationBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_conversations(&self) -> usize {
        self.states.len()
    }
}

#[async_trait]
impl StateBackend for ConversationBackend {
    type Key = ConversationKey;
    type Event = InboundUpdate;

    fn active_key_state(
        &self,
        update: &InboundUpdate,
        locks: &KeyLocks<ConversationKey>,
    ) -> (ConversationKey, State) {
        if let Some(user) = &update.sender_id {
            let key = ConversationKey::member(update, user);
            let state = self.states.observe(locks, &key);
            if !state.is_idle() {
                return (key, state);
            }
        }
        let chat = ConversationKey::Chat(update.chat_id.clone());
        let state = self.states.observe(locks, &chat);
        if !state.is_idle() {
            return (chat, state);
        }
        (ConversationKey::for_new(update), State::idle())
    }

    fn stored_state(&self, key: &ConversationKey) -> Option<State> {
        self.states.get(key)
    }

    async fn persist_state(&self, key: &ConversationKey, state: &State) -> anyhow::Result<()> {
        self.states.set(key, state);
        if state.is_idle() {
            self.names.remove(key);
        }
        Ok(())
    }
}

pub struct Conversation {
    machine: StateMachine<ConversationBackend>,
    flow: Flow,
    timeout: Duration,
}

impl Conversation {
    pub fn new(
        machine: StateMachine<ConversationBackend>,
        flow: Flow,
        timeout: Duration,
    ) -> Self {
        Self {
            machine,
            flow,
            timeout,
        }
    }

    pub fn machine(&self) -> &StateMachine<ConversationBackend> {
        &self.machine
    }

    /// React to one update; `Ok(None)` means nothing to say.
    #[tracing::instrument(level = "debug", skip_all, fields(update_id = update.update_id))]
    pub async fn handle(&self, update: &InboundUpdate) -> cv_state::Result<Option<String>> {
        let (key, state) = self.machine.get_active_key_state(update);
        let text = update.content.trim();
        tracing::debug!(%key, %state, "routing update");

        if text == "/cancel" && State::any().matches(&state) {
            return self.cancel(&key, &state).await;
        }
        if state.is_busy() {
            return Ok(Some(BUSY_REPLY.to_string()));
        }

        if text == "/start" {
            if self.flow.in_progress.matches(&state) {
                return Ok(Some("Already started. Send /cancel to stop.".to_string()));
            }
            self.advance(&key, &self.flow.asking_name).await?;
            return Ok(Some("Hi! What's your name?".to_string()));
        }

        if self.flow.asking_name.matches(&state) {
            self.machine.backend().names.insert(key.clone(), text.to_string());
            self.advance(&key, &self.flow.asking_color).await?;
            return Ok(Some(format!("Nice to meet you, {text}. Favourite color?")));
        }

        if self.flow.asking_color.matches(&state) {
            let name = self
                .machine
                .backend()
                .names
                .get(&key)
                .map(|n| n.value().clone())
                .unwrap_or_else(|| "friend".to_string());
            self.machine.set_state(&key, &State::idle()).await?;
            return Ok(Some(format!("Got it, {name}: {text} it is. Bye!")));
        }

        Ok(None)
    }

    async fn cancel(
        &self,
        key: &ConversationKey,
        state: &State,
    ) -> cv_state::Result<Option<String>> {
        if state.is_idle() {
            return Ok(Some("Nothing to cancel.".to_string()));
        }
        match self.machine.set_state_nowait(key, &State::idle()).await {
            Ok(()) => Ok(Some("Cancelled.".to_string())),
            Err(e) if e.is_locked() => Ok(Some(BUSY_REPLY.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn advance(&self, key: &ConversationKey, next: &State) -> cv_state::Result<()> {
        self.machine.set_state(key, next).await?;
        self.machine.schedule_reset(key, self.timeout)?;
        Ok(())
    }
}
