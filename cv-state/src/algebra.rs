//! Conversation states and the boolean algebra over them.
//!
//! A [`State`] is either a leaf registered once under a unique uid, one of the
//! built-in singletons ([`State::idle`], [`State::any`], [`State::busy`]), or a
//! combinator built with `!`, `&`, `|` and `^`. Combinators are memoized in a
//! process-wide table keyed by operator and operand uids, so evaluating the
//! same expression repeatedly hands back the same node.

use crate::error::{Result, StateError};
use dashmap::DashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitAnd, BitOr, BitXor, Not};
use std::sync::{Arc, LazyLock};

pub const IDLE_UID: &str = "IDLE";
pub const ANY_UID: &str = "ANY";
pub const BUSY_UID: &str = "BUSY";

const RESERVED_CHARS: &[char] = &['~', '&', '|', '^', '(', ')'];

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

#[derive(Clone)]
pub struct State(Arc<Node>);

struct Node {
    uid: String,
    kind: Kind,
}

enum Kind {
    Leaf,
    Any,
    Not(State),
    And(State, State),
    Or(State, State),
    Xor(State, State),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Not,
    And,
    Or,
    Xor,
}

struct Registry {
    idle: State,
    any: State,
    busy: State,
    leaves: DashMap<String, State>,
    combined: DashMap<(Op, String, String), State>,
}

impl Registry {
    fn new() -> Self {
        let idle = State::node(IDLE_UID.to_string(), Kind::Leaf);
        let any = State::node(ANY_UID.to_string(), Kind::Any);
        let busy = State::node(BUSY_UID.to_string(), Kind::Leaf);
        let leaves = DashMap::new();
        for builtin in [&idle, &any, &busy] {
            leaves.insert(builtin.uid().to_string(), builtin.clone());
        }
        Self {
            idle,
            any,
            busy,
            leaves,
            combined: DashMap::new(),
        }
    }
}

impl State {
    /// Register a new leaf state. Fails if the uid is already taken or contains
    /// characters reserved for combinator uids.
    pub fn new(uid: impl Into<String>) -> Result<Self> {
        let uid = uid.into();
        if uid.trim().is_empty() || uid.contains(RESERVED_CHARS) {
            return Err(StateError::InvalidUid(uid));
        }
        match REGISTRY.leaves.entry(uid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StateError::DuplicateUid(uid)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let state = State::node(uid, Kind::Leaf);
                slot.insert(state.clone());
                tracing::debug!(uid = %state.uid(), "registered state");
                Ok(state)
            }
        }
    }

    /// Look up a previously registered leaf (or built-in) by uid.
    pub fn registered(uid: &str) -> Option<Self> {
        REGISTRY.leaves.get(uid).map(|s| s.value().clone())
    }

    /// Default state of every key that has never been set.
    pub fn idle() -> Self {
        REGISTRY.idle.clone()
    }

    /// Wildcard matching every state. Never storable.
    pub fn any() -> Self {
        REGISTRY.any.clone()
    }

    /// Reported for a key whose transition is in progress.
    pub fn busy() -> Self {
        REGISTRY.busy.clone()
    }

    pub fn uid(&self) -> &str {
        &self.0.uid
    }

    pub fn is_idle(&self) -> bool {
        self.uid() == IDLE_UID
    }

    pub fn is_any(&self) -> bool {
        matches!(self.0.kind, Kind::Any)
    }

    pub fn is_busy(&self) -> bool {
        self.uid() == BUSY_UID
    }

    /// True if this expression accepts `candidate` as the active state.
    pub fn matches(&self, candidate: &State) -> bool {
        match &self.0.kind {
            Kind::Leaf => self.uid() == candidate.uid(),
            Kind::Any => true,
            Kind::Not(inner) => !inner.matches(candidate),
            Kind::And(a, b) => a.matches(candidate) && b.matches(candidate),
            Kind::Or(a, b) => a.matches(candidate) || b.matches(candidate),
            Kind::Xor(a, b) => a.matches(candidate) != b.matches(candidate),
        }
    }

    pub fn negate(&self) -> State {
        combine(Op::Not, self, None)
    }

    pub fn and(&self, other: &State) -> State {
        combine(Op::And, self, Some(other))
    }

    pub fn or(&self, other: &State) -> State {
        combine(Op::Or, self, Some(other))
    }

    pub fn xor(&self, other: &State) -> State {
        combine(Op::Xor, self, Some(other))
    }

    fn node(uid: String, kind: Kind) -> Self {
        State(Arc::new(Node { uid, kind }))
    }
}

// Operand order is kept as given: `a & b` and `b & a` are separate cache
// entries that evaluate identically.
fn combine(op: Op, left: &State, right: Option<&State>) -> State {
    let key = (
        op,
        left.uid().to_string(),
        right.map(|r| r.uid().to_string()).unwrap_or_default(),
    );
    REGISTRY
        .combined
        .entry(key)
        .or_insert_with(|| {
            let (uid, kind) = match (op, right) {
                (Op::Not, _) | (_, None) => (format!("~{left}"), Kind::Not(left.clone())),
                (Op::And, Some(r)) => (
                    format!("({left} & {r})"),
                    Kind::And(left.clone(), r.clone()),
                ),
                (Op::Or, Some(r)) => (
                    format!("({left} | {r})"),
                    Kind::Or(left.clone(), r.clone()),
                ),
                (Op::Xor, Some(r)) => (
                    format!("({left} ^ {r})"),
                    Kind::Xor(left.clone(), r.clone()),
                ),
            };
            State::node(uid, kind)
        })
        .value()
        .clone()
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl Eq for State {}

impl Hash for State {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid().hash(state);
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uid())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.uid()).finish()
    }
}

impl Not for &State {
    type Output = State;

    fn not(self) -> State {
        self.negate()
    }
}

impl Not for State {
    type Output = State;

    fn not(self) -> State {
        self.negate()
    }
}

macro_rules! binary_op {
    ($trait:ident, $method:ident, $combinator:ident) => {
        impl $trait<&State> for &State {
            type Output = State;

            fn $method(self, rhs: &State) -> State {
                self.$combinator(rhs)
            }
        }

        impl $trait<State> for State {
            type Output = State;

            fn $method(self, rhs: State) -> State {
                self.$combinator(&rhs)
            }
        }
    };
}

binary_op!(BitAnd, bitand, and);
binary_op!(BitOr, bitor, or);
binary_op!(BitXor, bitxor, xor);
