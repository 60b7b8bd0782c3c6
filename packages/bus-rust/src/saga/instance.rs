//! Saga instances and their states.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;

use courier_core::{CorrelationId, MessageId};
use serde::{Deserialize, Serialize};

/// Domain data carried by a saga instance.
pub trait SagaData: Clone + Default + fmt::Debug + Send + Sync + 'static {}

impl<T> SagaData for T where T: Clone + Default + fmt::Debug + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A named state of a state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Cow<'static, str>);

impl State {
    /// Every instance starts here before its first transition.
    pub const INITIAL: State = State(Cow::Borrowed("Initial"));
    /// Terminal state entered by `finalize`.
    pub const FINAL: State = State(Cow::Borrowed("Final"));

    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        *self == Self::FINAL
    }
}

impl From<&'static str> for State {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

impl From<String> for State {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// SagaInstance
// ---------------------------------------------------------------------------

/// A long-lived process instance keyed by its correlation id.
///
/// `current_state` only changes through the state machine, which keeps it
/// inside the machine's declared state set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance<D> {
    correlation_id: CorrelationId,
    current_state: State,
    pub data: D,
    /// Most recent message ids applied to this instance, oldest first.
    applied: VecDeque<MessageId>,
}

impl<D: SagaData> SagaInstance<D> {
    /// A fresh instance in [`State::INITIAL`] with default data.
    #[must_use]
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self::with_data(correlation_id, D::default())
    }

    #[must_use]
    pub fn with_data(correlation_id: CorrelationId, data: D) -> Self {
        Self {
            correlation_id,
            current_state: State::INITIAL,
            data,
            applied: VecDeque::new(),
        }
    }
}

impl<D> SagaInstance<D> {
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    #[must_use]
    pub fn current_state(&self) -> &State {
        &self.current_state
    }

    pub(crate) fn set_current_state(&mut self, state: State) {
        self.current_state = state;
    }

    /// Whether the instance reached [`State::FINAL`].
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.current_state.is_final()
    }

    #[must_use]
    pub fn has_applied(&self, message_id: MessageId) -> bool {
        self.applied.contains(&message_id)
    }

    /// Remembers `message_id`, evicting the oldest ids beyond `window`.
    pub(crate) fn record_applied(&mut self, message_id: MessageId, window: usize) {
        if window == 0 {
            return;
        }
        self.applied.push_back(message_id);
        while self.applied.len() > window {
            self.applied.pop_front();
        }
    }

    #[must_use]
    pub fn applied_message_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.applied.iter()
    }
}
