//! Saga state machines as an explicit transition table.
//!
//! A machine declares its states, its events (each bound to one message type
//! with a correlation strategy and an optional missing-instance policy) and a
//! table `(state, event) -> Transition { actions, next }`. The table is
//! validated once by [`StateMachineBuilder::build`]; nothing is discovered at
//! dispatch time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use courier_core::{ConsumeContext, CorrelationId, EndpointAddress, Message, OutboundMessage};

use super::correlation::{CorrelationStrategy, IdSelector, PredicateFactory};
use super::instance::{SagaData, SagaInstance, State};
use super::missing::MissingInstancePolicy;
use super::store::InstancePredicate;
use crate::error::DispatchError;
use crate::probe::ProbeScope;

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// A single declared action.
pub type Action<D> = Arc<dyn Fn(&mut BehaviorContext<'_, D>) -> anyhow::Result<()> + Send + Sync>;

/// What an action sees: the instance being mutated, the message that
/// triggered the transition, and the outbox its messages go to.
pub struct BehaviorContext<'a, D> {
    instance: &'a mut SagaInstance<D>,
    consume: &'a ConsumeContext,
    outbox: &'a mut Vec<OutboundMessage>,
}

impl<'a, D> BehaviorContext<'a, D> {
    pub(crate) fn new(
        instance: &'a mut SagaInstance<D>,
        consume: &'a ConsumeContext,
        outbox: &'a mut Vec<OutboundMessage>,
    ) -> Self {
        Self {
            instance,
            consume,
            outbox,
        }
    }

    #[must_use]
    pub fn data(&self) -> &D {
        &self.instance.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.instance.data
    }

    #[must_use]
    pub fn instance(&self) -> &SagaInstance<D> {
        self.instance
    }

    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.instance.correlation_id()
    }

    #[must_use]
    pub fn consume(&self) -> &ConsumeContext {
        self.consume
    }

    /// Decodes the triggering message.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not an `M`.
    pub fn message<M: Message>(&self) -> anyhow::Result<M> {
        Ok(self.consume.message()?)
    }

    /// Queues a publish of `message`, correlated with this instance.
    ///
    /// # Errors
    ///
    /// Fails if `message` cannot be encoded.
    pub fn publish<M: Message>(&mut self, message: &M) -> anyhow::Result<()> {
        let out = self.consume.publish(message)?;
        self.push(out);
        Ok(())
    }

    /// Queues a response to the triggering message.
    ///
    /// # Errors
    ///
    /// Fails if `message` cannot be encoded.
    pub fn respond<M: Message>(&mut self, message: &M) -> anyhow::Result<()> {
        let out = self.consume.respond(message)?;
        self.push(out);
        Ok(())
    }

    /// Queues a send of `message` to `destination`.
    ///
    /// # Errors
    ///
    /// Fails if `message` cannot be encoded.
    pub fn send<M: Message>(&mut self, destination: EndpointAddress, message: &M) -> anyhow::Result<()> {
        let out = self.consume.send(destination, message)?;
        self.push(out);
        Ok(())
    }

    fn push(&mut self, mut out: OutboundMessage) {
        out.delivery.correlation_id = Some(self.instance.correlation_id());
        self.outbox.push(out);
    }
}

/// Ordered actions plus an optional target state.
pub struct Behavior<D> {
    actions: Vec<Action<D>>,
    target: Option<State>,
}

impl<D: SagaData> Default for Behavior<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: SagaData> Behavior<D> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            target: None,
        }
    }

    /// Appends an arbitrary action.
    #[must_use]
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut BehaviorContext<'_, D>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(action));
        self
    }

    /// Appends a publish of the message `build` returns.
    #[must_use]
    pub fn publish<M, F>(self, build: F) -> Self
    where
        M: Message,
        F: Fn(&BehaviorContext<'_, D>) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.then(move |ctx| {
            let message = build(&*ctx)?;
            ctx.publish(&message)
        })
    }

    /// Appends a response to the triggering message.
    #[must_use]
    pub fn respond<M, F>(self, build: F) -> Self
    where
        M: Message,
        F: Fn(&BehaviorContext<'_, D>) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.then(move |ctx| {
            let message = build(&*ctx)?;
            ctx.respond(&message)
        })
    }

    /// Appends a send to `destination`.
    #[must_use]
    pub fn send<M, F>(self, destination: EndpointAddress, build: F) -> Self
    where
        M: Message,
        F: Fn(&BehaviorContext<'_, D>) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.then(move |ctx| {
            let message = build(&*ctx)?;
            ctx.send(destination.clone(), &message)
        })
    }

    /// Moves the instance to `state` after the actions ran.
    #[must_use]
    pub fn transition_to(mut self, state: impl Into<State>) -> Self {
        self.target = Some(state.into());
        self
    }

    /// Moves the instance to [`State::FINAL`].
    #[must_use]
    pub fn finalize(self) -> Self {
        self.transition_to(State::FINAL)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Typed builder for an event bound to message type `M`.
///
/// Correlates on the delivery's correlation id unless told otherwise.
pub struct Event<D, M> {
    name: String,
    id_selector: Option<IdSelector>,
    predicate: Option<PredicateFactory<D>>,
    missing: Option<MissingInstancePolicy>,
    _message: PhantomData<fn() -> M>,
}

impl<D: SagaData, M: Message> Event<D, M> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_selector: None,
            predicate: None,
            missing: None,
            _message: PhantomData,
        }
    }

    /// Correlates on a key carried in the message body.
    #[must_use]
    pub fn correlate_by_id<F>(mut self, select: F) -> Self
    where
        F: Fn(&M) -> CorrelationId + Send + Sync + 'static,
    {
        self.id_selector = Some(Arc::new(
            move |ctx: &ConsumeContext| -> Result<CorrelationId, DispatchError> {
                Ok(select(&ctx.message::<M>()?))
            },
        ));
        self
    }

    /// Correlates on a predicate over (instance, message). Combine with
    /// [`correlate_by_id`](Self::correlate_by_id) to name the key of an
    /// instance created when nothing matches.
    ///
    /// An initial event without that key creates its instance under a fresh
    /// id. Two such copies arriving together both see no match and create two
    /// instances, after which the predicate is ambiguous. Select an id that
    /// is stable per conversation so the second insert conflicts and its
    /// retry correlates to the first.
    #[must_use]
    pub fn correlate_by<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SagaInstance<D>, &M) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.predicate = Some(Arc::new(
            move |ctx: &ConsumeContext| -> Result<Box<InstancePredicate<D>>, DispatchError> {
                let message = ctx.message::<M>()?;
                let predicate = predicate.clone();
                Ok(Box::new(move |instance: &SagaInstance<D>| {
                    predicate(instance, &message)
                }))
            },
        ));
        self
    }

    #[must_use]
    pub fn on_missing_instance(mut self, policy: MissingInstancePolicy) -> Self {
        self.missing = Some(policy);
        self
    }

    fn into_definition(self) -> EventDefinition<D> {
        let correlation = match (self.predicate, self.id_selector) {
            (Some(predicate), select_id) => CorrelationStrategy::ByPredicate {
                predicate,
                select_id,
            },
            (None, Some(selector)) => CorrelationStrategy::ById(selector),
            (None, None) => CorrelationStrategy::by_delivery_id(),
        };
        EventDefinition {
            name: self.name,
            message_type: M::MESSAGE_TYPE,
            correlation,
            missing: self.missing,
        }
    }
}

/// An event as stored in a built machine.
pub struct EventDefinition<D> {
    name: String,
    message_type: &'static str,
    correlation: CorrelationStrategy<D>,
    missing: Option<MissingInstancePolicy>,
}

impl<D> EventDefinition<D> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    #[must_use]
    pub fn correlation(&self) -> &CorrelationStrategy<D> {
        &self.correlation
    }

    #[must_use]
    pub fn missing_instance(&self) -> Option<&MissingInstancePolicy> {
        self.missing.as_ref()
    }
}

impl<D> fmt::Debug for EventDefinition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDefinition")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("correlation", &self.correlation)
            .field("missing", &self.missing)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// What happens when an event arrives in a state with no transition for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnhandledEventPolicy {
    #[default]
    Fault,
    Ignore,
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("state {state} is reserved")]
    ReservedState { state: State },
    #[error("state {state} is declared twice")]
    DuplicateState { state: State },
    #[error("event {event} is declared twice")]
    DuplicateEvent { event: String },
    #[error("events {first} and {second} both bind message type {message_type}")]
    DuplicateMessageType {
        message_type: String,
        first: String,
        second: String,
    },
    #[error("state {state} is not declared")]
    UnknownState { state: State },
    #[error("event {event} is not declared")]
    UnknownEvent { event: String },
    #[error("event {event} already has a transition in state {state}")]
    DuplicateTransition { state: State, event: String },
    #[error("event {event} cannot leave the final state")]
    TransitionFromFinal { event: String },
}

struct Transition<D> {
    actions: Vec<Action<D>>,
    next: Option<State>,
}

/// Result of applying an event to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Transitioned { from: State, to: State },
    /// The message id was already applied; nothing ran.
    Duplicate,
    /// No transition and the unhandled policy is `Ignore`.
    Ignored,
}

/// A validated saga state machine.
pub struct StateMachine<D> {
    name: String,
    states: Vec<State>,
    events: Vec<EventDefinition<D>>,
    by_message_type: HashMap<&'static str, usize>,
    transitions: HashMap<(State, usize), Transition<D>>,
    unhandled: UnhandledEventPolicy,
}

impl<D: SagaData> StateMachine<D> {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder<D> {
        StateMachineBuilder {
            name: name.into(),
            states: Vec::new(),
            events: Vec::new(),
            behaviors: Vec::new(),
            unhandled: UnhandledEventPolicy::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared states, including `Initial` and `Final`.
    #[must_use]
    pub fn states(&self) -> &[State] {
        &self.states
    }

    #[must_use]
    pub fn events(&self) -> &[EventDefinition<D>] {
        &self.events
    }

    /// Index of the event bound to `message_type`.
    #[must_use]
    pub fn event_for(&self, message_type: &str) -> Option<usize> {
        self.by_message_type.get(message_type).copied()
    }

    #[must_use]
    pub fn event(&self, index: usize) -> Option<&EventDefinition<D>> {
        self.events.get(index)
    }

    /// Whether event `index` creates instances (has a transition out of
    /// `Initial`).
    #[must_use]
    pub fn accepts_initial(&self, index: usize) -> bool {
        self.transitions.contains_key(&(State::INITIAL, index))
    }

    #[must_use]
    pub fn message_types(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|e| e.message_type.to_string())
            .collect()
    }

    /// Applies event `index` to `instance`, running the transition's actions
    /// in order and then moving to its target state.
    ///
    /// Messages already recorded on the instance are skipped. On error the
    /// instance may be partially mutated and must be thrown away.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnhandledEvent`] when there is no transition
    /// and the policy is `Fault`, or [`DispatchError::Handler`] when an action
    /// fails.
    pub fn apply(
        &self,
        index: usize,
        instance: &mut SagaInstance<D>,
        ctx: &ConsumeContext,
        outbox: &mut Vec<OutboundMessage>,
        idempotency_window: usize,
    ) -> Result<Applied, DispatchError> {
        if instance.has_applied(ctx.message_id()) {
            return Ok(Applied::Duplicate);
        }
        let from = instance.current_state().clone();
        let Some(transition) = self.transitions.get(&(from.clone(), index)) else {
            let event = self.events.get(index).map_or("?", |e| e.name.as_str());
            return match self.unhandled {
                UnhandledEventPolicy::Ignore => {
                    tracing::debug!(saga = %self.name, event, state = %from, "unhandled event ignored");
                    instance.record_applied(ctx.message_id(), idempotency_window);
                    Ok(Applied::Ignored)
                }
                UnhandledEventPolicy::Fault => Err(DispatchError::UnhandledEvent {
                    saga: self.name.clone(),
                    event: event.to_string(),
                    state: from.to_string(),
                }),
            };
        };

        let mut behavior = BehaviorContext::new(instance, ctx, outbox);
        for action in &transition.actions {
            action(&mut behavior)?;
        }
        let to = transition.next.clone().unwrap_or_else(|| from.clone());
        instance.set_current_state(to.clone());
        instance.record_applied(ctx.message_id(), idempotency_window);
        Ok(Applied::Transitioned { from, to })
    }

    /// Describes states, events and transitions.
    pub fn probe(&self, scope: &mut ProbeScope) {
        scope.add("saga", self.name.as_str());
        scope.add(
            "states",
            self.states.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
        );
        for (index, event) in self.events.iter().enumerate() {
            let child = scope.create_scope("event");
            child.add("name", event.name.as_str());
            child.add("messageType", event.message_type);
            child.add("correlation", event.correlation.label());
            child.add(
                "missingInstance",
                event.missing.as_ref().map_or("none", MissingInstancePolicy::label),
            );
            let mut from: Vec<_> = self
                .transitions
                .keys()
                .filter(|(_, e)| *e == index)
                .map(|(s, _)| s.name().to_string())
                .collect();
            from.sort();
            child.add("during", from);
        }
    }
}

impl<D> fmt::Debug for StateMachine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("events", &self.events.len())
            .field("transitions", &self.transitions.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct StateMachineBuilder<D> {
    name: String,
    states: Vec<State>,
    events: Vec<EventDefinition<D>>,
    behaviors: Vec<(State, String, Behavior<D>)>,
    unhandled: UnhandledEventPolicy,
}

impl<D: SagaData> StateMachineBuilder<D> {
    #[must_use]
    pub fn state(mut self, state: impl Into<State>) -> Self {
        self.states.push(state.into());
        self
    }

    #[must_use]
    pub fn states<S: Into<State>>(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.states.extend(states.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn event<M: Message>(mut self, event: Event<D, M>) -> Self {
        self.events.push(event.into_definition());
        self
    }

    /// Transition for `event` out of [`State::INITIAL`]; the event creates
    /// instances.
    #[must_use]
    pub fn initially(self, event: impl Into<String>, behavior: Behavior<D>) -> Self {
        self.during(State::INITIAL, event, behavior)
    }

    #[must_use]
    pub fn during(
        mut self,
        state: impl Into<State>,
        event: impl Into<String>,
        behavior: Behavior<D>,
    ) -> Self {
        self.behaviors.push((state.into(), event.into(), behavior));
        self
    }

    #[must_use]
    pub fn on_unhandled_event(mut self, policy: UnhandledEventPolicy) -> Self {
        self.unhandled = policy;
        self
    }

    /// Validates the definition and builds the transition table.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] for reserved, duplicate or unknown
    /// states and events, duplicate transitions, or transitions out of
    /// `Final`.
    pub fn build(self) -> Result<StateMachine<D>, DefinitionError> {
        let mut states = vec![State::INITIAL, State::FINAL];
        for state in self.states {
            if state.is_initial() || state.is_final() {
                return Err(DefinitionError::ReservedState { state });
            }
            if states.contains(&state) {
                return Err(DefinitionError::DuplicateState { state });
            }
            states.push(state);
        }

        let mut names = HashMap::new();
        let mut by_message_type: HashMap<&'static str, usize> = HashMap::new();
        for (index, event) in self.events.iter().enumerate() {
            if names.insert(event.name.clone(), index).is_some() {
                return Err(DefinitionError::DuplicateEvent {
                    event: event.name.clone(),
                });
            }
            if let Some(&first) = by_message_type.get(event.message_type) {
                return Err(DefinitionError::DuplicateMessageType {
                    message_type: event.message_type.to_string(),
                    first: self.events[first].name.clone(),
                    second: event.name.clone(),
                });
            }
            by_message_type.insert(event.message_type, index);
        }

        let declared: HashSet<&State> = states.iter().collect();
        let mut transitions = HashMap::new();
        for (state, event, behavior) in self.behaviors {
            if !declared.contains(&state) {
                return Err(DefinitionError::UnknownState { state });
            }
            if state.is_final() {
                return Err(DefinitionError::TransitionFromFinal { event });
            }
            let Some(&index) = names.get(&event) else {
                return Err(DefinitionError::UnknownEvent { event });
            };
            if let Some(target) = &behavior.target {
                if !declared.contains(target) || target.is_initial() {
                    return Err(DefinitionError::UnknownState {
                        state: target.clone(),
                    });
                }
            }
            let key = (state, index);
            if transitions.contains_key(&key) {
                return Err(DefinitionError::DuplicateTransition { state: key.0, event });
            }
            transitions.insert(
                key,
                Transition {
                    actions: behavior.actions,
                    next: behavior.target,
                },
            );
        }

        Ok(StateMachine {
            name: self.name,
            states,
            events: self.events,
            by_message_type,
            transitions,
            unhandled: self.unhandled,
        })
    }
}
