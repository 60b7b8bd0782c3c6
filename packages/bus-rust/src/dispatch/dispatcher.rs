//! Type-indexed dispatch: selects, lazily builds and invokes the filter chain
//! for an inbound message's type.

use std::sync::Arc;

use courier_core::ConsumeContext;
use tokio::sync::OnceCell;

use super::registry::{MessageTypeId, MessageTypeRegistry};
use crate::error::DispatchError;
use crate::observer::BusObserver;
use crate::pipeline::{ConsumeResponse, FilterChain, PipeSpecification};
use crate::probe::ProbeScope;

/// Routes messages to the filter chain registered for their type.
///
/// Each registered type owns one slot holding a single-assignment cell. The
/// first dispatch of a type builds its chain through the specification; racing
/// first dispatches wait for that one build and then share the published chain.
/// A failed build leaves the slot empty so a later dispatch retries it.
pub struct TypeIndexedDispatcher {
    specification: Arc<dyn PipeSpecification>,
    registry: MessageTypeRegistry,
    slots: Box<[OnceCell<Arc<FilterChain>>]>,
    observer: Arc<dyn BusObserver>,
}

impl TypeIndexedDispatcher {
    /// Creates a dispatcher serving every message type of `specification`.
    #[must_use]
    pub fn new(specification: Arc<dyn PipeSpecification>, observer: Arc<dyn BusObserver>) -> Self {
        let mut registry = MessageTypeRegistry::new();
        for message_type in specification.message_types() {
            registry.register(&message_type);
        }
        let slots = (0..registry.len()).map(|_| OnceCell::new()).collect();
        Self {
            specification,
            registry,
            slots,
            observer,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    /// Dispatches `ctx` through the chain of its message type.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnregisteredMessageType`] for unknown types,
    /// [`DispatchError::ChainBuild`] if the chain could not be built, or any
    /// error the chain itself produced.
    pub async fn dispatch(&self, ctx: ConsumeContext) -> Result<ConsumeResponse, DispatchError> {
        let Some(id) = self.registry.id_of(ctx.message_type()) else {
            return Err(DispatchError::UnregisteredMessageType {
                message_type: ctx.message_type().to_string(),
            });
        };
        self.dispatch_by_id(id, ctx).await
    }

    /// Dispatches `ctx` through the chain in slot `id`.
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn dispatch_by_id(
        &self,
        id: MessageTypeId,
        ctx: ConsumeContext,
    ) -> Result<ConsumeResponse, DispatchError> {
        let chain = self.chain(id).await?;
        chain.dispatch(ctx).await
    }

    /// Returns the chain in slot `id`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnregisteredMessageType`] for an unknown id or
    /// [`DispatchError::ChainBuild`] if the build failed.
    pub async fn chain(&self, id: MessageTypeId) -> Result<Arc<FilterChain>, DispatchError> {
        let (Some(slot), Some(message_type)) = (self.slots.get(id.index()), self.registry.name_of(id))
        else {
            return Err(DispatchError::UnregisteredMessageType {
                message_type: id.to_string(),
            });
        };

        let chain = slot
            .get_or_try_init(|| async {
                let chain = self.specification.build(message_type).inspect_err(|err| {
                    tracing::warn!(message_type, error = %err, "filter chain build failed");
                })?;
                self.observer
                    .on_chain_built(message_type, chain.stage_names().len());
                Ok::<_, DispatchError>(Arc::new(chain))
            })
            .await?;
        Ok(chain.clone())
    }

    /// Number of chains built so far.
    #[must_use]
    pub fn built_chains(&self) -> usize {
        self.slots.iter().filter(|slot| slot.initialized()).count()
    }

    /// Describes the endpoint and every chain built so far. Never builds a
    /// chain and never blocks a dispatch.
    pub fn probe(&self, scope: &mut ProbeScope) {
        let dispatcher = scope.create_scope("dispatcher");
        self.specification.probe(dispatcher);
        for slot in self.slots.iter() {
            if let Some(chain) = slot.get() {
                chain.probe(dispatcher);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
