//! Correlation of inbound messages to saga instances.

use std::fmt;
use std::sync::Arc;

use courier_core::{ConsumeContext, CorrelationId};

use super::instance::{SagaData, SagaInstance};
use super::store::{FindOne, InstancePredicate, Loaded, SagaStore};
use crate::error::DispatchError;

/// Extracts the instance key from a message.
pub type IdSelector =
    Arc<dyn Fn(&ConsumeContext) -> Result<CorrelationId, DispatchError> + Send + Sync>;

/// Builds the instance predicate for one message.
pub type PredicateFactory<D> =
    Arc<dyn Fn(&ConsumeContext) -> Result<Box<InstancePredicate<D>>, DispatchError> + Send + Sync>;

/// How an event finds its instance.
pub enum CorrelationStrategy<D> {
    /// Exact lookup by the key the selector extracts.
    ById(IdSelector),
    /// Scan for the single instance satisfying a predicate over (instance,
    /// message). `select_id` supplies the key of an instance created when
    /// nothing matched.
    ByPredicate {
        predicate: PredicateFactory<D>,
        select_id: Option<IdSelector>,
    },
}

impl<D> Clone for CorrelationStrategy<D> {
    fn clone(&self) -> Self {
        match self {
            Self::ById(selector) => Self::ById(selector.clone()),
            Self::ByPredicate {
                predicate,
                select_id,
            } => Self::ByPredicate {
                predicate: predicate.clone(),
                select_id: select_id.clone(),
            },
        }
    }
}

impl<D> fmt::Debug for CorrelationStrategy<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl<D> CorrelationStrategy<D> {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ById(_) => "id",
            Self::ByPredicate { .. } => "predicate",
        }
    }
}

impl<D: SagaData> Default for CorrelationStrategy<D> {
    fn default() -> Self {
        Self::by_delivery_id()
    }
}

impl<D: SagaData> CorrelationStrategy<D> {
    /// Correlates on the correlation id carried in the delivery metadata.
    #[must_use]
    pub fn by_delivery_id() -> Self {
        Self::ById(Arc::new(|ctx: &ConsumeContext| {
            ctx.correlation_id()
                .ok_or_else(|| DispatchError::MissingCorrelationId {
                    message_type: ctx.message_type().to_string(),
                })
        }))
    }

    /// Whether `instance` is the one this message correlates to.
    ///
    /// Selector failures count as "no match".
    #[must_use]
    pub fn matches(&self, ctx: &ConsumeContext, instance: &SagaInstance<D>) -> bool {
        match self {
            Self::ById(selector) => {
                selector(ctx).is_ok_and(|id| id == instance.correlation_id())
            }
            Self::ByPredicate { predicate, .. } => {
                predicate(ctx).is_ok_and(|predicate| predicate(instance))
            }
        }
    }
}

/// Outcome of a correlation lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation<D> {
    Found(Loaded<D>),
    /// Nothing matched. `candidate_id` is the key a new instance would get,
    /// when the strategy can name one.
    NotFound { candidate_id: Option<CorrelationId> },
    /// A predicate matched more than one instance.
    Ambiguous { matches: usize },
}

/// Resolves messages against a saga store. Never writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationResolver;

impl CorrelationResolver {
    /// Finds the instance `ctx` correlates to under `strategy`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingCorrelationId`] (or whatever the
    /// selector produced) when no key can be extracted, and
    /// [`DispatchError::Store`] on backend failure.
    pub async fn resolve<D: SagaData>(
        strategy: &CorrelationStrategy<D>,
        ctx: &ConsumeContext,
        store: &dyn SagaStore<D>,
    ) -> Result<Correlation<D>, DispatchError> {
        match strategy {
            CorrelationStrategy::ById(selector) => {
                let id = selector(ctx)?;
                Ok(match store.load(id).await? {
                    Some(loaded) => Correlation::Found(loaded),
                    None => Correlation::NotFound {
                        candidate_id: Some(id),
                    },
                })
            }
            CorrelationStrategy::ByPredicate {
                predicate,
                select_id,
            } => {
                let predicate = predicate(ctx)?;
                Ok(match store.try_find_one(predicate.as_ref()).await? {
                    FindOne::Found(loaded) => Correlation::Found(loaded),
                    FindOne::Ambiguous { matches } => Correlation::Ambiguous { matches },
                    FindOne::NotFound => Correlation::NotFound {
                        candidate_id: select_id.as_ref().map(|select| select(ctx)).transpose()?,
                    },
                })
            }
        }
    }
}
