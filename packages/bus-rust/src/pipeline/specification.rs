//! Pipe specifications: the configuration-time recipe a dispatcher uses to
//! build the filter chain for each message type.

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_core::EndpointAddress;

use super::chain::{Consumer, FilterChain, Stage};
use super::stages::{ConcurrencyLimitLayer, ObserveLayer, OutboxLayer, RetryLayer, TimeoutLayer};
use crate::config::BusConfig;
use crate::error::ChainBuildError;
use crate::observer::BusObserver;
use crate::probe::ProbeScope;
use crate::transport::SendTransport;

/// Produces the chain for a message type.
///
/// `build` must be a pure function of configuration: calling it twice for the
/// same type yields equivalent chains and has no other side effect.
pub trait PipeSpecification: Send + Sync {
    /// Message types this specification can build chains for, in a stable order.
    fn message_types(&self) -> Vec<String>;

    /// Builds the chain for `message_type`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChainBuildError`] if no consumer handles the type or a
    /// stage refuses to build.
    fn build(&self, message_type: &str) -> Result<FilterChain, ChainBuildError>;

    fn probe(&self, _scope: &mut ProbeScope) {}
}

// ---------------------------------------------------------------------------
// EndpointSpecification
// ---------------------------------------------------------------------------

/// Specification for one receive endpoint.
///
/// Stage order (outermost to innermost):
/// 1. `ObserveLayer` -- notifications and tracing span around the whole dispatch
/// 2. `ConcurrencyLimitLayer` -- reject when overloaded before doing any work
/// 3. `RetryLayer` -- re-run the inner chain on transient failures
/// 4. `OutboxLayer` -- flush produced messages only after the attempt succeeded
/// 5. `TimeoutLayer` -- bound each attempt and honour cancellation
/// 6. stages added with [`add_stage`](Self::add_stage), in insertion order
/// 7. the consumer registered for the message type
pub struct EndpointSpecification {
    address: EndpointAddress,
    stages: Vec<Arc<dyn Stage>>,
    consumers: BTreeMap<String, Arc<dyn Consumer>>,
}

impl EndpointSpecification {
    #[must_use]
    pub fn new(
        config: &BusConfig,
        transport: Arc<dyn SendTransport>,
        observer: Arc<dyn BusObserver>,
    ) -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(ObserveLayer::new(observer)),
            Arc::new(ConcurrencyLimitLayer::new(config.max_concurrent_dispatches)),
            Arc::new(RetryLayer::new(config.retry.clone())),
            Arc::new(OutboxLayer::new(transport)),
            Arc::new(TimeoutLayer::new(config.dispatch_timeout())),
        ];
        Self {
            address: EndpointAddress::new(&config.endpoint),
            stages,
            consumers: BTreeMap::new(),
        }
    }

    /// A specification with no built-in stages.
    #[must_use]
    pub fn bare(address: EndpointAddress) -> Self {
        Self {
            address,
            stages: Vec::new(),
            consumers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Appends a stage directly in front of the consumer.
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Registers `consumer` for every message type it declares.
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError::DuplicateConsumer`] if one of its message
    /// types already has a consumer; nothing is registered in that case.
    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) -> Result<(), ChainBuildError> {
        let types = consumer.message_types();
        if let Some((message_type, existing)) = types
            .iter()
            .find_map(|t| self.consumers.get(t).map(|c| (t, c)))
        {
            return Err(ChainBuildError::DuplicateConsumer {
                message_type: message_type.clone(),
                existing: existing.name().to_string(),
            });
        }
        for message_type in types {
            self.consumers.insert(message_type, consumer.clone());
        }
        Ok(())
    }
}

impl PipeSpecification for EndpointSpecification {
    fn message_types(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    fn build(&self, message_type: &str) -> Result<FilterChain, ChainBuildError> {
        let consumer =
            self.consumers
                .get(message_type)
                .ok_or_else(|| ChainBuildError::NoConsumer {
                    message_type: message_type.to_string(),
                })?;
        FilterChain::build(message_type, &self.stages, consumer.as_ref())
    }

    fn probe(&self, scope: &mut ProbeScope) {
        scope.add("endpoint", self.address.as_str());
        scope.add("stages", self.stages.len());
        scope.add("messageTypes", self.message_types());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
