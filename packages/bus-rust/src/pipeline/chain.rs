//! Filter chain: an ordered stack of stages in front of one consumer.

use std::sync::Arc;

use courier_core::{ConsumeContext, CorrelationId, OutboundMessage};
use parking_lot::Mutex;
use tower::util::BoxCloneService;
use tower::ServiceExt;

use crate::error::{ChainBuildError, DispatchError};
use crate::probe::ProbeScope;

// ---------------------------------------------------------------------------
// Service types
// ---------------------------------------------------------------------------

/// Type-erased service every stage wraps and every consumer provides.
pub type ConsumeService = BoxCloneService<ConsumeContext, ConsumeResponse, DispatchError>;

/// What a consumer did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// A saga instance was created or mutated. `duplicate` is set when the
    /// message id had already been applied and nothing ran.
    Consumed {
        correlation_id: CorrelationId,
        duplicate: bool,
    },
    /// A plain handler (or a missing-instance handler) ran.
    Handled,
    /// The message was dropped on purpose and observers were told why.
    Discarded { reason: String },
    /// A fault notification was produced for the message.
    Faulted { reason: String },
    /// The message was handed to the redelivery scheduler.
    Redelivered { attempt: u32 },
}

impl ConsumeOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Consumed {
                duplicate: false, ..
            } => "consumed",
            Self::Consumed {
                duplicate: true, ..
            } => "duplicate",
            Self::Handled => "handled",
            Self::Discarded { .. } => "discarded",
            Self::Faulted { .. } => "faulted",
            Self::Redelivered { .. } => "redelivered",
        }
    }
}

/// Response flowing back up the chain.
///
/// `outbox` holds the messages produced while consuming. The outbox stage
/// hands them to the transport once the inner chain succeeded.
#[derive(Debug)]
pub struct ConsumeResponse {
    pub outcome: ConsumeOutcome,
    pub outbox: Vec<OutboundMessage>,
}

impl ConsumeResponse {
    #[must_use]
    pub fn new(outcome: ConsumeOutcome) -> Self {
        Self {
            outcome,
            outbox: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_outbox(outcome: ConsumeOutcome, outbox: Vec<OutboundMessage>) -> Self {
        Self { outcome, outbox }
    }
}

// ---------------------------------------------------------------------------
// Stage / Consumer traits
// ---------------------------------------------------------------------------

/// A middleware stage that wraps the rest of the chain.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wraps `inner` for `message_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError::Stage`] if the stage cannot be configured for
    /// this message type.
    fn wrap(
        &self,
        message_type: &str,
        inner: ConsumeService,
    ) -> Result<ConsumeService, ChainBuildError>;

    fn probe(&self, _scope: &mut ProbeScope) {}
}

/// The terminal element of a chain.
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    /// Message types this consumer accepts.
    fn message_types(&self) -> Vec<String>;

    /// Builds the service consuming `message_type`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChainBuildError`] if the consumer cannot handle the type.
    fn service(&self, message_type: &str) -> Result<ConsumeService, ChainBuildError>;

    fn probe(&self, scope: &mut ProbeScope);
}

// ---------------------------------------------------------------------------
// FilterChain
// ---------------------------------------------------------------------------

/// A fully built chain for one message type.
///
/// The chain is immutable once built; each dispatch runs on its own clone of
/// the composed service.
pub struct FilterChain {
    message_type: String,
    stage_names: Vec<&'static str>,
    service: Mutex<ConsumeService>,
    probe: ProbeScope,
}

impl FilterChain {
    /// Composes `stages` (outermost first) around `consumer`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChainBuildError`] raised by the consumer or a stage.
    pub fn build(
        message_type: &str,
        stages: &[Arc<dyn Stage>],
        consumer: &dyn Consumer,
    ) -> Result<Self, ChainBuildError> {
        let mut service = consumer.service(message_type)?;
        for stage in stages.iter().rev() {
            service = stage.wrap(message_type, service)?;
        }

        let mut probe = ProbeScope::new("chain");
        probe.add("messageType", message_type);
        for stage in stages {
            let scope = probe.create_scope("stage");
            scope.add("name", stage.name());
            stage.probe(scope);
        }
        let scope = probe.create_scope("consumer");
        scope.add("name", consumer.name());
        consumer.probe(scope);

        Ok(Self {
            message_type: message_type.to_string(),
            stage_names: stages.iter().map(|s| s.name()).collect(),
            service: Mutex::new(service),
            probe,
        })
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    #[must_use]
    pub fn stage_names(&self) -> &[&'static str] {
        &self.stage_names
    }

    /// Runs `ctx` through the chain.
    ///
    /// # Errors
    ///
    /// Returns whatever error the stages or consumer produced.
    pub async fn dispatch(&self, ctx: ConsumeContext) -> Result<ConsumeResponse, DispatchError> {
        let service = self.service.lock().clone();
        service.oneshot(ctx).await
    }

    /// Appends this chain's structure to `scope`.
    pub fn probe(&self, scope: &mut ProbeScope) {
        let chain = scope.create_scope(self.probe.name());
        *chain = self.probe.clone();
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("message_type", &self.message_type)
            .field("stages", &self.stage_names)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::Message;
    use serde::{Deserialize, Serialize};
    use tower::service_fn;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl Message for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
    }

    /// Records its name into a header on the way in.
    struct TagStage(&'static str);

    impl Stage for TagStage {
        fn name(&self) -> &'static str {
            self.0
        }

        fn wrap(
            &self,
            _message_type: &str,
            inner: ConsumeService,
        ) -> Result<ConsumeService, ChainBuildError> {
            let tag = self.0;
            Ok(BoxCloneService::new(service_fn(move |mut ctx: ConsumeContext| {
                let inner = inner.clone();
                let trail = ctx.headers_mut().entry("trail".to_string()).or_default();
                trail.push_str(tag);
                inner.oneshot(ctx)
            })))
        }
    }

    struct FailingStage;

    impl Stage for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn wrap(
            &self,
            message_type: &str,
            _inner: ConsumeService,
        ) -> Result<ConsumeService, ChainBuildError> {
            Err(ChainBuildError::Stage {
                stage: "failing",
                message_type: message_type.to_string(),
                reason: "misconfigured".to_string(),
            })
        }
    }

    /// Reports the collected header trail as a discard reason.
    struct TrailConsumer;

    impl Consumer for TrailConsumer {
        fn name(&self) -> &str {
            "trail"
        }

        fn message_types(&self) -> Vec<String> {
            vec![Ping::MESSAGE_TYPE.to_string()]
        }

        fn service(&self, _message_type: &str) -> Result<ConsumeService, ChainBuildError> {
            Ok(BoxCloneService::new(service_fn(|ctx: ConsumeContext| async move {
                let reason = ctx.delivery().headers.get("trail").cloned().unwrap_or_default();
                Ok::<_, DispatchError>(ConsumeResponse::new(ConsumeOutcome::Discarded { reason }))
            })))
        }

        fn probe(&self, scope: &mut ProbeScope) {
            scope.add("kind", "test");
        }
    }

    #[tokio::test]
    async fn stages_run_outermost_first() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(TagStage("a")), Arc::new(TagStage("b"))];
        let chain = FilterChain::build(Ping::MESSAGE_TYPE, &stages, &TrailConsumer).unwrap();

        let resp = chain
            .dispatch(ConsumeContext::for_message(&Ping).unwrap())
            .await
            .unwrap();
        assert_eq!(
            resp.outcome,
            ConsumeOutcome::Discarded {
                reason: "ab".to_string()
            }
        );
        assert_eq!(chain.stage_names(), &["a", "b"]);
    }

    #[test]
    fn stage_failure_aborts_build() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(TagStage("a")), Arc::new(FailingStage)];
        let err = FilterChain::build(Ping::MESSAGE_TYPE, &stages, &TrailConsumer).unwrap_err();
        assert!(matches!(err, ChainBuildError::Stage { stage: "failing", .. }));
    }

    #[test]
    fn probe_describes_stages_and_consumer() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(TagStage("a"))];
        let chain = FilterChain::build(Ping::MESSAGE_TYPE, &stages, &TrailConsumer).unwrap();

        let mut root = ProbeScope::new("root");
        chain.probe(&mut root);
        let probed = root.child("chain").unwrap();
        assert_eq!(probed.entry("messageType").unwrap(), "test.ping");
        assert_eq!(probed.child("consumer").unwrap().entry("kind").unwrap(), "test");
    }

    #[test]
    fn outcome_labels() {
        let id = CorrelationId::new();
        assert_eq!(
            ConsumeOutcome::Consumed {
                correlation_id: id,
                duplicate: true
            }
            .label(),
            "duplicate"
        );
        assert_eq!(ConsumeOutcome::Redelivered { attempt: 1 }.label(), "redelivered");
    }
}
