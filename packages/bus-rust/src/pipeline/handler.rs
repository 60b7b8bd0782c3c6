//! Plain message handlers as chain consumers.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use courier_core::{ConsumeContext, Message, OutboundMessage};
use tower::service_fn;
use tower::util::BoxCloneService;

use super::chain::{ConsumeOutcome, ConsumeResponse, ConsumeService, Consumer};
use crate::error::{ChainBuildError, DispatchError};
use crate::probe::ProbeScope;

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<OutboundMessage>>> + Send>>;
type HandlerFn = Arc<dyn Fn(ConsumeContext) -> HandlerFuture + Send + Sync>;

/// Consumer that decodes `M` and hands it to an async closure.
///
/// The closure returns the messages it wants sent; they go through the
/// outbox like saga-produced messages.
pub struct HandlerConsumer<M> {
    name: String,
    handler: HandlerFn,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> HandlerConsumer<M> {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ConsumeContext, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<OutboundMessage>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |ctx: ConsumeContext| -> HandlerFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let message = ctx.message::<M>()?;
                handler(ctx, message).await
            })
        });
        Self {
            name: name.into(),
            handler: erased,
            _message: PhantomData,
        }
    }
}

impl<M: Message> Consumer for HandlerConsumer<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn message_types(&self) -> Vec<String> {
        vec![M::MESSAGE_TYPE.to_string()]
    }

    fn service(&self, message_type: &str) -> Result<ConsumeService, ChainBuildError> {
        if message_type != M::MESSAGE_TYPE {
            return Err(ChainBuildError::NoConsumer {
                message_type: message_type.to_string(),
            });
        }
        let handler = self.handler.clone();
        Ok(BoxCloneService::new(service_fn(move |ctx: ConsumeContext| {
            let fut = handler(ctx);
            async move {
                let outbox = fut.await.map_err(DispatchError::Handler)?;
                Ok(ConsumeResponse::with_outbox(ConsumeOutcome::Handled, outbox))
            }
        })))
    }

    fn probe(&self, scope: &mut ProbeScope) {
        scope.add("kind", "handler");
        scope.add("messageType", M::MESSAGE_TYPE);
    }
}
