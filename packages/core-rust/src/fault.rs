//! Fault notification synthesized when a message cannot be processed.

use serde::{Deserialize, Serialize};

use crate::context::ConsumeContext;
use crate::message::{Envelope, Message};
use crate::types::{now_millis, CorrelationId, MessageId};

/// Terminal failure report for a consumed message.
///
/// Carries the original envelope so the fault consumer can inspect or replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub fault_id: MessageId,
    pub faulted_message_id: MessageId,
    pub faulted_message_type: String,
    pub correlation_id: Option<CorrelationId>,
    pub request_id: Option<MessageId>,
    pub reason: String,
    pub timestamp_millis: u64,
    pub original: Envelope,
}

impl Message for Fault {
    const MESSAGE_TYPE: &'static str = "courier.fault";
}

impl Fault {
    /// Builds a fault for the message held by `ctx`.
    #[must_use]
    pub fn for_message(ctx: &ConsumeContext, reason: impl Into<String>) -> Self {
        Self {
            fault_id: MessageId::new(),
            faulted_message_id: ctx.message_id(),
            faulted_message_type: ctx.message_type().to_string(),
            correlation_id: ctx.correlation_id(),
            request_id: ctx.delivery().request_id,
            reason: reason.into(),
            timestamp_millis: now_millis(),
            original: ctx.envelope().clone(),
        }
    }
}
