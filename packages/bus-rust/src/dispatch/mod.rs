//! Message type registry and the type-indexed dispatcher.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::TypeIndexedDispatcher;
pub use registry::{MessageTypeId, MessageTypeRegistry};
