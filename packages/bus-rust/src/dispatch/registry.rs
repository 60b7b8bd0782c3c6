use std::collections::HashMap;
use std::fmt;

use courier_core::Message;

// ---------------------------------------------------------------------------
// MessageTypeId
// ---------------------------------------------------------------------------

/// Dense index assigned to a message type at configuration time.
///
/// Ids start at 0 and follow registration order, so they can index a slice
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeId(usize);

impl MessageTypeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageTypeRegistry
// ---------------------------------------------------------------------------

/// Registry of the message types a dispatcher serves.
///
/// Provides two lookup directions:
/// - **By name** (`id_of`): wire type name to its [`MessageTypeId`]
/// - **By id** (`name_of`): the reverse, for diagnostics
///
/// Registration is idempotent: registering a name twice returns the same id.
#[derive(Debug, Clone, Default)]
pub struct MessageTypeRegistry {
    by_name: HashMap<String, MessageTypeId>,
    names: Vec<String>,
}

impl MessageTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `message_type` and returns its id.
    pub fn register(&mut self, message_type: &str) -> MessageTypeId {
        if let Some(id) = self.by_name.get(message_type) {
            return *id;
        }
        let id = MessageTypeId(self.names.len());
        self.by_name.insert(message_type.to_string(), id);
        self.names.push(message_type.to_string());
        id
    }

    /// Registers the wire name of `M`.
    pub fn register_message<M: Message>(&mut self) -> MessageTypeId {
        self.register(M::MESSAGE_TYPE)
    }

    #[must_use]
    pub fn id_of(&self, message_type: &str) -> Option<MessageTypeId> {
        self.by_name.get(message_type).copied()
    }

    #[must_use]
    pub fn name_of(&self, id: MessageTypeId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Registered types in id order.
    pub fn iter(&self) -> impl Iterator<Item = (MessageTypeId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (MessageTypeId(i), name.as_str()))
    }
}
