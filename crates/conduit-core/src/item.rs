//! The per-item message model that flows along pipeline edges.

use serde_json::Value;

/// A single message traveling along a pipeline edge.
///
/// Generalizes the fixed-batch `Message` shape of a columnar runtime down to
/// one arbitrary JSON-shaped item per message, since elements here declare
/// their own ad hoc input schema rather than sharing one Arrow schema.
#[derive(Debug, Clone)]
pub enum Item {
    /// One unit of data flowing downstream.
    Value(Value),
    /// End-of-stream marker. Exactly one is sent per edge, after the last
    /// value, terminating the receiving element's pull loop.
    Eos,
}

impl Item {
    pub fn value(v: impl Into<Value>) -> Self {
        Item::Value(v.into())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::Eos => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::Eos => None,
        }
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Item::Eos)
    }
}

/// Sending half of an item edge.
pub type ItemTx = tokio::sync::mpsc::Sender<Item>;
/// Receiving half of an item edge.
pub type ItemRx = tokio::sync::mpsc::Receiver<Item>;

/// Default bounded channel capacity between stages. Kept at 1 so an edge
/// holds at most one in-flight item, per the strict one-at-a-time pull
/// invariant; the CLI's `--channel-capacity` flag may raise it.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

pub fn item_channel(capacity: usize) -> (ItemTx, ItemRx) {
    tokio::sync::mpsc::channel(capacity.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let item = Item::value(serde_json::json!({"a": 1}));
        assert!(!item.is_eos());
        assert_eq!(item.as_value().unwrap()["a"], 1);
    }

    #[test]
    fn eos_has_no_value() {
        let item = Item::Eos;
        assert!(item.is_eos());
        assert!(item.into_value().is_none());
    }
}
