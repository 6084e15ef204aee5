//! Domain events emitted by the network aggregate.
//!
//! These are the only signals the saga router reacts to. `Cleared` is
//! published on the bus but never written to the event store.

use serde::{Deserialize, Serialize};

use crate::types::Block;

/// A network-level domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// The network resumes after `height` (`None` = before genesis).
    Initialized {
        request_id: String,
        height: Option<u64>,
    },
    /// A contiguous run of blocks was appended.
    BlocksAdded {
        request_id: String,
        blocks: Vec<Block>,
    },
    /// History above `height` was discarded; `blocks` are the dropped blocks, newest first.
    Reorganized {
        request_id: String,
        height: Option<u64>,
        blocks: Vec<Block>,
    },
    /// All durable state was wiped by an operator-confirmed reset.
    Cleared { request_id: String },
}

impl NetworkEvent {
    /// Stable name used as the stored `event_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => "initialized",
            Self::BlocksAdded { .. } => "blocks_added",
            Self::Reorganized { .. } => "reorganized",
            Self::Cleared { .. } => "cleared",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Initialized { request_id, .. }
            | Self::BlocksAdded { request_id, .. }
            | Self::Reorganized { request_id, .. }
            | Self::Cleared { request_id } => request_id,
        }
    }

    /// The network height after this event is applied.
    pub fn block_height(&self) -> Option<u64> {
        match self {
            Self::Initialized { height, .. } | Self::Reorganized { height, .. } => *height,
            Self::BlocksAdded { blocks, .. } => blocks.last().map(|b| b.number),
            Self::Cleared { .. } => None,
        }
    }
}

impl std::fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.block_height() {
            Some(h) => write!(f, "{}@{h}", self.kind()),
            None => write!(f, "{}", self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_added_height_is_last_block() {
        let ev = NetworkEvent::BlocksAdded {
            request_id: "r".into(),
            blocks: vec![Block::new(4, "0x4", "0x3"), Block::new(5, "0x5", "0x4")],
        };
        assert_eq!(ev.block_height(), Some(5));
        assert_eq!(ev.kind(), "blocks_added");
        assert_eq!(ev.to_string(), "blocks_added@5");
    }

    #[test]
    fn tagged_serialization() {
        let ev = NetworkEvent::Initialized {
            request_id: "r".into(),
            height: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "initialized");
        assert!(json["height"].is_null());
        let back: NetworkEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
