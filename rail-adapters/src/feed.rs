//! In-process rail feed
//!
//! An append-only, cursor-addressed log of raw rail messages. Processors and
//! chain indexers publish into it; adapters read from it and acknowledge
//! consumed offsets so a restarted adapter resumes where the last one
//! committed.

use crate::{
    types::{RailCursor, RawRailMessage},
    Error, Result,
};
use bytes::Bytes;
use chrono::Utc;
use ledger_core::RailKind;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct FeedState {
    messages: Vec<RawRailMessage>,
    /// consumer name -> acknowledged cursor
    acknowledged: HashMap<String, RailCursor>,
}

/// Shared feed handle (cheap to clone)
#[derive(Debug, Clone)]
pub struct RailFeed {
    rail_kind: RailKind,
    state: Arc<RwLock<FeedState>>,
}

impl RailFeed {
    /// Create empty feed for a rail
    pub fn new(rail_kind: RailKind) -> Self {
        Self {
            rail_kind,
            state: Arc::new(RwLock::new(FeedState::default())),
        }
    }

    /// Rail this feed carries
    pub fn rail_kind(&self) -> RailKind {
        self.rail_kind
    }

    /// Append a raw payload, returning its cursor
    pub fn publish(&self, payload: impl Into<Bytes>) -> RailCursor {
        let mut state = self.state.write();
        let cursor = RailCursor(state.messages.len() as u64);
        state.messages.push(RawRailMessage {
            rail_kind: self.rail_kind,
            cursor,
            payload: payload.into(),
            received_at: Utc::now(),
        });
        tracing::trace!(rail = %self.rail_kind, cursor = %cursor, "Rail message published");
        cursor
    }

    /// Read up to `max` messages starting at `from`
    pub fn read_from(&self, from: RailCursor, max: usize) -> Result<Vec<RawRailMessage>> {
        let state = self.state.read();
        let len = state.messages.len() as u64;
        if from.0 > len {
            return Err(Error::InvalidCursor {
                cursor: from.0,
                len,
            });
        }
        Ok(state
            .messages
            .iter()
            .skip(from.0 as usize)
            .take(max)
            .cloned()
            .collect())
    }

    /// Number of published messages
    pub fn len(&self) -> u64 {
        self.state.read().messages.len() as u64
    }

    /// Whether nothing was published yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `consumer` processed everything before `cursor`
    pub fn acknowledge(&self, consumer: &str, cursor: RailCursor) -> Result<()> {
        let mut state = self.state.write();
        let len = state.messages.len() as u64;
        if cursor.0 > len {
            return Err(Error::InvalidCursor {
                cursor: cursor.0,
                len,
            });
        }
        let acked = state
            .acknowledged
            .entry(consumer.to_string())
            .or_insert(RailCursor::START);
        // Acknowledgements never move backwards
        if cursor > *acked {
            *acked = cursor;
        }
        Ok(())
    }

    /// Last acknowledged cursor for `consumer`
    pub fn acknowledged(&self, consumer: &str) -> RailCursor {
        self.state
            .read()
            .acknowledged
            .get(consumer)
            .copied()
            .unwrap_or(RailCursor::START)
    }
}
