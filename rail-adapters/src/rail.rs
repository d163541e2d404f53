//! Rail adapter interface

use crate::{
    feed::RailFeed,
    types::{Observation, RailCursor, RawRailMessage},
    Result,
};
use async_trait::async_trait;
use ledger_core::RailKind;

/// Rail adapter capability
///
/// Delivery is at-least-once: an adapter may hand out the same message again
/// after a restart or a `seek`. Consumers absorb duplicates downstream.
#[async_trait]
pub trait RailAdapter: Send + Sync {
    /// Rail this adapter serves
    fn rail_kind(&self) -> RailKind;

    /// Adapter instance name (also the rail-side consumer id)
    fn name(&self) -> &str;

    /// Next batch of raw messages; empty when the rail has nothing new
    async fn poll_or_receive(&mut self) -> Result<Vec<RawRailMessage>>;

    /// Position of the next message `poll_or_receive` will return
    fn cursor(&self) -> RailCursor;

    /// Move the read position (rewind for redelivery)
    fn seek(&mut self, cursor: RailCursor);

    /// Rail-side acknowledgement of everything before `cursor`
    async fn acknowledge(&mut self, cursor: RailCursor) -> Result<()>;

    /// Convert a raw message into a canonical event plus its finality signal
    fn normalize(&self, message: &RawRailMessage) -> Result<Observation>;
}

/// Cursor bookkeeping shared by feed-backed adapters
#[derive(Debug, Clone)]
pub struct FeedConsumer {
    feed: RailFeed,
    name: String,
    position: RailCursor,
    batch_size: usize,
}

impl FeedConsumer {
    /// Resume `name` from its last acknowledged cursor
    pub fn resume(feed: RailFeed, name: impl Into<String>, batch_size: usize) -> Self {
        let name = name.into();
        let position = feed.acknowledged(&name);
        Self {
            feed,
            name,
            position,
            batch_size: batch_size.max(1),
        }
    }

    /// Consumer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying feed
    pub fn feed(&self) -> &RailFeed {
        &self.feed
    }

    /// Read the next batch and advance the position past it
    pub fn poll(&mut self) -> Result<Vec<RawRailMessage>> {
        let batch = self.feed.read_from(self.position, self.batch_size)?;
        if let Some(last) = batch.last() {
            self.position = last.cursor.next();
        }
        Ok(batch)
    }

    /// Read position
    pub fn position(&self) -> RailCursor {
        self.position
    }

    /// Move the read position
    pub fn seek(&mut self, cursor: RailCursor) {
        tracing::debug!(consumer = %self.name, from = %self.position, to = %cursor, "Rail cursor moved");
        self.position = cursor;
    }

    /// Commit on the rail side
    pub fn acknowledge(&self, cursor: RailCursor) -> Result<()> {
        self.feed.acknowledge(&self.name, cursor)
    }
}
