//! Notification Service boundary
//!
//! The projector emits one `ReceiptNotice` per issued receipt. Delivery
//! (email, push) belongs to the external Notification Service.

use crate::{receipt::ReceiptNotice, Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Sink for receipt notices
pub trait NotificationSink: Send + Sync {
    /// Hand a notice to the Notification Service
    fn receipt_issued(&self, notice: ReceiptNotice) -> Result<()>;
}

/// Discards notices
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn receipt_issued(&self, _notice: ReceiptNotice) -> Result<()> {
        Ok(())
    }
}

/// Forwards notices over an unbounded channel to a delivery task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ReceiptNotice>,
}

impl ChannelSink {
    /// Create sink and the receiving end for the delivery task
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReceiptNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelSink {
    fn receipt_issued(&self, notice: ReceiptNotice) -> Result<()> {
        self.sender
            .send(notice)
            .map_err(|_| Error::Notification("Notification channel closed".to_string()))
    }
}

/// Collects notices in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    notices: Mutex<Vec<ReceiptNotice>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far
    pub fn notices(&self) -> Vec<ReceiptNotice> {
        self.notices.lock().clone()
    }
}

impl NotificationSink for MemorySink {
    fn receipt_issued(&self, notice: ReceiptNotice) -> Result<()> {
        self.notices.lock().push(notice);
        Ok(())
    }
}
