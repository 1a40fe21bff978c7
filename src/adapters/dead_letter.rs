//! Dead Letter Adapters
//!
//! Implements the `DeadLetterSink` port. Tickets land here once stock and
//! dedup state are committed but the durable write kept failing.

use async_trait::async_trait;
use tracing::error;

use crate::domain::ports::{DeadLetter, DeadLetterSink};
use crate::error::Result;

/// Dead-letter sink that reports through the logging system.
#[derive(Debug, Clone, Default)]
pub struct LoggingDeadLetterSink;

impl LoggingDeadLetterSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        let json = serde_json::to_string(&letter.ticket)?;
        error!(
            order_id = %letter.ticket.order_id,
            attempts = letter.attempts,
            last_error = %letter.last_error,
            ticket = %json,
            "Order ticket dead-lettered"
        );
        Ok(())
    }
}

/// In-memory dead-letter queue an operator (or a test) can drain.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    letters: parking_lot::Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    /// Copy of the queued letters.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Take every queued letter, leaving the queue empty.
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock())
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{OrderId, OrderTicket, UserId, VoucherId};
    use chrono::Utc;

    fn letter(id: i64) -> DeadLetter {
        DeadLetter {
            ticket: OrderTicket::new(OrderId(id), UserId(1), VoucherId(1)),
            attempts: 5,
            last_error: "db down".to_string(),
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_queue() {
        let queue = InMemoryDeadLetterQueue::new();
        assert!(queue.is_empty());

        queue.dead_letter(letter(1)).await.unwrap();
        queue.dead_letter(letter(2)).await.unwrap();
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].ticket.order_id, OrderId(1));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_logging_sink() {
        // Should not panic
        LoggingDeadLetterSink::new()
            .dead_letter(letter(1))
            .await
            .unwrap();
    }
}
