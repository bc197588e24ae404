//! Result channel toward the Judge.
//!
//! A broadcast fan-out of terminal results. The broker delivers each result
//! here once, after it was recorded in the store. Subscribers that fall
//! behind lose the oldest results; the store still has them for polling.

use tokio::sync::broadcast;
use tracing::trace;

use super::submission::ExecutionResult;

/// Results buffered per subscriber before the oldest is dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Broadcasts terminal execution results.
#[derive(Debug, Clone)]
pub struct ResultChannel {
    tx: broadcast::Sender<ExecutionResult>,
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl ResultChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emits a result. Returns how many subscribers received it.
    pub fn deliver(&self, result: ExecutionResult) -> usize {
        let id = result.submission_id;
        // No subscribers is not an error; pollers read from the store.
        let receivers = self.tx.send(result).unwrap_or(0);
        trace!(submission_id = %id, receivers, "Result delivered");
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionResult> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::submission::{ResultBuilder, SubmissionId, SubmissionStatus};

    #[tokio::test]
    async fn test_subscribers_receive_results() {
        let channel = ResultChannel::default();
        let mut rx = channel.subscribe();

        let id = SubmissionId::new();
        let delivered = channel.deliver(ResultBuilder::new(id, SubmissionStatus::Done).build());
        assert_eq!(delivered, 1);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.submission_id, id);
    }

    #[test]
    fn test_deliver_without_subscribers() {
        let channel = ResultChannel::new(4);
        let delivered = channel.deliver(
            ResultBuilder::new(SubmissionId::new(), SubmissionStatus::Timeout).build(),
        );
        assert_eq!(delivered, 0);
        assert_eq!(channel.subscriber_count(), 0);
    }
}
