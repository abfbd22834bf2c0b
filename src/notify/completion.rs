//! Fires the completion notification when a batch closes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{BatchReport, Notifier};
use crate::error::QueueError;
use crate::scheduler::batch::BatchId;
use crate::scheduler::queue::QueueStore;

/// A batch that closed during this check.
#[derive(Debug, Clone)]
pub struct BatchClosed {
    pub report: BatchReport,
    /// Whether the notifier accepted the message.
    pub delivered: bool,
}

/// Checks batch closure after every terminal transition.
///
/// Each batch closes exactly once because only one task can be the last
/// to leave the non-terminal states, and the driver calls this right after
/// that transition.
pub struct BatchCompletionNotifier {
    notifier: Arc<dyn Notifier>,
    from: String,
}

impl BatchCompletionNotifier {
    pub fn new(notifier: Arc<dyn Notifier>, from: impl Into<String>) -> Self {
        Self {
            notifier,
            from: from.into(),
        }
    }

    /// Sends the batch report if every task of `batch_id` is terminal.
    ///
    /// Delivery failures are logged, never returned.
    pub async fn on_terminal(
        &self,
        store: &QueueStore,
        batch_id: &BatchId,
    ) -> Result<Option<BatchClosed>, QueueError> {
        let table = store.snapshot()?;
        let tasks = table.batch(batch_id.as_str());
        let Some(report) = BatchReport::closed(batch_id, &tasks) else {
            debug!(batch = %batch_id, "Batch still open");
            return Ok(None);
        };

        let notification = report.notification(&self.from);
        let delivered = match self.notifier.send(&notification).await {
            Ok(()) => {
                info!(
                    batch = %batch_id,
                    to = %notification.to,
                    verdict = %report.verdict(),
                    "Batch complete, notification sent"
                );
                true
            }
            Err(e) => {
                warn!(batch = %batch_id, error = %e, "Batch complete, notification failed");
                false
            }
        };

        Ok(Some(BatchClosed { report, delivered }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::notify::{Notification, Verdict};
    use crate::scheduler::job::TaskStatus;
    use crate::scheduler::queue::tests::task;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                return Err(NotifyError::Rejected {
                    code: 75,
                    stderr: "relay unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn store_with(temp: &TempDir, tasks: &[(&str, &str, TaskStatus)]) -> QueueStore {
        let store = QueueStore::new(temp.path().join("queue.csv"));
        let records: Vec<_> = tasks.iter().map(|(b, i, s)| task(b, i, *s)).collect();
        store.append(&records).unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_batch_sends_nothing() {
        let temp = TempDir::new().unwrap();
        let store = store_with(
            &temp,
            &[
                ("A", "/a1", TaskStatus::Complete),
                ("A", "/a2", TaskStatus::Pending),
            ],
        );
        let outbox = Arc::new(Outbox::default());
        let notifier = BatchCompletionNotifier::new(outbox.clone(), "bot@example.com");

        let closed = notifier.on_terminal(&store, &BatchId::from("A")).await.unwrap();
        assert!(closed.is_none());
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_batch_sends_one_report() {
        let temp = TempDir::new().unwrap();
        let store = store_with(
            &temp,
            &[
                ("A", "/a1", TaskStatus::Complete),
                ("B", "/b1", TaskStatus::Pending),
                ("A", "/a2", TaskStatus::Failed),
            ],
        );
        let outbox = Arc::new(Outbox::default());
        let notifier = BatchCompletionNotifier::new(outbox.clone(), "bot@example.com");

        let closed = notifier
            .on_terminal(&store, &BatchId::from("A"))
            .await
            .unwrap()
            .unwrap();
        assert!(closed.delivered);
        assert_eq!(closed.report.verdict(), Verdict::Fail);
        assert_eq!(closed.report.total(), 2);

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[FAIL] Pattern Release : A");
        assert!(!sent[0].body.contains("/b1"));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let store = store_with(&temp, &[("A", "/a1", TaskStatus::Skipped)]);
        let outbox = Arc::new(Outbox {
            fail: true,
            ..Default::default()
        });
        let notifier = BatchCompletionNotifier::new(outbox, "bot@example.com");

        let closed = notifier
            .on_terminal(&store, &BatchId::from("A"))
            .await
            .unwrap()
            .unwrap();
        assert!(!closed.delivered);
        assert_eq!(closed.report.verdict(), Verdict::Pass);
    }
}
