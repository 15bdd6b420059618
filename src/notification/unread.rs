use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::metrics::NotificationMetrics;

use super::{ApiError, NotificationApi};

/// What caused an unread-count refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// A push event announced new unread state
    Push,
    /// The fallback timer fired
    Poll,
    /// The client returned to the foreground
    Visibility,
    /// A mark-as-read request succeeded
    AfterMutation,
    Manual,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::Push => "push",
            RefreshTrigger::Poll => "poll",
            RefreshTrigger::Visibility => "visibility",
            RefreshTrigger::AfterMutation => "after_mutation",
            RefreshTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for RefreshTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side unread counter, refreshed by pull.
///
/// Refreshes may overlap (push, timer and foreground triggers are independent).
/// Each refresh takes a ticket when it is issued, and a response is applied only
/// if no later-issued refresh has been applied already, so a slow stale answer
/// never overwrites a fresher one.
pub struct UnreadCounter {
    api: Arc<dyn NotificationApi>,
    value: watch::Sender<u64>,
    issued: AtomicU64,
    applied: Mutex<u64>,
}

impl UnreadCounter {
    pub fn new(api: Arc<dyn NotificationApi>) -> Self {
        let (value, _) = watch::channel(0);
        Self {
            api,
            value,
            issued: AtomicU64::new(0),
            applied: Mutex::new(0),
        }
    }

    /// Last applied value
    pub fn get(&self) -> u64 {
        *self.value.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.value.subscribe()
    }

    /// Pull the count and publish it. On error the published value is kept.
    #[tracing::instrument(name = "unread.refresh", skip(self), fields(trigger = %trigger))]
    pub async fn refresh(&self, trigger: RefreshTrigger) -> Result<u64, ApiError> {
        let ticket = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        match self.api.fetch_unread_count().await {
            Ok(count) => {
                NotificationMetrics::record_unread_refresh(trigger.as_str(), true);
                if !self.apply(ticket, count) {
                    tracing::debug!(
                        ticket = ticket,
                        count = count,
                        "Discarding stale unread count"
                    );
                }
                Ok(count)
            }
            Err(e) => {
                NotificationMetrics::record_unread_refresh(trigger.as_str(), false);
                tracing::debug!(error = %e, "Unread count refresh failed");
                Err(e)
            }
        }
    }

    fn apply(&self, ticket: u64, count: u64) -> bool {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if ticket < *applied {
            return false;
        }
        *applied = ticket;
        self.value.send_replace(count);
        NotificationMetrics::set_unread_count(count);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationRecord, Page, PageQuery, RecordId};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Answers unread-count calls from a queue; each answer can be held back
    /// until released, to interleave responses.
    struct ScriptedCounts {
        answers: Mutex<VecDeque<(Result<u64, ApiError>, Arc<Notify>)>>,
    }

    impl ScriptedCounts {
        fn new() -> Self {
            Self {
                answers: Mutex::new(VecDeque::new()),
            }
        }

        fn push(&self, answer: Result<u64, ApiError>) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.answers.lock().unwrap().push_back((answer, gate.clone()));
            gate
        }
    }

    #[async_trait]
    impl NotificationApi for ScriptedCounts {
        async fn fetch_notifications(
            &self,
            _query: &PageQuery,
        ) -> Result<Page<NotificationRecord>, ApiError> {
            Err(ApiError::NotFound("unused".into()))
        }

        async fn fetch_unread_count(&self) -> Result<u64, ApiError> {
            let (answer, gate) = self.answers.lock().unwrap().pop_front().expect("unexpected call");
            gate.notified().await;
            answer
        }

        async fn mark_read(&self, _id: &RecordId) -> Result<(), ApiError> {
            Ok(())
        }

        async fn mark_all_read(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_value() {
        let api = Arc::new(ScriptedCounts::new());
        api.push(Ok(4)).notify_one();
        let counter = UnreadCounter::new(api);
        let mut rx = counter.watch();

        assert_eq!(counter.refresh(RefreshTrigger::Manual).await, Ok(4));
        assert_eq!(counter.get(), 4);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 4);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_value() {
        let api = Arc::new(ScriptedCounts::new());
        api.push(Ok(2)).notify_one();
        api.push(Err(ApiError::Timeout)).notify_one();
        let counter = UnreadCounter::new(api);

        counter.refresh(RefreshTrigger::Poll).await.unwrap();
        assert_eq!(counter.refresh(RefreshTrigger::Poll).await, Err(ApiError::Timeout));
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        let api = Arc::new(ScriptedCounts::new());
        let first = api.push(Ok(10));
        let second = api.push(Ok(3));
        let counter = Arc::new(UnreadCounter::new(api));

        let slow = tokio::spawn({
            let counter = counter.clone();
            async move { counter.refresh(RefreshTrigger::Poll).await }
        });
        tokio::task::yield_now().await;
        let fast = tokio::spawn({
            let counter = counter.clone();
            async move { counter.refresh(RefreshTrigger::Push).await }
        });
        tokio::task::yield_now().await;

        second.notify_one();
        assert_eq!(fast.await.unwrap(), Ok(3));
        first.notify_one();
        assert_eq!(slow.await.unwrap(), Ok(10));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.get(), 3);
    }
}
