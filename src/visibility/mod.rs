//! Foreground/background reconciliation.
//!
//! A client that sat in the background may have lost its socket silently and
//! missed pushes. Coming back to the foreground reconnects when needed and
//! always re-pulls the unread counter.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection_manager::{ConnectionManager, ConnectionState};
use crate::notification::{ApiError, RefreshTrigger, UnreadCounter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Foreground => f.write_str("foreground"),
            Visibility::Background => f.write_str("background"),
        }
    }
}

/// What a foreground transition did
#[derive(Debug, Clone, PartialEq)]
pub struct ForegroundOutcome {
    pub connection: ConnectionState,
    pub unread: Result<u64, ApiError>,
}

pub struct VisibilityReconciler {
    connection: Arc<ConnectionManager>,
    unread: Arc<UnreadCounter>,
    last: Mutex<Option<Visibility>>,
}

impl VisibilityReconciler {
    pub fn new(connection: Arc<ConnectionManager>, unread: Arc<UnreadCounter>) -> Self {
        Self {
            connection,
            unread,
            last: Mutex::new(None),
        }
    }

    /// Feed one visibility signal. Returns `None` unless it was a transition
    /// to the foreground.
    pub async fn on_visibility_change(&self, visibility: Visibility) -> Option<ForegroundOutcome> {
        let previous = self.observe(visibility);
        if visibility != Visibility::Foreground || previous == Some(Visibility::Foreground) {
            return None;
        }
        Some(self.on_foreground().await)
    }

    /// Reconnect if needed and refresh the counter, both at once
    #[tracing::instrument(name = "visibility.foreground", skip(self))]
    pub async fn on_foreground(&self) -> ForegroundOutcome {
        let reconnect = async {
            if self.connection.is_connected() {
                ConnectionState::Connected
            } else {
                tracing::info!(
                    state = %self.connection.state(),
                    "Foregrounded while not connected, reconnecting"
                );
                self.connection.connect().await
            }
        };

        let refresh = self.unread.refresh(RefreshTrigger::Visibility);
        let (connection, unread) = tokio::join!(reconnect, refresh);

        if let Err(ref e) = unread {
            tracing::warn!(error = %e, "Unread refresh on foreground failed");
        }

        ForegroundOutcome { connection, unread }
    }

    /// Follow a visibility channel until it closes or the guard is dropped.
    ///
    /// The value present at spawn time is taken as the starting point and does
    /// not trigger anything by itself.
    pub fn spawn(self: &Arc<Self>, mut visibility: watch::Receiver<Visibility>) -> VisibilityGuard {
        let reconciler = self.clone();
        let handle = tokio::spawn(async move {
            let initial = *visibility.borrow_and_update();
            reconciler.observe(initial);

            while visibility.changed().await.is_ok() {
                let current = *visibility.borrow_and_update();
                reconciler.on_visibility_change(current).await;
            }
            tracing::debug!("Visibility channel closed");
        });

        VisibilityGuard { handle: Some(handle) }
    }

    fn observe(&self, visibility: Visibility) -> Option<Visibility> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.replace(visibility)
    }
}

/// Keeps a spawned visibility listener alive; aborts it on drop
pub struct VisibilityGuard {
    handle: Option<JoinHandle<()>>,
}

impl VisibilityGuard {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for VisibilityGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedCredentials;
    use crate::config::ConnectionConfig;
    use crate::dispatcher::EventDispatcher;
    use crate::notification::{NotificationApi, NotificationRecord, Page, PageQuery, RecordId};
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicU64,
    }

    #[async_trait]
    impl NotificationApi for CountingApi {
        async fn fetch_notifications(
            &self,
            _query: &PageQuery,
        ) -> Result<Page<NotificationRecord>, ApiError> {
            Err(ApiError::NotFound("unused".into()))
        }

        async fn fetch_unread_count(&self) -> Result<u64, ApiError> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn mark_read(&self, _id: &RecordId) -> Result<(), ApiError> {
            Ok(())
        }

        async fn mark_all_read(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        api: Arc<CountingApi>,
        connection: Arc<ConnectionManager>,
        reconciler: Arc<VisibilityReconciler>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let api = Arc::new(CountingApi::default());
        let connection = Arc::new(ConnectionManager::new(
            transport.clone(),
            Arc::new(SharedCredentials::new(Some("token".into()))),
            Arc::new(EventDispatcher::new()),
            ConnectionConfig {
                idle_timeout_ms: 0,
                backoff_jitter: 0.0,
                ..ConnectionConfig::default()
            },
        ));
        let unread = Arc::new(UnreadCounter::new(api.clone()));
        let reconciler = Arc::new(VisibilityReconciler::new(connection.clone(), unread));
        Fixture {
            transport,
            api,
            connection,
            reconciler,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_reconnects_and_refreshes() {
        let f = fixture();

        let outcome = f.reconciler.on_visibility_change(Visibility::Foreground).await.unwrap();
        assert_eq!(outcome.connection, ConnectionState::Connected);
        assert_eq!(outcome.unread, Ok(1));
        assert_eq!(f.transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_even_when_connected() {
        let f = fixture();
        f.connection.connect().await;

        f.reconciler.on_visibility_change(Visibility::Background).await;
        let outcome = f.reconciler.on_visibility_change(Visibility::Foreground).await.unwrap();

        assert_eq!(outcome.connection, ConnectionState::Connected);
        assert_eq!(f.api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_foreground_is_ignored() {
        let f = fixture();

        assert!(f.reconciler.on_visibility_change(Visibility::Foreground).await.is_some());
        assert!(f.reconciler.on_visibility_change(Visibility::Foreground).await.is_none());
        assert!(f.reconciler.on_visibility_change(Visibility::Background).await.is_none());
        assert!(f.reconciler.on_visibility_change(Visibility::Foreground).await.is_some());

        assert_eq!(f.api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_listener_recovers_silent_drop() {
        let f = fixture();
        f.connection.connect().await;

        let (tx, rx) = watch::channel(Visibility::Foreground);
        let guard = f.reconciler.spawn(rx);
        assert!(guard.is_running());

        tx.send(Visibility::Background).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Lost while backgrounded
        f.connection.disconnect().await;
        assert!(!f.transport.has_session());
        tx.send(Visibility::Foreground).unwrap();

        let mut state = f.connection.watch_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.transport.attempts(), 2);
        assert_eq!(f.api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_stops_listener() {
        let f = fixture();
        let (tx, rx) = watch::channel(Visibility::Background);
        let mut guard = f.reconciler.spawn(rx);

        guard.stop();
        assert!(!guard.is_running());

        let _ = tx.send(Visibility::Foreground);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.transport.attempts(), 0);
    }
}
