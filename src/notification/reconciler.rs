use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::NotificationsConfig;
use crate::dispatcher::{names, Event, EventDispatcher, Subscription};
use crate::metrics::NotificationMetrics;
use crate::tasks::UnreadPoller;

use super::{
    ApiError, NotificationApi, NotificationRecord, PageInfo, PageQuery, PaginatedView, RecordId,
    RefreshTrigger, UnreadCounter,
};

/// Which refresh triggers a reconciler arms
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub page_size: u32,
    /// Refresh the counter when `new_message` / `new_notification` arrive
    pub push_refresh: bool,
    /// Fallback polling interval; `None` disables the timer
    pub poll_interval: Option<Duration>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::from(&NotificationsConfig::default())
    }
}

impl From<&NotificationsConfig> for ReconcilerOptions {
    fn from(config: &NotificationsConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            push_refresh: config.push_refresh,
            poll_interval: config.polling.then(|| config.poll_interval()),
        }
    }
}

/// Keeps the materialized notification list and the unread counter in step
/// with the server.
///
/// Pull results are merged into a [`PaginatedView`]. Read flags are flipped
/// optimistically, before the request goes out, and never rolled back; the next
/// page-1 load is the correction. Push events only trigger a counter refresh,
/// they are not spliced into the list.
pub struct NotificationReconciler {
    inner: Arc<ReconcilerInner>,
    push: Mutex<Option<PushRefresh>>,
    poller: Mutex<Option<UnreadPoller>>,
}

struct ReconcilerInner {
    api: Arc<dyn NotificationApi>,
    unread: Arc<UnreadCounter>,
    view: RwLock<PaginatedView<NotificationRecord>>,
    revision: watch::Sender<u64>,
    page_size: u32,
    active: AtomicBool,
}

impl NotificationReconciler {
    /// Build the reconciler and arm the configured triggers.
    ///
    /// Handlers hold only a weak reference, so dropping the reconciler is
    /// enough to stop them.
    pub fn new(
        api: Arc<dyn NotificationApi>,
        unread: Arc<UnreadCounter>,
        dispatcher: &Arc<EventDispatcher>,
        options: ReconcilerOptions,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let inner = Arc::new(ReconcilerInner {
            api,
            unread,
            view: RwLock::new(PaginatedView::new()),
            revision,
            page_size: options.page_size.max(1),
            active: AtomicBool::new(true),
        });

        let push = options
            .push_refresh
            .then(|| PushRefresh::attach(dispatcher, &inner));

        let poller = options.poll_interval.and_then(|interval| match Handle::try_current() {
            Ok(handle) => Some(UnreadPoller::spawn_on(&handle, inner.unread.clone(), interval)),
            Err(_) => {
                tracing::warn!("No tokio runtime, unread polling disabled");
                None
            }
        });

        tracing::debug!(
            push_refresh = push.is_some(),
            polling = poller.is_some(),
            "Notification reconciler mounted"
        );

        Self {
            inner,
            push: Mutex::new(push),
            poller: Mutex::new(poller),
        }
    }

    /// Fetch one page and merge it. On error the view is left untouched.
    #[tracing::instrument(
        name = "notifications.load_page",
        skip(self),
        fields(page = query.page, limit = query.limit)
    )]
    pub async fn load_page(&self, query: PageQuery) -> Result<PageInfo, ApiError> {
        query.validate()?;

        let page = match self.inner.api.fetch_notifications(&query).await {
            Ok(page) => page,
            Err(e) => {
                NotificationMetrics::record_page_load(false);
                tracing::warn!(error = %e, "Page load failed, keeping last known view");
                return Err(e);
            }
        };

        let info = page.pagination;
        let received = page.data.len();
        self.inner.update_view(|view| view.merge_page(query.page, page.data, info));
        NotificationMetrics::record_page_load(true);

        tracing::debug!(
            received = received,
            total_pages = info.total_pages,
            "Page merged"
        );
        Ok(info)
    }

    /// Load the page after the last one merged (page 1 on an empty view)
    pub async fn load_next_page(&self) -> Result<PageInfo, ApiError> {
        let page = self.inner.read_view(|view| view.next_page());
        self.load_page(PageQuery::new(page, self.inner.page_size)).await
    }

    /// Reload page 1 (head truth)
    pub async fn reload(&self) -> Result<PageInfo, ApiError> {
        self.load_page(PageQuery::new(1, self.inner.page_size)).await
    }

    /// Mark one record read.
    ///
    /// The local flag flips when this is called, not when the returned future
    /// is first polled. The flip stays even if the request fails.
    pub fn mark_as_read(
        &self,
        id: RecordId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send + 'static {
        let found = self.inner.update_view(|view| view.mark_read(&id));
        if !found {
            tracing::debug!(id = %id, "Marking a record that is not materialized");
        }

        let inner = self.inner.clone();
        async move {
            let result = inner.api.mark_read(&id).await;
            inner.finish_mutation("mark_read", result).await
        }
    }

    /// Mark every materialized record read, then ask the server to do the same
    pub fn mark_all_as_read(&self) -> impl Future<Output = Result<(), ApiError>> + Send + 'static {
        let flipped = self.inner.update_view(|view| view.mark_all_read());
        tracing::debug!(flipped = flipped, "Marked all materialized records read");

        let inner = self.inner.clone();
        async move {
            let result = inner.api.mark_all_read().await;
            inner.finish_mutation("mark_all_read", result).await
        }
    }

    /// Refresh the counter now
    pub async fn refresh_unread(&self, trigger: RefreshTrigger) -> Result<u64, ApiError> {
        self.inner.unread.refresh(trigger).await
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.inner.read_view(|view| view.records().to_vec())
    }

    pub fn get(&self, id: &RecordId) -> Option<NotificationRecord> {
        self.inner.read_view(|view| view.get(id).cloned())
    }

    pub fn page_info(&self) -> Option<PageInfo> {
        self.inner.read_view(|view| view.page_info())
    }

    pub fn has_more(&self) -> bool {
        self.inner.read_view(|view| view.has_more())
    }

    pub fn unread_count(&self) -> u64 {
        self.inner.unread.get()
    }

    pub fn watch_unread(&self) -> watch::Receiver<u64> {
        self.inner.unread.watch()
    }

    /// Bumped on every change to the materialized view
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Release push subscriptions and stop the poll timer. Idempotent.
    pub fn teardown(&self) {
        let was_active = self.inner.active.swap(false, Ordering::AcqRel);

        if let Some(push) = self.push.lock().unwrap_or_else(PoisonError::into_inner).take() {
            push.detach();
        }
        let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut poller) = poller {
            poller.stop();
        }

        if was_active {
            tracing::debug!("Notification reconciler torn down");
        }
    }
}

impl Drop for NotificationReconciler {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl ReconcilerInner {
    /// Apply a mutation under a short write guard, then publish a new revision
    fn update_view<R>(&self, f: impl FnOnce(&mut PaginatedView<NotificationRecord>) -> R) -> R {
        let result = {
            let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut view)
        };
        self.revision.send_modify(|rev| *rev += 1);
        result
    }

    fn read_view<R>(&self, f: impl FnOnce(&PaginatedView<NotificationRecord>) -> R) -> R {
        let view = self.view.read().unwrap_or_else(PoisonError::into_inner);
        f(&view)
    }

    async fn finish_mutation(
        &self,
        kind: &'static str,
        result: Result<(), ApiError>,
    ) -> Result<(), ApiError> {
        NotificationMetrics::record_mutation(kind, result.is_ok());

        match result {
            Ok(()) => {
                if let Err(e) = self.unread.refresh(RefreshTrigger::AfterMutation).await {
                    tracing::debug!(error = %e, "Unread refresh after {} failed", kind);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(op = kind, error = %e, "Read-state request failed, local flag kept");
                Err(e)
            }
        }
    }

    /// Refresh the counter off the dispatch path
    fn spawn_refresh(&self, trigger: RefreshTrigger) {
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(trigger = %trigger, "No tokio runtime, skipping unread refresh");
            return;
        };

        let unread = self.unread.clone();
        handle.spawn(async move {
            if let Err(e) = unread.refresh(trigger).await {
                tracing::debug!(error = %e, "Push-triggered unread refresh failed");
            }
        });
    }

    fn on_read_notice(&self, event: &Event) -> anyhow::Result<()> {
        let notice: ReadNotice = event.decode()?;

        if notice.all {
            self.update_view(|view| view.mark_all_read());
        } else if let Some(id) = notice.id {
            self.update_view(|view| view.mark_read(&id));
        }

        self.spawn_refresh(RefreshTrigger::Push);
        Ok(())
    }
}

/// Body of `notification_read`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadNotice {
    #[serde(default, alias = "notificationId", alias = "_id")]
    id: Option<RecordId>,
    #[serde(default)]
    all: bool,
}

/// Push trigger: dispatcher subscriptions that refresh the unread counter.
///
/// Kept apart from the poll trigger so either can be disabled alone.
struct PushRefresh {
    subscriptions: Vec<Subscription>,
}

impl PushRefresh {
    fn attach(dispatcher: &Arc<EventDispatcher>, inner: &Arc<ReconcilerInner>) -> Self {
        let mut subscriptions = Vec::with_capacity(3);

        for name in [names::NEW_MESSAGE, names::NEW_NOTIFICATION] {
            let weak = Arc::downgrade(inner);
            subscriptions.push(dispatcher.on(name, move |_event| {
                if let Some(inner) = live(&weak) {
                    inner.spawn_refresh(RefreshTrigger::Push);
                }
                Ok(())
            }));
        }

        let weak = Arc::downgrade(inner);
        subscriptions.push(dispatcher.on(names::NOTIFICATION_READ, move |event| {
            match live(&weak) {
                Some(inner) => inner.on_read_notice(event),
                None => Ok(()),
            }
        }));

        Self { subscriptions }
    }

    fn detach(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

fn live(weak: &Weak<ReconcilerInner>) -> Option<Arc<ReconcilerInner>> {
    weak.upgrade()
        .filter(|inner| inner.active.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Page;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeApi {
        pages: Mutex<Vec<Result<Page<NotificationRecord>, ApiError>>>,
        unread: Mutex<u64>,
        fail_mutations: AtomicBool,
        count_calls: AtomicUsize,
        mark_calls: AtomicUsize,
    }

    impl FakeApi {
        fn queue_page(&self, page: Result<Page<NotificationRecord>, ApiError>) {
            self.pages.lock().unwrap().push(page);
        }
    }

    #[async_trait]
    impl NotificationApi for FakeApi {
        async fn fetch_notifications(
            &self,
            _query: &PageQuery,
        ) -> Result<Page<NotificationRecord>, ApiError> {
            self.pages.lock().unwrap().remove(0)
        }

        async fn fetch_unread_count(&self) -> Result<u64, ApiError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.unread.lock().unwrap())
        }

        async fn mark_read(&self, _id: &RecordId) -> Result<(), ApiError> {
            self.mark_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_mutations.load(Ordering::SeqCst) {
                Err(ApiError::Status { status: 500, message: "boom".into() })
            } else {
                Ok(())
            }
        }

        async fn mark_all_read(&self) -> Result<(), ApiError> {
            if self.fail_mutations.load(Ordering::SeqCst) {
                Err(ApiError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    fn record(id: u64, is_read: bool) -> NotificationRecord {
        NotificationRecord {
            id: RecordId::from(id),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            is_read,
            payload: Default::default(),
        }
    }

    fn page(current_page: u32, records: Vec<NotificationRecord>) -> Page<NotificationRecord> {
        Page {
            data: records,
            pagination: PageInfo {
                current_page,
                total_pages: 2,
                total_items: 4,
                page_size: 2,
            },
        }
    }

    fn options() -> ReconcilerOptions {
        ReconcilerOptions {
            page_size: 2,
            push_refresh: true,
            poll_interval: None,
        }
    }

    fn setup(api: Arc<FakeApi>) -> (NotificationReconciler, Arc<EventDispatcher>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let unread = Arc::new(UnreadCounter::new(api.clone()));
        let reconciler = NotificationReconciler::new(api, unread, &dispatcher, options());
        (reconciler, dispatcher)
    }

    #[tokio::test]
    async fn test_optimistic_flip_happens_at_call_time() {
        let api = Arc::new(FakeApi::default());
        api.queue_page(Ok(page(1, vec![record(1, false), record(2, false)])));
        let (reconciler, _dispatcher) = setup(api.clone());
        reconciler.reload().await.unwrap();

        let pending = reconciler.mark_as_read(RecordId::from(2u64));
        assert!(reconciler.get(&RecordId::from(2u64)).unwrap().is_read);
        assert!(!reconciler.get(&RecordId::from(1u64)).unwrap().is_read);
        assert_eq!(api.mark_calls.load(Ordering::SeqCst), 0);

        pending.await.unwrap();
        assert_eq!(api.mark_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.count_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_mark_is_not_rolled_back() {
        let api = Arc::new(FakeApi::default());
        api.queue_page(Ok(page(1, vec![record(1, false), record(2, false)])));
        api.fail_mutations.store(true, Ordering::SeqCst);
        let (reconciler, _dispatcher) = setup(api.clone());
        reconciler.reload().await.unwrap();

        assert!(reconciler.mark_as_read(RecordId::from(1u64)).await.is_err());
        assert!(reconciler.get(&RecordId::from(1u64)).unwrap().is_read);

        assert_eq!(reconciler.mark_all_as_read().await, Err(ApiError::Timeout));
        assert!(reconciler.records().iter().all(|r| r.is_read));
        assert_eq!(api.count_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_view() {
        let api = Arc::new(FakeApi::default());
        api.queue_page(Ok(page(1, vec![record(1, false)])));
        api.queue_page(Err(ApiError::Network("down".into())));
        let (reconciler, _dispatcher) = setup(api);

        reconciler.reload().await.unwrap();
        assert!(reconciler.load_next_page().await.is_err());
        assert_eq!(reconciler.records().len(), 1);
        assert_eq!(reconciler.page_info().unwrap().current_page, 1);
    }

    #[tokio::test]
    async fn test_zero_page_rejected_locally() {
        let api = Arc::new(FakeApi::default());
        let (reconciler, _dispatcher) = setup(api);
        assert!(matches!(
            reconciler.load_page(PageQuery::new(0, 10)).await,
            Err(ApiError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_push_event_refreshes_counter() {
        let api = Arc::new(FakeApi::default());
        *api.unread.lock().unwrap() = 7;
        let (reconciler, dispatcher) = setup(api.clone());
        let mut unread = reconciler.watch_unread();

        dispatcher.dispatch(&Event::new(names::NEW_MESSAGE, json!({"contactId": 3})));
        unread.changed().await.unwrap();
        assert_eq!(reconciler.unread_count(), 7);
        assert!(reconciler.records().is_empty());
    }

    #[tokio::test]
    async fn test_read_notice_flips_local_record() {
        let api = Arc::new(FakeApi::default());
        api.queue_page(Ok(page(1, vec![record(1, false), record(2, false)])));
        let (reconciler, dispatcher) = setup(api);
        reconciler.reload().await.unwrap();

        dispatcher.dispatch(&Event::new(names::NOTIFICATION_READ, json!({"notificationId": 1})));
        assert!(reconciler.get(&RecordId::from(1u64)).unwrap().is_read);
        assert!(!reconciler.get(&RecordId::from(2u64)).unwrap().is_read);

        dispatcher.dispatch(&Event::new(names::NOTIFICATION_READ, json!({"all": true})));
        assert!(reconciler.records().iter().all(|r| r.is_read));
    }

    #[tokio::test]
    async fn test_teardown_releases_handlers() {
        let api = Arc::new(FakeApi::default());
        let (reconciler, dispatcher) = setup(api.clone());
        assert_eq!(dispatcher.handler_count(names::NEW_MESSAGE), 1);

        reconciler.teardown();
        reconciler.teardown();
        assert_eq!(dispatcher.handler_count(names::NEW_MESSAGE), 0);
        assert_eq!(dispatcher.handler_count(names::NOTIFICATION_READ), 0);
        assert!(!reconciler.is_active());

        dispatcher.dispatch(&Event::new(names::NEW_MESSAGE, json!({})));
        tokio::task::yield_now().await;
        assert_eq!(api.count_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_refresh_can_be_disabled() {
        let api = Arc::new(FakeApi::default());
        let dispatcher = Arc::new(EventDispatcher::new());
        let unread = Arc::new(UnreadCounter::new(api.clone()));
        let _reconciler = NotificationReconciler::new(
            api,
            unread,
            &dispatcher,
            ReconcilerOptions {
                push_refresh: false,
                ..options()
            },
        );
        assert_eq!(dispatcher.handler_count(names::NEW_MESSAGE), 0);
    }
}
