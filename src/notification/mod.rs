//! Notification state reconciliation.
//!
//! - `PaginatedView`: id-deduplicated list merged from page loads
//! - `UnreadCounter`: server counter, refreshed by pull from several triggers
//! - `NotificationReconciler`: page loads, optimistic read flags, push/poll triggers
//! - `group_conversations`: message list collapsed per contact
//! - `HttpNotificationApi`: the REST collaborator over reqwest

mod api;
mod conversations;
mod http_api;
mod reconciler;
mod types;
mod unread;
mod view;

pub use api::{ApiError, NotificationApi};
pub use conversations::{group_conversations, ConversationSummary};
pub use http_api::HttpNotificationApi;
pub use reconciler::{NotificationReconciler, ReconcilerOptions};
pub use types::{
    Direction, MessageRecord, NotificationRecord, Page, PageInfo, PageQuery, Record, RecordId,
    UnreadCount,
};
pub use unread::{RefreshTrigger, UnreadCounter};
pub use view::PaginatedView;
