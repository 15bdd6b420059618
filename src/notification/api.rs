use async_trait::async_trait;
use thiserror::Error;

use super::{NotificationRecord, Page, PageQuery, RecordId};

/// Failures of the pull (REST) boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// REST collaborator serving notification state
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn fetch_notifications(
        &self,
        query: &PageQuery,
    ) -> Result<Page<NotificationRecord>, ApiError>;

    async fn fetch_unread_count(&self) -> Result<u64, ApiError>;

    async fn mark_read(&self, id: &RecordId) -> Result<(), ApiError>;

    async fn mark_all_read(&self) -> Result<(), ApiError>;
}
