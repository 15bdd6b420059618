use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::auth::CredentialStore;
use crate::config::{EndpointConfig, NotificationsConfig};

use super::{ApiError, NotificationApi, NotificationRecord, Page, PageQuery, RecordId, UnreadCount};

/// [`NotificationApi`] over HTTP.
///
/// The bearer token is read from the credential store on every request, so a
/// rotated token applies to the very next call.
#[derive(Clone)]
pub struct HttpNotificationApi {
    base_url: String,
    http_client: reqwest::Client,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpNotificationApi {
    pub fn new(
        endpoint: &EndpointConfig,
        notifications: &NotificationsConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .timeout(notifications.request_timeout())
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self::with_client(&endpoint.api_base_url, http_client, credentials))
    }

    pub fn with_client(
        base_url: &str,
        http_client: reqwest::Client,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            credentials,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http_client.request(method, url);
        match self.credentials.bearer_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, op: &'static str) -> Result<Response, ApiError> {
        let started = Instant::now();
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();

        tracing::debug!(
            op = op,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "REST response received"
        );

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify_status(status, body);
        tracing::warn!(op = op, error = %error, "REST request failed");
        Err(error)
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn fetch_notifications(
        &self,
        query: &PageQuery,
    ) -> Result<Page<NotificationRecord>, ApiError> {
        query.validate()?;
        let builder = self
            .request(Method::GET, "/notifications")
            .query(&query.to_query_pairs());
        let response = self.send(builder, "fetch_notifications").await?;
        Self::json(response).await
    }

    async fn fetch_unread_count(&self) -> Result<u64, ApiError> {
        let builder = self.request(Method::GET, "/notifications/unread-count");
        let response = self.send(builder, "fetch_unread_count").await?;
        let body: UnreadCount = Self::json(response).await?;
        Ok(body.count)
    }

    async fn mark_read(&self, id: &RecordId) -> Result<(), ApiError> {
        let path = format!("/notifications/{}/read", id);
        let builder = self.request(Method::PATCH, &path);
        self.send(builder, "mark_read").await?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), ApiError> {
        let builder = self.request(Method::PATCH, "/notifications/read-all");
        self.send(builder, "mark_all_read").await?;
        Ok(())
    }
}

fn map_transport_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else if error.is_decode() {
        ApiError::Decode(error.to_string())
    } else {
        ApiError::Network(error.to_string())
    }
}

/// Map a non-2xx status, preferring a `message` field from a JSON error body
fn classify_status(status: StatusCode, body: String) -> ApiError {
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or(body);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ApiError::Timeout,
        _ => ApiError::Status {
            status: status.as_u16(),
            message,
        },
    }
}
