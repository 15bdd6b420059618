//! Explicit context object wiring the sync components together.
//!
//! One context per signed-in session. Cloning shares the same connection,
//! dispatcher and counter.

use std::sync::Arc;

use crate::auth::SharedCredentials;
use crate::config::{ConnectionConfig, NotificationsConfig, Settings};
use crate::connection_manager::ConnectionManager;
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::notification::{
    HttpNotificationApi, NotificationApi, NotificationReconciler, ReconcilerOptions, UnreadCounter,
};
use crate::transport::{Transport, WebSocketTransport};
use crate::video::VideoStatusProjector;
use crate::visibility::VisibilityReconciler;

#[derive(Clone)]
pub struct SyncContext {
    pub credentials: SharedCredentials,
    pub dispatcher: Arc<EventDispatcher>,
    pub connection: Arc<ConnectionManager>,
    pub api: Arc<dyn NotificationApi>,
    pub unread: Arc<UnreadCounter>,
    notifications: NotificationsConfig,
}

impl SyncContext {
    /// Build a context talking to the configured WebSocket and REST endpoints
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let credentials = SharedCredentials::new(settings.auth.token.clone());
        let transport = Arc::new(WebSocketTransport::new(settings.endpoint.socket_url.clone()));
        let api = Arc::new(HttpNotificationApi::new(
            &settings.endpoint,
            &settings.notifications,
            Arc::new(credentials.clone()),
        )?);

        tracing::info!(
            socket_url = %settings.endpoint.socket_url,
            api_base_url = %settings.endpoint.api_base_url,
            "Sync context created"
        );

        Ok(Self::with_parts(
            transport,
            api,
            credentials,
            settings.connection.clone(),
            settings.notifications.clone(),
        ))
    }

    /// Build a context from already constructed collaborators
    pub fn with_parts(
        transport: Arc<dyn Transport>,
        api: Arc<dyn NotificationApi>,
        credentials: SharedCredentials,
        connection: ConnectionConfig,
        notifications: NotificationsConfig,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = Arc::new(ConnectionManager::new(
            transport,
            Arc::new(credentials.clone()),
            dispatcher.clone(),
            connection,
        ));
        let unread = Arc::new(UnreadCounter::new(api.clone()));

        Self {
            credentials,
            dispatcher,
            connection,
            api,
            unread,
            notifications,
        }
    }

    /// Mount a notification reconciler with the configured triggers
    pub fn notification_reconciler(&self) -> NotificationReconciler {
        self.notification_reconciler_with(ReconcilerOptions::from(&self.notifications))
    }

    pub fn notification_reconciler_with(
        &self,
        options: ReconcilerOptions,
    ) -> NotificationReconciler {
        NotificationReconciler::new(
            self.api.clone(),
            self.unread.clone(),
            &self.dispatcher,
            options,
        )
    }

    pub fn visibility_reconciler(&self) -> Arc<VisibilityReconciler> {
        Arc::new(VisibilityReconciler::new(self.connection.clone(), self.unread.clone()))
    }

    pub fn video_projector(&self, video_id: &str) -> VideoStatusProjector {
        VideoStatusProjector::attach(&self.dispatcher, video_id)
    }

    /// Sign-out path: close the push channel and forget the credential.
    ///
    /// Mounted reconcilers and projectors are torn down by their owners.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.credentials.clear();
        tracing::info!("Sync context shut down");
    }
}
