//! Video processing status projection.
//!
//! Transcoding runs elsewhere; this module only follows its
//! `video_status_update` events for one video and keeps the latest.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::dispatcher::{names, Event, EventDispatcher, Subscription};
use crate::metrics::VideoMetrics;
use crate::notification::RecordId;

/// Processing stage of an uploaded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum VideoState {
    Uploading,
    Processing,
    Ready,
    Failed,
}

impl VideoState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VideoState::Ready | VideoState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown video status: {0}")]
pub struct UnknownVideoState(String);

impl FromStr for VideoState {
    type Err = UnknownVideoState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploading" => Ok(VideoState::Uploading),
            "processing" => Ok(VideoState::Processing),
            "ready" | "completed" => Ok(VideoState::Ready),
            "failed" | "error" => Ok(VideoState::Failed),
            _ => Err(UnknownVideoState(s.to_string())),
        }
    }
}

impl TryFrom<String> for VideoState {
    type Error = UnknownVideoState;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoState::Uploading => "uploading",
            VideoState::Processing => "processing",
            VideoState::Ready => "ready",
            VideoState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Latest known status of one video
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub video_id: RecordId,
    pub status: VideoState,
    /// Always within 0..=100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVideoStatus {
    #[serde(alias = "video_id")]
    video_id: RecordId,
    status: VideoState,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default, alias = "error", alias = "error_message")]
    error_message: Option<String>,
}

impl VideoStatus {
    /// Decode an event body; progress is clamped, a missing progress means 100
    /// for a ready video and 0 otherwise.
    pub fn from_body(body: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let raw = RawVideoStatus::deserialize(body)?;

        let progress = match raw.progress {
            Some(p) if p.is_finite() => p.round().clamp(0.0, 100.0) as u8,
            _ if raw.status == VideoState::Ready => 100,
            _ => 0,
        };

        Ok(Self {
            video_id: raw.video_id,
            status: raw.status,
            progress,
            error_message: raw.error_message,
        })
    }
}

/// Follows status events for a single video id and keeps only the latest.
///
/// Push-only: there is no polling or REST fallback.
pub struct VideoStatusProjector {
    video_id: RecordId,
    state: Arc<watch::Sender<Option<VideoStatus>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl VideoStatusProjector {
    pub fn attach(dispatcher: &Arc<EventDispatcher>, video_id: impl Into<RecordId>) -> Self {
        let video_id = video_id.into();
        let (state, _) = watch::channel(None);
        let state = Arc::new(state);

        let target = video_id.clone();
        let weak = Arc::downgrade(&state);
        let subscription = dispatcher.on(names::VIDEO_STATUS_UPDATE, move |event: &Event| {
            let Some(state) = weak.upgrade() else {
                return Ok(());
            };

            match VideoStatus::from_body(&event.body) {
                Ok(status) if status.video_id == target => {
                    tracing::debug!(
                        video_id = %status.video_id,
                        status = %status.status,
                        progress = status.progress,
                        "Video status updated"
                    );
                    VideoMetrics::record_status_applied();
                    state.send_replace(Some(status));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring undecodable video status event");
                }
            }
            Ok(())
        });

        Self {
            video_id,
            state,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn video_id(&self) -> &RecordId {
        &self.video_id
    }

    /// Latest status, or `None` before the first matching event
    pub fn latest(&self) -> Option<VideoStatus> {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<VideoStatus>> {
        self.state.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Release the subscription. The last status stays readable.
    pub fn teardown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

impl Drop for VideoStatusProjector {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_event(video_id: &str, status: &str, progress: f64) -> Event {
        Event::new(
            names::VIDEO_STATUS_UPDATE,
            json!({"videoId": video_id, "status": status, "progress": progress}),
        )
    }

    #[test]
    fn test_state_aliases_and_case() {
        assert_eq!("COMPLETED".parse::<VideoState>().unwrap(), VideoState::Ready);
        assert_eq!("error".parse::<VideoState>().unwrap(), VideoState::Failed);
        assert_eq!(" Processing ".parse::<VideoState>().unwrap(), VideoState::Processing);
        assert!("paused".parse::<VideoState>().is_err());
    }

    #[test]
    fn test_progress_is_clamped() {
        let status = VideoStatus::from_body(&json!({"videoId": 1, "status": "processing", "progress": 140})).unwrap();
        assert_eq!(status.progress, 100);

        let status = VideoStatus::from_body(&json!({"videoId": 1, "status": "uploading", "progress": -3})).unwrap();
        assert_eq!(status.progress, 0);

        let status = VideoStatus::from_body(&json!({"video_id": "1", "status": "completed"})).unwrap();
        assert_eq!(status.progress, 100);
        assert_eq!(status.video_id, RecordId::from("1"));
    }

    #[test]
    fn test_projector_keeps_latest_for_its_video() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let projector = VideoStatusProjector::attach(&dispatcher, "v1");
        assert!(projector.latest().is_none());

        for progress in [10.0, 40.0, 90.0] {
            dispatcher.dispatch(&status_event("v1", "processing", progress));
        }
        dispatcher.dispatch(&status_event("v2", "processing", 5.0));
        dispatcher.dispatch(&Event::new(names::VIDEO_STATUS_UPDATE, json!({"garbage": true})));

        let latest = projector.latest().unwrap();
        assert_eq!(latest.progress, 90);
        assert_eq!(latest.status, VideoState::Processing);
        assert_eq!(dispatcher.stats().failed, 0);
    }

    #[test]
    fn test_failure_message_is_kept() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let projector = VideoStatusProjector::attach(&dispatcher, "v1");

        dispatcher.dispatch(&Event::new(
            names::VIDEO_STATUS_UPDATE,
            json!({"videoId": "v1", "status": "error", "errorMessage": "codec unsupported"}),
        ));

        let latest = projector.latest().unwrap();
        assert_eq!(latest.status, VideoState::Failed);
        assert!(latest.status.is_terminal());
        assert_eq!(latest.error_message.as_deref(), Some("codec unsupported"));
    }

    #[test]
    fn test_teardown_stops_updates() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let projector = VideoStatusProjector::attach(&dispatcher, "v1");
        dispatcher.dispatch(&status_event("v1", "processing", 10.0));

        projector.teardown();
        projector.teardown();
        assert!(!projector.is_attached());
        assert_eq!(dispatcher.handler_count(names::VIDEO_STATUS_UPDATE), 0);

        dispatcher.dispatch(&status_event("v1", "ready", 100.0));
        assert_eq!(projector.latest().unwrap().progress, 10);
    }

    #[tokio::test]
    async fn test_watch_sees_updates() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let projector = VideoStatusProjector::attach(&dispatcher, "v9");
        let mut rx = projector.watch();

        dispatcher.dispatch(&status_event("v9", "ready", 100.0));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|s| s.status), Some(VideoState::Ready));
    }
}
