//! Progress events and the fire-and-forget publisher.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::registry::SessionRegistry;

/// Status event for one download job, pushed to the session's subscriber.
/// Closed set so every consumer handles each case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Connected,
    Preparing,
    Downloading {
        progress: u8,
        downloaded: u64,
        total: u64,
    },
    Completed,
    Error {
        message: String,
    },
}

/// Wire shape of a push frame, matching the event payload contract:
/// `{progress, status, downloaded?, total?, message?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub progress: u8,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn frame(&self) -> ProgressFrame {
        match self {
            ProgressEvent::Connected => ProgressFrame::bare(0, "connected"),
            ProgressEvent::Preparing => ProgressFrame::bare(0, "preparing"),
            ProgressEvent::Downloading {
                progress,
                downloaded,
                total,
            } => ProgressFrame {
                progress: *progress,
                status: "downloading".to_string(),
                downloaded: Some(*downloaded),
                total: Some(*total),
                message: None,
            },
            ProgressEvent::Completed => ProgressFrame::bare(100, "completed"),
            ProgressEvent::Error { message } => ProgressFrame {
                progress: 0,
                status: "error".to_string(),
                downloaded: None,
                total: None,
                message: Some(message.clone()),
            },
        }
    }
}

impl ProgressFrame {
    fn bare(progress: u8, status: &str) -> Self {
        Self {
            progress,
            status: status.to_string(),
            downloaded: None,
            total: None,
            message: None,
        }
    }
}

/// Narrow interface the download pipeline uses to push status events.
///
/// Publishing never fails and never blocks: an absent session, a closed
/// channel, or a full buffer all drop the frame silently, so a broken
/// progress channel can never abort a download.
#[derive(Clone)]
pub struct Publisher {
    registry: Arc<SessionRegistry>,
}

impl Publisher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn publish(&self, token: &str, event: ProgressEvent) {
        let Some(handle) = self.registry.lookup(token) else {
            return;
        };

        if let ProgressEvent::Downloading {
            progress,
            downloaded,
            total,
        } = &event
        {
            handle.record_progress(*progress);
            if handle.crosses_decile(*progress) {
                info!(token, progress, downloaded, total, "download progress");
            }
        }

        // Single non-blocking write attempt; drop on full or closed.
        let _ = handle.sender().try_send(event);
    }
}
