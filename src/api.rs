//! HTTP surface: the three endpoints binding resolver, registry and proxy.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::get,
};
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{ApiError, ApiResult, DownloadError};
use crate::progress::{ProgressEvent, Publisher};
use crate::provider::MediaProvider;
use crate::proxy;
use crate::registry::SessionRegistry;
use crate::resolver::{self, ResolvedVideo};

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn MediaProvider>,
    pub registry: Arc<SessionRegistry>,
    pub publisher: Publisher,
}

impl AppState {
    pub fn new(provider: Arc<dyn MediaProvider>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let publisher = Publisher::new(Arc::clone(&registry));
        Self {
            provider,
            registry,
            publisher,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/formats", get(get_formats))
        .route("/api/progress/{session_id}", get(progress_events))
        .route("/api/download", get(download))
        .with_state(state)
}

#[derive(Deserialize)]
struct FormatsQuery {
    url: Option<String>,
}

async fn get_formats(
    State(state): State<AppState>,
    Query(query): Query<FormatsQuery>,
) -> ApiResult<Json<ResolvedVideo>> {
    let url = query.url.unwrap_or_default();
    let resolved = resolver::resolve(state.provider.as_ref(), &url)
        .await
        .map_err(|err| {
            error!(%err, "format resolution failed");
            ApiError::from(err)
        })?;
    Ok(Json(resolved))
}

async fn progress_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<KeepAliveStream<SubscriptionStream>> {
    info!(session_id, "progress subscription opened");
    let (rx, epoch) = state.registry.open(&session_id);
    let stream = SubscriptionStream {
        rx,
        registry: Arc::clone(&state.registry),
        token: session_id,
        epoch,
        connected_sent: false,
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Event stream for one progress subscription. Emits the initial `connected`
/// frame, then relays session events until the channel closes. Dropping the
/// stream (subscriber disconnect) removes the registry entry, unless a newer
/// subscription for the token has superseded this one.
pub struct SubscriptionStream {
    rx: mpsc::Receiver<ProgressEvent>,
    registry: Arc<SessionRegistry>,
    token: String,
    epoch: u64,
    connected_sent: bool,
}

fn frame_event(event: &ProgressEvent) -> Event {
    Event::default().data(serde_json::to_string(&event.frame()).unwrap_or_default())
}

impl Stream for SubscriptionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.connected_sent {
            this.connected_sent = true;
            return Poll::Ready(Some(Ok(frame_event(&ProgressEvent::Connected))));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(frame_event(&event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if self.registry.close_if_current(&self.token, self.epoch) {
            debug!(token = %self.token, "progress subscriber disconnected");
        }
    }
}

#[derive(Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    itag: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Fallback token for downloads started without a subscription; progress is
/// still computed, it just has no audience.
fn generated_token() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Reports a pre-stream failure on every channel it can reach: the operator
/// log, the progress subscriber (one `error` frame), and the HTTP status.
/// The session is closed afterwards.
fn download_failed(state: &AppState, token: &str, err: DownloadError) -> ApiError {
    error!(token, %err, "download request failed");
    state.publisher.publish(
        token,
        ProgressEvent::Error {
            message: err.to_string(),
        },
    );
    state.registry.close(token);
    err.into()
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let token = query.session_id.clone().unwrap_or_else(generated_token);
    let url = query.url.unwrap_or_default();

    let Some(itag) = query.itag.as_deref().and_then(|raw| raw.trim().parse().ok()) else {
        return Err(download_failed(
            &state,
            &token,
            DownloadError::InvalidIdentifier,
        ));
    };

    let download = proxy::open_download(
        state.provider.as_ref(),
        &state.registry,
        &state.publisher,
        &url,
        itag,
        &token,
    )
    .await
    .map_err(|err| download_failed(&state, &token, err))?;

    let disposition = format!("attachment; filename=\"{}\"", download.filename);
    let mut response = Body::from_stream(download.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        disposition
            .parse()
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    if download.total_bytes > 0 {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.total_bytes));
    }
    Ok(response)
}
