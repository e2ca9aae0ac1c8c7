//! Streaming proxy: pipes one upstream byte stream to one downstream
//! response while driving the progress publisher.
//!
//! Each job runs a pump task (upstream reads, progress frames) feeding a
//! bounded byte channel; the HTTP body drains the channel, so the first
//! bytes reach the client long before the payload has been transferred and
//! memory stays constant relative to payload size.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::DownloadError;
use crate::progress::{ProgressEvent, Publisher};
use crate::provider::{ByteStream, MediaProvider, StreamFormat};
use crate::registry::{COMPLETION_GRACE, SessionRegistry};

/// In-flight chunks buffered between the pump and the HTTP body.
const STREAM_BUFFER: usize = 8;

/// Longest filename offered in the attachment header.
const MAX_FILENAME_CHARS: usize = 100;

/// Replaces characters illegal in filesystem names and bounds the length.
pub fn sanitize_filename(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            other => other,
        })
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// A download ready to stream: response metadata plus the byte body.
pub struct DownloadStream {
    pub filename: String,
    /// Declared payload size; 0 when the upstream did not report one, in
    /// which case progress frames are suppressed.
    pub total_bytes: u64,
    pub body: DownloadBody,
}

/// Byte stream handed to the HTTP response. Dropping it is how downstream
/// disconnect propagates to the pump.
pub struct DownloadBody {
    rx: mpsc::Receiver<Result<Bytes, DownloadError>>,
}

impl Stream for DownloadBody {
    type Item = Result<Bytes, DownloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Resolves the requested encoding and starts the streaming pump.
///
/// Errors returned here occur before any response bytes exist and map to a
/// status code at the HTTP boundary; once this returns `Ok`, failures are
/// reported only through the progress channel and body termination.
pub async fn open_download(
    provider: &dyn MediaProvider,
    registry: &Arc<SessionRegistry>,
    publisher: &Publisher,
    identifier: &str,
    itag: u32,
    token: &str,
) -> Result<DownloadStream, DownloadError> {
    if !provider.validate(identifier) {
        return Err(DownloadError::InvalidIdentifier);
    }

    let info = provider.full_info(identifier).await?;
    let format: &StreamFormat = info
        .formats
        .iter()
        .find(|format| format.itag == itag)
        .ok_or(DownloadError::EncodingNotFound(itag))?;

    let total_bytes = format.content_length.unwrap_or(0);
    let filename = format!("{}.{}", sanitize_filename(&info.title), format.container());

    publisher.publish(token, ProgressEvent::Preparing);
    if total_bytes > 0 {
        publisher.publish(
            token,
            ProgressEvent::Downloading {
                progress: 0,
                downloaded: 0,
                total: total_bytes,
            },
        );
    }

    let upstream = provider.open_stream(format).await?;
    info!(token, itag, total_bytes, filename, "starting download");

    let (tx, rx) = mpsc::channel::<Result<Bytes, DownloadError>>(STREAM_BUFFER);
    tokio::spawn(pump(
        upstream,
        tx,
        publisher.clone(),
        Arc::clone(registry),
        token.to_string(),
        total_bytes,
    ));

    Ok(DownloadStream {
        filename,
        total_bytes,
        body: DownloadBody { rx },
    })
}

/// Upstream read loop. Terminal paths:
/// - end-of-data: `completed` frame, grace-delayed session teardown;
/// - upstream error: `error` frame, immediate session close, body errors out;
/// - downstream disconnect: stop reading within one chunk, no further
///   frames, immediate session close.
async fn pump(
    mut upstream: ByteStream,
    tx: mpsc::Sender<Result<Bytes, DownloadError>>,
    publisher: Publisher,
    registry: Arc<SessionRegistry>,
    token: String,
    total: u64,
) {
    let mut downloaded: u64 = 0;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(chunk) => {
                if tx.is_closed() {
                    debug!(token, downloaded, "downstream disconnected, stopping");
                    registry.close(&token);
                    return;
                }

                downloaded += chunk.len() as u64;
                if total > 0 {
                    let progress = ((downloaded * 100) / total).min(100) as u8;
                    publisher.publish(
                        &token,
                        ProgressEvent::Downloading {
                            progress,
                            downloaded,
                            total,
                        },
                    );
                }

                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(token, downloaded, "downstream disconnected, stopping");
                    registry.close(&token);
                    return;
                }
            }
            Err(err) => {
                error!(token, %err, "upstream stream error");
                publisher.publish(
                    &token,
                    ProgressEvent::Error {
                        message: err.to_string(),
                    },
                );
                registry.close(&token);
                // Best effort: the body may already be gone.
                let _ = tx.try_send(Err(err));
                return;
            }
        }
    }

    info!(token, downloaded, "download completed");
    publisher.publish(&token, ProgressEvent::Completed);
    registry.close_after(&token, COMPLETION_GRACE);
}
