//! Encoding resolver: turns the provider's raw format list into the stable,
//! client-facing set of downloadable variants.

use serde::Serialize;

use crate::error::DownloadError;
use crate::provider::{MediaProvider, StreamFormat};

/// One offered variant. Immutable; derived per request, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodingOption {
    pub itag: u32,
    pub label: String,
    pub container: String,
    #[serde(skip)]
    pub size_bytes: u64,
    /// Display-only decimal megabyte rendering of `size_bytes`.
    #[serde(rename = "size")]
    pub size_display: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedVideo {
    pub title: String,
    #[serde(rename = "formats")]
    pub options: Vec<EncodingOption>,
}

/// Renders an exact byte count as "N.NN MB" for clients. Internal math must
/// keep using the byte count.
pub fn format_size_mb(size_bytes: u64) -> String {
    format!("{:.2} MB", size_bytes as f64 / (1024.0 * 1024.0))
}

fn to_option(format: &StreamFormat) -> Option<EncodingOption> {
    // A variant is only offered if it can be sized for the client and
    // progress-tracked: it needs a byte count and a quality indicator.
    let size_bytes = format.content_length.filter(|len| *len > 0)?;
    let label = match (&format.quality_label, &format.audio_quality) {
        (Some(quality), _) => quality.clone(),
        (None, Some(audio)) => format!("{audio} audio only"),
        (None, None) => return None,
    };
    Some(EncodingOption {
        itag: format.itag,
        label,
        container: format.container().to_string(),
        size_bytes,
        size_display: format_size_mb(size_bytes),
    })
}

/// Validates the identifier, fetches the candidate encodings, and filters
/// them down to the deliverable set.
pub async fn resolve(
    provider: &dyn MediaProvider,
    identifier: &str,
) -> Result<ResolvedVideo, DownloadError> {
    if !provider.validate(identifier) {
        return Err(DownloadError::InvalidIdentifier);
    }

    let info = provider.basic_info(identifier).await?;
    let options: Vec<EncodingOption> = info.formats.iter().filter_map(to_option).collect();
    if options.is_empty() {
        return Err(DownloadError::NoUsableEncodings);
    }

    Ok(ResolvedVideo {
        title: info.title,
        options,
    })
}
