//! Stream relay: pipes one fetcher format straight into an HTTP body without
//! touching disk.

use tracing::info;

use crate::error::FetchError;
use crate::fetcher::{ChunkStream, Fetcher, stream_args};
use crate::filename::{content_disposition, sanitize_filename};
use crate::formats::is_playlist_url;
use crate::security::{validate_format_id, validate_source_url};

/// Format ids that carry audio only on the common video hosts.
pub const AUDIO_FORMAT_IDS: [&str; 6] = ["140", "141", "171", "249", "250", "251"];
const AUDIO_MARKER: &str = "m4a";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn classify(format_id: &str) -> Self {
        if AUDIO_FORMAT_IDS.contains(&format_id) || format_id.contains(AUDIO_MARKER) {
            MediaKind::Audio
        } else {
            MediaKind::Video
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio/mpeg",
            MediaKind::Video => "video/mp4",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Audio => "mp3",
            MediaKind::Video => "mp4",
        }
    }
}

/// One download request as received from the browser.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source_url: String,
    pub format_id: Option<String>,
    pub display_title: String,
    pub audio_only: bool,
}

impl DownloadRequest {
    pub fn targets_playlist(&self) -> bool {
        is_playlist_url(&self.source_url)
    }
}

/// A started relay: response metadata plus the live body.
pub struct MediaStream {
    pub kind: MediaKind,
    pub content_disposition: String,
    pub body: ChunkStream,
}

impl MediaStream {
    pub fn content_type(&self) -> &'static str {
        self.kind.mime_type()
    }
}

/// Starts the fetcher in write-to-stdout mode for the requested format. The
/// returned body yields chunks as the fetcher produces them.
pub async fn start_relay(
    fetcher: &dyn Fetcher,
    request: &DownloadRequest,
) -> Result<MediaStream, FetchError> {
    let url = request.source_url.trim();
    let format_id = request.format_id.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() || format_id.is_empty() {
        return Err(FetchError::Validation("Missing parameters".into()));
    }
    validate_source_url(url)?;
    validate_format_id(format_id)?;

    let kind = MediaKind::classify(format_id);
    let filename = format!(
        "{}.{}",
        sanitize_filename(&request.display_title),
        kind.extension()
    );
    let body = fetcher.invoke_streaming(&stream_args(url, format_id)).await?;
    info!(url, format_id, filename = %filename, "relay started");

    Ok(MediaStream {
        kind,
        content_disposition: content_disposition(&filename),
        body,
    })
}
