//! Format listing: turns the fetcher's metadata dump into the normalized
//! [`FormatDescriptor`] list shown to users, and hosts the first-match format
//! policy used for playlist members.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::FetchError;
use crate::fetcher::{Fetcher, metadata_args};
use crate::security::validate_source_url;

/// Query fragment that marks a URL as a playlist.
pub const PLAYLIST_MARKER: &str = "list=";
/// Containers offered for direct download.
pub const ALLOWED_CONTAINERS: [&str; 2] = ["mp4", "m4a"];
pub const DEFAULT_TITLE: &str = "download";
pub const PLAYLIST_NOTICE: &str = "Playlist detected. Automatic download will begin.";

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

/// Subset of the fetcher's metadata dump that the service reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

/// One entry of the metadata dump's `formats` array. Every field is optional because
/// extractors disagree on what they fill in.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub height: Option<i64>,
    pub filesize: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub abr: Option<f64>,
}

impl RawFormat {
    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    /// Audio track with the video codec explicitly reported as `none`.
    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && self.vcodec.as_deref() == Some("none")
    }

    /// Single stream carrying both audio and video.
    pub fn is_progressive(&self) -> bool {
        self.has_audio() && self.has_video()
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(codec) if codec != "none")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Resolution {
    Label(String),
    Height(i64),
}

/// Normalized, read-only view of one downloadable format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(rename = "ext")]
    pub container_extension: String,
    pub resolution: Option<Resolution>,
    #[serde(rename = "filesize")]
    pub filesize_megabytes: Option<f64>,
    #[serde(rename = "abr")]
    pub audio_bitrate: Option<f64>,
}

impl FormatDescriptor {
    /// Returns `None` for formats that are not offered: unknown id, a
    /// container outside [`ALLOWED_CONTAINERS`], or no audio channel.
    pub fn from_raw(raw: &RawFormat) -> Option<Self> {
        let format_id = raw.format_id.as_deref()?.trim();
        let ext = raw.ext.as_deref()?;
        if format_id.is_empty() || !ALLOWED_CONTAINERS.contains(&ext) || !raw.has_audio() {
            return None;
        }
        let resolution = raw
            .resolution
            .as_deref()
            .filter(|label| !label.is_empty())
            .map(|label| Resolution::Label(label.to_string()))
            .or_else(|| {
                raw.height
                    .filter(|height| *height != 0)
                    .map(Resolution::Height)
            });
        Some(Self {
            format_id: format_id.to_string(),
            container_extension: ext.to_string(),
            resolution,
            filesize_megabytes: raw.filesize.and_then(bytes_to_megabytes),
            audio_bitrate: raw.abr,
        })
    }
}

/// Converts a byte count to megabytes rounded to two decimals. Zero or
/// negative sizes count as unknown.
pub fn bytes_to_megabytes(bytes: f64) -> Option<f64> {
    if !bytes.is_finite() || bytes <= 0.0 {
        return None;
    }
    Some((bytes / BYTES_PER_MEGABYTE * 100.0).round() / 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatListing {
    pub title: String,
    pub formats: Vec<FormatDescriptor>,
}

impl FormatListing {
    pub fn from_info(info: &VideoInfo) -> Self {
        let title = info
            .title
            .clone()
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let formats = info
            .formats
            .iter()
            .filter_map(FormatDescriptor::from_raw)
            .collect();
        Self { title, formats }
    }
}

/// Outcome of a format-list request.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatLookup {
    /// The URL names a playlist; the caller should start an archive download.
    Playlist,
    Formats(FormatListing),
}

pub fn is_playlist_url(url: &str) -> bool {
    url.contains(PLAYLIST_MARKER)
}

/// Lists the downloadable formats of `url`. Playlist URLs short-circuit
/// before the fetcher is invoked.
pub async fn list_formats(fetcher: &dyn Fetcher, url: &str) -> Result<FormatLookup, FetchError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(FetchError::Validation("Missing URL.".into()));
    }
    if is_playlist_url(url) {
        info!(url, "playlist detected, skipping format listing");
        return Ok(FormatLookup::Playlist);
    }
    validate_source_url(url)?;

    let info: VideoInfo = fetcher.invoke(&metadata_args(url)).await?.parse_json()?;
    let listing = FormatListing::from_info(&info);
    info!(
        url,
        offered = listing.formats.len(),
        reported = info.formats.len(),
        "listed formats"
    );
    Ok(FormatLookup::Formats(listing))
}

/// First format, in the fetcher's own order, that fits the playlist policy:
/// audio-only when `audio_only` is set, otherwise a progressive stream.
pub fn select_member_format(formats: &[RawFormat], audio_only: bool) -> Option<&str> {
    formats
        .iter()
        .find(|format| {
            if audio_only {
                format.is_audio_only()
            } else {
                format.is_progressive()
            }
        })
        .and_then(|format| format.format_id.as_deref())
}
