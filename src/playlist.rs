//! Playlist archiver: downloads every member of a playlist into a private
//! scratch directory, zips the files of the members that downloaded cleanly and
//! streams the archive back.
//!
//! Members are processed one at a time. A member that cannot be fetched is
//! recorded as a [`MemberOutcome`] and never aborts the playlist, so the
//! archive is always produced, possibly empty.

use std::{
    collections::HashSet,
    ffi::OsStr,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::{StreamExt, stream};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::task;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::{ZipWriter, write::SimpleFileOptions};

use crate::error::FetchError;
use crate::fetcher::{
    ChunkStream, Fetcher, STREAM_CHUNK_SIZE, download_args, flat_playlist_args, metadata_args,
};
use crate::formats::{VideoInfo, select_member_format};
use crate::security::{validate_format_id, validate_source_url};

pub const ARCHIVE_NAME: &str = "playlist.zip";
pub const MEDIA_EXTENSIONS: [&str; 4] = ["mp4", "m4a", "webm", "mp3"];
const SCRATCH_PREFIX: &str = "playlist-";

/// Output of the flat playlist listing.
#[derive(Debug, Default, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Option<Vec<Option<FlatEntry>>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
}

/// One member of a playlist, as enumerated by the flat listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub member_video_id: String,
}

impl PlaylistEntry {
    /// Full video URL for this member. Identifiers that already are URLs are
    /// used as they are.
    pub fn video_url(&self, watch_url: &str) -> String {
        let id = self.member_video_id.as_str();
        if id.starts_with("http://") || id.starts_with("https://") {
            id.to_string()
        } else {
            format!("{watch_url}{id}")
        }
    }
}

fn entries_from(playlist: FlatPlaylist) -> Vec<PlaylistEntry> {
    playlist
        .entries
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            entry
                .id
                .filter(|id| !id.trim().is_empty())
                .or(entry.url.filter(|url| !url.trim().is_empty()))
        })
        .map(|id| PlaylistEntry {
            member_video_id: id.trim().to_string(),
        })
        .collect()
}

/// Result of processing one member. Only the files of `Downloaded` members
/// go into the archive.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberOutcome {
    Downloaded {
        member_video_id: String,
        format_id: String,
        files: Vec<PathBuf>,
    },
    /// No format matched the member policy.
    SkippedNoFormat { member_video_id: String },
    Failed {
        member_video_id: String,
        reason: String,
    },
}

impl MemberOutcome {
    pub fn member_video_id(&self) -> &str {
        match self {
            MemberOutcome::Downloaded {
                member_video_id, ..
            }
            | MemberOutcome::SkippedNoFormat { member_video_id }
            | MemberOutcome::Failed {
                member_video_id, ..
            } => member_video_id,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, MemberOutcome::Downloaded { .. })
    }

    /// Files this member contributes to the archive.
    pub fn files(&self) -> &[PathBuf] {
        match self {
            MemberOutcome::Downloaded { files, .. } => files.as_slice(),
            _ => &[],
        }
    }

    fn log(&self) {
        let member = self.member_video_id();
        match self {
            MemberOutcome::Downloaded {
                format_id, files, ..
            } => info!(member, %format_id, files = files.len(), "member downloaded"),
            MemberOutcome::SkippedNoFormat { .. } => {
                warn!(member, "no matching format, skipping member")
            }
            MemberOutcome::Failed { reason, .. } => {
                warn!(member, %reason, "member failed, skipping")
            }
        }
    }
}

/// A finished archive ready to be streamed.
///
/// `body` owns the scratch directory; the directory is removed when the body
/// is exhausted or dropped.
pub struct PlaylistArchive {
    pub body: ChunkStream,
    pub size: u64,
    pub entry_count: usize,
    pub outcomes: Vec<MemberOutcome>,
}

pub struct PlaylistArchiver {
    fetcher: Arc<dyn Fetcher>,
    watch_url: String,
    scratch_root: Option<PathBuf>,
}

impl PlaylistArchiver {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        watch_url: impl Into<String>,
        scratch_root: Option<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            watch_url: watch_url.into(),
            scratch_root,
        }
    }

    /// Runs the whole playlist flow up to the point where the archive body
    /// can be streamed. Any error returned here has already released the
    /// scratch directory.
    pub async fn archive(
        &self,
        playlist_url: &str,
        audio_only: bool,
    ) -> Result<PlaylistArchive, FetchError> {
        let url = playlist_url.trim();
        if url.is_empty() {
            return Err(FetchError::Validation("Missing parameters".into()));
        }
        validate_source_url(url)?;

        let root = self.scratch_root.clone();
        let scratch = task::spawn_blocking(move || create_scratch_dir(root)).await??;
        let entries = self.enumerate(url).await?;
        info!(url, members = entries.len(), audio_only, "archiving playlist");

        let mut outcomes = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            // Each member gets its own directory so its files can be told
            // apart from whatever a failed member left behind.
            let member_dir = scratch.path().join(format!("member-{index:04}"));
            let outcome = self.fetch_member(entry, audio_only, &member_dir).await;
            outcome.log();
            outcomes.push(outcome);
        }

        let files: Vec<PathBuf> = outcomes
            .iter()
            .flat_map(MemberOutcome::files)
            .cloned()
            .collect();
        let archive_path = scratch.path().join(ARCHIVE_NAME);
        let entry_count = {
            let archive_path = archive_path.clone();
            task::spawn_blocking(move || build_archive(&archive_path, &files)).await??
        };
        let file = tokio::fs::File::open(&archive_path).await?;
        let size = file.metadata().await?.len();
        info!(
            url,
            downloaded = outcomes.iter().filter(|o| o.is_downloaded()).count(),
            entry_count,
            size,
            "playlist archive ready"
        );

        Ok(PlaylistArchive {
            body: scratch_guarded_chunks(file, scratch),
            size,
            entry_count,
            outcomes,
        })
    }

    async fn enumerate(&self, url: &str) -> Result<Vec<PlaylistEntry>, FetchError> {
        let playlist: FlatPlaylist = self
            .fetcher
            .invoke(&flat_playlist_args(url))
            .await?
            .parse_json()?;
        Ok(entries_from(playlist))
    }

    async fn fetch_member(
        &self,
        entry: &PlaylistEntry,
        audio_only: bool,
        dir: &Path,
    ) -> MemberOutcome {
        let member_video_id = entry.member_video_id.clone();
        match self.download_member(entry, audio_only, dir).await {
            Ok(Some((format_id, files))) => MemberOutcome::Downloaded {
                member_video_id,
                format_id,
                files,
            },
            Ok(None) => MemberOutcome::SkippedNoFormat { member_video_id },
            Err(err) => MemberOutcome::Failed {
                member_video_id,
                reason: err.to_string(),
            },
        }
    }

    /// Downloads one member into `dir`. Returns the chosen format and the
    /// media files the fetcher produced, or `None` when no format fits.
    async fn download_member(
        &self,
        entry: &PlaylistEntry,
        audio_only: bool,
        dir: &Path,
    ) -> Result<Option<(String, Vec<PathBuf>)>, FetchError> {
        let video_url = entry.video_url(&self.watch_url);
        validate_source_url(&video_url)?;

        let info: VideoInfo = self
            .fetcher
            .invoke(&metadata_args(&video_url))
            .await?
            .parse_json()?;
        let Some(format_id) = select_member_format(&info.formats, audio_only) else {
            return Ok(None);
        };
        validate_format_id(format_id)?;

        tokio::fs::create_dir_all(dir).await?;
        self.fetcher
            .invoke(&download_args(&video_url, format_id, dir))
            .await?
            .into_success()?;

        let dir = dir.to_path_buf();
        let files = task::spawn_blocking(move || media_files_in(&dir)).await??;
        Ok(Some((format_id.to_string(), files)))
    }
}

fn create_scratch_dir(root: Option<PathBuf>) -> Result<TempDir, FetchError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(SCRATCH_PREFIX);
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(&root)?;
            builder.tempdir_in(&root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext))
}

/// Media files under `dir`, in file name order. The archive itself is never
/// listed.
fn media_files_in(dir: &Path) -> Result<Vec<PathBuf>, FetchError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || entry.file_name() == ARCHIVE_NAME {
            continue;
        }
        if is_media_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Zips `files` into `archive_path`, stored by bare file name. Returns the
/// number of entries written.
fn build_archive(archive_path: &Path, files: &[PathBuf]) -> Result<usize, FetchError> {
    let mut writer = ZipWriter::new(BufWriter::new(File::create(archive_path)?));
    let mut names = HashSet::new();
    for path in files {
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            continue;
        };
        if !names.insert(name.clone()) {
            warn!(path = %path.display(), "duplicate file name, leaving it out of the archive");
            continue;
        }
        let large = path.metadata()?.len() >= u64::from(u32::MAX);
        writer.start_file(name, SimpleFileOptions::default().large_file(large))?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut writer)?;
    }
    let mut inner = writer.finish()?;
    inner.flush()?;

    Ok(names.len())
}

/// Streams the archive in fixed-size chunks. The scratch directory travels
/// with the stream and is removed once the last chunk has been read, or
/// when the stream is dropped early.
fn scratch_guarded_chunks(file: tokio::fs::File, scratch: TempDir) -> ChunkStream {
    let chunks = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
    Box::pin(stream::unfold(
        Some((chunks, scratch)),
        |state| async move {
            let (mut chunks, scratch) = state?;
            match chunks.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some((chunks, scratch)))),
                Some(Err(err)) => Some((Err(err), None)),
                None => {
                    drop(chunks);
                    release_scratch(scratch).await;
                    None
                }
            }
        },
    ))
}

async fn release_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    match task::spawn_blocking(move || scratch.close()).await {
        Ok(Ok(())) => debug!(path = %path.display(), "scratch directory removed"),
        Ok(Err(err)) => warn!(path = %path.display(), %err, "could not remove scratch directory"),
        Err(err) => warn!(path = %path.display(), %err, "scratch cleanup task failed"),
    }
}
