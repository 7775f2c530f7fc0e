//! Narrow interface to the external media fetcher (yt-dlp by default).
//!
//! Every flow talks to the fetcher through [`Fetcher`], which has exactly two
//! shapes of call: a lookup that captures the whole output, and a streaming
//! call whose stdout is handed out as a lazy sequence of byte chunks. The
//! argument builders below encode the command-line contract for each use.

use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use serde::de::DeserializeOwned;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Size of every chunk pulled from the fetcher or from an archive on disk.
pub const STREAM_CHUNK_SIZE: usize = 4096;
/// Container every download is merged into.
pub const MERGE_CONTAINER: &str = "mp4";
/// Output template used for playlist members: the video's own title.
pub const MEMBER_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Finite, non-restartable sequence of chunks. Pulled by the HTTP body, so
/// the consumer's write readiness paces the producer.
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Captured result of a [`Fetcher::invoke`] call.
#[derive(Debug, Clone, Default)]
pub struct FetcherOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl FetcherOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a non-zero exit into [`FetchError::Exit`]. Stderr only goes to
    /// the debug log.
    pub fn into_success(self) -> Result<Self, FetchError> {
        if self.success() {
            return Ok(self);
        }
        debug!(
            code = ?self.exit_code,
            stderr = %String::from_utf8_lossy(&self.stderr).trim(),
            "fetcher reported failure"
        );
        Err(FetchError::Exit {
            code: self.exit_code,
        })
    }

    pub fn parse_json<T: DeserializeOwned>(self) -> Result<T, FetchError> {
        let output = self.into_success()?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Runs the fetcher to completion and captures stdout and stderr.
    async fn invoke(&self, args: &[String]) -> Result<FetcherOutput, FetchError>;

    /// Starts the fetcher and returns its stdout as chunks. The stream ends
    /// with an error item if the process exits non-zero after output began.
    async fn invoke_streaming(&self, args: &[String]) -> Result<ChunkStream, FetchError>;
}

/// [`Fetcher`] backed by a real executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        // Killing on drop is what stops a relay when the client goes away.
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Fetcher for YtDlp {
    async fn invoke(&self, args: &[String]) -> Result<FetcherOutput, FetchError> {
        debug!(program = %self.program.display(), ?args, "invoking fetcher");
        let output = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(FetchError::Spawn)?;
        Ok(FetcherOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn invoke_streaming(&self, args: &[String]) -> Result<ChunkStream, FetchError> {
        debug!(program = %self.program.display(), ?args, "streaming from fetcher");
        // Stderr is discarded: an unread pipe would eventually block the child.
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(FetchError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("fetcher stdout was not captured"))?;
        Ok(child_chunks(child, stdout))
    }
}

/// Relays a child's stdout chunk by chunk, then reaps the child. The child
/// travels with the stream, so dropping the stream early kills it.
fn child_chunks(child: Child, stdout: ChildStdout) -> ChunkStream {
    let chunks = ReaderStream::with_capacity(stdout, STREAM_CHUNK_SIZE);
    Box::pin(stream::unfold(
        Some((chunks, child)),
        |state| async move {
            let (mut chunks, mut child) = state?;
            match chunks.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some((chunks, child)))),
                Some(Err(err)) => Some((Err(err), None)),
                None => match child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => {
                        warn!(%status, "fetcher failed after the response body started");
                        Some((
                            Err(io::Error::other(format!("fetcher exited with {status}"))),
                            None,
                        ))
                    }
                    Err(err) => Some((Err(err), None)),
                },
            }
        },
    ))
}

/// Metadata dump: one JSON object with the title and every format.
pub fn metadata_args(url: &str) -> Vec<String> {
    to_args(&["--dump-json", "--no-warnings", "--", url])
}

/// Flat playlist listing: member entries only, no per-video extraction.
pub fn flat_playlist_args(url: &str) -> Vec<String> {
    to_args(&[
        "--flat-playlist",
        "--dump-single-json",
        "--no-warnings",
        "--",
        url,
    ])
}

/// Fetch of one format, merged into a single container, written to stdout.
pub fn stream_args(url: &str, format_id: &str) -> Vec<String> {
    to_args(&[
        "--format",
        format_id,
        "--merge-output-format",
        MERGE_CONTAINER,
        "--output",
        "-",
        "--quiet",
        "--no-warnings",
        "--",
        url,
    ])
}

/// Fetch of one format into `dir`, named after the video's title.
pub fn download_args(url: &str, format_id: &str, dir: &Path) -> Vec<String> {
    let template = dir.join(MEMBER_OUTPUT_TEMPLATE);
    let template = template.to_string_lossy();
    to_args(&[
        "--format",
        format_id,
        "--merge-output-format",
        MERGE_CONTAINER,
        "--output",
        &template,
        "--no-progress",
        "--no-warnings",
        "--",
        url,
    ])
}

fn to_args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
