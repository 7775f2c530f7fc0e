use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Failure of one of the request flows.
///
/// `Exit` only carries the exit code. The fetcher's stderr is logged, never
/// returned to clients.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Validation(String),
    #[error("fetcher exited with {}", describe_exit(.code))]
    Exit { code: Option<i32> },
    #[error("could not launch fetcher: {0}")]
    Spawn(#[source] io::Error),
    #[error("unexpected fetcher output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("could not build archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl FetchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FetchError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_fetcher_exit(&self) -> bool {
        matches!(self, FetchError::Exit { .. })
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}
