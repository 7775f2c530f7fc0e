#![forbid(unsafe_code)]

//! HTTP front-end for the fetcher.
//!
//! Three things are exposed: the format listing used by the landing page,
//! the download endpoint (single video relay or playlist archive) and the
//! static files of the landing page itself. All of the real work happens in
//! the library; this binary only maps requests and errors onto HTTP.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::{Value, json};
use streamgrab::config::{
    DEFAULT_ENV_PATH, RuntimeOverrides, RuntimeSettings, resolve_runtime_settings,
};
use streamgrab::error::FetchError;
use streamgrab::fetcher::{Fetcher, STREAM_CHUNK_SIZE, YtDlp};
use streamgrab::filename::content_disposition;
use streamgrab::formats::{FormatLookup, PLAYLIST_NOTICE, list_formats};
use streamgrab::playlist::{ARCHIVE_NAME, PlaylistArchiver};
use streamgrab::relay::{DownloadRequest, start_relay};
use streamgrab::security::ensure_not_root;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const INDEX_FILE: &str = "index.html";
const DEFAULT_DOWNLOAD_TITLE: &str = "video";
const FORMATS_FAILED: &str = "Failed to fetch video data.";
const DOWNLOAD_FAILED: &str = "Download failed";
const PLAYLIST_FAILED: &str = "Playlist download failed";

#[derive(Debug, Parser)]
#[command(name = "streamgrab-server", about = "Web front-end for yt-dlp downloads")]
struct ServerArgs {
    /// Address to listen on (IPv4 or IPv6 literal).
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Fetcher executable, looked up on PATH when not a path.
    #[arg(long)]
    fetcher: Option<PathBuf>,
    /// Directory holding the landing page.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Parent directory for playlist scratch directories.
    #[arg(long)]
    scratch_root: Option<PathBuf>,
    /// Runtime worker threads.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,
}

impl ServerArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            fetcher: self.fetcher,
            www_root: self.www_root,
            scratch_root: self.scratch_root,
            workers: self.workers,
            env_path: Some(self.env_file),
        }
    }
}

/// Immutable state shared by every request.
#[derive(Clone)]
struct AppState {
    fetcher: Arc<dyn Fetcher>,
    archiver: Arc<PlaylistArchiver>,
    www_root: Arc<PathBuf>,
}

impl AppState {
    fn new(fetcher: Arc<dyn Fetcher>, settings: &RuntimeSettings) -> Self {
        let archiver = PlaylistArchiver::new(
            fetcher.clone(),
            settings.watch_url.clone(),
            settings.scratch_root.clone(),
        );
        Self {
            fetcher,
            archiver: Arc::new(archiver),
            www_root: Arc::new(settings.www_root.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorBody {
    Json,
    Text,
}

/// HTTP rendering of a failed request. The format API answers with
/// `{"error": ...}` JSON, the download endpoint with plain text.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    body: ErrorBody,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            body: ErrorBody::Json,
        }
    }

    fn bad_json(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
            body: ErrorBody::Json,
        }
    }

    /// Fetcher exits get a fixed message; their stderr stays in the log.
    fn formats(err: FetchError) -> Self {
        let message = if err.is_fetcher_exit() {
            FORMATS_FAILED.to_string()
        } else {
            err.to_string()
        };
        log_failure("format listing", &err);
        Self {
            status: err.status_code(),
            message,
            body: ErrorBody::Json,
        }
    }

    fn download(err: FetchError, prefix: &str) -> Self {
        log_failure(prefix, &err);
        let message = match &err {
            FetchError::Validation(message) => message.clone(),
            other => format!("{prefix}: {other}"),
        };
        Self {
            status: err.status_code(),
            message,
            body: ErrorBody::Text,
        }
    }
}

fn log_failure(context: &str, err: &FetchError) {
    if err.status_code().is_server_error() {
        error!(%err, "{context} failed");
    } else {
        debug!(%err, "{context} rejected");
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.body {
            ErrorBody::Json => (self.status, Json(json!({ "error": self.message }))).into_response(),
            ErrorBody::Text => (
                self.status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                self.message,
            )
                .into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_tracing();
    ensure_not_root("streamgrab")?;

    let settings =
        resolve_runtime_settings(args.into_overrides()).context("loading configuration")?;
    let runtime = build_runtime(settings.workers)?;
    runtime.block_on(serve(settings))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_runtime(workers: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = workers {
        builder.worker_threads(workers);
    }
    builder.build().context("building async runtime")
}

async fn serve(settings: RuntimeSettings) -> Result<()> {
    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", settings.host))?;
    let fetcher = YtDlp::new(&settings.fetcher);
    info!(
        fetcher = %fetcher.program().display(),
        www_root = %settings.www_root.display(),
        workers = ?settings.workers,
        "starting streamgrab"
    );
    let app = router(AppState::new(Arc::new(fetcher), &settings));

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;
    info!("server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/formats", post(formats))
        .route("/stream-download", get(stream_download))
        .fallback(static_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on the handler; Ctrl+C still ends the
    // process without it.
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
}

#[derive(Debug, Default, Deserialize)]
struct FormatsRequest {
    #[serde(default)]
    url: String,
    /// Sent by the landing page; listing is the same either way.
    #[serde(default, rename = "audioOnly")]
    audio_only: Option<Value>,
}

async fn formats(
    State(state): State<AppState>,
    payload: Result<Json<FormatsRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload.map_err(ApiError::bad_json)?;
    debug!(url = %request.url, audio_only = ?request.audio_only, "format listing requested");

    match list_formats(state.fetcher.as_ref(), &request.url).await {
        Ok(FormatLookup::Playlist) => {
            Ok(Json(json!({ "error": PLAYLIST_NOTICE, "playlist": true })).into_response())
        }
        Ok(FormatLookup::Formats(listing)) => Ok(Json(listing).into_response()),
        Err(err) => Err(ApiError::formats(err)),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    url: String,
    format: Option<String>,
    title: Option<String>,
    #[serde(rename = "audioOnly")]
    audio_only: Option<String>,
}

impl StreamQuery {
    fn into_request(self) -> DownloadRequest {
        DownloadRequest {
            source_url: self.url,
            format_id: self.format,
            display_title: self
                .title
                .unwrap_or_else(|| DEFAULT_DOWNLOAD_TITLE.to_string()),
            audio_only: self
                .audio_only
                .is_some_and(|value| value.eq_ignore_ascii_case("true")),
        }
    }
}

async fn stream_download(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let request = query.into_request();
    if request.targets_playlist() {
        return archive_playlist(&state, &request).await;
    }

    let stream = start_relay(state.fetcher.as_ref(), &request)
        .await
        .map_err(|err| ApiError::download(err, DOWNLOAD_FAILED))?;
    let disposition = HeaderValue::from_str(&stream.content_disposition).map_err(|err| {
        ApiError::download(FetchError::Io(io::Error::other(err)), DOWNLOAD_FAILED)
    })?;
    let content_type = stream.content_type();

    let mut response = Body::from_stream(stream.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

async fn archive_playlist(state: &AppState, request: &DownloadRequest) -> ApiResult<Response> {
    let archive = state
        .archiver
        .archive(&request.source_url, request.audio_only)
        .await
        .map_err(|err| ApiError::download(err, PLAYLIST_FAILED))?;
    let disposition = HeaderValue::from_str(&content_disposition(ARCHIVE_NAME)).map_err(|err| {
        ApiError::download(FetchError::Io(io::Error::other(err)), PLAYLIST_FAILED)
    })?;

    let mut response = Body::from_stream(archive.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(archive.size));
    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Serves a landing page asset. Directories and extension-less paths fall
/// back to `index.html` so client-side routes keep working.
async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => serve_file(&root.join(INDEX_FILE)).await,
        Ok(_) => serve_file(&target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            serve_file(&root.join(INDEX_FILE)).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join(INDEX_FILE));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    Path::new(request_path.trim_start_matches('/'))
        .extension()
        .is_none()
}

async fn serve_file(path: &Path) -> ApiResult<Response> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mime = MimeGuess::from_path(path).first_or_octet_stream();

    let body = Body::from_stream(ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE));
    let mut response = body.into_response();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use streamgrab::config::DEFAULT_WATCH_URL;
    use tempfile::{TempDir, tempdir};

    fn settings_for(root: &Path) -> RuntimeSettings {
        RuntimeSettings {
            host: "127.0.0.1".into(),
            port: 0,
            fetcher: root.join("yt-dlp"),
            www_root: root.join("www"),
            scratch_root: Some(root.join("scratch")),
            watch_url: DEFAULT_WATCH_URL.into(),
            workers: None,
        }
    }

    fn state_for(root: &Path) -> AppState {
        let settings = settings_for(root);
        std::fs::create_dir_all(&settings.www_root).unwrap();
        std::fs::write(settings.www_root.join(INDEX_FILE), "<h1>streamgrab</h1>").unwrap();
        std::fs::write(settings.www_root.join("app.js"), "console.log(1);").unwrap();
        AppState::new(Arc::new(YtDlp::new(&settings.fetcher)), &settings)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    fn error_response(result: ApiResult<Response>) -> Response {
        match result {
            Ok(_) => panic!("expected an error response"),
            Err(err) => err.into_response(),
        }
    }

    fn query(url: &str, format: Option<&str>, title: Option<&str>) -> Query<StreamQuery> {
        Query(StreamQuery {
            url: url.into(),
            format: format.map(str::to_string),
            title: title.map(str::to_string),
            audio_only: None,
        })
    }

    #[test]
    fn command_is_named_after_the_binary() {
        use clap::CommandFactory;
        assert_eq!(ServerArgs::command().get_name(), "streamgrab-server");
    }

    #[test]
    fn cli_flags_map_to_overrides() {
        let args = ServerArgs::try_parse_from([
            "streamgrab-server",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--fetcher",
            "/usr/local/bin/yt-dlp",
            "--www-root",
            "/srv/www",
            "--scratch-root",
            "/var/tmp/streamgrab",
            "--workers",
            "4",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.fetcher, Some(PathBuf::from("/usr/local/bin/yt-dlp")));
        assert_eq!(overrides.www_root, Some(PathBuf::from("/srv/www")));
        assert_eq!(
            overrides.scratch_root,
            Some(PathBuf::from("/var/tmp/streamgrab"))
        );
        assert_eq!(overrides.workers, Some(4));
        assert_eq!(overrides.env_path, Some(PathBuf::from(DEFAULT_ENV_PATH)));
    }

    #[test]
    fn cli_rejects_invalid_port() {
        assert!(ServerArgs::try_parse_from(["streamgrab", "--port", "http"]).is_err());
    }

    #[test]
    fn worker_count_configures_runtime() {
        let runtime = build_runtime(Some(2)).unwrap();
        assert_eq!(runtime.metrics().num_workers(), 2);
    }

    #[test]
    fn stream_query_defaults() {
        let request = StreamQuery::default().into_request();
        assert_eq!(request.display_title, DEFAULT_DOWNLOAD_TITLE);
        assert!(!request.audio_only);

        for (raw, expected) in [("true", true), ("TRUE", true), ("True", true), ("1", false), ("yes", false)] {
            let request = StreamQuery {
                audio_only: Some(raw.into()),
                ..StreamQuery::default()
            }
            .into_request();
            assert_eq!(request.audio_only, expected, "{raw}");
        }
    }

    #[test]
    fn www_paths_reject_traversal() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_www_path(root, "/").unwrap(), root.join(INDEX_FILE));
        assert_eq!(
            resolve_www_path(root, "/assets/app.js").unwrap(),
            root.join("assets/app.js")
        );
        assert!(resolve_www_path(root, "/../etc/passwd").is_err());
        assert!(should_fallback_to_index("/watch"));
        assert!(!should_fallback_to_index("/missing.css"));
    }

    #[test]
    fn api_error_bodies() {
        let err = ApiError::formats(FetchError::Exit { code: Some(1) });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, FORMATS_FAILED);

        let err = ApiError::download(FetchError::Validation("Missing parameters".into()), DOWNLOAD_FAILED);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body, ErrorBody::Text);
        assert_eq!(err.message, "Missing parameters");

        let err = ApiError::download(FetchError::Exit { code: Some(2) }, PLAYLIST_FAILED);
        assert_eq!(err.message, "Playlist download failed: fetcher exited with status 2");
    }

    #[tokio::test]
    async fn unknown_api_path_is_json_404() {
        let dir = tempdir().unwrap();
        let state = state_for(dir.path());
        let req = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(state), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await, json!({"error": "endpoint not found"}));
    }

    #[tokio::test]
    async fn static_fallback_serves_landing_page() {
        let dir = tempdir().unwrap();
        let state = state_for(dir.path());

        for path in ["/", "/some/page"] {
            let req = Request::builder().uri(path).body(Body::empty()).unwrap();
            let response = static_fallback(State(state.clone()), req).await;
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            assert!(header_str(&response, header::CONTENT_TYPE).starts_with("text/html"));
            assert_eq!(body_bytes(response).await, b"<h1>streamgrab</h1>");
        }

        let req = Request::builder().uri("/app.js").body(Body::empty()).unwrap();
        let response = static_fallback(State(state.clone()), req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header_str(&response, header::CONTENT_TYPE).contains("javascript"));

        let req = Request::builder()
            .uri("/missing.css")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(state), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn formats_requires_url() {
        let dir = tempdir().unwrap();
        let state = state_for(dir.path());
        let result = formats(State(state), Ok(Json(FormatsRequest::default()))).await;
        let response = error_response(result);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "Missing URL."}));
    }

    #[tokio::test]
    async fn formats_reports_playlists() {
        let dir = tempdir().unwrap();
        let state = state_for(dir.path());
        let request = FormatsRequest {
            url: "https://www.youtube.com/playlist?list=PL1".into(),
            audio_only: Some(Value::Bool(true)),
        };
        let response = formats(State(state), Ok(Json(request))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"error": PLAYLIST_NOTICE, "playlist": true})
        );
    }

    #[tokio::test]
    async fn stream_download_requires_parameters() {
        let dir = tempdir().unwrap();
        let state = state_for(dir.path());
        let result = stream_download(State(state), query("https://x/watch?v=a", None, None)).await;
        let response = error_response(result);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(header_str(&response, header::CONTENT_TYPE).starts_with("text/plain"));
        assert_eq!(body_bytes(response).await, b"Missing parameters");
    }

    #[tokio::test]
    async fn missing_fetcher_is_a_server_error() {
        let dir = tempdir().unwrap();
        let state = state_for(dir.path());
        let result =
            stream_download(State(state), query("https://x/watch?v=a", Some("18"), None)).await;
        let response = error_response(result);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.starts_with("Download failed: could not launch fetcher"));
    }

    /// Exercises the handlers against a shell script standing in for yt-dlp.
    #[cfg(unix)]
    mod fetcher_stub {
        use super::*;
        use std::io::Cursor;
        use std::os::unix::fs::PermissionsExt;

        const STUB: &str = r#"#!/bin/bash
output=""
format=""
prev=""
for arg in "$@"; do
  case "$prev" in
    --output) output="$arg" ;;
    --format) format="$arg" ;;
  esac
  prev="$arg"
done
url="${@: -1}"
id="${url##*=}"

case " $* " in
  *" --flat-playlist "*)
    echo '{"entries":[{"id":"one"},{"id":"fail-two"},{"id":"three"}]}'
    ;;
  *" --dump-json "*)
    if [[ "$id" == fail* ]]; then
      echo "ERROR: [youtube] $id: Private video" >&2
      exit 1
    fi
    echo '{"title":"Sample","formats":[
      {"format_id":"137","ext":"mp4","vcodec":"avc1","acodec":"none","height":1080},
      {"format_id":"18","ext":"mp4","vcodec":"avc1","acodec":"mp4a","height":360,"filesize":10485760},
      {"format_id":"251","ext":"webm","vcodec":"none","acodec":"opus"},
      {"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a","resolution":"audio only","abr":129.5}
    ]}'
    ;;
  *)
    if [ "$output" = "-" ]; then
      printf 'media:%s:%s' "$format" "$id"
    else
      target="${output//%(title)s/Title $id}"
      target="${target//%(ext)s/mp4}"
      printf 'file:%s' "$id" > "$target"
    fi
    ;;
esac
"#;

        fn stub_state() -> (TempDir, AppState) {
            let dir = tempdir().unwrap();
            let script = dir.path().join("yt-dlp");
            std::fs::write(&script, STUB).unwrap();
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
            let state = state_for(dir.path());
            (dir, state)
        }

        #[tokio::test]
        async fn formats_lists_downloadable_formats() {
            let (_dir, state) = stub_state();
            let request = FormatsRequest {
                url: "https://www.youtube.com/watch?v=abc".into(),
                audio_only: None,
            };
            let response = formats(State(state), Ok(Json(request))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                body_json(response).await,
                json!({
                    "title": "Sample",
                    "formats": [
                        {"format_id": "18", "ext": "mp4", "resolution": 360,
                         "filesize": 10.0, "abr": null},
                        {"format_id": "140", "ext": "m4a", "resolution": "audio only",
                         "filesize": null, "abr": 129.5}
                    ]
                })
            );
        }

        #[tokio::test]
        async fn formats_hides_fetcher_errors() {
            let (_dir, state) = stub_state();
            let request = FormatsRequest {
                url: "https://www.youtube.com/watch?v=fail-me".into(),
                audio_only: None,
            };
            let response = error_response(formats(State(state), Ok(Json(request))).await);
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body_json(response).await, json!({"error": FORMATS_FAILED}));
        }

        #[tokio::test]
        async fn audio_download_is_relayed_with_audio_headers() {
            let (_dir, state) = stub_state();
            let response = stream_download(
                State(state),
                query("https://www.youtube.com/watch?v=abc", Some("251"), Some("My Song")),
            )
            .await
            .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header_str(&response, header::CONTENT_TYPE), "audio/mpeg");
            assert_eq!(
                header_str(&response, header::CONTENT_DISPOSITION),
                "attachment; filename=\"My Song.mp3\""
            );
            assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-cache");
            assert_eq!(body_bytes(response).await, b"media:251:abc");
        }

        #[tokio::test]
        async fn video_download_uses_default_title() {
            let (_dir, state) = stub_state();
            let response = stream_download(
                State(state),
                query("https://www.youtube.com/watch?v=abc", Some("18"), None),
            )
            .await
            .unwrap();
            assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
            assert_eq!(
                header_str(&response, header::CONTENT_DISPOSITION),
                "attachment; filename=\"video.mp4\""
            );
        }

        #[tokio::test]
        async fn playlist_download_streams_zip_and_cleans_up() {
            let (dir, state) = stub_state();
            let response = stream_download(
                State(state),
                query("https://www.youtube.com/playlist?list=PL1", None, None),
            )
            .await
            .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header_str(&response, header::CONTENT_TYPE), "application/zip");
            assert_eq!(
                header_str(&response, header::CONTENT_DISPOSITION),
                "attachment; filename=\"playlist.zip\""
            );
            assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-cache");
            let length: usize = header_str(&response, header::CONTENT_LENGTH).parse().unwrap();

            let bytes = body_bytes(response).await;
            assert_eq!(bytes.len(), length);
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
            let mut names: Vec<String> = (0..archive.len())
                .map(|index| archive.by_index(index).unwrap().name().to_string())
                .collect();
            names.sort();
            assert_eq!(names, ["Title one.mp4", "Title three.mp4"]);

            let scratch = dir.path().join("scratch");
            assert!(std::fs::read_dir(scratch).unwrap().next().is_none());
        }
    }
}
