//! Receiver daemon: `POST /receiver` with a multipart body, written under
//! the sandbox root.

use anyhow::Context;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::protocol::{field, upload_confirmation, RECEIVER_PATH};
use crate::sandbox::{Sandbox, SandboxError};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("Invalid request method")]
    MethodNotAllowed,
    #[error("Invalid token")]
    Unauthorized,
    #[error("Missing file")]
    MissingFile,
    #[error("Missing target")]
    MissingTarget,
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("{0}")]
    Multipart(#[from] MultipartError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ReceiveError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MissingFile | Self::MissingTarget => StatusCode::BAD_REQUEST,
            Self::Sandbox(SandboxError::Outside { .. }) => StatusCode::BAD_REQUEST,
            Self::Sandbox(SandboxError::Resolve { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            // Oversized or malformed bodies are bad requests too
            Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "upload failed");
        } else {
            debug!(error = %self, %status, "upload rejected");
        }
        (status, format!("{self}\n")).into_response()
    }
}

/// Shared daemon settings
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub sandbox: Sandbox,
    /// Shared secret; `None` or empty disables the check
    pub token: Option<String>,
    /// Request body cap in bytes; `None` means unlimited
    pub max_upload_bytes: Option<usize>,
}

#[derive(Clone)]
struct ReceiverState {
    config: Arc<ReceiverConfig>,
}

pub fn router(config: ReceiverConfig) -> Router {
    let limit = match config.max_upload_bytes {
        Some(n) => DefaultBodyLimit::max(n),
        None => DefaultBodyLimit::disable(),
    };
    Router::new()
        .route(RECEIVER_PATH, any(receive))
        .layer(limit)
        .layer(TraceLayer::new_for_http())
        .with_state(ReceiverState {
            config: Arc::new(config),
        })
}

/// Serve until `shutdown` fires; in-flight requests are allowed to finish.
pub async fn serve(listener: TcpListener, config: ReceiverConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, sandbox = %config.sandbox.root().display(), "receiver listening");
    axum::serve(listener, router(config))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("receiver stopped with an error")
}

/// Spooled `file` part
struct Spool {
    file: File,
    bytes: u64,
}

/// Form fields gathered before any validation runs
#[derive(Default)]
struct UploadForm {
    token: Option<String>,
    target: Option<String>,
    file: Option<Spool>,
}

impl UploadForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, ReceiveError> {
        let mut form = Self::default();
        while let Some(mut part) = multipart.next_field().await? {
            let name = part.name().map(str::to_owned);
            match name.as_deref() {
                Some(field::FILE) if form.file.is_none() => {
                    let mut file = File::from_std(tempfile::tempfile()?);
                    let mut bytes = 0u64;
                    while let Some(chunk) = part.chunk().await? {
                        file.write_all(&chunk).await?;
                        bytes += chunk.len() as u64;
                    }
                    // tokio may still have the last write in flight
                    file.flush().await?;
                    form.file = Some(Spool { file, bytes });
                }
                Some(field::TARGET) if form.target.is_none() => form.target = Some(part.text().await?),
                Some(field::TOKEN) if form.token.is_none() => form.token = Some(part.text().await?),
                other => debug!(field = ?other, "ignoring form field"),
            }
        }
        Ok(form)
    }
}

async fn receive(State(state): State<ReceiverState>, request: Request) -> Result<String, ReceiveError> {
    if request.method() != Method::POST {
        return Err(ReceiveError::MethodNotAllowed);
    }
    let form = match Multipart::from_request(request, &state).await {
        Ok(mut multipart) => UploadForm::read(&mut multipart).await?,
        Err(rejection) => {
            // Not multipart: same outcome as a form with no fields
            debug!(%rejection, "request body is not multipart");
            UploadForm::default()
        }
    };
    let config = &state.config;

    if let Some(expected) = config.token.as_deref().filter(|t| !t.is_empty()) {
        if form.token.as_deref() != Some(expected) {
            return Err(ReceiveError::Unauthorized);
        }
    }
    let spool = form.file.ok_or(ReceiveError::MissingFile)?;
    let target = form
        .target
        .filter(|t| !t.is_empty())
        .ok_or(ReceiveError::MissingTarget)?;
    info!(%target, "receiving upload");

    let dest = config.sandbox.resolve(&target)?;
    let written = store(&dest, spool).await?;
    info!(path = %dest.display(), bytes = written, "file stored");
    Ok(upload_confirmation(&dest))
}

/// Create parent directories, truncate-or-create the destination and copy
/// the spooled bytes into it. A failed copy may leave a partial file.
async fn store(dest: &Path, mut spool: Spool) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = open_destination(dest).await?;
    spool.file.seek(SeekFrom::Start(0)).await?;
    let copied = tokio::io::copy(&mut spool.file, &mut out).await?;
    out.flush().await?;
    if copied != spool.bytes {
        debug!(expected = spool.bytes, copied, "spool size mismatch");
    }
    Ok(copied)
}

/// Truncate-or-create without following a symlink at the final component
async fn open_destination(dest: &Path) -> std::io::Result<File> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.custom_flags(libc::O_NOFOLLOW);
    opts.open(dest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "pushsync-test-boundary";

    fn multipart_body(fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            if *name == field::FILE {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"upload.bin\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
            }
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post(fields: &[(&str, &str)]) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(RECEIVER_PATH)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(fields)))
            .unwrap()
    }

    fn config(home: &TempDir, token: Option<&str>) -> ReceiverConfig {
        ReceiverConfig {
            sandbox: Sandbox::from_home(home.path(), "/mirror"),
            token: token.map(str::to_string),
            max_upload_bytes: None,
        }
    }

    async fn send(config: ReceiverConfig, req: Request) -> (StatusCode, String) {
        let resp = router(config).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn target(home: &TempDir, rel: &str) -> String {
        home.path().join("mirror").join(rel).display().to_string()
    }

    #[tokio::test]
    async fn stores_file_and_creates_parents() {
        let home = TempDir::new().unwrap();
        let t = target(&home, "t/a/b.txt");
        let (status, body) = send(
            config(&home, None),
            post(&[(field::FILE, "hi"), (field::TARGET, t.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body.starts_with("File uploaded successfully: "));
        let written = std::fs::read(home.path().join("mirror/t/a/b.txt")).unwrap();
        assert_eq!(written, b"hi");
    }

    #[tokio::test]
    async fn field_order_does_not_matter() {
        let home = TempDir::new().unwrap();
        let t = target(&home, "x.txt");
        let (status, _) = send(
            config(&home, None),
            post(&[(field::TARGET, t.as_str()), (field::FILE, "x")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_target_cannot_escape() {
        let home = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("owned.txt");
        std::fs::create_dir_all(home.path().join("mirror")).unwrap();
        std::os::unix::fs::symlink(&victim, home.path().join("mirror/link")).unwrap();

        let t = target(&home, "link");
        let (status, _) = send(
            config(&home, None),
            post(&[(field::FILE, "pwned"), (field::TARGET, t.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!victim.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn destination_open_refuses_final_symlink() {
        let dir = TempDir::new().unwrap();
        let victim = dir.path().join("victim.txt");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&victim, &link).unwrap();
        assert!(open_destination(&link).await.is_err());
        assert!(!victim.exists());
        assert!(open_destination(&dir.path().join("plain.txt")).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_body_is_400() {
        let home = TempDir::new().unwrap();
        let mut cfg = config(&home, None);
        cfg.max_upload_bytes = Some(64);
        let t = target(&home, "big.bin");
        let big = "x".repeat(4096);
        let (status, _) = send(cfg, post(&[(field::TARGET, t.as_str()), (field::FILE, big.as_str())])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!home.path().join("mirror/big.bin").exists());
    }

    #[tokio::test]
    async fn non_post_is_405() {
        let home = TempDir::new().unwrap();
        let req = Request::builder()
            .method(Method::GET)
            .uri(RECEIVER_PATH)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(config(&home, None), req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "Invalid request method\n");
    }

    #[tokio::test]
    async fn missing_fields_are_400() {
        let home = TempDir::new().unwrap();
        let t = target(&home, "x.txt");

        let (status, body) = send(config(&home, None), post(&[(field::TARGET, t.as_str())])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing file\n");

        let (status, body) = send(config(&home, None), post(&[(field::FILE, "x")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing target\n");

        let (status, _) = send(
            config(&home, None),
            post(&[(field::FILE, "x"), (field::TARGET, "")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn relative_target_is_rejected_without_writing() {
        let home = TempDir::new().unwrap();
        let (status, body) = send(
            config(&home, None),
            post(&[(field::FILE, "root::0:0"), (field::TARGET, "../../etc/passwd")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains(&home.path().join("mirror").display().to_string()));
        assert!(!home.path().join("mirror").exists());
    }

    #[tokio::test]
    async fn token_is_enforced_when_configured() {
        let home = TempDir::new().unwrap();
        let t = target(&home, "secret.txt");

        let (status, _) = send(
            config(&home, Some("s3cret")),
            post(&[(field::FILE, "x"), (field::TARGET, t.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            config(&home, Some("s3cret")),
            post(&[(field::TOKEN, "wrong"), (field::FILE, "x"), (field::TARGET, t.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!home.path().join("mirror/secret.txt").exists());

        let (status, _) = send(
            config(&home, Some("s3cret")),
            post(&[(field::TOKEN, "s3cret"), (field::FILE, "x"), (field::TARGET, t.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn token_field_ignored_when_unset() {
        let home = TempDir::new().unwrap();
        let t = target(&home, "open.txt");
        let (status, _) = send(
            config(&home, None),
            post(&[(field::TOKEN, "anything"), (field::FILE, "x"), (field::TARGET, t.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn non_multipart_post_without_token_is_401() {
        let home = TempDir::new().unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri(RECEIVER_PATH)
            .body(Body::from("plain"))
            .unwrap();
        let (status, _) = send(config(&home, Some("s3cret")), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
