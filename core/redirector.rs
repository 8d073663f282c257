//! Short-link web surface: turns a generated alias into a 302 to the real
//! clip file, and serves real clip filenames directly with byte-range
//! support.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::{err, Error};
use http::{Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::store::{Store, TypedStore};

const NAMESPACE: &str = "redirect_aliases";

/// Alias length, in decimal digits. Six digits gives a million addresses,
/// plenty for the short-lived clip links this serves.
const ALIAS_DIGITS: u32 = 6;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AliasRecord {
    path: PathBuf,
}

/// Maps generated aliases to files under `clip_dir` and serves both the
/// alias (as a 302) and the real filename (with byte-range support) over
/// HTTP.
pub struct Redirector<S> {
    store: Arc<S>,
    clip_dir: PathBuf,
}

impl<S: Store> Redirector<S> {
    pub fn new(store: Arc<S>, clip_dir: PathBuf) -> Self {
        Redirector { store, clip_dir }
    }

    /// Generates a fresh numeric alias for `path` and persists the mapping.
    /// Retries on the astronomically unlikely event of a collision.
    pub async fn create_alias(&self, path: &Path) -> Result<String, Error> {
        let typed = TypedStore::new(self.store.as_ref());
        let max = 10u64.pow(ALIAS_DIGITS);
        for _ in 0..8 {
            let n = fastrand::u64(0..max);
            let alias = format!("{n:0width$}", width = ALIAS_DIGITS as usize);
            let existing: Option<AliasRecord> = typed.get(NAMESPACE, &alias).await?;
            if existing.is_none() {
                typed
                    .put(
                        NAMESPACE,
                        &alias,
                        &AliasRecord {
                            path: path.to_path_buf(),
                        },
                    )
                    .await?;
                return Ok(alias);
            }
        }
        Err(err!(ResourceExhausted, "could not allocate a free alias"))
    }

    pub async fn resolve_alias(&self, alias: &str) -> Result<PathBuf, Error> {
        let typed = TypedStore::new(self.store.as_ref());
        let rec: Option<AliasRecord> = typed.get(NAMESPACE, &alias.to_string()).await?;
        rec.map(|r| r.path)
            .ok_or_else(|| err!(NotFound, "no such alias {alias}"))
    }
}

fn is_alias(segment: &str) -> bool {
    segment.len() == ALIAS_DIGITS as usize && segment.bytes().all(|b| b.is_ascii_digit())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())).boxed())
        .expect("static response is well-formed")
}

fn redirect_response(location: &str) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(http::header::LOCATION, location)
        .body(Empty::<Bytes>::new().boxed())
        .expect("redirect response is well-formed")
}

async fn serve_real_file<ReqBody>(
    file_path: &Path,
    req: &Request<ReqBody>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let file = match tokio::fs::File::open(file_path).await {
        Ok(f) => f,
        Err(_) => return text_response(StatusCode::NOT_FOUND, "file is gone"),
    };
    let entity = match http_serve::ChunkedReadFile::new(file, None).await {
        Ok(e) => e,
        Err(_) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "stat failed"),
    };
    let resp = http_serve::serve(entity, req);
    resp.map(|b| b.map_err(|e: std::io::Error| panic!("file body error: {e}")).boxed())
}

/// `GET /favicon.ico` serves the file or 404s; `GET /clips/<alias>` 302s to
/// the real filename; `GET /clips/<real-name>` serves the file directly
/// with byte-range support; anything else 404s.
async fn handle<S: Store, ReqBody>(
    redirector: Arc<Redirector<S>>,
    req: Request<ReqBody>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let path = req.uri().path().to_string();

    if path == "/favicon.ico" {
        return Ok(serve_real_file(&redirector.clip_dir.join("favicon.ico"), &req).await);
    }

    let rest = match path.strip_prefix("/clips/") {
        Some(r) if !r.is_empty() && !r.contains('/') => r,
        _ => return Ok(text_response(StatusCode::NOT_FOUND, "not found")),
    };

    if is_alias(rest) {
        let file_path = match redirector.resolve_alias(rest).await {
            Ok(p) => p,
            Err(_) => return Ok(text_response(StatusCode::NOT_FOUND, "no such link")),
        };
        let name = file_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        return Ok(redirect_response(&format!("/clips/{name}")));
    }

    Ok(serve_real_file(&redirector.clip_dir.join(rest), &req).await)
}

/// Runs the redirector HTTP server on `addr` until `shutdown` resolves.
pub async fn serve<S: Store + 'static>(
    addr: SocketAddr,
    redirector: Arc<Redirector<S>>,
    shutdown: base::shutdown::Receiver,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| err!(Unavailable, "binding {addr}: {e}"))?;
    tracing::info!(%addr, "redirector listening");

    loop {
        let accept = listener.accept();
        let stop = shutdown.as_future();
        tokio::select! {
            _ = stop => return Ok(()),
            result = accept => {
                let (stream, _peer) = result.map_err(|e| err!(Unavailable, "accept: {e}"))?;
                let io = TokioIo::new(stream);
                let redirector = redirector.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| handle(redirector.clone(), req));
                    if let Err(e) = ConnBuilder::new(hyper_util::rt::TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::warn!(error = %e, "redirector connection error");
                    }
                });
            }
        }
    }
}
