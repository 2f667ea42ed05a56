//! Request-mutating reverse proxy fronting the cluster API.
//!
//! Every engine child process talks to the cluster through this proxy. The
//! proxy owns the real cluster credentials; requests arrive with the owning
//! CR's identity smuggled in basic auth (see [`inject`]), get their owner
//! reference appended on create, and are forwarded with the proxy's own
//! authorization.

pub mod filter;
pub mod inject;
pub mod kubeconfig;

pub use filter::FilterServer;

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use kube::client::{Body as KubeBody, ConfigExt};
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tower::buffer::Buffer;
use tower::util::BoxService;
use tower::{BoxError, ServiceBuilder, ServiceExt};
use tracing::{debug, error, info};

pub const DEFAULT_ADDRESS: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8888;

const UPSTREAM_BUFFER: usize = 1024;

#[derive(Error, Debug)]
pub enum Error {
    /// Upstream transport could not be derived from the cluster config.
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Proxy configuration.
pub struct Options {
    pub address: String,
    pub port: u16,
    /// Requests are served under this prefix, which is stripped before
    /// forwarding unless it begins with `/api`.
    pub api_proxy_prefix: String,
    pub filter: FilterServer,
    /// Ambient cluster credentials the upstream transport is derived from.
    pub config: kube::Config,
}

impl Options {
    pub fn new(config: kube::Config) -> Self {
        Options {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            api_proxy_prefix: "/".to_string(),
            filter: FilterServer::default(),
            config,
        }
    }
}

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type Upstream = Buffer<BoxService<Request<KubeBody>, Response<ProxyBody>, BoxError>, Request<KubeBody>>;

struct Inner {
    filter: FilterServer,
    /// `None` when the prefix begins with `/api` and must be left intact.
    strip_prefix: Option<String>,
    mount_prefix: String,
    upstream: Upstream,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bound proxy server, ready to serve.
pub struct Proxy {
    listener: Listener,
    inner: Arc<Inner>,
}

impl Proxy {
    /// Bind on loopback TCP.
    pub async fn bind(options: Options) -> Result<Proxy, Error> {
        let address = format!("{}:{}", options.address, options.port);
        let listener = TcpListener::bind(&address).await?;
        info!(msg = "proxy listening", %address);
        Ok(Proxy {
            listener: Listener::Tcp(listener),
            inner: Arc::new(Inner::new(options)?),
        })
    }

    /// Bind on a UNIX socket instead of TCP.
    pub async fn bind_unix(options: Options, socket_path: &Path) -> Result<Proxy, Error> {
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(msg = "proxy listening", socket = %socket_path.display());
        Ok(Proxy {
            listener: Listener::Unix(listener),
            inner: Arc::new(Inner::new(options)?),
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Accept and serve connections until the listener fails.
    pub async fn serve(self) -> Result<(), Error> {
        loop {
            match &self.listener {
                Listener::Tcp(listener) => {
                    let (stream, _addr) = listener.accept().await?;
                    self.spawn_connection(TokioIo::new(stream));
                }
                Listener::Unix(listener) => {
                    let (stream, _addr) = listener.accept().await?;
                    self.spawn_connection(TokioIo::new(stream));
                }
            }
        }
    }

    fn spawn_connection<I>(&self, io: I)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let inner = inner.clone();
                Box::pin(async move { handle(req, inner).await })
                    as std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response<ProxyBody>, Infallible>> + Send>>
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                if !e.is_incomplete_message() {
                    debug!(msg = "proxy connection error", %e);
                }
            }
        });
    }
}

impl Inner {
    fn new(options: Options) -> Result<Self, Error> {
        let strip_prefix = if options.api_proxy_prefix.starts_with("/api") {
            None
        } else {
            Some(options.api_proxy_prefix.clone())
        };
        Ok(Inner {
            filter: options.filter,
            strip_prefix,
            mount_prefix: options.api_proxy_prefix.clone(),
            upstream: upstream_from_config(&options.config)?,
        })
    }
}

/// Upstream transport: the cluster config's TLS connector plus its base-uri
/// and auth layers over an HTTP/1 client, so forwarded requests carry the
/// proxy's own credentials and never negotiate HTTP/2.
fn upstream_from_config(config: &kube::Config) -> Result<Upstream, Error> {
    let connector = config.rustls_https_connector().map_err(Error::KubeError)?;
    let client: Client<_, KubeBody> = Client::builder(TokioExecutor::new()).build(connector);
    let stack = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .service(client);
    Ok(Buffer::new(BoxService::new(stack), UPSTREAM_BUFFER))
}

async fn handle(
    req: Request<Incoming>,
    inner: Arc<Inner>,
) -> Result<Response<ProxyBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(filter::extract_host)
        .unwrap_or_default()
        .to_string();

    if !inner.filter.accept(method.as_str(), &path, &host) {
        debug!(msg = "filter rejecting", %method, %path, %host);
        return Ok(html_response(StatusCode::FORBIDDEN, "<h3>Unauthorized</h3>"));
    }

    if !path.starts_with(&inner.mount_prefix) {
        return Ok(empty_response(StatusCode::NOT_FOUND));
    }

    let (mut parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(msg = "could not read request body", %e);
            return Ok(text_response(StatusCode::BAD_REQUEST, "could not read request body"));
        }
    };

    let body = if parts.method == Method::POST {
        let owner = match inject::owner_from_headers(&parts.headers) {
            Ok(owner) => owner,
            Err(e) => {
                error!(msg = "owner reference extraction failed", %e);
                let mut response = text_response(e.status(), &e.to_string());
                if e.status() == StatusCode::UNAUTHORIZED {
                    if let Ok(challenge) = "Basic realm=\"Operator Proxy\"".parse() {
                        response
                            .headers_mut()
                            .insert(http::header::WWW_AUTHENTICATE, challenge);
                    }
                }
                return Ok(response);
            }
        };
        match inject::inject_owner_reference(&body, &owner) {
            Ok(injected) => Bytes::from(injected),
            Err(e) => {
                error!(msg = "owner reference injection failed", %e);
                return Ok(text_response(e.status(), &e.to_string()));
            }
        }
    } else {
        body
    };

    sanitize_headers(&mut parts.headers, body.len());

    let forwarded_path = match &inner.strip_prefix {
        Some(prefix) => match strip_leave_slash(prefix, &path) {
            Some(stripped) => stripped,
            None => return Ok(empty_response(StatusCode::NOT_FOUND)),
        },
        None => path,
    };
    parts.uri = match rebuild_uri(&forwarded_path, parts.uri.query()) {
        Some(uri) => uri,
        None => return Ok(empty_response(StatusCode::NOT_FOUND)),
    };

    let upstream_req = Request::from_parts(parts, KubeBody::from(body));
    match inner.upstream.clone().oneshot(upstream_req).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(msg = "error while proxying request", %e);
            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

/// The upstream transport holds the real credentials, and the body has been
/// collected (and possibly rewritten), so its size is known.
fn sanitize_headers(headers: &mut http::HeaderMap, body_len: usize) {
    headers.remove(AUTHORIZATION);
    headers.remove(HOST);
    headers.remove(http::header::TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, http::HeaderValue::from(body_len as u64));
}

/// Like stripping a prefix, but an initial slash is always left in place so
/// path filters keep working.
fn strip_leave_slash(prefix: &str, path: &str) -> Option<String> {
    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    if stripped.len() >= path.len() {
        return None;
    }
    if !stripped.is_empty() && !stripped.starts_with('/') {
        Some(format!("/{stripped}"))
    } else {
        Some(stripped.to_string())
    }
}

fn rebuild_uri(path: &str, query: Option<&str>) -> Option<Uri> {
    let combined = match query {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    combined.parse().ok()
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn html_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    if let Ok(content_type) = "text/html".parse() {
        response
            .headers_mut()
            .insert(http::header::CONTENT_TYPE, content_type);
    }
    response
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
