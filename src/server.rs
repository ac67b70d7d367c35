use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;

use crate::cache::{self, Cache, CacheError, NoopCache};
use crate::cluster::{self, Cluster};
use crate::connect;
use crate::interceptor::TlsInterceptor;
use crate::keymutex::KeyMutex;
use crate::metrics;
use crate::proxy;
use crate::rule::Rules;
use crate::token;
use crate::upstream::{self, UpstreamClient};

/// Explicit construction-time configuration, assembled by the caller.
pub struct Options {
    pub addr: String,
    pub disk: Option<cache::DiskCache>,
    pub rules: Rules,
    pub cluster: Option<Cluster>,
    pub tls_interceptor: Option<TlsInterceptor>,
    pub insecure_upstream: bool,
    pub read_header_timeout: std::time::Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            disk: None,
            rules: Rules::default(),
            cluster: None,
            tls_interceptor: None,
            insecure_upstream: false,
            read_header_timeout: std::time::Duration::from_secs(30),
        }
    }
}

pub(crate) struct ServerState {
    pub addr: String,
    pub disk: Arc<dyn Cache>,
    pub rules: Rules,
    pub cluster: Option<Arc<Cluster>>,
    pub tls_interceptor: Option<Arc<TlsInterceptor>>,
    pub keymutex: KeyMutex,
    pub upstream: UpstreamClient,
    pub internal: Client<HttpConnector, Full<Bytes>>,
}

/// Marks requests that arrived over an intercepted TLS tunnel.
#[derive(Clone, Copy)]
pub struct TlsSession;

#[derive(Clone)]
pub struct RemoteAddr(pub String);

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    read_header_timeout: std::time::Duration,
}

impl Server {
    pub async fn new(options: Options) -> Result<Self> {
        install_crypto_provider();

        if options.cluster.is_some() {
            let socket_addr: SocketAddr = options
                .addr
                .parse()
                .with_context(|| format!("addr {:?} doesn't seem to be fully-qualified", options.addr))?;
            if socket_addr.ip().is_unspecified() {
                return Err(anyhow!(
                    "IP address in addr {:?} cannot be empty or unspecified when using cluster mode",
                    options.addr
                ));
            }
            if socket_addr.port() == 0 {
                return Err(anyhow!(
                    "port in addr {:?} cannot be zero when using cluster mode",
                    options.addr
                ));
            }
        }

        let listener = TcpListener::bind(&options.addr)
            .await
            .with_context(|| format!("bind {}", options.addr))?;
        let local_addr = listener.local_addr().context("local addr")?;
        let addr = normalize_addr(local_addr);

        let disk: Arc<dyn Cache> = match options.disk {
            Some(disk) => Arc::new(disk),
            None => Arc::new(NoopCache::new()),
        };

        let internal = upstream::internal_client();
        let cluster = options.cluster.map(Arc::new);

        if let Some(cluster) = &cluster {
            cluster::spawn_health_task(Arc::clone(cluster), internal.clone());
        }

        let state = Arc::new(ServerState {
            addr,
            disk,
            rules: options.rules,
            cluster,
            tls_interceptor: options.tls_interceptor.map(Arc::new),
            keymutex: KeyMutex::new(),
            upstream: UpstreamClient::new(options.insecure_upstream)?,
            internal,
        });

        Ok(Self {
            listener,
            state,
            read_header_timeout: options.read_header_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.state.addr
    }

    pub async fn run(self) -> Result<()> {
        log::info!("listening on {}", self.state.addr);

        let read_header_timeout = self.read_header_timeout;

        loop {
            let (stream, peer) = self.listener.accept().await.context("accept")?;
            let peer = peer.to_string();
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |mut req| {
                    req.extensions_mut().insert(RemoteAddr(peer.clone()));
                    handle(req, Arc::clone(&state))
                });
                let mut builder = ConnBuilder::new(TokioExecutor::new());
                builder
                    .http1()
                    .timer(hyper_util::rt::TokioTimer::new())
                    .header_read_timeout(read_header_timeout);
                if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                    log::debug!("connection ended: {err}");
                }
            });
        }
    }
}

fn install_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());
    });
}

// The unspecified address is unreachable as a peer target; advertise
// loopback instead.
fn normalize_addr(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("127.0.0.1:{}", addr.port())
    } else {
        addr.to_string()
    }
}

pub(crate) async fn handle(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    log::debug!("request: {} {}", req.method(), req.uri());

    let method = req.method().to_string();
    let host = extract_host(&req).unwrap_or_default();
    let path = req.uri().path().to_string();
    let remote_addr = req
        .extensions()
        .get::<RemoteAddr>()
        .map(|addr| addr.0.clone())
        .unwrap_or_else(|| "-".to_string());

    let is_local = host.is_empty() || host == state.addr;

    let (response, operation) = if is_local {
        if req.method() == Method::PUT {
            (handle_cluster_put(req, &state).await, "cluster-put")
        } else if req.method() == Method::GET {
            match path.as_str() {
                "/health" => (text_response(StatusCode::OK, "healthy"), "health-check"),
                "/metrics" => (text_response(StatusCode::OK, &metrics::render()), "metrics"),
                "/direct-connect" => (handle_direct_connect_get(req, &state).await, "direct-connect-get"),
                _ => (handle_cluster_get(req, &state).await, "cluster-get"),
            }
        } else {
            (not_found(), "unknown")
        }
    } else if req.method() == Method::CONNECT {
        (connect::handle(req, Arc::clone(&state)).await, "proxy-connect")
    } else {
        (proxy::handle_default(req, Arc::clone(&state)).await, "proxy-default")
    };

    let status = response.status();
    log::info!(
        "{method} {host}{path} status={} operation={operation} remote_addr={remote_addr}",
        status.as_u16()
    );
    metrics::record_request(&method, status.as_u16(), operation);

    Ok(response)
}

async fn handle_cluster_get(req: Request<Incoming>, state: &ServerState) -> Response<Full<Bytes>> {
    let Some(cluster) = &state.cluster else {
        return text_response(
            StatusCode::NOT_FOUND,
            "KV request received, but cluster mode is not configured",
        );
    };

    if let Some(response) = check_cluster_auth(req.headers(), cluster) {
        return response;
    }

    let key = match cache::kv::get_key(req.headers()) {
        Ok(key) => key,
        Err(err) => {
            return text_response(StatusCode::BAD_REQUEST, &format!("failed to determine the key: {err}"));
        }
    };

    let (blob, metadata) = match state.disk.get(&key).await {
        Ok(entry) => entry,
        Err(CacheError::NotFound) => {
            return text_response(StatusCode::NOT_FOUND, &format!("no cache entry found for key {key}"));
        }
        Err(err) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to get cache entry for key {key}: {err}"),
            );
        }
    };

    let mut headers = HeaderMap::new();
    if let Err(err) = cache::kv::set_metadata(&mut headers, &metadata) {
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to provide the metadata to the requester: {err}"),
        );
    }

    response_with_headers(StatusCode::OK, headers, blob)
}

async fn handle_cluster_put(req: Request<Incoming>, state: &ServerState) -> Response<Full<Bytes>> {
    let Some(cluster) = &state.cluster else {
        return text_response(
            StatusCode::NOT_FOUND,
            "KV request received, but cluster mode is not configured",
        );
    };

    if let Some(response) = check_cluster_auth(req.headers(), cluster) {
        return response;
    }

    let key = match cache::kv::get_key(req.headers()) {
        Ok(key) => key,
        Err(err) => {
            return text_response(StatusCode::BAD_REQUEST, &format!("failed to determine the key: {err}"));
        }
    };

    let metadata = match cache::kv::get_metadata(req.headers()) {
        Ok(metadata) => metadata,
        Err(err) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to determine the metadata: {err}"),
            );
        }
    };

    let blob = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(err) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to read the body: {err}"));
        }
    };

    if let Err(err) = state.disk.put(&key, metadata, blob).await {
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("unable to put cache entry: {err}"),
        );
    }

    text_response(StatusCode::OK, "cache entry written successfully")
}

async fn handle_direct_connect_get(req: Request<Incoming>, state: &ServerState) -> Response<Full<Bytes>> {
    let Some(cluster) = &state.cluster else {
        return text_response(
            StatusCode::NOT_FOUND,
            "direct connect request received, but cluster mode is not configured",
        );
    };

    let Some(raw_token) = query_param(req.uri().query(), "token") else {
        return text_response(StatusCode::UNAUTHORIZED, "direct connect token is missing or is empty");
    };

    let key = match token::verify(&raw_token, cluster.secret()) {
        Ok(key) => key,
        Err(err) => {
            return text_response(
                StatusCode::UNAUTHORIZED,
                &format!("direct connect token is invalid: {err}"),
            );
        }
    };

    let started_at = Instant::now();

    let (blob, _) = match state.disk.get(&key).await {
        Ok(entry) => entry,
        Err(CacheError::NotFound) => {
            return text_response(StatusCode::NOT_FOUND, &format!("no cache entry found for key {key}"));
        }
        Err(err) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to get cache entry for key {key}: {err}"),
            );
        }
    };

    metrics::record_cache_operation("direct-connect");
    metrics::record_cache_transfer("direct-connect", blob.len() as u64);
    let bytes_per_second = blob.len() as f64 / started_at.elapsed().as_secs_f64().max(1.0);
    metrics::record_cache_speed("direct-connect", bytes_per_second);

    response_with_headers(StatusCode::OK, HeaderMap::new(), blob)
}

fn check_cluster_auth(headers: &HeaderMap, cluster: &Cluster) -> Option<Response<Full<Bytes>>> {
    let Some(provided) = basic_auth_password(headers) else {
        return Some(text_response(StatusCode::UNAUTHORIZED, "failed to get basic auth"));
    };

    if cluster.secret().as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
        return Some(text_response(StatusCode::UNAUTHORIZED, "invalid secret"));
    }

    None
}

fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (_, password) = credentials.split_once(':')?;
    Some(password.to_string())
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        if let Some((pair_name, value)) = pair.split_once('=') {
            if pair_name == name && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub(crate) fn extract_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.headers().get(http::header::HOST) {
        return host.to_str().ok().map(|host| host.to_string());
    }
    req.uri().authority().map(|authority| authority.to_string())
}

pub(crate) fn not_found() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

pub(crate) fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub(crate) fn response_with_headers(
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(Full::new(body)).unwrap()
}
