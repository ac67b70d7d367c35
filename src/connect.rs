use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio_rustls::TlsAcceptor;

use crate::server::{self, empty_response, extract_host, text_response, ServerState};

type HandleFuture = Pin<Box<dyn Future<Output = Result<Response<Full<Bytes>>, hyper::Error>> + Send>>;

/// CONNECT handler: accepts the tunnel, terminates TLS with a freshly minted
/// per-host leaf and promotes the decrypted bytestream into an HTTP server
/// that handles exactly this one connection with the regular top-level
/// handler.
pub(crate) fn handle(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>> {
    Box::pin(handle_inner(req, state))
}

async fn handle_inner(req: Request<Incoming>, state: Arc<ServerState>) -> Response<Full<Bytes>> {
    let Some(interceptor) = state.tls_interceptor.clone() else {
        return text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "no TLS interceptor is configured, rejecting the request",
        );
    };

    let Some(authority) = req
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| extract_host(&req))
    else {
        return text_response(StatusCode::BAD_REQUEST, "failed to parse Host header");
    };

    let Some((host, port)) = authority.rsplit_once(':') else {
        return text_response(StatusCode::BAD_REQUEST, "failed to parse Host header");
    };

    if port != "443" {
        return text_response(StatusCode::NOT_ACCEPTABLE, "only CONNECTs to port 443 are allowed");
    }

    let host = host.to_string();

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                log::warn!("failed to hijack the connection: {err}");
                return;
            }
        };

        let config = match interceptor.server_config(&host) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("failed to generate X.509 certificate for {host}: {err}");
                return;
            }
        };

        let acceptor = TlsAcceptor::from(config);
        let tls_stream = match acceptor.accept(TokioIo::new(upgraded)).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("failed to perform TLS connection handshake with {host}: {err}");
                return;
            }
        };

        let service = service_fn(move |mut inner: Request<Incoming>| -> HandleFuture {
            inner.extensions_mut().insert(server::TlsSession);
            Box::pin(server::handle(inner, Arc::clone(&state)))
        });

        let builder = ConnBuilder::new(TokioExecutor::new());
        if let Err(err) = builder.serve_connection(TokioIo::new(tls_stream), service).await {
            // The client closing the tunnel surfaces as an error here; that
            // is the normal end of an intercepted exchange.
            log::debug!("ephemeral HTTP server for {host} finished: {err}");
        }
    });

    // hyper performs the connection upgrade once this 2xx is flushed.
    empty_response(StatusCode::OK)
}
