use std::sync::Arc;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CACHE_CONTROL, ETAG, IF_NONE_MATCH, PRAGMA, VARY};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::cache::{Cache, CacheError, KvCache, Metadata};
use crate::fingerprint;
use crate::metrics;
use crate::rule::Rule;
use crate::server::{extract_host, response_with_headers, text_response, ServerState, TlsSession};
use crate::token;

const END_TO_END_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

pub(crate) async fn handle_default(req: Request<Incoming>, state: Arc<ServerState>) -> Response<Full<Bytes>> {
    // Requests arrive with only path and query populated; the scheme follows
    // from the connection and the host from the Host header.
    let scheme = if req.extensions().get::<TlsSession>().is_some() {
        "https"
    } else {
        "http"
    };

    let host = match extract_host(&req) {
        Some(host) if !host.is_empty() => host,
        _ => return text_response(StatusCode::BAD_REQUEST, "Host header is empty"),
    };

    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().map(str::to_string);
    let full_url = match &raw_query {
        Some(query) => format!("{scheme}://{host}{path}?{query}"),
        None => format!("{scheme}://{host}{path}"),
    };

    // Determine our caching policy for this request, then the cache key.
    let rule = state.rules.get(&full_url).cloned();
    let key = fingerprint::cache_key(scheme, &host, &path, raw_query.as_deref(), rule.as_ref());

    // When the rule opts into direct connect and another node owns the key,
    // hand the client a signed owner URL instead of streaming through us.
    if rule.as_ref().map(Rule::direct_connect).unwrap_or(false) {
        if let Some(cluster) = &state.cluster {
            if let Some(owner) = cluster.target_node(&key) {
                if owner != cluster.local_node() {
                    return match token::sign(&key, cluster.secret()) {
                        Ok(signed) => {
                            let location = format!("http://{owner}/direct-connect?token={signed}");
                            redirect_response(&location)
                        }
                        Err(err) => text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            &format!("failed to generate a direct connect token: {err}"),
                        ),
                    };
                }
            }
        }
    }

    // Collapse concurrent upstream fetches for the same key on this node.
    let _guard = state.keymutex.lock(&key).await;

    // If we're in a cluster, another node may own this key; go through the
    // KV protocol then, and through the local disk otherwise.
    let (cache, peer): (Arc<dyn Cache>, Option<String>) = match &state.cluster {
        Some(cluster) => match cluster.target_node(&key) {
            Some(owner) if owner != cluster.local_node() => {
                let kv = KvCache::new(owner.to_string(), cluster.secret().to_string(), state.internal.clone());
                (Arc::new(kv), Some(owner.to_string()))
            }
            _ => (Arc::clone(&state.disk), None),
        },
        None => (Arc::clone(&state.disk), None),
    };

    // Acquire the prior entry, if any; its ETag drives revalidation.
    let prior = match cache.get(&key).await {
        Ok(entry) => Some(entry),
        Err(CacheError::NotFound) => None,
        Err(err) => {
            let message = format!("failed to retrieve cache entry for key {key:?}: {err}");
            let status = if peer.is_some() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return text_response(status, &message);
        }
    };

    // Always perform an upstream request so the requester's access to the
    // resource is re-verified on every hit; conditional requests make this
    // cheap (RFC 9110 §13.2.1).
    let method = req.method().clone();
    let client_headers = req.headers().clone();

    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(err) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read the request body: {err}"),
            );
        }
    };

    let uri: Uri = match full_url.parse() {
        Ok(uri) => uri,
        Err(err) => {
            return text_response(StatusCode::BAD_REQUEST, &format!("failed to parse the request URL: {err}"));
        }
    };

    let mut upstream_headers = client_headers.clone();
    if let Some((_, metadata)) = &prior {
        if !metadata.etag.is_empty() && !upstream_headers.contains_key(IF_NONE_MATCH) {
            if let Ok(value) = HeaderValue::from_str(&metadata.etag) {
                upstream_headers.insert(IF_NONE_MATCH, value);
            }
        }
    }
    remove_end_to_end_headers(&mut upstream_headers);

    log::debug!("upstream request: {method} {full_url}");

    let (status, response_headers, response_body) =
        match state.upstream.fetch(method.clone(), uri, upstream_headers, body).await {
            Ok(response) => response,
            Err(err) => {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("failed to perform a request to the upstream: {err}"),
                );
            }
        };

    log::debug!("upstream response: {status}");

    // Hop-by-hop headers must not survive the relay either; hyper frames the
    // relayed body itself.
    let mut relay_headers = response_headers.clone();
    remove_end_to_end_headers(&mut relay_headers);

    if status == StatusCode::OK && should_cache(&method, &client_headers, status, &response_headers, rule.as_ref())
    {
        // The cache entry is absent or outdated; refresh it with the
        // upstream bytes while serving them to the client.
        let etag = response_headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if let Err(err) = cache.put(&key, Metadata { etag }, response_body.clone()).await {
            let message = format!("failed to create a cache entry for key {key:?}: {err}");
            let status = if peer.is_some() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return text_response(status, &message);
        }

        metrics::record_cache_operation("miss");
        metrics::record_cache_transfer("miss", response_body.len() as u64);

        response_with_headers(StatusCode::OK, relay_headers, response_body)
    } else if let Some((blob, _)) = prior.filter(|_| status == StatusCode::NOT_MODIFIED) {
        // The cached entry is up-to-date; serve its contents. The 304's
        // framing headers do not describe the cached body.
        relay_headers.remove(http::header::CONTENT_LENGTH);

        metrics::record_cache_operation("hit");
        metrics::record_cache_transfer("hit", blob.len() as u64);

        response_with_headers(StatusCode::OK, relay_headers, blob)
    } else {
        // Caching is not allowed; relay the upstream response verbatim.
        metrics::record_cache_operation("not-allowed");

        response_with_headers(status, relay_headers, response_body)
    }
}

fn should_cache(
    method: &Method,
    request_headers: &HeaderMap,
    status: StatusCode,
    response_headers: &HeaderMap,
    rule: Option<&Rule>,
) -> bool {
    let Some(rule) = rule else {
        return false;
    };

    if method != Method::GET {
        return false;
    }

    if !is_cacheable_cache_control(request_headers) {
        return false;
    }

    let pragma = request_headers
        .get(PRAGMA)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if pragma.contains("no-cache") {
        return false;
    }

    if !is_cacheable_cache_control(response_headers) {
        return false;
    }

    if request_headers.contains_key(AUTHORIZATION)
        && !cache_control_explicitly_allows(response_headers)
        && !rule.ignore_authorization_header()
    {
        return false;
    }

    // A Vary header of "*" always fails to match; the header is rare enough
    // in this use-case that any Vary declines caching (RFC 7234 §4.1).
    if response_headers.contains_key(VARY) {
        return false;
    }

    if status != StatusCode::OK {
        return false;
    }

    true
}

fn is_cacheable_cache_control(headers: &HeaderMap) -> bool {
    !headers_contain_directive(headers, "no-store") && !headers_contain_directive(headers, "private")
}

fn cache_control_explicitly_allows(headers: &HeaderMap) -> bool {
    headers_contain_directive(headers, "must-revalidate")
        || headers_contain_directive(headers, "public")
        || headers_contain_directive(headers, "s-maxage")
}

fn headers_contain_directive(headers: &HeaderMap, directive: &str) -> bool {
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };

        for header_directive in value.split(',') {
            let directive_key = header_directive.split('=').next().unwrap_or_default();

            if directive_key.trim().eq_ignore_ascii_case(directive) {
                return true;
            }
        }
    }

    false
}

fn remove_end_to_end_headers(headers: &mut HeaderMap) {
    // Connection and the hop-by-hop set, RFC 9110 §7.6.1, §11.7.1, §11.7.2.
    for name in END_TO_END_HEADERS {
        headers.remove(*name);
    }
}

fn redirect_response(location: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(http::header::LOCATION, location)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
