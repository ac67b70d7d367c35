use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;

use crate::cache::{Cache, CacheError, Metadata};

pub const HEADER_KEY: &str = "x-chacha-key";
pub const HEADER_METADATA: &str = "x-chacha-metadata";

pub fn set_key(headers: &mut HeaderMap, key: &str) -> Result<()> {
    let value = HeaderValue::from_str(&BASE64.encode(key.as_bytes())).context("encode key header")?;
    headers.insert(HEADER_KEY, value);
    Ok(())
}

pub fn get_key(headers: &HeaderMap) -> Result<String> {
    let bytes = decode(headers, HEADER_KEY)?;
    String::from_utf8(bytes).context("key header is not valid UTF-8")
}

pub fn set_metadata(headers: &mut HeaderMap, metadata: &Metadata) -> Result<()> {
    let json = serde_json::to_vec(metadata).context("encode metadata")?;
    let value = HeaderValue::from_str(&BASE64.encode(json)).context("encode metadata header")?;
    headers.insert(HEADER_METADATA, value);
    Ok(())
}

pub fn get_metadata(headers: &HeaderMap) -> Result<Metadata> {
    let bytes = decode(headers, HEADER_METADATA)?;
    serde_json::from_slice(&bytes).context("unable to unmarshal metadata")
}

fn decode(headers: &HeaderMap, name: &str) -> Result<Vec<u8>> {
    let raw = headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("no {name} header is found or it is empty"))?;

    BASE64
        .decode(raw)
        .with_context(|| format!("unable to decode {name} header contents"))
}

pub fn basic_auth_value(secret: &str) -> HeaderValue {
    let credentials = BASE64.encode(format!(":{secret}"));
    HeaderValue::from_str(&format!("Basic {credentials}"))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"))
}

/// Client side of the inter-node cache protocol: GET and PUT against the
/// bare root of the owning node, authenticated with the cluster secret.
#[derive(Clone)]
pub struct KvCache {
    node: String,
    secret: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl KvCache {
    pub fn new(node: String, secret: String, client: Client<HttpConnector, Full<Bytes>>) -> Self {
        Self { node, secret, client }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn url(&self) -> String {
        format!("http://{}/", self.node)
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> CacheError {
        CacheError::Other(anyhow!("cluster node {} is not available: {err}", self.node))
    }
}

#[async_trait]
impl Cache for KvCache {
    async fn get(&self, key: &str) -> Result<(Bytes, Metadata), CacheError> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(self.url())
            .body(Full::new(Bytes::new()))
            .context("build cluster get request")?;

        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, basic_auth_value(&self.secret));
        set_key(request.headers_mut(), key)?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| self.unavailable(err))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CacheError::NotFound);
        }
        if status != StatusCode::OK {
            return Err(CacheError::Other(anyhow!(
                "cluster node {}: unexpected HTTP {status}",
                self.node
            )));
        }

        let metadata = get_metadata(response.headers())?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| self.unavailable(err))?
            .to_bytes();

        Ok((body, metadata))
    }

    async fn put(&self, key: &str, metadata: Metadata, blob: Bytes) -> Result<(), CacheError> {
        let mut request = Request::builder()
            .method(Method::PUT)
            .uri(self.url())
            .body(Full::new(blob))
            .context("build cluster put request")?;

        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, basic_auth_value(&self.secret));
        set_key(request.headers_mut(), key)?;
        set_metadata(request.headers_mut(), &metadata)?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| self.unavailable(err))?;

        if response.status() != StatusCode::OK {
            return Err(CacheError::Other(anyhow!(
                "cluster node {}: unexpected HTTP {}",
                self.node,
                response.status()
            )));
        }

        Ok(())
    }
}
