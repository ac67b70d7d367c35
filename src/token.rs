use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const ISSUER: &str = "chacha";
pub const AUDIENCE_DIRECT_CONNECT: &str = "direct-connect";

pub const VALIDITY: Duration = Duration::from_secs(10 * 60);
pub const LEEWAY: Duration = Duration::from_secs(10);

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    aud: Vec<String>,
    sub: String,
    nbf: u64,
    exp: u64,
}

/// Mints a direct-connect token binding the cache key to the cluster secret.
pub fn sign(key: &str, secret: &str) -> Result<String> {
    sign_at(key, secret, unix_now())
}

pub fn sign_at(key: &str, secret: &str, now: u64) -> Result<String> {
    let claims = Claims {
        iss: ISSUER.to_string(),
        aud: vec![AUDIENCE_DIRECT_CONNECT.to_string()],
        sub: key.to_string(),
        nbf: now,
        exp: now + VALIDITY.as_secs(),
    };

    let header = URL_SAFE_NO_PAD.encode(HEADER);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).context("encode claims")?);
    let signing_input = format!("{header}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("invalid signing key")?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Verifies a direct-connect token and returns the cache key it is bound to.
pub fn verify(token: &str, secret: &str) -> Result<String> {
    verify_at(token, secret, unix_now())
}

pub fn verify_at(token: &str, secret: &str, now: u64) -> Result<String> {
    let mut parts = token.splitn(3, '.');
    let (Some(header), Some(payload), Some(signature)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("malformed token"));
    };

    #[derive(Deserialize)]
    struct Header {
        alg: String,
    }

    let header_bytes = URL_SAFE_NO_PAD.decode(header).context("malformed token header")?;
    let parsed_header: Header = serde_json::from_slice(&header_bytes).context("malformed token header")?;
    if parsed_header.alg != "HS256" {
        return Err(anyhow!("unexpected signing algorithm {}", parsed_header.alg));
    }

    let signature_bytes = URL_SAFE_NO_PAD.decode(signature).context("malformed token signature")?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("invalid signing key")?;
    mac.update(format!("{header}.{payload}").as_bytes());
    mac.verify_slice(&signature_bytes)
        .map_err(|_| anyhow!("invalid signature"))?;

    let payload_bytes = URL_SAFE_NO_PAD.decode(payload).context("malformed token payload")?;
    let claims: Claims = serde_json::from_slice(&payload_bytes).context("malformed token payload")?;

    if claims.iss != ISSUER {
        return Err(anyhow!("invalid issuer"));
    }
    if !claims.aud.iter().any(|aud| aud == AUDIENCE_DIRECT_CONNECT) {
        return Err(anyhow!("mismatched audience"));
    }
    if claims.nbf > now + LEEWAY.as_secs() {
        return Err(anyhow!("token is not valid yet"));
    }
    if claims.exp + LEEWAY.as_secs() <= now {
        return Err(anyhow!("token is expired"));
    }

    Ok(claims.sub)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
