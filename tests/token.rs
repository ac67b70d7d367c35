use std::time::{SystemTime, UNIX_EPOCH};

use chacha::token;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_secs()
}

#[test]
fn test_round_trip() {
    let signed = token::sign("http://example.com/artifact", "secret").expect("sign");
    let key = token::verify(&signed, "secret").expect("verify");

    assert_eq!(key, "http://example.com/artifact");
}

#[test]
fn test_wrong_secret_is_rejected() {
    let signed = token::sign("key", "secret").expect("sign");
    assert!(token::verify(&signed, "other-secret").is_err());
}

#[test]
fn test_expired_token_is_rejected() {
    let issued_at = unix_now() - token::VALIDITY.as_secs() - 60;
    let signed = token::sign_at("key", "secret", issued_at).expect("sign");

    assert!(token::verify(&signed, "secret").is_err());
}

#[test]
fn test_not_yet_valid_token_is_rejected() {
    let signed = token::sign_at("key", "secret", unix_now() + 3600).expect("sign");

    assert!(token::verify(&signed, "secret").is_err());
}

#[test]
fn test_expiry_leeway_is_tolerated() {
    // Just over the validity boundary, but within the verification leeway
    let issued_at = unix_now() - token::VALIDITY.as_secs() - token::LEEWAY.as_secs() / 2;
    let signed = token::sign_at("key", "secret", issued_at).expect("sign");

    assert_eq!(token::verify(&signed, "secret").expect("verify"), "key");
}

#[test]
fn test_garbage_is_rejected() {
    assert!(token::verify("", "secret").is_err());
    assert!(token::verify("definitely-not-a-token", "secret").is_err());
    assert!(token::verify("a.b.c", "secret").is_err());
}

#[test]
fn test_tampered_payload_is_rejected() {
    let signed = token::sign("key", "secret").expect("sign");

    let mut parts: Vec<&str> = signed.split('.').collect();
    let other = token::sign("other-key", "secret").expect("sign other");
    let other_payload = other.split('.').nth(1).expect("payload");
    parts[1] = other_payload;
    let tampered = parts.join(".");

    assert!(token::verify(&tampered, "secret").is_err());
}
