//! Provider webhook signatures.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! HMAC-SHA256 is computed over `"{t}.{raw body}"` with the shared signing
//! secret. Unknown schemes (`v0=` and friends) are ignored.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("webhook signing secret is not configured")]
    MissingSecret,
    #[error("signature header is missing")]
    MissingHeader,
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature timestamp is outside the tolerance window")]
    TimestampOutsideTolerance,
    #[error("no signature matches the payload")]
    NoMatchingSignature,
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader)?,
                )
            }
            "v1" if !value.is_empty() => signatures.push(value),
            _ => {}
        }
    }
    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(ParsedHeader {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::MalformedHeader),
    }
}

fn compute(payload: &[u8], timestamp: i64, secret: &str) -> Result<Vec<u8>, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::MissingSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Check `header` against the raw request body.
///
/// `now` and `tolerance_secs` bound replay: a signature whose timestamp is
/// further than the tolerance from `now`, in either direction, is rejected.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    if header.trim().is_empty() {
        return Err(SignatureError::MissingHeader);
    }
    let parsed = parse_header(header)?;
    if (now - parsed.timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampOutsideTolerance);
    }

    let expected = compute(payload, parsed.timestamp, secret)?;
    let matched = parsed.signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|provided| bool::from(expected.ct_eq(&provided)))
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(SignatureError::NoMatchingSignature)
    }
}

/// Produce a header value the way the provider does. Used by tests and local
/// tooling that replays captured events.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let digest = compute(payload, timestamp, secret).unwrap_or_default();
    format!("t={},v1={}", timestamp, hex::encode(digest))
}
