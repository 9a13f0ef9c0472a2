use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Maximum distance between the signed timestamp and now.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Outcome of a signature check. Verification never panics or errors;
/// anything unexpected is reported through `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// `t=<unix>,v1=<hex>` over `"{t}.{body}"`, HMAC-SHA256.
    TimestampedSha256,
    /// `sha256=<hex>` over the raw body.
    Sha256,
    /// `sha1=<hex>` over the raw body.
    Sha1,
}

impl SignatureScheme {
    pub fn verify(&self, body: &[u8], header: &str, secret: &str) -> VerificationResult {
        match self {
            SignatureScheme::TimestampedSha256 => verify_timestamped_hmac(body, header, secret),
            SignatureScheme::Sha256 => verify_sha256_hmac(body, header, secret),
            SignatureScheme::Sha1 => verify_sha1_hmac(body, header, secret),
        }
    }
}

/// Verify a timestamped HMAC-SHA256 header against the current clock.
pub fn verify_timestamped_hmac(body: &[u8], header: &str, secret: &str) -> VerificationResult {
    verify_timestamped_hmac_at(body, header, secret, Utc::now().timestamp())
}

/// Verify a timestamped HMAC-SHA256 header as of `now` (unix seconds).
/// Header format: "t=<unix>,v1=<hex>[,v1=<hex>...]".
pub fn verify_timestamped_hmac_at(
    body: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> VerificationResult {
    if secret.is_empty() {
        return VerificationResult::invalid("webhook secret is empty");
    }

    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(value),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return VerificationResult::invalid("signature header missing timestamp");
    };
    if signatures.is_empty() {
        return VerificationResult::invalid("signature header missing v1 signature");
    }
    let ts: i64 = match timestamp.parse() {
        Ok(ts) => ts,
        Err(e) => return VerificationResult::invalid(format!("invalid timestamp: {e}")),
    };

    let skew = now.saturating_sub(ts).saturating_abs();
    if skew > TIMESTAMP_TOLERANCE_SECS {
        return VerificationResult::invalid(format!(
            "timestamp outside tolerance: {skew}s > {TIMESTAMP_TOLERANCE_SECS}s"
        ));
    }

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => return VerificationResult::invalid(format!("hmac init failed: {e}")),
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    // Every candidate is checked so the loop does not exit early on a match.
    let mut matched = false;
    for sig in signatures {
        if let Ok(provided) = hex::decode(sig) {
            matched |= bool::from(expected.as_slice().ct_eq(&provided));
        }
    }

    if matched {
        VerificationResult::valid()
    } else {
        VerificationResult::invalid("signature mismatch")
    }
}

/// Verify a "sha256=<hex>" header over the raw body.
pub fn verify_sha256_hmac(body: &[u8], header: &str, secret: &str) -> VerificationResult {
    let Some(expected_hex) = header.trim().strip_prefix("sha256=") else {
        return VerificationResult::invalid("signature header missing sha256= prefix");
    };
    if secret.is_empty() {
        return VerificationResult::invalid("webhook secret is empty");
    }
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => return VerificationResult::invalid(format!("hmac init failed: {e}")),
    };
    mac.update(body);
    compare_hex(&mac.finalize().into_bytes(), expected_hex)
}

/// Verify a "sha1=<hex>" header over the raw body.
pub fn verify_sha1_hmac(body: &[u8], header: &str, secret: &str) -> VerificationResult {
    let Some(expected_hex) = header.trim().strip_prefix("sha1=") else {
        return VerificationResult::invalid("signature header missing sha1= prefix");
    };
    if secret.is_empty() {
        return VerificationResult::invalid("webhook secret is empty");
    }
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => return VerificationResult::invalid(format!("hmac init failed: {e}")),
    };
    mac.update(body);
    compare_hex(&mac.finalize().into_bytes(), expected_hex)
}

fn compare_hex(computed: &[u8], provided_hex: &str) -> VerificationResult {
    let provided = match hex::decode(provided_hex) {
        Ok(b) => b,
        Err(e) => return VerificationResult::invalid(format!("invalid signature encoding: {e}")),
    };
    if bool::from(computed.ct_eq(&provided)) {
        VerificationResult::valid()
    } else {
        VerificationResult::invalid("signature mismatch")
    }
}

/// Produce a scheme A header for `body`; used by tests and local tooling.
pub fn sign_timestamped(body: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Produce a scheme B header for `body`.
pub fn sign_sha256(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Produce a scheme C header for `body`.
pub fn sign_sha1(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}
