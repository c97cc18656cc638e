//! Request signing checks for Listener mode.
//!
//! The platform signs `v0:{timestamp}:{body}` with the app's signing secret
//! and sends `v0=` plus the hex HMAC-SHA256 digest in `X-Slack-Signature`.

use std::time::Duration;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const SIGNATURE_HEADER: &str = "x-slack-signature";
const SIGNATURE_VERSION: &str = "v0";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing request header `{0}`")]
    MissingHeader(&'static str),
    #[error("request timestamp `{0}` is not a unix timestamp")]
    InvalidTimestamp(String),
    #[error("request timestamp is {skew_secs}s away from local clock")]
    StaleTimestamp { skew_secs: u64 },
    #[error("request signature is malformed")]
    MalformedSignature,
    #[error("request signature does not match body")]
    Mismatch,
    #[error("signing secret cannot key the request digest")]
    InvalidSecret,
}

#[derive(Debug)]
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret, tolerance: Duration::from_secs(300) }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now_unix: i64,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;

        let sent_at = timestamp
            .trim()
            .parse::<i64>()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_owned()))?;
        let skew_secs = now_unix.abs_diff(sent_at);
        if skew_secs > self.tolerance.as_secs() {
            return Err(SignatureError::StaleTimestamp { skew_secs });
        }

        let digest = signature
            .strip_prefix("v0=")
            .and_then(|hex_digest| hex::decode(hex_digest).ok())
            .ok_or(SignatureError::MalformedSignature)?;

        self.mac(timestamp, body)?.verify_slice(&digest).map_err(|_| SignatureError::Mismatch)
    }

    /// Header value the platform would send for `body` at `timestamp`.
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
        let digest = self.mac(timestamp, body)?.finalize().into_bytes();
        Ok(format!("{SIGNATURE_VERSION}={}", hex::encode(digest)))
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::InvalidSecret)?;
        mac.update(SIGNATURE_VERSION.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        Ok(mac)
    }
}
