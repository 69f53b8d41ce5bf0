//! QBox request signing
//!
//! The signed string is the request path (plus `?query` when present) and a
//! newline; form-encoded bodies are appended, JSON bodies are not.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::CdnError;

type HmacSha1 = Hmac<Sha1>;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Produce the `<access_key>:<signature>` token for an `Authorization: QBox`
/// header.
pub fn sign_request(
    access_key: &str,
    secret_key: &str,
    path_and_query: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<String, CdnError> {
    let mut mac = HmacSha1::new_from_slice(secret_key.as_bytes())
        .map_err(|e| CdnError::Signing(e.to_string()))?;

    mac.update(path_and_query.as_bytes());
    mac.update(b"\n");
    if content_type == Some(FORM_CONTENT_TYPE) {
        mac.update(body);
    }

    let signature = URL_SAFE.encode(mac.finalize().into_bytes());
    Ok(format!("{}:{}", access_key, signature))
}
