//! CDN domain and certificate types, plus the Qiniu wire format

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CdnError;

/// HTTPS binding of a CDN domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHttpsState {
    pub domain: String,
    /// Bound certificate id; empty when HTTPS is not enabled
    pub active_cert_id: String,
    pub force_https: bool,
}

impl DomainHttpsState {
    pub fn https_enabled(&self) -> bool {
        !self.active_cert_id.is_empty()
    }
}

/// Vendor view of an uploaded certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub cert_id: String,
    pub name: String,
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Status embedded in every Qiniu response body
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiStatus {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DomainInfo {
    #[serde(default)]
    pub https: HttpsInfo,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HttpsInfo {
    #[serde(rename = "certId", default)]
    pub cert_id: String,
    #[serde(rename = "forceHttps", default)]
    pub force_https: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CertInfoResponse {
    pub cert: CertDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CertDetail {
    #[serde(default)]
    pub certid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub dnsnames: Vec<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub not_before: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub not_after: DateTime<Utc>,
}

impl From<CertDetail> for CertInfo {
    fn from(detail: CertDetail) -> Self {
        Self {
            cert_id: detail.certid,
            name: detail.name,
            common_name: detail.common_name,
            dns_names: detail.dnsnames,
            not_before: detail.not_before,
            not_after: detail.not_after,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadCertResponse {
    #[serde(rename = "certID")]
    pub cert_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CertUpload<'a> {
    pub name: &'a str,
    pub common_name: &'a str,
    pub ca: &'a str,
    pub pri: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HttpsConf<'a> {
    pub certid: &'a str,
    #[serde(rename = "forceHttps")]
    pub force_https: bool,
}

/// Turn a response into `T`, mapping a body `code` above 200 to
/// [`CdnError::Api`] whatever the transport status was.
pub(crate) fn decode_response<T: DeserializeOwned>(
    http_status: u16,
    body: &[u8],
) -> Result<T, CdnError> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };

    let status: ApiStatus = match serde_json::from_slice(body) {
        Ok(status) => status,
        Err(e) if (200..300).contains(&http_status) => return Err(e.into()),
        Err(_) => {
            return Err(CdnError::Status {
                status: http_status,
                body: String::from_utf8_lossy(body).into_owned(),
            })
        }
    };

    if status.code > 200 {
        return Err(CdnError::Api {
            code: status.code,
            message: status.error,
        });
    }

    if !(200..300).contains(&http_status) {
        return Err(CdnError::Status {
            status: http_status,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }

    Ok(serde_json::from_slice(body)?)
}

/// Name the vendor shows for an uploaded certificate: the first DNS label
pub(crate) fn display_name(domain: &str) -> &str {
    domain.split('.').next().unwrap_or(domain)
}
