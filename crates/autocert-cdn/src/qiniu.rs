//! Qiniu CDN API client

use async_trait::async_trait;
use autocert_cert::CertificateRecord;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::signing::sign_request;
use crate::types::{
    decode_response, display_name, ApiStatus, CertInfoResponse, CertUpload, DomainInfo,
    HttpsConf, UploadCertResponse,
};
use crate::{CdnController, CdnError, CertInfo, DomainHttpsState};

pub const DEFAULT_API_HOST: &str = "https://api.qiniu.com";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Qiniu credentials and endpoint
#[derive(Clone)]
pub struct QiniuConfig {
    pub access_key: String,
    pub secret_key: String,
    pub api_host: String,
}

impl QiniuConfig {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            api_host: DEFAULT_API_HOST.to_string(),
        }
    }

    pub fn with_api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into().trim_end_matches('/').to_string();
        self
    }
}

impl std::fmt::Debug for QiniuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QiniuConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("api_host", &self.api_host)
            .finish()
    }
}

/// Client for the Qiniu domain and SSL certificate APIs
pub struct QiniuClient {
    config: QiniuConfig,
    http: reqwest::Client,
}

impl QiniuClient {
    pub fn new(config: QiniuConfig) -> Result<Self, CdnError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { config, http })
    }

    /// Send a signed JSON request and decode the body
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T, CdnError> {
        let body = match body {
            Some(body) => serde_json::to_vec(body)?,
            None => Vec::new(),
        };
        let token = sign_request(
            &self.config.access_key,
            &self.config.secret_key,
            path,
            Some(JSON_CONTENT_TYPE),
            &body,
        )?;

        trace!("Qiniu {} {}", method, path);
        let response = self
            .http
            .request(method, format!("{}{}", self.config.api_host, path))
            .header(AUTHORIZATION, format!("QBox {}", token))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        decode_response(status, &bytes)
    }
}

#[async_trait]
impl CdnController for QiniuClient {
    async fn get_domain_https_state(&self, domain: &str) -> Result<DomainHttpsState, CdnError> {
        let info: DomainInfo = self
            .request(Method::GET, &format!("/domain/{}", domain), None::<&()>)
            .await?;

        Ok(DomainHttpsState {
            domain: domain.to_string(),
            active_cert_id: info.https.cert_id,
            force_https: info.https.force_https,
        })
    }

    async fn get_cert_info(&self, cert_id: &str) -> Result<CertInfo, CdnError> {
        let info: CertInfoResponse = self
            .request(Method::GET, &format!("/sslcert/{}", cert_id), None::<&()>)
            .await?;
        Ok(info.cert.into())
    }

    async fn upload_certificate(&self, record: &CertificateRecord) -> Result<String, CdnError> {
        let upload = CertUpload {
            name: display_name(&record.domain),
            common_name: &record.domain,
            ca: &record.certificate_chain_pem,
            pri: &record.private_key_pem,
        };

        let response: UploadCertResponse =
            self.request(Method::POST, "/sslcert", Some(&upload)).await?;
        debug!(
            "Uploaded certificate for {} as {}",
            record.domain, response.cert_id
        );
        Ok(response.cert_id)
    }

    async fn enable_https(
        &self,
        domain: &str,
        cert_id: &str,
        force_https: bool,
    ) -> Result<(), CdnError> {
        let conf = HttpsConf {
            certid: cert_id,
            force_https,
        };
        let _: ApiStatus = self
            .request(Method::PUT, &format!("/domain/{}/sslize", domain), Some(&conf))
            .await?;
        Ok(())
    }

    async fn update_https_cert_id(
        &self,
        domain: &str,
        cert_id: &str,
        force_https: bool,
    ) -> Result<(), CdnError> {
        let conf = HttpsConf {
            certid: cert_id,
            force_https,
        };
        let _: ApiStatus = self
            .request(
                Method::PUT,
                &format!("/domain/{}/httpsconf", domain),
                Some(&conf),
            )
            .await?;
        Ok(())
    }

    async fn delete_certificate(&self, cert_id: &str) -> Result<(), CdnError> {
        let _: ApiStatus = self
            .request(Method::DELETE, &format!("/sslcert/{}", cert_id), None::<&()>)
            .await?;
        Ok(())
    }
}
