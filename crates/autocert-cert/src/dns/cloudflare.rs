//! Cloudflare DNS API provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::{DnsProvider, DnsProviderError, TxtRecordHandle};

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const TXT_TTL: u32 = 120;

/// Cloudflare credentials and endpoint
#[derive(Clone)]
pub struct CloudflareConfig {
    /// API token with `Zone.DNS:Edit` permission
    pub api_token: String,
    /// Zone id; looked up from the record name when absent
    pub zone_id: Option<String>,
    pub api_base: String,
}

impl std::fmt::Debug for CloudflareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareConfig")
            .field("api_token", &"<redacted>")
            .field("zone_id", &self.zone_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl CloudflareConfig {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            zone_id: None,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Read `CLOUDFLARE_DNS_API_TOKEN` (or `CF_DNS_API_TOKEN`) and the optional
    /// `CLOUDFLARE_ZONE_ID`.
    pub fn from_env() -> Result<Self, DnsProviderError> {
        let api_token = std::env::var("CLOUDFLARE_DNS_API_TOKEN")
            .or_else(|_| std::env::var("CF_DNS_API_TOKEN"))
            .map_err(|_| DnsProviderError::MissingSetting("CLOUDFLARE_DNS_API_TOKEN"))?;

        let mut config = Self::new(api_token);
        config.zone_id = std::env::var("CLOUDFLARE_ZONE_ID")
            .ok()
            .filter(|zone| !zone.is_empty());
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

#[derive(Debug, Serialize)]
struct NewTxtRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

impl<T> Envelope<T> {
    fn into_result(self) -> Result<Option<T>, DnsProviderError> {
        if self.success {
            return Ok(self.result);
        }
        let message = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(DnsProviderError::Provider(message))
    }
}

/// Candidate zone names for a record, most specific first:
/// `_acme-challenge.www.example.com` -> `www.example.com`, `example.com`
fn zone_candidates(record_name: &str) -> Vec<String> {
    let labels: Vec<&str> = record_name
        .trim_end_matches('.')
        .split('.')
        .skip_while(|label| label.starts_with('_'))
        .collect();

    (0..labels.len().saturating_sub(1))
        .map(|start| labels[start..].join("."))
        .collect()
}

/// Cloudflare DNS-01 provider
pub struct CloudflareDnsProvider {
    config: CloudflareConfig,
    client: reqwest::Client,
    zones: Mutex<HashMap<String, String>>,
}

impl CloudflareDnsProvider {
    pub fn new(config: CloudflareConfig) -> Result<Self, DnsProviderError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            client,
            zones: Mutex::new(HashMap::new()),
        })
    }

    async fn zone_for(&self, record_name: &str) -> Result<String, DnsProviderError> {
        if let Some(zone_id) = &self.config.zone_id {
            return Ok(zone_id.clone());
        }

        if let Some(zone_id) = self
            .zones
            .lock()
            .ok()
            .and_then(|zones| zones.get(record_name).cloned())
        {
            return Ok(zone_id);
        }

        for candidate in zone_candidates(record_name) {
            let envelope: Envelope<Vec<Zone>> = self
                .client
                .get(format!("{}/zones", self.config.api_base))
                .bearer_auth(&self.config.api_token)
                .query(&[("name", candidate.as_str())])
                .send()
                .await?
                .json()
                .await?;

            if let Some(zone) = envelope.into_result()?.and_then(|z| z.into_iter().next()) {
                debug!("Resolved Cloudflare zone {} for {}", zone.id, candidate);
                if let Ok(mut zones) = self.zones.lock() {
                    zones.insert(record_name.to_string(), zone.id.clone());
                }
                return Ok(zone.id);
            }
        }

        Err(DnsProviderError::ZoneNotFound(record_name.to_string()))
    }
}

#[async_trait]
impl DnsProvider for CloudflareDnsProvider {
    async fn publish_txt(
        &self,
        record_name: &str,
        record_value: &str,
    ) -> Result<TxtRecordHandle, DnsProviderError> {
        let zone_id = self.zone_for(record_name).await?;

        let envelope: Envelope<DnsRecord> = self
            .client
            .post(format!(
                "{}/zones/{}/dns_records",
                self.config.api_base, zone_id
            ))
            .bearer_auth(&self.config.api_token)
            .json(&NewTxtRecord {
                kind: "TXT",
                name: record_name,
                content: record_value,
                ttl: TXT_TTL,
            })
            .send()
            .await?
            .json()
            .await?;

        let record = envelope
            .into_result()?
            .ok_or_else(|| DnsProviderError::Provider("empty record in response".to_string()))?;

        debug!("Published TXT record {} ({})", record_name, record.id);

        Ok(TxtRecordHandle::new(record.id, record_name.to_string()))
    }

    async fn remove_txt(&self, handle: &TxtRecordHandle) -> Result<(), DnsProviderError> {
        let zone_id = self.zone_for(handle.record_name()).await?;

        let envelope: Envelope<serde_json::Value> = self
            .client
            .delete(format!(
                "{}/zones/{}/dns_records/{}",
                self.config.api_base,
                zone_id,
                handle.record_id()
            ))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?
            .json()
            .await?;

        envelope.into_result()?;
        debug!("Removed TXT record {}", handle.record_name());
        Ok(())
    }
}
