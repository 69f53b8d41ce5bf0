//! Integration tests for ACME issuance against the Pebble test server
//!
//! Pebble (Let's Encrypt's test ACME server) validates DNS-01 challenges
//! against challtestsrv, whose management API plays the role of the DNS
//! provider here.
//!
//! To run these tests:
//! ```
//! # Requires Docker to be running
//! cargo test -p autocert-cert --test pebble_acme_test -- --ignored
//! ```

use async_trait::async_trait;
use autocert_cert::{
    AcmeAuthority, AcmeConfig, CertificateAuthority, DnsProvider, DnsProviderError,
    TxtRecordHandle,
};
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

// Install the Rustls crypto provider once for all tests
static INIT: Once = Once::new();

fn init_crypto_provider() {
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install Rustls crypto provider");
    });
}

/// Pebble's minica root CA certificate (from Pebble repository)
/// This is used to verify Pebble's TLS server certificate
const PEBBLE_MINICA_ROOT_CA: &str = r#"-----BEGIN CERTIFICATE-----
MIIDPzCCAiegAwIBAgIIU0Xm9UFdQxUwDQYJKoZIhvcNAQELBQAwIDEeMBwGA1UE
AxMVbWluaWNhIHJvb3QgY2EgNTM0NWU2MCAXDTI1MDkwMzIzANDAwNVoYDzIxMjUw
OTAzMjM0MDA1WjAgMR4wHAYDVQQDExVtaW5pY2Egcm9vdCBjYSA1MzQ1ZTYwggEi
MA0GCSqGSIb3DQEBAQUAA4IBDwAwggEKAoIBAQC5WgZNoVJandj43kkLyU50vzCZ
alozvdRo3OFiKoDtmqKPNWRNO2hC9AUNxTDJco51Yc42u/WV3fPbbhSznTiOOVtn
Ajm6iq4I5nZYltGGZetGDOQWr78y2gWY+SG078MuOO2hyDIiKtVc3xiXYA+8Hluu
9F8KbqSS1h55yxZ9b87eKR+B0zu2ahzBCIHKmKWgc6N13l7aDxxY3D6uq8gtJRU0
toumyLbdzGcupVvjbjDP11nl07RESDWBLG1/g3ktJvqIa4BWgU2HMh4rND6y8OD3
Hy3H8MY6CElL+MOCbFJjWqhtOxeFyZZV9q3kYnk9CAuQJKMEGuN4GU6tzhW1AgMB
AAGjezB5MA4GA1UdDwEB/wQEAwIChDATBgNVHSUEDDAKBggrBgEFBQcDATASBgNV
HRMBAf8ECDAGAQH/AgEAMB0GA1UdDgQWBBSu8RGpErgYUoYnQuwCq+/ggTiEjDAf
BgNVHSMEGDAWgBSu8RGpErgYUoYnQuwCq+/ggTiEjDANBgkqhkiG9w0BAQsFAAOC
AQEAXDVYov1+f6EL7S41LhYQkEX/GyNNzsEvqxE9U0+3Iri5JfkcNOiA9O9L6Z+Y
bqcsXV93s3vi4r4WSWuc//wHyJYrVe5+tK4nlFpbJOvfBUtnoBDyKNxXzZCxFJVh
f9uc8UejRfQMFbDbhWY/x83y9BDufJHHq32OjCIN7gp2UR8rnfYvlz7Zg4qkJBsn
DG4dwd+pRTCFWJOVIG0JoNhK3ZmE7oJ1N4H38XkZ31NPcMksKxpsLLIS9+mosZtg
4olL7tMPJklx5ZaeMFaKRDq4Gdxkbw4+O4vRgNm3Z8AXWKknOdfgdpqLUPPhRcP4
v1lhy71EhBuXXwRQJry0lTdF+w==
-----END CERTIFICATE-----"#;

/// Pebble ACME server port
const PEBBLE_HTTPS_PORT: u16 = 14000;

/// Challtestsrv ports for DNS challenge mock
const CHALLTESTSRV_HTTP_PORT: u16 = 8055;
const CHALLTESTSRV_DNS_PORT: u16 = 8053;

/// Docker network name for Pebble and challtestsrv communication
const TEST_NETWORK: &str = "autocert-pebble-net";
/// Container name for challtestsrv (used as DNS server hostname)
const CHALLTESTSRV_CONTAINER_NAME: &str = "autocert-challtestsrv";

/// DNS provider backed by the challtestsrv management API
struct ChallTestSrvProvider {
    mgmt_url: String,
    client: reqwest::Client,
}

impl ChallTestSrvProvider {
    fn new(mgmt_url: String) -> Self {
        Self {
            mgmt_url,
            client: reqwest::Client::new(),
        }
    }

    /// challtestsrv requires FQDN with trailing period
    fn fqdn(name: &str) -> String {
        if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{}.", name)
        }
    }
}

#[async_trait]
impl DnsProvider for ChallTestSrvProvider {
    async fn publish_txt(
        &self,
        record_name: &str,
        record_value: &str,
    ) -> Result<TxtRecordHandle, DnsProviderError> {
        self.client
            .post(format!("{}/set-txt", self.mgmt_url))
            .json(&serde_json::json!({
                "host": Self::fqdn(record_name),
                "value": record_value
            }))
            .send()
            .await?
            .error_for_status()?;

        Ok(TxtRecordHandle::new(
            record_name.to_string(),
            record_name.to_string(),
        ))
    }

    async fn remove_txt(&self, handle: &TxtRecordHandle) -> Result<(), DnsProviderError> {
        self.client
            .post(format!("{}/clear-txt", self.mgmt_url))
            .json(&serde_json::json!({ "host": Self::fqdn(handle.record_name()) }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Helper to create Docker network (idempotent - ignores if exists)
fn ensure_docker_network(name: &str) {
    let output = std::process::Command::new("docker")
        .args(["network", "create", name])
        .output()
        .expect("Failed to execute docker network create");

    // Ignore error if network already exists
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("already exists") {
            panic!("Failed to create Docker network: {}", stderr);
        }
    }
}

struct PebbleEnv {
    _challtestsrv: ContainerAsync<GenericImage>,
    _pebble: ContainerAsync<GenericImage>,
    directory_url: String,
    mgmt_url: String,
}

/// Start challtestsrv, then Pebble resolving DNS through it
async fn start_pebble() -> PebbleEnv {
    ensure_docker_network(TEST_NETWORK);

    // GenericImage methods (with_wait_for, with_exposed_port) must come before
    // ImageExt methods (with_network, with_container_name)
    let challtestsrv = GenericImage::new("ghcr.io/letsencrypt/pebble-challtestsrv", "latest")
        .with_wait_for(WaitFor::seconds(3))
        .with_exposed_port(ContainerPort::Tcp(CHALLTESTSRV_HTTP_PORT))
        .with_exposed_port(ContainerPort::Tcp(CHALLTESTSRV_DNS_PORT))
        .with_network(TEST_NETWORK)
        .with_container_name(CHALLTESTSRV_CONTAINER_NAME)
        .start()
        .await
        .expect("Failed to start challtestsrv");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let dns_server = format!("{}:{}", CHALLTESTSRV_CONTAINER_NAME, CHALLTESTSRV_DNS_PORT);
    let pebble = GenericImage::new("ghcr.io/letsencrypt/pebble", "latest")
        .with_wait_for(WaitFor::seconds(3))
        .with_exposed_port(ContainerPort::Tcp(PEBBLE_HTTPS_PORT))
        .with_network(TEST_NETWORK)
        .with_env_var("PEBBLE_VA_NOSLEEP", "1")
        .with_cmd(vec![
            "-config",
            "/test/config/pebble-config.json",
            "-dnsserver",
            &dns_server,
        ])
        .start()
        .await
        .expect("Failed to start Pebble");

    let pebble_port = pebble.get_host_port_ipv4(PEBBLE_HTTPS_PORT).await.unwrap();
    let mgmt_port = challtestsrv
        .get_host_port_ipv4(CHALLTESTSRV_HTTP_PORT)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    PebbleEnv {
        _challtestsrv: challtestsrv,
        _pebble: pebble,
        directory_url: format!("https://localhost:{}/dir", pebble_port),
        mgmt_url: format!("http://localhost:{}", mgmt_port),
    }
}

fn authority(env: &PebbleEnv, dir: &Path) -> AcmeAuthority {
    let root_ca_path = dir.join("pebble_minica_root_ca.pem");
    std::fs::write(&root_ca_path, PEBBLE_MINICA_ROOT_CA).expect("Failed to write root CA file");

    let config = AcmeConfig {
        directory_url: Some(env.directory_url.clone()),
        root_ca: Some(root_ca_path),
        account_path: dir.join("account.json"),
        propagation_delay: Duration::ZERO,
        order_timeout: Duration::from_secs(60),
        ..AcmeConfig::default()
    };

    AcmeAuthority::new(
        config,
        Arc::new(ChallTestSrvProvider::new(env.mgmt_url.clone())),
    )
}

/// Obtain, then renew with the same key, persisting the account in between
#[tokio::test]
#[ignore = "Requires Docker - full ACME flow test"]
async fn test_obtain_and_renew_dns01() {
    init_crypto_provider();
    let env = start_pebble().await;
    let dir = tempfile::tempdir().unwrap();

    let acme = authority(&env, dir.path());
    let issued = acme
        .obtain("autocert.example.com", "admin@example.com")
        .await
        .expect("Failed to obtain certificate");

    assert_eq!(issued.domain, "autocert.example.com");
    assert!(issued
        .certificate_chain_pem
        .contains("-----BEGIN CERTIFICATE-----"));
    assert!(issued.not_after > issued.not_before);
    assert!(
        dir.path().join("account.json").exists(),
        "account credentials should be persisted"
    );

    // A fresh authority reuses the stored account, so renewal needs no email
    let acme = authority(&env, dir.path());
    let renewed = acme.renew(&issued).await.expect("Failed to renew");

    assert_eq!(renewed.domain, issued.domain);
    assert_eq!(renewed.private_key_pem, issued.private_key_pem);
    assert_ne!(renewed.issuer_id, issued.issuer_id);
}

/// Renewal from a record whose key cannot be parsed fails instead of panicking
#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_renew_with_corrupt_key_fails() {
    init_crypto_provider();
    let env = start_pebble().await;
    let dir = tempfile::tempdir().unwrap();

    let acme = authority(&env, dir.path());
    let mut issued = acme
        .obtain("corrupt.example.com", "admin@example.com")
        .await
        .expect("Failed to obtain certificate");

    issued.private_key_pem = "not a key".to_string();
    assert!(acme.renew(&issued).await.is_err());
}
