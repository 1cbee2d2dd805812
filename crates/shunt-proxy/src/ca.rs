//! Local certificate authority for HTTPS interception.
//!
//! The CA certificate and key are kept under `<dir>/certs/ca.pem` and
//! `<dir>/keys/ca.key` and reused across runs, so a CA installed as trusted
//! once keeps working. Leaf certificates are minted per host on first use
//! and kept in memory.

use crate::error::ProxyError;
use crate::proxy::tls::server_config;
use parking_lot::Mutex;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{debug, info};

/// CA validity, days
const CA_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity, days
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdate leaves to tolerate clock skew between proxy and client
const NOT_BEFORE_OFFSET_SECS: i64 = 60;

const CA_COMMON_NAME: &str = "Shunt Proxy CA";

fn cert_error(context: &str, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::Certificate(format!("{context}: {err}"))
}

pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    cert_path: PathBuf,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load the CA stored under `dir`, generating and saving one when either
    /// file is missing.
    pub async fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let dir = dir.as_ref();
        let cert_path = dir.join("certs").join("ca.pem");
        let key_path = dir.join("keys").join("ca.key");

        let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            debug!("Loading proxy CA from {}", cert_path.display());
            (
                fs::read_to_string(&cert_path).await?,
                fs::read_to_string(&key_path).await?,
            )
        } else {
            let (cert_pem, key_pem) = generate_ca()?;
            fs::create_dir_all(dir.join("certs")).await?;
            fs::create_dir_all(dir.join("keys")).await?;
            fs::write(&cert_path, &cert_pem).await?;
            fs::write(&key_path, &key_pem).await?;
            info!("Generated proxy CA at {}", cert_path.display());
            (cert_pem, key_pem)
        };

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| cert_error("Failed to parse CA key", e))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| cert_error("Failed to load CA certificate", e))?;
        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::Certificate("No certificate found in CA PEM".to_string()))?
            .map_err(|e| cert_error("Failed to parse CA PEM", e))?;

        Ok(Self {
            issuer,
            ca_cert_der,
            ca_cert_pem: cert_pem,
            cert_path,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the CA certificate, the file to trust in clients.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// TLS configuration presenting a certificate for `host`.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        if let Some(config) = self.leaves.lock().get(host) {
            return Ok(config.clone());
        }
        let (chain, key) = self.issue_leaf(host)?;
        let config = server_config(chain, key)?;
        self.leaves.lock().insert(host.to_string(), config.clone());
        debug!("Issued certificate for {}", host);
        Ok(config)
    }

    /// Sign a certificate for `host`. Returns the chain `[leaf, ca]`.
    pub fn issue_leaf(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(
                host.try_into()
                    .map_err(|e| cert_error(&format!("Invalid host name '{host}'"), e))?,
            )],
        };

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair =
            KeyPair::generate().map_err(|e| cert_error("Failed to generate key pair", e))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| cert_error(&format!("Failed to sign certificate for '{host}'"), e))?;

        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| cert_error("Failed to serialize leaf key", e))?;
        Ok((vec![cert.der().clone(), self.ca_cert_der.clone()], key))
    }

    /// Add the CA certificate to the OS trust store.
    pub async fn install(&self) -> Result<(), ProxyError> {
        if !self.cert_path.exists() {
            return Err(ProxyError::Certificate(format!(
                "Proxy certificate {} is absent",
                self.cert_path.display()
            )));
        }
        install_trusted(&self.cert_path).await?;
        info!("Installed {} as a trusted root", self.cert_path.display());
        Ok(())
    }
}

fn generate_ca() -> Result<(String, String), ProxyError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "Shunt");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| cert_error("Failed to generate CA key", e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| cert_error("Failed to generate CA", e))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(windows)]
async fn install_trusted(cert_path: &Path) -> Result<(), ProxyError> {
    let output = tokio::process::Command::new("certutil")
        .args(["-addstore", "-enterprise", "-f", "Root"])
        .arg(cert_path)
        .output()
        .await
        .map_err(|e| ProxyError::CertificateInstall(e.to_string()))?;
    if !output.status.success() {
        return Err(ProxyError::CertificateInstall(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ));
    }
    Ok(())
}

#[cfg(not(windows))]
async fn install_trusted(_cert_path: &Path) -> Result<(), ProxyError> {
    Err(ProxyError::UnsupportedPlatform(std::env::consts::OS))
}
