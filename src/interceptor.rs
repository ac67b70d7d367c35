use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

/// Mints per-host leaf certificates from a configured CA, so intercepted
/// CONNECT tunnels present a subject matching the target host. Leaves are
/// ephemeral: a cache would grow without bound and risk cross-host leakage.
pub struct TlsInterceptor {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
}

impl TlsInterceptor {
    pub fn new(issuer: Issuer<'static, KeyPair>, ca_cert_der: CertificateDer<'static>) -> Self {
        Self { issuer, ca_cert_der }
    }

    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
        let ca_cert_der =
            CertificateDer::from_pem_slice(ca_cert_pem.as_bytes()).context("parse CA certificate PEM")?;
        let ca_key = KeyPair::from_pem(ca_key_pem).context("parse CA private key PEM")?;
        let issuer = Issuer::from_ca_cert_der(&ca_cert_der, ca_key).context("parse CA issuer metadata")?;

        Ok(Self::new(issuer, ca_cert_der))
    }

    pub fn from_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_pem =
            std::fs::read_to_string(cert_path).with_context(|| format!("read CA certificate {cert_path}"))?;
        let key_pem =
            std::fs::read_to_string(key_path).with_context(|| format!("read CA private key {key_path}"))?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Generates a fresh ECDSA-P256 leaf for the host and returns a TLS
    /// server configuration serving it.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).context("generate leaf key")?;

        let mut params = CertificateParams::new(Vec::<String>::new()).context("leaf parameters")?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.to_string());
        params.distinguished_name = distinguished_name;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into().context("host as SAN")?));
        }

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::hours(1);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Nanosecond serials keep concurrently-minted leaves distinct.
        params.serial_number = Some(SerialNumber::from(unix_nanos().to_be_bytes().to_vec()));

        let leaf_cert = params
            .signed_by(&leaf_key, &self.issuer)
            .with_context(|| format!("sign leaf certificate for {host}"))?;

        let chain = vec![leaf_cert.der().clone(), self.ca_cert_der.clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .context("assemble TLS server configuration")?;

        Ok(Arc::new(config))
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
