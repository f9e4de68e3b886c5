//! TLS certificate issuance
//!
//! Two issuers share the [`CertificateIssuer`] contract: the local
//! [`CertificateAuthority`], which holds its own CA key, and
//! [`crate::remote::RemoteCaSigner`], which submits requests to an external
//! signing authority. Both persist material through a [`BlobStore`] chosen
//! from the paths in [`AuthOptions`].

mod authority;
mod info;
mod request;

pub use authority::CertificateAuthority;
pub use info::{CertificateInfo, RequestInfo};
pub use request::SigningRequest;

use std::net::IpAddr;
use std::sync::Arc;

use machine_common::identity::current_username;
use machine_common::logging::Logger;

use crate::blob::{open_blob_store, BlobStore, PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
use crate::config::{AuthOptions, StorageConfig};
use crate::error::{MachineError, Result};
use crate::kv::KvConnector;
use crate::remote::RemoteCaSigner;

/// RSA modulus size for CA, client and server keys
pub const DEFAULT_KEY_BITS: u32 = 2048;

/// Validity of every certificate issued by the local CA
pub const CERT_VALIDITY_DAYS: u32 = 1080;

/// Suffix of the organization name used for bootstrap material
pub const BOOTSTRAP_ORG_SUFFIX: &str = "<bootstrap>";

/// Issues the CA, client and server certificates a machine needs
pub trait CertificateIssuer {
    /// Create the CA and client certificate if absent.
    ///
    /// Artifacts already present are left untouched, so calling this again
    /// after a partial failure completes the set.
    fn bootstrap(&self, auth: &AuthOptions) -> Result<()>;

    /// Issue a server certificate for `hosts` plus `auth.server_cert_sans`,
    /// written to `auth.server_cert_path` and `auth.server_key_path`.
    fn generate_server_cert(
        &self,
        hosts: &[String],
        auth: &AuthOptions,
        org: &str,
        bits: u32,
    ) -> Result<()>;

    /// Issue the client certificate at `auth.client_cert_path`
    fn generate_client_cert(&self, auth: &AuthOptions, org: &str, bits: u32) -> Result<()>;
}

/// Organization of bootstrap material: `<user>.<bootstrap>`
pub fn bootstrap_org() -> String {
    format!("{}.{}", current_username(), BOOTSTRAP_ORG_SUFFIX)
}

/// Parameters of one certificate issued by the local CA
#[derive(Debug, Clone)]
pub struct CertSpec {
    /// DNS names or IP addresses; `[""]` requests a client certificate
    pub hosts: Vec<String>,
    pub cert_path: String,
    pub key_path: String,
    pub ca_cert_path: String,
    pub ca_key_path: String,
    pub org: String,
    pub bits: u32,
}

impl CertSpec {
    /// Client certificates carry no host names at all
    pub fn is_client(&self) -> bool {
        self.hosts.iter().all(|host| host.is_empty())
    }
}

/// Host list split into subject alternative name kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostNames {
    pub ips: Vec<IpAddr>,
    pub dns: Vec<String>,
}

impl HostNames {
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.dns.is_empty()
    }
}

/// Classify each host as an IP address if it parses strictly as one, else a
/// DNS name. Empty entries are skipped.
pub fn classify_hosts<S: AsRef<str>>(hosts: &[S]) -> HostNames {
    let mut names = HostNames::default();
    for host in hosts.iter().map(|h| h.as_ref().trim()) {
        if host.is_empty() {
            continue;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => names.ips.push(ip),
            Err(_) => names.dns.push(host.to_string()),
        }
    }
    names
}

/// Requested hosts followed by the configured extra SANs, without duplicates
/// Reject a server request that names no host of its own. Configured SANs
/// alone do not identify a machine.
pub(crate) fn require_hosts(hosts: &[String]) -> Result<()> {
    if hosts.iter().all(|h| h.trim().is_empty()) {
        return Err(MachineError::InvalidInput(
            "server certificate needs at least one host".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn server_hosts(hosts: &[String], auth: &AuthOptions) -> Vec<String> {
    let mut all: Vec<String> = Vec::with_capacity(hosts.len() + auth.server_cert_sans.len());
    for host in hosts.iter().chain(auth.server_cert_sans.iter()) {
        let host = host.trim();
        if !host.is_empty() && !all.iter().any(|h| h == host) {
            all.push(host.to_string());
        }
    }
    all
}

/// A certificate and its private key, both PEM encoded
#[derive(Clone)]
pub struct CertificateMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl CertificateMaterial {
    /// Persist the pair. The key goes first so an existing certificate always
    /// has its key next to it.
    pub fn write_to(&self, store: &dyn BlobStore, cert_path: &str, key_path: &str) -> Result<()> {
        store.write(key_path, &self.key_pem, PRIVATE_FILE_MODE)?;
        store.write(cert_path, &self.cert_pem, PUBLIC_FILE_MODE)
    }
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Certificates a host presents on its TLS endpoint
#[derive(Debug, Clone)]
pub struct HostCerts {
    pub ca_cert: Vec<u8>,
    pub server_cert: Vec<u8>,
    pub server_key: Vec<u8>,
}

/// Read the CA certificate and the host's server pair
pub fn load_host_certs(store: &dyn BlobStore, auth: &AuthOptions) -> Result<HostCerts> {
    Ok(HostCerts {
        ca_cert: store.read(&auth.ca_cert_path)?,
        server_cert: store.read(&auth.server_cert_path)?,
        server_key: store.read(&auth.server_key_path)?,
    })
}

/// Location whose backend holds the certificates described by `auth`
pub(crate) fn store_location(auth: &AuthOptions) -> &str {
    if auth.cert_dir.is_empty() {
        &auth.ca_cert_path
    } else {
        &auth.cert_dir
    }
}

pub(crate) fn open_cert_store(
    auth: &AuthOptions,
    connector: &KvConnector,
    logger: &Arc<Logger>,
) -> Result<Arc<dyn BlobStore>> {
    open_blob_store(store_location(auth), connector, logger.clone())
}

/// Bootstrap the global material of `config` with the remote CA when one is
/// configured, else the local CA
pub fn bootstrap_certificates(
    config: &StorageConfig,
    connector: &KvConnector,
    logger: Arc<Logger>,
) -> Result<()> {
    let auth = config.auth_options();
    if auth.uses_remote_ca() {
        RemoteCaSigner::new(connector.clone(), logger)
            .with_timeout(config.request_timeout())
            .bootstrap(&auth)
    } else {
        CertificateAuthority::new(connector.clone(), logger).bootstrap(&auth)
    }
}
