//! PKCS#10 signing requests for remote issuance

use openssl::pkey::{PKey, Private};
use rcgen::{Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, SanType};

use super::authority::{generate_rsa_key, private_key_pem};
use super::classify_hosts;
use crate::error::{MachineError, Result};

/// A freshly generated key and the request for it.
///
/// The key never leaves the process; only `csr_pem` is sent out.
#[cfg_attr(test, derive(Debug))]
pub struct SigningRequest {
    pub csr_pem: String,
    key: PKey<Private>,
}

impl SigningRequest {
    /// Server request: the first host is the common name and every host is
    /// a subject alternative name. An empty host list is rejected.
    pub fn for_server(hosts: &[String], org: &str, bits: u32) -> Result<Self> {
        let common_name = hosts
            .iter()
            .map(|h| h.trim())
            .find(|h| !h.is_empty())
            .ok_or_else(|| {
                MachineError::InvalidInput(
                    "cannot build a server certificate request without hosts".to_string(),
                )
            })?;

        let names = classify_hosts(hosts);
        let mut sans = Vec::with_capacity(names.ips.len() + names.dns.len());
        sans.extend(names.ips.into_iter().map(SanType::IpAddress));
        sans.extend(names.dns.into_iter().map(SanType::DnsName));
        Self::build(common_name, org, sans, bits)
    }

    /// Client request identified by the OS user
    pub fn for_client(user: &str, org: &str, bits: u32) -> Result<Self> {
        if user.is_empty() {
            return Err(MachineError::InvalidInput(
                "client certificate request needs a user name".to_string(),
            ));
        }
        Self::build(user, org, Vec::new(), bits)
    }

    fn build(common_name: &str, org: &str, sans: Vec<SanType>, bits: u32) -> Result<Self> {
        let key = generate_rsa_key(bits)?;
        let pkcs8 = key.private_key_to_pkcs8()?;
        let key_pair = rcgen::KeyPair::from_der(&pkcs8)
            .map_err(|e| MachineError::Certificate(format!("rcgen KeyPair conversion error: {e}")))?;

        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name);
        if !org.is_empty() {
            distinguished_name.push(DnType::OrganizationName, org);
        }
        params.distinguished_name = distinguished_name;
        params.subject_alt_names = sans;
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);

        let request = RcgenCertificate::from_params(params)
            .map_err(|e| MachineError::Certificate(format!("Failed to build CSR: {e}")))?;
        let csr_pem = request
            .serialize_request_pem()
            .map_err(|e| MachineError::Certificate(format!("Failed to encode CSR: {e}")))?;

        Ok(Self { csr_pem, key })
    }

    /// DER SubjectPublicKeyInfo of the request key
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.key.public_key_to_der()?)
    }

    /// PKCS#1 PEM of the request key
    pub fn private_key_pem(&self) -> Result<Vec<u8>> {
        private_key_pem(&self.key)
    }
}
