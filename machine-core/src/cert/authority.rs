//! Local certificate authority backed by OpenSSL

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use machine_common::logging::{Component, Logger};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509NameRef, X509Ref, X509Req, X509};

use super::{
    bootstrap_org, classify_hosts, open_cert_store, require_hosts, server_hosts, CertSpec,
    CertificateIssuer, CertificateMaterial, HostNames, RequestInfo, CERT_VALIDITY_DAYS,
    DEFAULT_KEY_BITS,
};
use crate::blob::{open_blob_store, BlobStore};
use crate::config::AuthOptions;
use crate::error::{MachineError, Result};
use crate::kv::KvConnector;

/// Leaf certificates are backdated to tolerate clock skew between hosts
const NOT_BEFORE_SKEW_SECS: i64 = 5 * 60;

/// Certificate authority whose key lives in the configured store
pub struct CertificateAuthority {
    connector: KvConnector,
    logger: Arc<Logger>,
}

impl CertificateAuthority {
    pub fn new(connector: KvConnector, logger: Arc<Logger>) -> Self {
        Self {
            connector,
            logger: Arc::new(logger.with_component(Component::Certs)),
        }
    }

    /// Create a self-signed CA and persist it at `cert_path` / `key_path`
    pub fn generate_ca_certificate(
        &self,
        store: &dyn BlobStore,
        cert_path: &str,
        key_path: &str,
        org: &str,
        bits: u32,
    ) -> Result<()> {
        self.logger.info(format!("Creating CA: {cert_path}"));
        let key = generate_rsa_key(bits)?;
        let subject = subject_name(org, None)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = random_serial()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(&subject)?;
        builder.set_pubkey(&key)?;
        set_validity(&mut builder, CERT_VALIDITY_DAYS)?;

        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;

        builder.sign(&key, MessageDigest::sha256())?;
        let cert = builder.build();

        material(&cert, &key)?.write_to(store, cert_path, key_path)
    }

    /// Issue the certificate described by `spec`, signed by the CA it names.
    ///
    /// The store is selected from `spec.cert_path`; the CA pair must be
    /// readable through the same backend.
    pub fn generate_cert(&self, spec: &CertSpec) -> Result<()> {
        let store = open_blob_store(&spec.cert_path, &self.connector, self.logger.clone())?;
        let (ca_cert, ca_key) = load_ca(store.as_ref(), &spec.ca_cert_path, &spec.ca_key_path)?;

        let hosts = classify_hosts(&spec.hosts);
        let common_name = spec.hosts.iter().find(|h| !h.is_empty()).map(String::as_str);
        let subject = subject_name(&spec.org, common_name)?;
        let key = generate_rsa_key(spec.bits)?;

        let cert = build_leaf(
            &key,
            &subject,
            &hosts,
            spec.is_client(),
            &ca_cert,
            &ca_key,
            CERT_VALIDITY_DAYS,
        )?;
        self.logger.debug(format!(
            "Issued {} certificate {} ({} IP, {} DNS names)",
            if spec.is_client() { "client" } else { "server" },
            spec.cert_path,
            hosts.ips.len(),
            hosts.dns.len()
        ));
        material(&cert, &key)?.write_to(store.as_ref(), &spec.cert_path, &spec.key_path)
    }

    /// Sign an externally generated PKCS#10 request with this CA.
    ///
    /// The request's self-signature is verified; its subject and requested
    /// alternative names are carried over. Returns the certificate as PEM.
    pub fn sign_request(
        &self,
        csr_pem: &[u8],
        ca_cert_path: &str,
        ca_key_path: &str,
        validity_days: u32,
    ) -> Result<Vec<u8>> {
        let request = X509Req::from_pem(csr_pem)
            .map_err(|e| MachineError::Certificate(format!("Failed to parse CSR: {e}")))?;
        let public_key = request.public_key()?;
        if !request.verify(&public_key)? {
            return Err(MachineError::Certificate(
                "CSR signature does not match its public key".to_string(),
            ));
        }

        let info = RequestInfo::from_pem(csr_pem)?;
        let hosts = HostNames {
            ips: info.ip_addresses.clone(),
            dns: info.dns_names.clone(),
        };
        let is_client = hosts.is_empty();

        let store = open_blob_store(ca_cert_path, &self.connector, self.logger.clone())?;
        let (ca_cert, ca_key) = load_ca(store.as_ref(), ca_cert_path, ca_key_path)?;
        let cert = build_leaf(
            &public_key,
            request.subject_name(),
            &hosts,
            is_client,
            &ca_cert,
            &ca_key,
            validity_days,
        )?;
        self.logger.debug(format!(
            "Signed request for {}",
            info.common_name.as_deref().unwrap_or("<no CN>")
        ));
        Ok(cert.to_pem()?)
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn bootstrap(&self, auth: &AuthOptions) -> Result<()> {
        let store = open_cert_store(auth, &self.connector, &self.logger)?;
        let org = bootstrap_org();

        if !store.exists(&auth.ca_cert_path) {
            self.generate_ca_certificate(
                store.as_ref(),
                &auth.ca_cert_path,
                &auth.ca_private_key_path,
                &org,
                DEFAULT_KEY_BITS,
            )
            .map_err(|e| MachineError::bootstrap("CA certificate", e))?;
        }

        if !store.exists(&auth.client_cert_path) {
            self.logger
                .info(format!("Creating client certificate: {}", auth.client_cert_path));
            self.generate_client_cert(auth, &org, DEFAULT_KEY_BITS)
                .map_err(|e| MachineError::bootstrap("client certificate", e))?;
        }
        Ok(())
    }

    fn generate_server_cert(
        &self,
        hosts: &[String],
        auth: &AuthOptions,
        org: &str,
        bits: u32,
    ) -> Result<()> {
        require_hosts(hosts)?;
        self.generate_cert(&CertSpec {
            hosts: server_hosts(hosts, auth),
            cert_path: auth.server_cert_path.clone(),
            key_path: auth.server_key_path.clone(),
            ca_cert_path: auth.ca_cert_path.clone(),
            ca_key_path: auth.ca_private_key_path.clone(),
            org: org.to_string(),
            bits,
        })
    }

    fn generate_client_cert(&self, auth: &AuthOptions, org: &str, bits: u32) -> Result<()> {
        self.generate_cert(&CertSpec {
            hosts: vec![String::new()],
            cert_path: auth.client_cert_path.clone(),
            key_path: auth.client_key_path.clone(),
            ca_cert_path: auth.ca_cert_path.clone(),
            ca_key_path: auth.ca_private_key_path.clone(),
            org: org.to_string(),
            bits,
        })
    }
}

pub(crate) fn generate_rsa_key(bits: u32) -> Result<PKey<Private>> {
    if bits < 1024 {
        return Err(MachineError::InvalidInput(format!(
            "RSA key size {bits} is too small"
        )));
    }
    let rsa = Rsa::generate(bits)?;
    rsa.check_key()?;
    Ok(PKey::from_rsa(rsa)?)
}

/// PKCS#1 PEM (`RSA PRIVATE KEY`)
pub(crate) fn private_key_pem(key: &PKeyRef<Private>) -> Result<Vec<u8>> {
    Ok(key.rsa()?.private_key_to_pem()?)
}

fn material(cert: &X509, key: &PKeyRef<Private>) -> Result<CertificateMaterial> {
    Ok(CertificateMaterial {
        cert_pem: cert.to_pem()?,
        key_pem: private_key_pem(key)?,
    })
}

fn load_ca(store: &dyn BlobStore, cert_path: &str, key_path: &str) -> Result<(X509, PKey<Private>)> {
    let cert = X509::from_pem(&store.read(cert_path)?)
        .map_err(|e| MachineError::Certificate(format!("Invalid CA certificate {cert_path}: {e}")))?;
    let key = PKey::private_key_from_pem(&store.read(key_path)?)
        .map_err(|e| MachineError::Certificate(format!("Invalid CA key {key_path}: {e}")))?;
    Ok((cert, key))
}

fn subject_name(org: &str, common_name: Option<&str>) -> Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
    if let Some(cn) = common_name {
        name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    }
    Ok(name.build())
}

fn random_serial() -> Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn set_validity(builder: &mut X509Builder, days: u32) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| MachineError::Certificate(format!("System clock before epoch: {e}")))?
        .as_secs() as i64;
    let not_before = now - NOT_BEFORE_SKEW_SECS;
    let not_after = not_before + i64::from(days) * 24 * 60 * 60;
    let not_before = Asn1Time::from_unix(not_before as _)?;
    let not_after = Asn1Time::from_unix(not_after as _)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(())
}

fn build_leaf<T: HasPublic>(
    public_key: &PKeyRef<T>,
    subject: &X509NameRef,
    hosts: &HostNames,
    is_client: bool,
    ca_cert: &X509Ref,
    ca_key: &PKeyRef<Private>,
    validity_days: u32,
) -> Result<X509> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    builder.set_pubkey(public_key)?;
    set_validity(&mut builder, validity_days)?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .key_agreement()
            .build()?,
    )?;
    let usage = if is_client {
        ExtendedKeyUsage::new().client_auth().build()?
    } else {
        ExtendedKeyUsage::new().server_auth().client_auth().build()?
    };
    builder.append_extension(usage)?;

    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(aki)?;

    if !hosts.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for ip in &hosts.ips {
            san.ip(&ip.to_string());
        }
        for dns in &hosts.dns {
            san.dns(dns);
        }
        let san = san.build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(san)?;
    }

    builder.sign(ca_key, MessageDigest::sha256())?;
    Ok(builder.build())
}
