//! Read-only views of certificates and signing requests

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use crate::error::{MachineError, Result};

/// Fields of an X.509 certificate relevant to machine provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub is_ca: bool,
    pub server_auth: bool,
    pub client_auth: bool,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Unix timestamps
    pub not_before: i64,
    pub not_after: i64,
    /// Hex encoded serial number
    pub serial: String,
    /// DER encoded SubjectPublicKeyInfo
    pub public_key_der: Vec<u8>,
}

impl CertificateInfo {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, pem) = parse_x509_pem(pem)
            .map_err(|e| MachineError::Certificate(format!("Invalid certificate PEM: {e}")))?;
        Self::from_der(&pem.contents)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| MachineError::Certificate(format!("Failed to parse certificate: {e}")))?;

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);
        let (server_auth, client_auth) = cert
            .extended_key_usage()
            .ok()
            .flatten()
            .map(|eku| (eku.value.server_auth, eku.value.client_auth))
            .unwrap_or((false, false));

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            collect_names(&san.value.general_names, &mut dns_names, &mut ip_addresses);
        }

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            common_name: first_attr(cert.subject().iter_common_name()),
            organization: first_attr(cert.subject().iter_organization()),
            is_ca,
            server_auth,
            client_auth,
            dns_names,
            ip_addresses,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            serial: hex::encode(cert.raw_serial()),
            public_key_der: cert.public_key().raw.to_vec(),
        })
    }
}

/// Fields of a PKCS#10 certificate signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub subject: String,
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub public_key_der: Vec<u8>,
}

impl RequestInfo {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, pem) = parse_x509_pem(pem)
            .map_err(|e| MachineError::Certificate(format!("Invalid CSR PEM: {e}")))?;
        let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
            .map_err(|e| MachineError::Certificate(format!("Failed to parse CSR: {e}")))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for extension in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = extension {
                    collect_names(&san.general_names, &mut dns_names, &mut ip_addresses);
                }
            }
        }

        let info = &csr.certification_request_info;
        Ok(Self {
            subject: info.subject.to_string(),
            common_name: first_attr(info.subject.iter_common_name()),
            organization: first_attr(info.subject.iter_organization()),
            dns_names,
            ip_addresses,
            public_key_der: info.subject_pki.raw.to_vec(),
        })
    }
}

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn collect_names(names: &[GeneralName<'_>], dns: &mut Vec<String>, ips: &mut Vec<IpAddr>) {
    for name in names {
        match name {
            GeneralName::DNSName(host) => dns.push(host.to_string()),
            GeneralName::IPAddress(bytes) => {
                if let Some(ip) = ip_from_bytes(bytes) {
                    ips.push(ip);
                }
            }
            _ => {}
        }
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
