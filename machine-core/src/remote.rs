//! Issuance through a remote cfssl-compatible signing authority
//!
//! Every call derives its TLS client from the material currently in the
//! store: a local CA certificate becomes an extra trust root, and an existing
//! client certificate/key pair is presented for mutual TLS. Nothing is
//! persisted until a certificate has been received and checked against the
//! locally generated key.

use std::sync::Arc;
use std::time::Duration;

use machine_common::identity::current_username;
use machine_common::logging::{Component, Logger};
use reqwest::blocking::Client;
use reqwest::{Certificate, Identity, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::blob::{BlobStore, PUBLIC_FILE_MODE};
use crate::cert::{
    bootstrap_org, open_cert_store, require_hosts, server_hosts, CertificateInfo,
    CertificateIssuer, CertificateMaterial, SigningRequest, DEFAULT_KEY_BITS,
};
use crate::config::{AuthOptions, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{MachineError, Result};
use crate::kv::KvConnector;

pub const SIGN_PATH: &str = "api/v1/cfssl/sign";
pub const INFO_PATH: &str = "api/v1/cfssl/info";

/// Signing profile requested from the authority
pub const DEFAULT_PROFILE: &str = "node";

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    certificate_request: &'a str,
    profile: &'a str,
}

#[derive(Debug, Serialize)]
struct InfoRequest<'a> {
    label: &'a str,
    profile: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SignResult {
    #[serde(default)]
    certificate: String,
}

/// The authority's own certificate and signing policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CaInfo {
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub usages: Vec<String>,
    #[serde(default)]
    pub expiry: String,
}

/// Client of a remote signing authority
pub struct RemoteCaSigner {
    connector: KvConnector,
    logger: Arc<Logger>,
    timeout: Duration,
    profile: String,
}

impl RemoteCaSigner {
    pub fn new(connector: KvConnector, logger: Arc<Logger>) -> Self {
        Self {
            connector,
            logger: Arc::new(logger.with_component(Component::RemoteCa)),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            profile: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Bound on connecting to and waiting for the authority
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Query the authority's info endpoint
    pub fn ca_info(&self, auth: &AuthOptions) -> Result<CaInfo> {
        let store = open_cert_store(auth, &self.connector, &self.logger)?;
        let base = base_url(&auth.remote_ca)?;
        let client = self.client(store.as_ref(), auth)?;
        let info: CaInfo = self.post(
            &client,
            &base,
            INFO_PATH,
            &InfoRequest {
                label: "",
                profile: &self.profile,
            },
        )?;
        if info.certificate.trim().is_empty() {
            return Err(MachineError::EmptyResult {
                endpoint: INFO_PATH.to_string(),
            });
        }
        Ok(info)
    }

    /// Submit `request`, validate the issued certificate and persist it with
    /// the request key.
    pub fn issue(
        &self,
        auth: &AuthOptions,
        request: &SigningRequest,
        cert_path: &str,
        key_path: &str,
    ) -> Result<()> {
        let store = open_cert_store(auth, &self.connector, &self.logger)?;
        let base = base_url(&auth.remote_ca)?;
        let client = self.client(store.as_ref(), auth)?;

        let result: SignResult = self.post(
            &client,
            &base,
            SIGN_PATH,
            &SignRequest {
                certificate_request: &request.csr_pem,
                profile: &self.profile,
            },
        )?;
        if result.certificate.trim().is_empty() {
            return Err(MachineError::EmptyResult {
                endpoint: SIGN_PATH.to_string(),
            });
        }

        let issued = CertificateInfo::from_pem(result.certificate.as_bytes())
            .map_err(|e| MachineError::Protocol(format!("unusable certificate: {e}")))?;
        if issued.public_key_der != request.public_key_der()? {
            return Err(MachineError::Protocol(
                "issued certificate does not match the requested key".to_string(),
            ));
        }

        self.logger.info(format!(
            "Received certificate {} for {}",
            issued.serial,
            issued.common_name.as_deref().unwrap_or("<no CN>")
        ));
        CertificateMaterial {
            cert_pem: result.certificate.into_bytes(),
            key_pem: request.private_key_pem()?,
        }
        .write_to(store.as_ref(), cert_path, key_path)
    }

    fn client(&self, store: &dyn BlobStore, auth: &AuthOptions) -> Result<Client> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .no_proxy()
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        if store.exists(&auth.ca_cert_path) {
            let pem = store.read(&auth.ca_cert_path)?;
            let root = Certificate::from_pem(&pem).map_err(|e| {
                MachineError::Configuration(format!(
                    "Unusable CA certificate {}: {e}",
                    auth.ca_cert_path
                ))
            })?;
            builder = builder.add_root_certificate(root);
        }

        if store.exists(&auth.client_cert_path) && store.exists(&auth.client_key_path) {
            let mut pem = store.read(&auth.client_key_path)?;
            pem.extend_from_slice(&store.read(&auth.client_cert_path)?);
            let identity = Identity::from_pem(&pem).map_err(|e| {
                MachineError::Configuration(format!(
                    "Unusable client certificate {}: {e}",
                    auth.client_cert_path
                ))
            })?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| MachineError::Configuration(format!("Cannot build TLS client: {e}")))
    }

    fn post<B, T>(&self, client: &Client, base: &Url, path: &str, body: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let url = base
            .join(path)
            .map_err(|e| MachineError::Configuration(format!("Invalid remote CA URL: {e}")))?;
        self.logger.debug(format!("POST {url}"));

        let response = client
            .post(url.clone())
            .json(body)
            .send()
            .map_err(|e| MachineError::Transport(format!("{url}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| MachineError::Transport(format!("{url}: {e}")))?;

        if status != StatusCode::OK {
            self.logger
                .warn(format!("Remote CA answered {status} on {path}"));
            return Err(MachineError::RemoteStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| MachineError::Protocol(format!("{path}: {e}")))?;
        envelope.result.ok_or_else(|| MachineError::EmptyResult {
            endpoint: path.to_string(),
        })
    }
}

impl CertificateIssuer for RemoteCaSigner {
    fn bootstrap(&self, auth: &AuthOptions) -> Result<()> {
        let store = open_cert_store(auth, &self.connector, &self.logger)?;

        if !store.exists(&auth.ca_cert_path) {
            self.logger
                .info(format!("Fetching CA certificate from {}", auth.remote_ca));
            let info = self
                .ca_info(auth)
                .map_err(|e| MachineError::bootstrap("CA certificate", e))?;
            store
                .write(&auth.ca_cert_path, info.certificate.as_bytes(), PUBLIC_FILE_MODE)
                .map_err(|e| MachineError::bootstrap("CA certificate", e))?;
        }

        if !store.exists(&auth.client_cert_path) {
            self.logger
                .info(format!("Requesting client certificate: {}", auth.client_cert_path));
            self.generate_client_cert(auth, &bootstrap_org(), DEFAULT_KEY_BITS)
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
        let request = SigningRequest::for_server(&server_hosts(hosts, auth), org, bits)?;
        self.issue(auth, &request, &auth.server_cert_path, &auth.server_key_path)
    }

    fn generate_client_cert(&self, auth: &AuthOptions, org: &str, bits: u32) -> Result<()> {
        let request = SigningRequest::for_client(&current_username(), org, bits)?;
        self.issue(auth, &request, &auth.client_cert_path, &auth.client_key_path)
    }
}

/// Parse the authority URL so that relative endpoint paths append to it
fn base_url(remote_ca: &str) -> Result<Url> {
    let mut url = Url::parse(remote_ca).map_err(|e| {
        MachineError::Configuration(format!("Malformed remote CA URL {remote_ca:?}: {e}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MachineError::Configuration(format!(
            "Unsupported remote CA scheme: {}",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_append_to_base_path() {
        let base = base_url("https://ca.internal:8888/pki").unwrap();
        assert_eq!(
            base.join(SIGN_PATH).unwrap().as_str(),
            "https://ca.internal:8888/pki/api/v1/cfssl/sign"
        );
        let base = base_url("http://127.0.0.1:9000").unwrap();
        assert_eq!(
            base.join(INFO_PATH).unwrap().as_str(),
            "http://127.0.0.1:9000/api/v1/cfssl/info"
        );
    }

    #[test]
    fn malformed_urls_are_configuration_errors() {
        assert!(matches!(base_url("not a url"), Err(MachineError::Configuration(_))));
        assert!(matches!(
            base_url("ftp://ca.internal"),
            Err(MachineError::Configuration(_))
        ));
    }

    #[test]
    fn request_bodies_use_wire_names() {
        let body = serde_json::to_value(SignRequest {
            certificate_request: "CSR",
            profile: "node",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"certificate_request": "CSR", "profile": "node"}));

        let body = serde_json::to_value(InfoRequest {
            label: "",
            profile: "node",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"label": "", "profile": "node"}));
    }

    #[test]
    fn null_result_decodes_as_absent() {
        let envelope: Envelope<SignResult> = serde_json::from_str(r#"{"result":null}"#).unwrap();
        assert!(envelope.result.is_none());
        let envelope: Envelope<CaInfo> = serde_json::from_str(
            r#"{"success":true,"result":{"certificate":"PEM","usages":["signing"],"expiry":"8760h"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.result.unwrap().usages, vec!["signing"]);
    }
}
