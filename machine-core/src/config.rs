//! Storage and TLS path configuration
//!
//! [`StorageConfig`] is resolved once at startup from a base location and
//! hands out [`AuthOptions`] describing where CA, client and server material
//! lives. Paths keep the form of the base location, so a URL base yields URL
//! paths that the blob store factory routes to the key-value backend.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MachineError, Result};
use crate::location::StorageRoot;

/// Environment variable overriding the storage base location
pub const STORAGE_PATH_ENV: &str = "MACHINE_STORAGE_PATH";

/// Timeout for remote CA requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca-key.pem";
pub const CLIENT_CERT_FILE: &str = "cert.pem";
pub const CLIENT_KEY_FILE: &str = "key.pem";
pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server-key.pem";

/// TLS material locations for one host, or for the global client identity.
///
/// Embedded in host descriptors, hence the PascalCase field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthOptions {
    pub cert_dir: String,
    pub ca_cert_path: String,
    pub ca_private_key_path: String,
    pub ca_cert_remote_path: String,
    pub server_cert_path: String,
    pub server_key_path: String,
    pub client_key_path: String,
    pub server_cert_remote_path: String,
    pub server_key_remote_path: String,
    pub client_cert_path: String,
    #[serde(rename = "ServerCertSANs")]
    pub server_cert_sans: Vec<String>,
    pub store_path: String,
    /// Base URL of a remote signing authority; empty for the local CA
    pub remote_ca: String,
}

impl AuthOptions {
    pub fn uses_remote_ca(&self) -> bool {
        !self.remote_ca.is_empty()
    }
}

/// Resolved storage base and issuance settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    base: String,
    root: StorageRoot,
    remote_ca: Option<String>,
    request_timeout: Duration,
}

impl StorageConfig {
    /// Configuration rooted at `base`, a directory or a KV URL
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into();
        let root = StorageRoot::parse(&base)?;
        Ok(Self {
            base,
            root,
            remote_ca: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// `$MACHINE_STORAGE_PATH`, falling back to `~/.docker/machine`
    pub fn from_env() -> Result<Self> {
        if let Ok(base) = env::var(STORAGE_PATH_ENV) {
            if !base.trim().is_empty() {
                return Self::new(base);
            }
        }
        let home = dirs::home_dir().ok_or_else(|| {
            MachineError::Configuration(format!(
                "Cannot determine home directory and {STORAGE_PATH_ENV} is not set"
            ))
        })?;
        Self::new(home.join(".docker").join("machine").to_string_lossy().into_owned())
    }

    pub fn with_remote_ca(mut self, url: impl Into<String>) -> Self {
        self.remote_ca = Some(url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn root(&self) -> &StorageRoot {
        &self.root
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn remote_ca(&self) -> Option<&str> {
        self.remote_ca.as_deref()
    }

    pub fn certs_dir(&self) -> String {
        self.root.join(&["certs"])
    }

    pub fn machines_dir(&self) -> String {
        self.root.join(&["machines"])
    }

    pub fn machine_dir(&self, name: &str) -> String {
        self.root.join(&["machines", name])
    }

    /// Global CA and client certificate locations
    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            cert_dir: self.certs_dir(),
            ca_cert_path: self.root.join(&["certs", CA_CERT_FILE]),
            ca_private_key_path: self.root.join(&["certs", CA_KEY_FILE]),
            client_cert_path: self.root.join(&["certs", CLIENT_CERT_FILE]),
            client_key_path: self.root.join(&["certs", CLIENT_KEY_FILE]),
            remote_ca: self.remote_ca.clone().unwrap_or_default(),
            ..AuthOptions::default()
        }
    }

    /// Global locations plus the server certificate pair of `name`
    pub fn host_auth_options(&self, name: &str) -> AuthOptions {
        AuthOptions {
            server_cert_path: self.root.join(&["machines", name, SERVER_CERT_FILE]),
            server_key_path: self.root.join(&["machines", name, SERVER_KEY_FILE]),
            store_path: self.machine_dir(name),
            ..self.auth_options()
        }
    }
}
