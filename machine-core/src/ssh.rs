//! SSH key generation and storage

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use machine_common::logging::{Component, Logger};
use md5::{Digest, Md5};
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use ssh_key::public::{KeyData, RsaPublicKey};
use ssh_key::{Mpint, PublicKey};

use crate::blob::{open_blob_store, BlobStore, PRIVATE_FILE_MODE};
use crate::error::{MachineError, Result};
use crate::kv::KvConnector;

/// Modulus size of generated keys
pub const SSH_KEY_BITS: u32 = 2048;

/// An RSA key pair in the encodings persisted to storage
#[derive(Clone)]
pub struct KeyPair {
    /// PKCS#1 DER
    pub private_key: Vec<u8>,
    /// `ssh-rsa <base64>\n`
    pub public_key: Vec<u8>,
    private_pem: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(SSH_KEY_BITS)
            .map_err(|e| MachineError::SshKey(format!("Unable to generate key: {e}")))?;
        let valid = rsa
            .check_key()
            .map_err(|e| MachineError::SshKey(format!("Unable to validate key: {e}")))?;
        if !valid {
            return Err(MachineError::SshKey("Unable to validate key".to_string()));
        }

        let encode_err = |e: openssl::error::ErrorStack| {
            MachineError::SshKey(format!("Unable to encode key: {e}"))
        };
        let private_key = rsa.private_key_to_der().map_err(encode_err)?;
        let private_pem = rsa.private_key_to_pem().map_err(encode_err)?;
        let public_key = authorized_key(&rsa)?;

        Ok(Self {
            private_key,
            public_key,
            private_pem,
        })
    }

    /// Private key as an `RSA PRIVATE KEY` PEM block
    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_pem
    }

    /// Lowercase hex MD5 of the public key blob
    pub fn fingerprint(&self) -> Result<String> {
        fingerprint(&self.public_key)
    }

    /// Write the private key to `private_path` and the public key next to it
    pub fn write_to(&self, store: &dyn BlobStore, private_path: &str, public_path: &str) -> Result<()> {
        store.write(private_path, &self.private_pem, PRIVATE_FILE_MODE)?;
        store.write(public_path, &self.public_key, PRIVATE_FILE_MODE)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &String::from_utf8_lossy(&self.public_key).trim_end())
            .finish_non_exhaustive()
    }
}

/// OpenSSH authorized-keys line for the public half of `rsa`
fn authorized_key(rsa: &Rsa<Private>) -> Result<Vec<u8>> {
    let ssh_err = |e: ssh_key::Error| MachineError::SshKey(format!("Unable to encode public key: {e}"));
    let key = RsaPublicKey {
        e: Mpint::from_positive_bytes(&rsa.e().to_vec()).map_err(ssh_err)?,
        n: Mpint::from_positive_bytes(&rsa.n().to_vec()).map_err(ssh_err)?,
    };
    let line = PublicKey::new(KeyData::Rsa(key), "")
        .to_openssh()
        .map_err(ssh_err)?;
    Ok(format!("{}\n", line.trim_end()).into_bytes())
}

/// Fingerprint of an authorized-keys line or a bare base64 blob
pub fn fingerprint(public_key: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(public_key)
        .map_err(|e| MachineError::SshKey(format!("Public key is not UTF-8: {e}")))?;
    let mut fields = text.split_whitespace();
    let blob = match (fields.next(), fields.next()) {
        (Some(_kind), Some(blob)) => blob,
        (Some(blob), None) => blob,
        _ => return Err(MachineError::SshKey("Empty public key".to_string())),
    };
    let decoded = STANDARD
        .decode(blob)
        .map_err(|e| MachineError::SshKey(format!("Public key is not base64: {e}")))?;
    Ok(hex::encode(Md5::digest(&decoded)))
}

/// Creates SSH keys through the backend the key path selects
pub struct SshKeyManager {
    store: Arc<dyn BlobStore>,
    logger: Arc<Logger>,
}

impl SshKeyManager {
    pub fn new(store: Arc<dyn BlobStore>, logger: Arc<Logger>) -> Self {
        Self {
            store,
            logger: Arc::new(logger.with_component(Component::Ssh)),
        }
    }

    /// Create a key at `private_path` and `<private_path>.pub` unless one is
    /// already there. Returns whether a key was generated.
    pub fn generate(&self, private_path: &str) -> Result<bool> {
        if self.store.exists(private_path) {
            self.logger
                .debug(format!("SSH key {private_path} already exists"));
            return Ok(false);
        }

        let pair = KeyPair::generate()?;
        pair.write_to(self.store.as_ref(), private_path, &public_key_path(private_path))
            .map_err(|e| MachineError::SshKey(format!("Error writing keys: {e}")))?;
        self.logger.info(format!(
            "Generated SSH key {private_path} ({})",
            pair.fingerprint()?
        ));
        Ok(true)
    }

    /// Fingerprint of the stored public half of `private_path`
    pub fn fingerprint(&self, private_path: &str) -> Result<String> {
        fingerprint(&self.store.read(&public_key_path(private_path))?)
    }
}

pub fn public_key_path(private_path: &str) -> String {
    format!("{private_path}.pub")
}

/// Generate the key at `path`, choosing the backend from the path itself
pub fn generate_ssh_key(path: &str, connector: &KvConnector, logger: Arc<Logger>) -> Result<bool> {
    let store = open_blob_store(path, connector, logger.clone())?;
    SshKeyManager::new(store, logger).generate(path)
}
