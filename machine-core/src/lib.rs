//! Machine Core
//!
//! Persistence and credential management for provisioned machines.
//!
//! This crate provides:
//! - Storage location parsing that routes plain paths to the filesystem and
//!   scheme URLs (`etcd://host:port`) to a shared key-value backend
//! - [`BlobStore`] implementations for both backends
//! - A local certificate authority and a remote cfssl signing client
//! - SSH key generation
//! - Host descriptor storage with schema migration on load

pub mod blob;
pub mod cert;
pub mod config;
pub mod error;
pub mod host;
pub mod kv;
pub mod location;
pub mod remote;
pub mod ssh;

pub use blob::{open_blob_store, BlobStore, FileBlobStore, KvBlobStore};
pub use cert::{
    bootstrap_certificates, load_host_certs, CertSpec, CertificateAuthority, CertificateInfo,
    CertificateIssuer, HostCerts, RequestInfo,
};
pub use config::{AuthOptions, StorageConfig};
pub use error::{MachineError, Result};
pub use host::{
    open_host_store, HostMigrator, HostOptions, HostRecord, HostRecordStore, SchemaMigrator,
};
pub use kv::KvConnector;
pub use location::StorageRoot;
pub use remote::RemoteCaSigner;
pub use ssh::{generate_ssh_key, KeyPair, SshKeyManager};
