//! Storage locations
//!
//! Any path handed to this crate is either a plain filesystem path or a URL of
//! the form `<scheme>://<host>/<path>`. The decision is made once, when the
//! location is parsed into a [`StorageRoot`].

use std::path::PathBuf;

use url::Url;

use crate::error::{MachineError, Result};

/// Where persisted material lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    /// A directory on the local filesystem
    Local { path: PathBuf },
    /// A distributed key-value backend selected by `scheme`
    Distributed {
        scheme: String,
        /// `host` or `host:port`
        authority: String,
        /// Path below the authority, without a trailing slash
        path: String,
    },
}

impl StorageRoot {
    /// Parse a location string.
    ///
    /// A scheme longer than one character selects the distributed backend.
    /// Unix paths have no scheme and Windows drive letters parse as a
    /// one-character scheme, so both stay on the filesystem.
    pub fn parse(location: &str) -> Result<Self> {
        let url = match Url::parse(location) {
            Ok(url) => url,
            Err(_) => {
                return Ok(StorageRoot::Local {
                    path: PathBuf::from(location),
                })
            }
        };

        if url.scheme().len() <= 1 {
            return Ok(StorageRoot::Local {
                path: PathBuf::from(location),
            });
        }

        let host = url.host_str().unwrap_or_default();
        if host.is_empty() {
            return Err(MachineError::Configuration(format!(
                "Malformed store path: {location} has no host"
            )));
        }
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(StorageRoot::Distributed {
            scheme: url.scheme().to_string(),
            authority,
            path: url.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, StorageRoot::Distributed { .. })
    }

    /// `scheme://authority` for distributed roots
    pub fn endpoint(&self) -> Option<String> {
        match self {
            StorageRoot::Local { .. } => None,
            StorageRoot::Distributed {
                scheme, authority, ..
            } => Some(format!("{scheme}://{authority}")),
        }
    }

    /// Append path elements, keeping the URL form for distributed roots
    pub fn join(&self, elems: &[&str]) -> String {
        match self {
            StorageRoot::Local { path } => {
                let mut joined = path.clone();
                for elem in elems {
                    joined.push(elem);
                }
                joined.to_string_lossy().into_owned()
            }
            StorageRoot::Distributed {
                scheme,
                authority,
                path,
            } => {
                let mut joined = format!("{scheme}://{authority}{path}");
                for elem in elems {
                    let elem = elem.trim_matches('/');
                    if !elem.is_empty() {
                        joined.push('/');
                        joined.push_str(elem);
                    }
                }
                joined
            }
        }
    }

    /// Store-relative key for a location under this root.
    ///
    /// Strips `scheme://authority` (and the `scheme:/authority` form left
    /// behind when a URL went through a filesystem-style join), then
    /// normalizes the remainder to `a/b/c`. Local roots return the input.
    pub fn relative_key(&self, location: &str) -> String {
        match self {
            StorageRoot::Local { .. } => location.to_string(),
            StorageRoot::Distributed {
                scheme, authority, ..
            } => {
                let full = format!("{scheme}://{authority}");
                let collapsed = format!("{scheme}:/{authority}");
                let rest = location
                    .strip_prefix(full.as_str())
                    .or_else(|| location.strip_prefix(collapsed.as_str()))
                    .unwrap_or(location);
                normalize_key(rest)
            }
        }
    }
}

/// Collapse repeated and surrounding slashes: `//a//b/` becomes `a/b`
pub fn normalize_key(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_and_relative_paths_are_local() {
        for location in ["/home/user/.docker/machine", "certs/ca.pem", ""] {
            assert!(matches!(
                StorageRoot::parse(location).unwrap(),
                StorageRoot::Local { .. }
            ));
        }
    }

    #[test]
    fn drive_letter_is_local() {
        let root = StorageRoot::parse(r"C:\Users\me\.docker\machine").unwrap();
        assert!(!root.is_distributed());
        let root = StorageRoot::parse("c:/machine").unwrap();
        assert!(!root.is_distributed());
    }

    #[test]
    fn multi_letter_scheme_is_distributed() {
        let root = StorageRoot::parse("etcd://10.0.0.1:2379/fleet").unwrap();
        assert_eq!(
            root,
            StorageRoot::Distributed {
                scheme: "etcd".to_string(),
                authority: "10.0.0.1:2379".to_string(),
                path: "/fleet".to_string(),
            }
        );
        assert_eq!(root.endpoint().as_deref(), Some("etcd://10.0.0.1:2379"));
    }

    #[test]
    fn distributed_root_without_host_is_rejected() {
        let err = StorageRoot::parse("etcd:///no-host").unwrap_err();
        assert!(matches!(err, MachineError::Configuration(_)));
    }

    #[test]
    fn join_keeps_url_form() {
        let root = StorageRoot::parse("etcd://kv:2379").unwrap();
        assert_eq!(
            root.join(&["machines", "node1", "config.json"]),
            "etcd://kv:2379/machines/node1/config.json"
        );
    }

    #[test]
    fn relative_key_strips_scheme_and_host() {
        let root = StorageRoot::parse("etcd://kv:2379").unwrap();
        assert_eq!(root.relative_key("etcd://kv:2379/certs/ca.pem"), "certs/ca.pem");
        assert_eq!(root.relative_key("etcd:/kv:2379/certs/ca.pem"), "certs/ca.pem");
        assert_eq!(root.relative_key("/certs//key.pem"), "certs/key.pem");
    }
}
