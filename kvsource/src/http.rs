//! Shared HTTP plumbing for the REST-speaking backends.

use reqwest::{Method, RequestBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::BackendKind;
use crate::error::{BackendError, Result};

/// TLS and authentication settings for an HTTP backend.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub insecure: bool,
}

/// HTTP basic credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A configured `reqwest` client plus per-request credentials.
#[derive(Debug, Clone)]
pub struct HttpClient {
    backend: BackendKind,
    client: reqwest::Client,
    basic_auth: Option<BasicAuth>,
}

impl HttpClient {
    /// Build a client for `backend` with the given TLS material.
    pub fn new(
        backend: BackendKind,
        tls: &TlsSettings,
        basic_auth: Option<BasicAuth>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(tls.insecure);

        match (&tls.client_cert, &tls.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(backend, cert)?;
                pem.push(b'\n');
                pem.extend(read_pem(backend, key)?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    BackendError::construction(backend, format!("invalid client certificate: {}", e))
                })?;
                builder = builder.identity(identity);
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(BackendError::construction(
                    backend,
                    "client certificate and key must be configured together",
                ));
            }
            (None, None) => {}
        }

        if let Some(ca) = &tls.ca_cert {
            let pem = read_pem(backend, ca)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BackendError::construction(backend, format!("invalid CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::construction(backend, e.to_string()))?;

        Ok(Self {
            backend,
            client,
            basic_auth,
        })
    }

    /// Start a request, attaching basic auth when configured.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.basic_auth {
            Some(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            None => request,
        }
    }

    /// Send a request, mapping transport failures to `Unreachable`.
    pub async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| BackendError::unreachable(self.backend, e))
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

fn read_pem(backend: BackendKind, path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        BackendError::construction(backend, format!("cannot read {}: {}", path.display(), e))
    })
}

/// Turn a node entry into a base URL, adding `scheme` when the node has none.
pub fn base_url(node: &str, scheme: &str) -> String {
    let node = node.trim().trim_end_matches('/');
    if node.contains("://") {
        node.to_string()
    } else {
        format!("{}://{}", scheme, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("127.0.0.1:8500", "http"), "http://127.0.0.1:8500");
        assert_eq!(base_url("https://vault:8200/", "http"), "https://vault:8200");
        assert_eq!(base_url("consul:8500", "https"), "https://consul:8500");
    }

    #[test]
    fn test_basic_auth_debug_hides_password() {
        let auth = BasicAuth {
            username: "admin".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{:?}", auth);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_half_configured_identity_is_rejected() {
        let tls = TlsSettings {
            client_cert: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..Default::default()
        };
        let err = HttpClient::new(BackendKind::Etcd, &tls, None).unwrap_err();
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_missing_ca_file() {
        let tls = TlsSettings {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let err = HttpClient::new(BackendKind::Consul, &tls, None).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
