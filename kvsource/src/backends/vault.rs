//! HashiCorp Vault backend.
//!
//! The client logs in once at construction (unless handed a token) and keeps
//! the resulting token for its lifetime. Reads walk the requested paths with
//! `LIST`, then read every leaf secret. A secret at `/secret/app` with fields
//! `user` and `pass` yields `/secret/app/user`, `/secret/app/pass`, and the
//! whole secret as JSON at `/secret/app`. KV v2 responses are unwrapped.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::{AuthType, BackendKind};
use crate::error::{BackendError, Result};
use crate::http::{base_url, HttpClient, TlsSettings};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint, poll_until_changed};

/// Service account token mounted into Kubernetes pods.
pub const KUBERNETES_JWT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

const TOKEN_HEADER: &str = "X-Vault-Token";

/// How the client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum VaultAuth {
    Token(String),
    AppId { app_id: String, user_id: String },
    AppRole { role_id: String, secret_id: String },
    Userpass { username: String, password: String },
    Cert,
    Kubernetes { role: String, jwt_path: PathBuf },
    Github { token: String },
}

impl VaultAuth {
    pub fn auth_type(&self) -> AuthType {
        match self {
            VaultAuth::Token(_) => AuthType::Token,
            VaultAuth::AppId { .. } => AuthType::AppId,
            VaultAuth::AppRole { .. } => AuthType::Approle,
            VaultAuth::Userpass { .. } => AuthType::Userpass,
            VaultAuth::Cert => AuthType::Cert,
            VaultAuth::Kubernetes { .. } => AuthType::Kubernetes,
            VaultAuth::Github { .. } => AuthType::Github,
        }
    }
}

impl std::fmt::Debug for VaultAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VaultAuth").field(&self.auth_type()).finish()
    }
}

/// Parameters for the Vault backend.
#[derive(Debug, Clone)]
pub struct VaultParams {
    pub nodes: Vec<String>,
    pub scheme: String,
    pub tls: TlsSettings,
    pub auth: VaultAuth,
    /// Mount point of the auth method; defaults to the method name.
    pub mount: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

/// Vault client holding an authenticated token.
#[derive(Clone)]
pub struct VaultStore {
    http: HttpClient,
    base: String,
    token: String,
    poll_interval: Duration,
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl VaultStore {
    /// Build the client and authenticate.
    pub async fn connect(params: VaultParams) -> Result<Self> {
        let node = params.nodes.first().ok_or_else(|| {
            BackendError::construction(BackendKind::Vault, "no vault address configured")
        })?;

        let http = HttpClient::new(BackendKind::Vault, &params.tls, None)?;
        let base = base_url(node, &params.scheme);

        let token = match &params.auth {
            VaultAuth::Token(token) => token.clone(),
            auth => {
                let token = login(&http, &base, auth, params.mount.as_deref()).await?;
                info!(auth_type = %auth.auth_type(), "Authenticated with vault");
                token
            }
        };

        Ok(Self {
            http,
            base,
            token,
            poll_interval: params.poll_interval,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base, path.trim_start_matches('/'))
    }

    /// Children of `path`, or `None` when it is not a directory.
    async fn list(&self, path: &str) -> Result<Option<Vec<String>>> {
        let request = self
            .http
            .request(Method::GET, &self.url(path))
            .query(&[("list", "true")])
            .header(TOKEN_HEADER, &self.token);
        let Some(body) = self.read_json(request, path).await? else {
            return Ok(None);
        };

        let keys = body
            .data
            .and_then(|mut d| d.remove("keys"))
            .and_then(|k| match k {
                Value::Array(items) => Some(
                    items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                ),
                _ => None,
            });
        Ok(keys)
    }

    async fn read(&self, path: &str) -> Result<Option<Map<String, Value>>> {
        let request = self
            .http
            .request(Method::GET, &self.url(path))
            .header(TOKEN_HEADER, &self.token);
        let Some(body) = self.read_json(request, path).await? else {
            return Ok(None);
        };
        Ok(body.data.map(unwrap_kv2))
    }

    async fn read_json(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<Option<SecretResponse>> {
        let response = self.http.send(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => Err(BackendError::InvalidRequest(format!(
                "permission denied reading {}",
                path
            ))),
            status if status.is_success() => response
                .json::<SecretResponse>()
                .await
                .map(Some)
                .map_err(|e| BackendError::decode(BackendKind::Vault, e)),
            status => Err(BackendError::unreachable(
                BackendKind::Vault,
                format!("unexpected status {} for {}", status, path),
            )),
        }
    }

    /// Every secret path at or below `root`.
    async fn walk(&self, root: &str) -> Result<Vec<String>> {
        let mut leaves = Vec::new();
        let mut pending = vec![root.trim_end_matches('/').to_string()];

        while let Some(path) = pending.pop() {
            match self.list(&path).await? {
                None => leaves.push(path),
                Some(children) => {
                    for child in children {
                        let full = format!("{}/{}", path, child.trim_end_matches('/'));
                        if child.ends_with('/') {
                            pending.push(full);
                        } else {
                            leaves.push(full);
                        }
                    }
                }
            }
        }

        Ok(leaves)
    }

    async fn snapshot(&self, roots: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        for root in roots {
            for path in self.walk(root).await? {
                let Some(secret) = self.read(&path).await? else {
                    continue;
                };
                let key = if path.starts_with('/') {
                    path
                } else {
                    format!("/{}", path)
                };
                for (field, value) in &secret {
                    vars.insert(format!("{}/{}", key, field), value_to_string(value));
                }
                vars.insert(key, Value::Object(secret).to_string());
            }
        }
        Ok(vars)
    }
}

async fn login(
    http: &HttpClient,
    base: &str,
    auth: &VaultAuth,
    mount: Option<&str>,
) -> Result<String> {
    let method = auth.auth_type();
    let mount = mount.unwrap_or(method.as_str()).trim_matches('/');

    let (path, body) = match auth {
        VaultAuth::Token(token) => return Ok(token.clone()),
        VaultAuth::AppId { app_id, user_id } => (
            format!("auth/{}/login/{}", mount, app_id),
            json!({ "user_id": user_id }),
        ),
        VaultAuth::AppRole { role_id, secret_id } => (
            format!("auth/{}/login", mount),
            json!({ "role_id": role_id, "secret_id": secret_id }),
        ),
        VaultAuth::Userpass { username, password } => (
            format!("auth/{}/login/{}", mount, username),
            json!({ "password": password }),
        ),
        VaultAuth::Cert => (format!("auth/{}/login", mount), json!({})),
        VaultAuth::Kubernetes { role, jwt_path } => {
            let jwt = tokio::fs::read_to_string(jwt_path).await.map_err(|e| {
                BackendError::construction(
                    BackendKind::Vault,
                    format!("cannot read service account token {}: {}", jwt_path.display(), e),
                )
            })?;
            (
                format!("auth/{}/login", mount),
                json!({ "role": role, "jwt": jwt.trim() }),
            )
        }
        VaultAuth::Github { token } => (
            format!("auth/{}/login", mount),
            json!({ "token": token }),
        ),
    };

    debug!(path = %path, "Vault login");
    let request = http
        .request(Method::POST, &format!("{}/v1/{}", base, path))
        .json(&body);
    let response = http
        .send(request)
        .await
        .map_err(|e| BackendError::construction(BackendKind::Vault, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::construction(
            BackendKind::Vault,
            format!("{} login rejected with status {}", method, status),
        ));
    }

    response
        .json::<LoginResponse>()
        .await
        .ok()
        .and_then(|r| r.auth)
        .map(|a| a.client_token)
        .ok_or_else(|| {
            BackendError::construction(BackendKind::Vault, format!("{} login returned no token", method))
        })
}

/// KV v2 nests the secret under `data` next to `metadata`.
fn unwrap_kv2(mut data: Map<String, Value>) -> Map<String, Value> {
    if data.len() == 2 && data.contains_key("metadata") {
        if let Some(Value::Object(inner)) = data.remove("data") {
            return inner;
        }
    }
    data
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl StoreClient for VaultStore {
    #[instrument(skip(self), fields(backend = "vault"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        self.snapshot(keys).await
    }

    #[instrument(skip(self, stop), fields(backend = "vault"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        let roots = [prefix.to_string()];
        let roots = &roots;

        poll_until_changed(
            move || async move {
                let snapshot: KvPairs = self
                    .snapshot(roots)
                    .await?
                    .into_iter()
                    .filter(|(k, _)| key_is_watched(k, keys))
                    .collect();
                Ok(fingerprint(&snapshot))
            },
            wait_index,
            self.poll_interval,
            stop,
        )
        .await
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Vault
    }
}
