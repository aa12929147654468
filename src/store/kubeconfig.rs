//! Kubeconfig loading
//!
//! Only what is needed to reach one API server is read: the server, CA and
//! credentials of the selected context. Relative file references resolve
//! against the kubeconfig's own directory.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolved connection details for one API server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub token: Option<String>,
    /// PEM data of every trusted CA certificate
    pub ca_pem: Option<Vec<u8>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub current_context: Option<String>,

    #[serde(default)]
    pub clusters: Vec<NamedCluster>,

    #[serde(default)]
    pub users: Vec<NamedUser>,

    #[serde(default)]
    pub contexts: Vec<NamedContext>,
}

#[derive(Debug, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
    pub certificate_authority: Option<PathBuf>,
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: AuthInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthInfo {
    pub token: Option<String>,
    #[serde(rename = "tokenFile")]
    pub token_file: Option<PathBuf>,
    pub client_certificate: Option<PathBuf>,
    pub client_certificate_data: Option<String>,
    pub client_key: Option<PathBuf>,
    pub client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: Option<String>,
}

impl Kubeconfig {
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid kubeconfig: {}", e)))
    }

    /// The current context, or the only one when none is selected
    fn context(&self) -> Result<&Context> {
        let named = match self.current_context.as_deref().filter(|c| !c.is_empty()) {
            Some(name) => self
                .contexts
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::Config(format!("kubeconfig has no context '{}'", name)))?,
            None => match self.contexts.as_slice() {
                [only] => only,
                _ => {
                    return Err(Error::Config(
                        "kubeconfig has no current-context to select".into(),
                    ));
                }
            },
        };
        Ok(&named.context)
    }

    /// Connection details of the selected context
    ///
    /// `base` is the directory relative file references are resolved in.
    pub fn endpoint(&self, base: &Path) -> Result<Endpoint> {
        let context = self.context()?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                Error::Config(format!("kubeconfig has no cluster '{}'", context.cluster))
            })?;
        if cluster.server.is_empty() {
            return Err(Error::Config(format!(
                "kubeconfig cluster '{}' has no server",
                context.cluster
            )));
        }

        let anonymous = AuthInfo::default();
        let user = match &context.user {
            Some(name) => self
                .users
                .iter()
                .find(|u| &u.name == name)
                .map(|u| &u.user)
                .ok_or_else(|| Error::Config(format!("kubeconfig has no user '{}'", name)))?,
            None => &anonymous,
        };

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(path)) => Some(read_token(&base.join(path))?),
            (None, None) => None,
        };

        Ok(Endpoint {
            server: cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem: data_or_file(
                base,
                "certificate-authority-data",
                cluster.certificate_authority_data.as_deref(),
                cluster.certificate_authority.as_deref(),
            )?,
            client_cert_pem: data_or_file(
                base,
                "client-certificate-data",
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
            )?,
            client_key_pem: data_or_file(
                base,
                "client-key-data",
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
            )?,
            insecure: cluster.insecure_skip_tls_verify,
        })
    }
}

/// Load a kubeconfig file and resolve its selected context
pub fn load_endpoint(path: &Path) -> Result<Endpoint> {
    let yaml = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("unable to load kubeconfig from {}: {}", path.display(), e))
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Kubeconfig::parse(&yaml)?.endpoint(base)
}

pub fn read_token(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|token| token.trim().to_string())
        .map_err(|e| Error::Config(format!("unable to read token file {}: {}", path.display(), e)))
}

fn data_or_file(
    base: &Path,
    field: &str,
    data: Option<&str>,
    file: Option<&Path>,
) -> Result<Option<Vec<u8>>> {
    match (data, file) {
        (Some(data), _) => STANDARD
            .decode(data.trim())
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {} in kubeconfig: {}", field, e))),
        (None, Some(file)) => {
            let path = base.join(file);
            fs::read(&path).map(Some).map_err(|e| {
                Error::Config(format!("unable to read {}: {}", path.display(), e))
            })
        }
        (None, None) => Ok(None),
    }
}
