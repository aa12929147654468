//! Kubernetes API client for IPPool resources and pods
//!
//! Talks to the API server over HTTPS, with credentials from a kubeconfig
//! file or the pod's service account. Only three calls are made:
//! - GET the IPPool
//! - PUT the IPPool status subresource
//! - GET a pod to see whether it still exists

use crate::error::{Error, Result};
use crate::ipam::{Pool, PoolResource};
use crate::store::kubeconfig::{self, Endpoint};
use crate::store::{PodLiveness, PoolSnapshot, PoolStore, ResourceVersion};
use log::debug;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ureq::Agent;
use ureq::tls::{Certificate, ClientCert, PemItem, PrivateKey, RootCerts, TlsConfig, parse_pem};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Connection settings for the API server
///
/// With a kubeconfig, its selected context supplies the connection and any
/// field set here overrides it. Without one, unset fields fall back to the
/// in-cluster service account environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    /// Kubeconfig file to read the connection from
    pub kubeconfig: Option<PathBuf>,

    /// Base URL, e.g. `https://10.96.0.1:443`
    pub api_server: Option<String>,

    /// File holding the bearer token
    pub token_file: Option<PathBuf>,

    /// PEM bundle used to verify the API server
    pub ca_file: Option<PathBuf>,
}

impl KubeConfig {
    /// API server URL, from config or from `KUBERNETES_SERVICE_HOST`/`_PORT`
    pub fn resolve_api_server(&self) -> Result<String> {
        if let Some(server) = self.api_server.as_deref().filter(|s| !s.is_empty()) {
            return Ok(server.trim_end_matches('/').to_string());
        }

        let host = env::var("KUBERNETES_SERVICE_HOST").ok();
        let port = env::var("KUBERNETES_SERVICE_PORT").ok();
        service_url(host.as_deref(), port.as_deref()).ok_or_else(|| {
            Error::Config(
                "no kubernetes.apiServer configured and KUBERNETES_SERVICE_HOST is not set".into(),
            )
        })
    }

    /// Connection details, from the kubeconfig when one is set
    pub fn resolve(&self) -> Result<Endpoint> {
        let Some(path) = &self.kubeconfig else {
            return Ok(Endpoint {
                server: self.resolve_api_server()?,
                token: self
                    .token_file
                    .clone()
                    .or_else(|| existing(SERVICE_ACCOUNT_TOKEN))
                    .map(|path| kubeconfig::read_token(&path))
                    .transpose()?,
                ca_pem: self
                    .ca_file
                    .clone()
                    .or_else(|| existing(SERVICE_ACCOUNT_CA))
                    .map(|path| read_ca(&path))
                    .transpose()?,
                ..Endpoint::default()
            });
        };

        let mut endpoint = kubeconfig::load_endpoint(path)?;
        if let Some(server) = self.api_server.as_deref().filter(|s| !s.is_empty()) {
            endpoint.server = server.trim_end_matches('/').to_string();
        }
        if let Some(path) = &self.token_file {
            endpoint.token = Some(kubeconfig::read_token(path)?);
        }
        if let Some(path) = &self.ca_file {
            endpoint.ca_pem = Some(read_ca(path)?);
        }
        Ok(endpoint)
    }
}

fn read_ca(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| Error::Config(format!("unable to read CA file {}: {}", path.display(), e)))
}

fn existing(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    path.exists().then(|| path.to_path_buf())
}

fn service_url(host: Option<&str>, port: Option<&str>) -> Option<String> {
    let host = host.filter(|h| !h.is_empty())?;
    let port = port.filter(|p| !p.is_empty()).unwrap_or("443");
    if host.contains(':') {
        Some(format!("https://[{}]:{}", host, port))
    } else {
        Some(format!("https://{}:{}", host, port))
    }
}

fn tls_config(endpoint: &Endpoint) -> Result<TlsConfig> {
    let mut tls = TlsConfig::builder();

    if let Some(pem) = &endpoint.ca_pem {
        let certs = pem_certificates(pem)?;
        if certs.is_empty() {
            return Err(Error::Config("CA bundle holds no certificates".into()));
        }
        tls = tls.root_certs(RootCerts::Specific(Arc::new(certs)));
    }

    if let (Some(cert), Some(key)) = (&endpoint.client_cert_pem, &endpoint.client_key_pem) {
        let chain = pem_certificates(cert)?;
        let key = PrivateKey::from_pem(key)
            .map_err(|e| Error::Config(format!("invalid client key: {}", e)))?;
        tls = tls.client_cert(Some(ClientCert::new_with_certs(&chain, key)));
    }

    if endpoint.insecure {
        tls = tls.disable_verification(true);
    }

    Ok(tls.build())
}

/// Every certificate in a PEM bundle, in order
fn pem_certificates(pem: &[u8]) -> Result<Vec<Certificate<'static>>> {
    parse_pem(pem)
        .filter_map(|item| match item {
            Ok(PemItem::Certificate(cert)) => Some(Ok(cert)),
            Ok(_) => None,
            Err(e) => Some(Err(Error::Config(format!("invalid PEM data: {}", e)))),
        })
        .collect()
}

/// Client for the IPPool API and pod lookups
pub struct KubeClient {
    agent: Agent,
    api_server: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: &KubeConfig) -> Result<Self> {
        let endpoint = config.resolve()?;

        let agent_config = Agent::config_builder()
            .tls_config(tls_config(&endpoint)?)
            .http_status_as_error(false)
            .build();

        Ok(Self {
            agent: Agent::new_with_config(agent_config),
            api_server: endpoint.server,
            token: endpoint.token,
        })
    }

    fn pool_url(&self, pool_name: &str) -> String {
        format!(
            "{}/apis/{}/ippools/{}",
            self.api_server,
            crate::ipam::resource::API_VERSION,
            pool_name
        )
    }

    fn pod_url(&self, namespace: &str, pod: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.api_server, namespace, pod
        )
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }

    /// GET a URL, returning status code and body
    fn get(&self, url: &str) -> std::result::Result<(u16, String), ureq::Error> {
        debug!("GET {}", url);
        let mut request = self.agent.get(url).header("Accept", "application/json");
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        let mut response = request.call()?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        Ok((status, body))
    }

    /// PUT a JSON body, returning status code and body
    fn put(&self, url: &str, body: String) -> std::result::Result<(u16, String), ureq::Error> {
        debug!("PUT {}", url);
        let mut request = self
            .agent
            .put(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        let mut response = request.send(body)?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        Ok((status, body))
    }
}

impl PoolStore for KubeClient {
    fn fetch(&self, pool_name: &str) -> Result<PoolSnapshot> {
        let (status, body) = self
            .get(&self.pool_url(pool_name))
            .map_err(|e| Error::Store(format!("unable to get IPPool '{}': {}", pool_name, e)))?;
        if status != 200 {
            return Err(Error::Store(format!(
                "unable to get IPPool '{}': HTTP {}: {}",
                pool_name, status, body
            )));
        }

        let resource: PoolResource = serde_json::from_str(&body)
            .map_err(|e| Error::Store(format!("unable to decode IPPool '{}': {}", pool_name, e)))?;
        Ok(PoolSnapshot {
            pool: resource.to_pool()?,
            version: resource.version()?,
        })
    }

    fn write_status(&self, pool_name: &str, pool: &Pool, version: &ResourceVersion) -> Result<()> {
        let resource = PoolResource::from_pool(pool_name, pool, version);
        let body = serde_json::to_string(&resource)?;
        let url = format!("{}/status", self.pool_url(pool_name));

        let (status, body) = self
            .put(&url, body)
            .map_err(|e| Error::Store(format!("unable to update IPPool '{}': {}", pool_name, e)))?;
        write_outcome(pool_name, status, &body)
    }
}

impl PodLiveness for KubeClient {
    fn exists(&self, namespace: &str, pod: &str) -> Result<bool> {
        let (status, body) = self.get(&self.pod_url(namespace, pod)).map_err(|e| {
            Error::LivenessQuery(format!("unable to get pod {}/{}: {}", namespace, pod, e))
        })?;
        pod_outcome(namespace, pod, status, &body)
    }
}

fn write_outcome(pool_name: &str, status: u16, body: &str) -> Result<()> {
    match status {
        200 | 201 => Ok(()),
        409 => Err(Error::Conflict {
            pool: pool_name.to_string(),
        }),
        _ => Err(Error::Store(format!(
            "unable to update IPPool '{}': HTTP {}: {}",
            pool_name, status, body
        ))),
    }
}

fn pod_outcome(namespace: &str, pod: &str, status: u16, body: &str) -> Result<bool> {
    match status {
        200 => Ok(true),
        404 => Ok(false),
        _ => Err(Error::LivenessQuery(format!(
            "unable to get pod {}/{}: HTTP {}: {}",
            namespace, pod, status, body
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &str) -> KubeClient {
        KubeClient::new(&KubeConfig {
            api_server: Some(server.to_string()),
            ..KubeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_service_url() {
        assert_eq!(
            service_url(Some("10.96.0.1"), Some("443")).as_deref(),
            Some("https://10.96.0.1:443")
        );
        assert_eq!(
            service_url(Some("fd00::1"), None).as_deref(),
            Some("https://[fd00::1]:443")
        );
        assert_eq!(service_url(None, Some("443")), None);
        assert_eq!(service_url(Some(""), None), None);
    }

    #[test]
    fn test_explicit_api_server() {
        let config = KubeConfig {
            api_server: Some("https://kube.example:6443/".into()),
            ..KubeConfig::default()
        };
        assert_eq!(config.resolve_api_server().unwrap(), "https://kube.example:6443");
    }

    #[test]
    fn test_urls() {
        let client = client("https://kube.example:6443");
        assert_eq!(
            client.pool_url("sample"),
            "https://kube.example:6443/apis/k8s.pgc.umn.edu/v1alpha1/ippools/sample"
        );
        assert_eq!(
            client.pod_url("ns1", "pod1"),
            "https://kube.example:6443/api/v1/namespaces/ns1/pods/pod1"
        );
    }

    #[test]
    fn test_missing_token_file_is_config_error() {
        let err = KubeClient::new(&KubeConfig {
            api_server: Some("https://kube.example:6443".into()),
            token_file: Some(PathBuf::from("/nonexistent/token")),
            ..KubeConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    const CA_BUNDLE: &str = "\
-----BEGIN CERTIFICATE-----
AAECAwQF
-----END CERTIFICATE-----
-----BEGIN CERTIFICATE-----
BgcICQoL
-----END CERTIFICATE-----
";

    #[test]
    fn test_ca_bundle_keeps_every_certificate() {
        let certs = pem_certificates(CA_BUNDLE.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].der(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(certs[1].der(), &[6, 7, 8, 9, 10, 11]);

        let endpoint = Endpoint {
            server: "https://kube.example:6443".into(),
            ca_pem: Some(b"not a certificate".to_vec()),
            ..Endpoint::default()
        };
        assert!(matches!(tls_config(&endpoint), Err(Error::Config(_))));
    }

    #[test]
    fn test_kubeconfig_connection() {
        let dir = std::env::temp_dir().join(format!("pod-ipam-kube-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ca.crt"), CA_BUNDLE).unwrap();
        fs::write(dir.join("override-token"), "override\n").unwrap();
        fs::write(
            dir.join("k8s-ipam.kubeconfig"),
            r#"
current-context: ipam
clusters:
- name: local
  cluster: { server: "https://10.96.0.1:443", certificate-authority: ca.crt }
users:
- name: ipam
  user: { token: from-kubeconfig }
contexts:
- name: ipam
  context: { cluster: local, user: ipam }
"#,
        )
        .unwrap();

        let config = KubeConfig {
            kubeconfig: Some(dir.join("k8s-ipam.kubeconfig")),
            ..KubeConfig::default()
        };
        let endpoint = config.resolve().unwrap();
        assert_eq!(endpoint.server, "https://10.96.0.1:443");
        assert_eq!(endpoint.token.as_deref(), Some("from-kubeconfig"));
        assert_eq!(endpoint.ca_pem.as_deref(), Some(CA_BUNDLE.as_bytes()));

        let client = KubeClient::new(&config).unwrap();
        assert_eq!(
            client.pool_url("sample"),
            "https://10.96.0.1:443/apis/k8s.pgc.umn.edu/v1alpha1/ippools/sample"
        );
        assert_eq!(client.authorization().as_deref(), Some("Bearer from-kubeconfig"));

        let overridden = KubeConfig {
            api_server: Some("https://kube.example:6443".into()),
            token_file: Some(dir.join("override-token")),
            ..config.clone()
        };
        let endpoint = overridden.resolve().unwrap();
        assert_eq!(endpoint.server, "https://kube.example:6443");
        assert_eq!(endpoint.token.as_deref(), Some("override"));

        let missing = KubeConfig {
            kubeconfig: Some(dir.join("absent.kubeconfig")),
            ..KubeConfig::default()
        };
        assert!(matches!(missing.resolve(), Err(Error::Config(_))));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_outcome() {
        assert!(write_outcome("sample", 200, "").is_ok());
        assert!(write_outcome("sample", 409, "conflict").unwrap_err().is_conflict());
        assert!(matches!(write_outcome("sample", 403, "forbidden"), Err(Error::Store(_))));
    }

    #[test]
    fn test_pod_outcome() {
        assert!(pod_outcome("ns", "pod", 200, "{}").unwrap());
        assert!(!pod_outcome("ns", "pod", 404, "").unwrap());
        assert!(matches!(
            pod_outcome("ns", "pod", 500, "oops"),
            Err(Error::LivenessQuery(_))
        ));
    }
}
