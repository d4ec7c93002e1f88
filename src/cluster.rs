//! Cluster-side facts for the meta channel: provider, Kubernetes version,
//! intranet flag, and the customize command.
//!
//! The provider and customize command live in ConfigMaps in the agent's own
//! namespace so operators can pin them. Nothing here is fatal to the tunnel:
//! [`KubeMetaSource`] logs a failure and reports an empty document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::tunnel::meta::{AgentMeta, MetaSource};

pub const DEFAULT_AGENT_NAMESPACE: &str = "kube-system";
pub const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

pub const PROVIDER_CONFIGMAP: &str = "provider";
pub const PROVIDER_KEY: &str = "provider";
pub const PROVIDER_AUTO_KEY: &str = "auto";

pub const AGENT_CONFIGMAP: &str = "ack-agent-config";
pub const SCRIPT_PATH_KEY: &str = "addNodeScriptPath";

pub const DEFAULT_DMI_ROOT: &str = "/sys/class/dmi/id";

const MAX_CUSTOMIZE_COMMAND_LEN: usize = 1024;

/// DMI attribute and marker substring for each provider, checked in order.
const DMI_IDENTIFIERS: &[(&str, &str, &str)] = &[
    ("azure", "sys_vendor", "Microsoft Corporation"),
    ("amazon", "product_version", "amazon"),
    ("digitalocean", "sys_vendor", "DigitalOcean"),
    ("oracle", "chassis_asset_tag", "OracleCloud"),
    ("google", "product_name", "Google"),
    ("alibaba", "product_name", "Alibaba Cloud ECS"),
];

/// Identify the hosting cloud from DMI identity files under `dmi_root`.
pub async fn identify_provider(dmi_root: &Path) -> Option<&'static str> {
    for &(provider, attribute, marker) in DMI_IDENTIFIERS {
        match tokio::fs::read_to_string(dmi_root.join(attribute)).await {
            Ok(value) if value.contains(marker) => {
                trace!(provider, "provider identified from DMI");
                return Some(provider);
            }
            Ok(_) => {}
            Err(e) => trace!(provider, error = %e, "DMI attribute unreadable"),
        }
    }
    None
}

/// Guess the provider from a distribution's version suffix.
pub fn provider_from_version(version: &str) -> &'static str {
    let version = version.to_lowercase();
    if version.contains("eks") {
        "amazon"
    } else if version.contains("tke") {
        "tke"
    } else if version.contains("cce") {
        "cce"
    } else {
        "idc"
    }
}

/// A customize command is either empty or an http(s) URL of bounded length.
pub fn validate_customize_command(command: &str) -> Result<()> {
    if command.len() > MAX_CUSTOMIZE_COMMAND_LEN {
        return Err(Error::Config(format!(
            "customize command longer than {MAX_CUSTOMIZE_COMMAND_LEN} bytes"
        )));
    }
    if command.is_empty() || command.starts_with("https://") || command.starts_with("http://") {
        Ok(())
    } else {
        Err(Error::Config(
            "customize command must start with http:// or https://".into(),
        ))
    }
}

/// `INTERNAL_ENDPOINT` accepts exactly `true` or `false`.
pub fn parse_intranet(value: Option<&str>) -> Result<String> {
    match value {
        Some(v @ ("true" | "false")) => Ok(v.to_string()),
        other => Err(Error::Config(format!(
            "INTERNAL_ENDPOINT must be true or false, got {other:?}"
        ))),
    }
}

/// Namespace the agent runs in.
pub async fn agent_namespace() -> String {
    namespace_from(Path::new(NAMESPACE_FILE)).await
}

async fn namespace_from(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => {
            trace!(namespace = DEFAULT_AGENT_NAMESPACE, "using default namespace");
            DEFAULT_AGENT_NAMESPACE.to_string()
        }
    }
}

/// Build client configuration from an explicit kubeconfig, or infer it
/// (in-cluster service account first).
pub async fn load_kube_config(kubeconfig: Option<&Path>) -> Result<kube::Config> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).map_err(|e| {
                Error::Config(format!("failed to read kubeconfig {}: {e}", path.display()))
            })?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("failed to load kubeconfig: {e}")))
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::Config(format!("failed to infer kube config: {e}"))),
    }
}

/// Metadata collected from the API server and the node itself.
pub struct KubeMetaSource {
    client: kube::Client,
    namespace: String,
    intranet: Option<String>,
    dmi_root: PathBuf,
}

impl KubeMetaSource {
    pub fn new(client: kube::Client, namespace: impl Into<String>, intranet: Option<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            intranet,
            dmi_root: PathBuf::from(DEFAULT_DMI_ROOT),
        }
    }

    pub fn with_dmi_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dmi_root = root.into();
        self
    }

    async fn try_collect(&self) -> Result<AgentMeta> {
        let info = self.client.apiserver_version().await?;
        let k8s_version = info
            .git_version
            .strip_prefix('v')
            .unwrap_or(&info.git_version)
            .to_string();

        let provider = self.provider(&k8s_version).await?;
        let is_intranet = parse_intranet(self.intranet.as_deref())?;
        let customize_command = self.customize_command().await?;

        Ok(AgentMeta {
            provider,
            k8s_version,
            is_intranet,
            customize_command,
            data: BTreeMap::new(),
        })
    }

    async fn detect_provider(&self, k8s_version: &str) -> String {
        identify_provider(&self.dmi_root)
            .await
            .unwrap_or_else(|| provider_from_version(k8s_version))
            .to_string()
    }

    /// Cached provider unless the ConfigMap is missing, not marked
    /// automatic, or empty; then detect and write it back.
    async fn provider(&self, k8s_version: &str) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let provider = match api.get_opt(PROVIDER_CONFIGMAP).await? {
            None => {
                debug!(configmap = PROVIDER_CONFIGMAP, "configmap missing, creating");
                let provider = self.detect_provider(k8s_version).await;
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(PROVIDER_CONFIGMAP.to_string()),
                        ..ObjectMeta::default()
                    },
                    data: Some(provider_data(&provider)),
                    ..ConfigMap::default()
                };
                api.create(&PostParams::default(), &cm).await?;
                provider
            }
            Some(mut cm) => {
                let data = cm.data.as_ref();
                let cached = data.and_then(|d| d.get(PROVIDER_KEY)).filter(|p| !p.is_empty());
                let auto = data.and_then(|d| d.get(PROVIDER_AUTO_KEY)).map(String::as_str);
                if let (Some(p), Some("true")) = (cached, auto) {
                    return Ok(p.clone());
                }
                let provider = self.detect_provider(k8s_version).await;
                cm.data = Some(provider_data(&provider));
                api.replace(PROVIDER_CONFIGMAP, &PostParams::default(), &cm)
                    .await?;
                provider
            }
        };
        Ok(provider)
    }

    async fn customize_command(&self) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get_opt(AGENT_CONFIGMAP).await? {
            None => {
                debug!(configmap = AGENT_CONFIGMAP, "configmap missing, creating");
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(AGENT_CONFIGMAP.to_string()),
                        ..ObjectMeta::default()
                    },
                    data: Some(script_path_data()),
                    ..ConfigMap::default()
                };
                api.create(&PostParams::default(), &cm).await?;
                Ok(String::new())
            }
            Some(mut cm) => {
                if let Some(data) = cm.data.as_ref() {
                    let command = data.get(SCRIPT_PATH_KEY).cloned().unwrap_or_default();
                    validate_customize_command(&command)?;
                    return Ok(command);
                }
                cm.data = Some(script_path_data());
                if let Err(e) = api.replace(AGENT_CONFIGMAP, &PostParams::default(), &cm).await {
                    debug!(error = %e, "failed to seed agent configmap");
                }
                Ok(String::new())
            }
        }
    }
}

fn provider_data(provider: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PROVIDER_KEY.to_string(), provider.to_string()),
        (PROVIDER_AUTO_KEY.to_string(), "true".to_string()),
    ])
}

fn script_path_data() -> BTreeMap<String, String> {
    BTreeMap::from([(SCRIPT_PATH_KEY.to_string(), String::new())])
}

#[async_trait]
impl MetaSource for KubeMetaSource {
    async fn collect(&self) -> AgentMeta {
        match self.try_collect().await {
            Ok(meta) => meta,
            Err(e) => {
                error!(error = %e, "failed to collect cluster metadata");
                AgentMeta::default()
            }
        }
    }
}
