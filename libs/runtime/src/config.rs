//! Configuration schema (`spec.md §6`).
//!
//! Parsing the configuration *file* (YAML/JSON on disk, env overlays, etc.) is
//! an external collaborator's job; what lives here is the schema those bytes
//! deserialize into, plus the validation spec.md requires at load time
//! (exactly-one-of handler variant, TLS file readability).

use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("handler config for {0} must specify exactly one of exec/http")]
    HandlerVariant(String),

    #[error("tls config at {context} has an unreadable cert file: {path}")]
    TlsCertUnreadable { context: String, path: PathBuf },

    #[error("tls config at {context} has an unreadable key file: {path}")]
    TlsKeyUnreadable { context: String, path: PathBuf },

    #[error("tls config at {context} has an unreadable ca file: {path}")]
    TlsCaUnreadable { context: String, path: PathBuf },

    #[error("injector {0} verification key is unreadable: {1}")]
    InjectorKeyUnreadable(String, PathBuf),

    #[error("controller {0} has an empty name")]
    EmptyControllerName(String),

    #[error("duplicate controller name: {0}")]
    DuplicateControllerName(String),
}

/// A `(group, version, kind)` tuple identifying a cluster resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name, e.g. "configmaps". Required since the core does
    /// not perform API discovery.
    pub plural: String,
}

impl Gvk {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn to_api_resource(&self) -> kube::discovery::ApiResource {
        kube::discovery::ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DependentDescriptor {
    #[serde(flatten)]
    pub gvk: Gvk,
    #[serde(default)]
    pub orphan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceDescriptor {
    #[serde(flatten)]
    pub gvk: Gvk,
    pub name_field_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

impl TlsConfig {
    pub fn validate(&self, context: &str) -> Result<(), ConfigError> {
        if self.cert_file.as_os_str().is_empty() || !is_readable(&self.cert_file) {
            return Err(ConfigError::TlsCertUnreadable {
                context: context.to_owned(),
                path: self.cert_file.clone(),
            });
        }
        if self.key_file.as_os_str().is_empty() || !is_readable(&self.key_file) {
            return Err(ConfigError::TlsKeyUnreadable {
                context: context.to_owned(),
                path: self.key_file.clone(),
            });
        }
        if let Some(ca) = &self.ca_file {
            if !is_readable(ca) {
                return Err(ConfigError::TlsCaUnreadable {
                    context: context.to_owned(),
                    path: ca.clone(),
                });
            }
        }
        Ok(())
    }
}

fn is_readable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, with = "humantime_duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default, with = "humantime_duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub debug: bool,
}

/// Exactly-one-of `{exec, http}`: a tagged union validated at load time
/// rather than structurally enforced by serde's externally-tagged enum
/// representation, since config authors write `{exec: {...}}` or `{http:
/// {...}}` as plain maps that may (incorrectly) contain both keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HandlerConfig {
    #[serde(default)]
    pub exec: Option<ExecConfig>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
}

pub enum HandlerVariant<'a> {
    Exec(&'a ExecConfig),
    Http(&'a HttpConfig),
}

impl HandlerConfig {
    pub fn validate(&self, context: &str) -> Result<HandlerVariant<'_>, ConfigError> {
        match (&self.exec, &self.http) {
            (Some(exec), None) => Ok(HandlerVariant::Exec(exec)),
            (None, Some(http)) => {
                if let Some(tls) = &http.tls {
                    tls.validate(context)?;
                }
                Ok(HandlerVariant::Http(http))
            }
            _ => Err(ConfigError::HandlerVariant(context.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconcilerConfig {
    #[serde(flatten)]
    pub handler: HandlerConfig,
    #[serde(default, with = "humantime_duration_opt")]
    pub requeue_after: Option<Duration>,
    #[serde(default)]
    pub observe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FinalizerConfig {
    #[serde(flatten)]
    pub handler: HandlerConfig,
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SyncerConfig {
    #[serde(default, with = "humantime_duration_opt")]
    pub interval: Option<Duration>,
}

impl SyncerConfig {
    pub fn enabled(&self) -> bool {
        self.interval.map(|d| !d.is_zero()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ControllerConfig {
    pub name: String,
    pub resource: Gvk,
    #[serde(default)]
    pub dependents: Vec<DependentDescriptor>,
    #[serde(default)]
    pub references: Vec<ReferenceDescriptor>,
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub finalizer: Option<FinalizerConfig>,
    #[serde(default)]
    pub syncer: SyncerConfig,
    /// Number of worker tasks draining this controller's queue concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyControllerName(self.name.clone()));
        }
        self.reconciler
            .handler
            .validate(&format!("{}.reconciler", self.name))?;
        if let Some(finalizer) = &self.finalizer {
            finalizer
                .handler
                .validate(&format!("{}.finalizer", self.name))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub enum HandlerKind {
    Validate,
    Mutate,
    Inject,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InjectorConfig {
    #[serde(flatten)]
    pub handler: HandlerConfig,
    /// PEM-encoded public key used to verify the patch signature.
    pub verification_key_file: PathBuf,
}

impl InjectorConfig {
    /// `spec.md §9` Open Question: the upstream source's check was inverted
    /// (it failed when the key *did* exist). The intent is the opposite:
    /// require the file to exist and be readable.
    pub fn validate(&self, context: &str) -> Result<(), ConfigError> {
        self.handler.validate(context)?;
        if !is_readable(&self.verification_key_file) {
            return Err(ConfigError::InjectorKeyUnreadable(
                context.to_owned(),
                self.verification_key_file.clone(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookHandlerConfig {
    pub resource: Gvk,
    #[serde(default)]
    pub validator: Option<HandlerConfig>,
    #[serde(default)]
    pub mutator: Option<HandlerConfig>,
    #[serde(default)]
    pub injector: Option<InjectorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    pub tls: TlsConfig,
    #[serde(default)]
    pub handlers: Vec<WebhookHandlerConfig>,
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tls.validate("webhook")?;
        for h in &self.handlers {
            if let Some(v) = &h.validator {
                v.validate(&format!("webhook.{}.validator", h.resource.kind))?;
            }
            if let Some(m) = &h.mutator {
                m.validate(&format!("webhook.{}.mutator", h.resource.kind))?;
            }
            if let Some(i) = &h.injector {
                i.validate(&format!("webhook.{}.injector", h.resource.kind))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MetricsConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for controller in &self.controllers {
            controller.validate()?;
            if !seen.insert(controller.name.clone()) {
                return Err(ConfigError::DuplicateControllerName(controller.name.clone()));
            }
        }
        if let Some(webhook) = &self.webhook {
            webhook.validate()?;
        }
        Ok(())
    }
}

/// `serde_with`-style duration (de)serialization without pulling in the
/// `serde_with` crate for a single field shape: accepts a humantime string
/// ("5s", "10m") as the config's duration values are authored.
mod humantime_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(s) if !s.is_empty() => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}
