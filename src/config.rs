use std::net::{AddrParseError, SocketAddr};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::mutation::ContainerScope;
use crate::mutation::labels::LabelSelector;
use crate::mutation::mount_paths::RewriteRule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("label_key must not be empty")]
    EmptyLabelKey,
    #[error("{field} '{value}' must be an absolute path")]
    RelativePrefix { field: &'static str, value: String },
    #[error("{field} must not be the filesystem root")]
    RootPrefix { field: &'static str },
    #[error("rewrite_from '{from}' begins with rewrite_to '{to}'")]
    SourceInsideDestination { from: String, to: String },
    #[error("invalid listen_addr '{addr}': {source}")]
    ListenAddr { addr: String, source: AddrParseError },
    #[error("invalid metrics_addr '{addr}': {source}")]
    MetricsAddr { addr: String, source: AddrParseError },
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_tls_cert_path() -> String {
    "/tls/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/tls/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_label_key() -> String {
    "nfs-home".to_string()
}

fn default_label_value() -> String {
    "true".to_string()
}

fn default_rewrite_from() -> String {
    "/home".to_string()
}

fn default_rewrite_to() -> String {
    "/blah/home".to_string()
}

fn default_true() -> bool {
    true
}

/// Environment values such as `true` or `1` arrive typed; label keys and
/// values are always compared as text.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Bool(bool),
        Int(i64),
        Float(f64),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Overrides the port of `listen_addr` when set.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_label_key", deserialize_with = "lenient_string")]
    pub label_key: String,
    #[serde(default = "default_label_value", deserialize_with = "lenient_string")]
    pub label_value: String,
    #[serde(default = "default_rewrite_from")]
    pub rewrite_from: String,
    #[serde(default = "default_rewrite_to")]
    pub rewrite_to: String,
    #[serde(default = "default_true")]
    pub rewrite_init_containers: bool,
    #[serde(default)]
    pub rewrite_ephemeral_containers: bool,
    /// Log every admission body as received.
    #[serde(default)]
    pub debug_requests: bool,
    /// Log every generated patch.
    #[serde(default)]
    pub debug_patches: bool,
}

/// Everything the request path needs, validated once at startup and never
/// changed afterwards.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub selector: LabelSelector,
    pub rule: RewriteRule,
    pub scope: ContainerScope,
    pub debug_requests: bool,
    pub debug_patches: bool,
}

/// Variable names understood by earlier deployments of this webhook.
fn plain_env() -> Env {
    Env::raw().filter_map(|key| {
        let field = match key.as_str().to_ascii_uppercase().as_str() {
            "TARGET_LABEL_KEY" => "label_key",
            "TARGET_LABEL_VALUE" => "label_value",
            "REWRITE_FROM" => "rewrite_from",
            "REWRITE_TO" => "rewrite_to",
            "CERT_FILE" => "tls_cert_path",
            "KEY_FILE" => "tls_key_path",
            "PORT" => "port",
            "LOG_LEVEL" => "log_level",
            "DEBUG_REQUESTS" => "debug_requests",
            "DEBUG_PATCHES" => "debug_patches",
            _ => return None,
        };
        Some(field.into())
    })
}

impl WebhookConfig {
    /// Defaults, then the optional YAML file, then plain variables, then
    /// `MOUNT_REWRITER_*` variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(plain_env())
            // A Service named mount-rewriter injects MOUNT_REWRITER_PORT=tcp://...
            .merge(Env::prefixed("MOUNT_REWRITER_").ignore(&["port"]))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn snapshot(&self) -> Result<Snapshot, ConfigError> {
        if self.label_key.is_empty() {
            return Err(ConfigError::EmptyLabelKey);
        }
        Ok(Snapshot {
            selector: LabelSelector::new(&self.label_key, &self.label_value),
            rule: RewriteRule::new(&self.rewrite_from, &self.rewrite_to)?,
            scope: ContainerScope {
                init_containers: self.rewrite_init_containers,
                ephemeral_containers: self.rewrite_ephemeral_containers,
            },
            debug_requests: self.debug_requests,
            debug_patches: self.debug_patches,
        })
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let mut addr: SocketAddr =
            self.listen_addr
                .parse()
                .map_err(|source| ConfigError::ListenAddr {
                    addr: self.listen_addr.clone(),
                    source,
                })?;
        if let Some(port) = self.port {
            addr.set_port(port);
        }
        Ok(addr)
    }

    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics_addr
            .parse()
            .map_err(|source| ConfigError::MetricsAddr {
                addr: self.metrics_addr.clone(),
                source,
            })
    }
}
