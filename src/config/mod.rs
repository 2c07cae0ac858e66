// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Gateway configuration.
//!
//! The gateway is configured from a single TOML file, read once at startup
//! and never mutated afterwards:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8443"
//!
//! [backend]
//! url = "https://ca.example.com/gw"
//! ca_name = "issuing-ca"
//! timeout_seconds = 30
//! ca_bundle_path = "/etc/ca-gateway/backend-trust.pem"
//!
//! [pool]
//! signer = "pop"
//! borrow_timeout_ms = 5000
//!
//! [[signers]]
//! name = "pop"
//! key_path = "/etc/ca-gateway/pop-key.pem"
//! hash = "SHA256"
//! parallelism = 4
//!
//! [ca]
//! chain_path = "/etc/ca-gateway/ca-chain.pem"
//!
//! [est]
//! default_profile = "tls"
//!
//! [acme]
//! base_url = "https://gw.example.com/acme"
//! default_profile = "tls"
//! ```
//!
//! Protocol sections that are absent are not mounted.

mod expand;
mod loader;

pub use expand::expand_variables;
pub use loader::{ConfigLoader, write_default_config};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use x509_cert::Certificate;

use crate::audit::{AuditSink, FileAuditSink, LogAuditSink, MultiAuditSink};
use crate::backend::{CaClientConfig, ClientIdentity, HttpCaClient};
use crate::error::{GatewayError, Result};
use crate::logging::{LogConfig, LogLevel};
use crate::protocol::{AcmeAdapter, CmpAdapter, EstAdapter, ProtocolAdapter, ScepAdapter};
use crate::responder::Responder;
use crate::security::{HashAlgo, SignerPool, SoftwareSigner};

use expand::expand_option;

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConf {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConf,

    /// CA service the gateway forwards to.
    pub backend: BackendConf,

    /// Proof-of-possession signer pool.
    #[serde(default)]
    pub pool: PoolConf,

    /// Signer identities.
    #[serde(default)]
    pub signers: Vec<SignerConf>,

    /// CA certificate chain served to clients.
    #[serde(default)]
    pub ca: Option<CaConf>,

    /// EST mount.
    #[serde(default)]
    pub est: Option<ProtocolConf>,

    /// SCEP mount.
    #[serde(default)]
    pub scep: Option<ProtocolConf>,

    /// CMP-style update mount.
    #[serde(default)]
    pub cmp: Option<ProtocolConf>,

    /// ACME mount.
    #[serde(default)]
    pub acme: Option<AcmeConf>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConf,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConf,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConf {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log request and response bodies (base64) at DEBUG.
    #[serde(default)]
    pub log_req_resp: bool,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_req_resp: false,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// `[backend]`
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConf {
    /// CA service base URL.
    pub url: String,

    /// CA addressed on the service.
    pub ca_name: String,

    /// Request timeout in seconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout_seconds: u64,

    /// PEM bundle used to verify the CA service. Web PKI roots when unset.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    /// Client certificate (PEM) for mutual TLS.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    /// Client key (PEM) for mutual TLS.
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    /// HTTP Basic username.
    #[serde(default)]
    pub username: Option<String>,

    /// HTTP Basic password.
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for BackendConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConf")
            .field("url", &self.url)
            .field("ca_name", &self.ca_name)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("ca_bundle_path", &self.ca_bundle_path)
            .field("client_cert_path", &self.client_cert_path)
            .field("client_key_path", &self.client_key_path)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_backend_timeout() -> u64 {
    30
}

/// `[pool]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConf {
    /// Name of the `[[signers]]` entry backing the pool. May be omitted when
    /// exactly one signer is configured. Every configured signer must be the
    /// pool signer; validation rejects entries nothing would use.
    #[serde(default)]
    pub signer: Option<String>,

    /// How long a request waits for a free signer, in milliseconds.
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            signer: None,
            borrow_timeout_ms: default_borrow_timeout_ms(),
        }
    }
}

fn default_borrow_timeout_ms() -> u64 {
    5000
}

/// `[[signers]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignerConf {
    /// Identity name.
    pub name: String,

    /// PKCS#8 PEM private key.
    pub key_path: PathBuf,

    /// Digest algorithm, by name or OID.
    #[serde(default = "default_hash")]
    pub hash: String,

    /// Number of pooled handles.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_hash() -> String {
    "SHA256".to_string()
}

fn default_parallelism() -> usize {
    1
}

/// `[ca]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaConf {
    /// PEM file with the issuing CA certificate first.
    pub chain_path: PathBuf,
}

/// `[est]`, `[scep]`, `[cmp]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConf {
    /// Mount the protocol.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mount path. Protocol default when unset.
    #[serde(default)]
    pub path: Option<String>,

    /// Profile used when the path does not name one.
    pub default_profile: String,
}

/// `[acme]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeConf {
    /// Mount the protocol.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mount path. `/acme` when unset.
    #[serde(default)]
    pub path: Option<String>,

    /// Profile used when the path does not name one.
    pub default_profile: String,

    /// Externally visible URL of the mount.
    pub base_url: String,
}

fn default_true() -> bool {
    true
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConf {
    /// trace, debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConf {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[audit]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConf {
    /// JSON-lines audit file. Events go to the log only when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Rotate the file past this size.
    #[serde(default = "default_audit_max_size_mb")]
    pub max_size_mb: u64,

    /// Rotated files kept. Must be at least 1.
    #[serde(default = "default_audit_max_files")]
    pub max_files: u32,
}

impl Default for AuditConf {
    fn default() -> Self {
        Self {
            path: None,
            max_size_mb: default_audit_max_size_mb(),
            max_files: default_audit_max_files(),
        }
    }
}

fn default_audit_max_size_mb() -> u64 {
    FileAuditSink::DEFAULT_MAX_SIZE_BYTES / (1024 * 1024)
}

fn default_audit_max_files() -> u32 {
    FileAuditSink::DEFAULT_MAX_FILES
}

/// Default mount paths.
pub mod default_paths {
    /// EST
    pub const EST: &str = "/.well-known/est";
    /// SCEP
    pub const SCEP: &str = "/scep";
    /// CMP-style update
    pub const CMP: &str = "/cmp";
    /// ACME
    pub const ACME: &str = "/acme";
}

impl GatewayConf {
    /// Parse configuration from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GatewayError::config(format!("Invalid TOML: {e}")))
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GatewayError::config(format!("Failed to serialize config: {e}")))
    }

    /// Expand `${VAR}` references in string values.
    pub fn expand_variables(&mut self) -> Result<()> {
        self.backend.url = expand_variables(&self.backend.url)?;
        self.backend.ca_name = expand_variables(&self.backend.ca_name)?;
        expand_option(&mut self.backend.username)?;
        expand_option(&mut self.backend.password)?;
        if let Some(acme) = &mut self.acme {
            acme.base_url = expand_variables(&acme.base_url)?;
        }
        Ok(())
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.server.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.listen '{}' is not a socket address",
                self.server.listen
            ));
        }

        if self.backend.url.is_empty() {
            errors.push("backend.url is required".to_string());
        } else if url::Url::parse(&self.backend.url).is_err() {
            errors.push(format!("backend.url '{}' is not a URL", self.backend.url));
        }
        if self.backend.ca_name.is_empty() {
            errors.push("backend.ca_name is required".to_string());
        }
        if self.backend.timeout_seconds == 0 {
            errors.push("backend.timeout_seconds must be > 0".to_string());
        }
        if self.backend.client_cert_path.is_some() != self.backend.client_key_path.is_some() {
            errors.push(
                "backend.client_cert_path and backend.client_key_path must be set together"
                    .to_string(),
            );
        }
        if self.backend.username.is_some() != self.backend.password.is_some() {
            errors.push("backend.username and backend.password must be set together".to_string());
        }

        if self.pool.borrow_timeout_ms == 0 {
            errors.push("pool.borrow_timeout_ms must be > 0".to_string());
        }

        if self.signers.is_empty() {
            errors.push("at least one [[signers]] entry is required".to_string());
        }
        for (i, signer) in self.signers.iter().enumerate() {
            if signer.name.is_empty() {
                errors.push(format!("signers[{i}].name is required"));
            }
            if self.signers[..i].iter().any(|s| s.name == signer.name) {
                errors.push(format!("signers[{i}].name '{}' is duplicated", signer.name));
            }
            if signer.parallelism == 0 {
                errors.push(format!("signers[{i}].parallelism must be > 0"));
            }
            if HashAlgo::from_name(&signer.hash).is_none() {
                errors.push(format!("signers[{i}].hash '{}' is unknown", signer.hash));
            }
        }
        match &self.pool.signer {
            Some(name) if !self.signers.iter().any(|s| &s.name == name) => {
                errors.push(format!("pool.signer '{name}' has no [[signers]] entry"));
            }
            Some(name) => {
                for (i, signer) in self.signers.iter().enumerate() {
                    if &signer.name != name {
                        errors.push(format!(
                            "signers[{i}] '{}' is not used by pool.signer '{name}'",
                            signer.name
                        ));
                    }
                }
            }
            None if self.signers.len() > 1 => {
                errors.push("pool.signer is required when several signers exist".to_string());
            }
            None => {}
        }

        let mounts = self.mount_paths();
        if mounts.is_empty() {
            errors.push("at least one protocol must be enabled".to_string());
        }
        for (i, (section, path)) in mounts.iter().enumerate() {
            if !path.starts_with('/') {
                errors.push(format!("{section}.path '{path}' must start with '/'"));
            }
            if mounts[..i].iter().any(|(_, p)| p == path) {
                errors.push(format!("{section}.path '{path}' is already mounted"));
            }
        }

        let needs_chain = self.est.as_ref().is_some_and(|c| c.enabled)
            || self.scep.as_ref().is_some_and(|c| c.enabled)
            || self.acme.as_ref().is_some_and(|c| c.enabled);
        if needs_chain && self.ca.is_none() {
            errors.push("[ca] chain_path is required for EST, SCEP and ACME".to_string());
        }

        if let Some(acme) = self.acme.as_ref().filter(|a| a.enabled)
            && !(acme.base_url.starts_with("https://") || acme.base_url.starts_with("http://"))
        {
            errors.push("acme.base_url must be an http(s) URL".to_string());
        }

        if LogLevel::parse(&self.logging.level).is_none() {
            errors.push(format!("logging.level '{}' is unknown", self.logging.level));
        }

        if self.audit.max_size_mb == 0 || self.audit.max_files == 0 {
            errors.push("audit.max_size_mb and audit.max_files must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Enabled protocol sections with their effective mount paths.
    fn mount_paths(&self) -> Vec<(&'static str, String)> {
        let mut mounts = Vec::new();
        let sections = [
            ("est", &self.est, default_paths::EST),
            ("scep", &self.scep, default_paths::SCEP),
            ("cmp", &self.cmp, default_paths::CMP),
        ];
        for (section, conf, default) in sections {
            if let Some(conf) = conf.as_ref().filter(|c| c.enabled) {
                mounts.push((section, conf.path.clone().unwrap_or_else(|| default.to_string())));
            }
        }
        if let Some(acme) = self.acme.as_ref().filter(|a| a.enabled) {
            mounts.push((
                "acme",
                acme.path.clone().unwrap_or_else(|| default_paths::ACME.to_string()),
            ));
        }
        mounts
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            GatewayError::config(format!("Invalid listen address '{}': {e}", self.server.listen))
        })
    }

    /// Borrow timeout for the signer pool.
    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.borrow_timeout_ms)
    }

    /// Backend submission timeout.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_seconds)
    }

    /// Logging settings.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: LogLevel::parse(&self.logging.level).unwrap_or_default(),
            json_format: self.logging.json,
        }
    }

    /// Load the pool signer's key and replicate it into a pool.
    pub fn load_signer_pool(&self) -> Result<Arc<SignerPool>> {
        let signer_conf = match &self.pool.signer {
            Some(name) => self.signers.iter().find(|s| &s.name == name),
            None => self.signers.first(),
        }
        .ok_or_else(|| GatewayError::config("no signer configured for the pool"))?;

        let hash: HashAlgo = signer_conf.hash.parse()?;
        let signer =
            SoftwareSigner::from_pkcs8_file(&signer_conf.name, &signer_conf.key_path, hash)?;
        tracing::info!(
            "Loaded signer '{}' ({}, {}) with parallelism {}",
            signer_conf.name,
            signer.key_algorithm(),
            hash,
            signer_conf.parallelism
        );

        let pool = SignerPool::replicate(&signer_conf.name, &signer, signer_conf.parallelism)?;
        Ok(Arc::new(pool))
    }

    /// Load the CA certificate chain, issuing CA first. Empty without `[ca]`.
    pub fn load_ca_chain(&self) -> Result<Vec<Certificate>> {
        let Some(ca) = &self.ca else {
            return Ok(Vec::new());
        };
        let pem = std::fs::read(&ca.chain_path).map_err(|e| {
            GatewayError::config(format!("Failed to read {}: {e}", ca.chain_path.display()))
        })?;
        let chain = Certificate::load_pem_chain(&pem).map_err(|e| {
            GatewayError::config(format!(
                "Failed to parse CA chain {}: {e}",
                ca.chain_path.display()
            ))
        })?;
        if chain.is_empty() {
            return Err(GatewayError::config(format!(
                "CA chain {} contains no certificates",
                ca.chain_path.display()
            )));
        }
        Ok(chain)
    }

    /// Build the enabled adapters paired with their mount paths.
    pub fn adapters(&self, ca_chain: &[Certificate]) -> Result<Vec<(String, ProtocolAdapter)>> {
        let mut adapters = Vec::new();

        if let Some(est) = self.est.as_ref().filter(|c| c.enabled) {
            adapters.push((
                est.path.clone().unwrap_or_else(|| default_paths::EST.to_string()),
                ProtocolAdapter::Est(EstAdapter::new(&est.default_profile, ca_chain.to_vec())),
            ));
        }
        if let Some(scep) = self.scep.as_ref().filter(|c| c.enabled) {
            adapters.push((
                scep.path.clone().unwrap_or_else(|| default_paths::SCEP.to_string()),
                ProtocolAdapter::Scep(ScepAdapter::new(&scep.default_profile, ca_chain.to_vec())),
            ));
        }
        if let Some(cmp) = self.cmp.as_ref().filter(|c| c.enabled) {
            adapters.push((
                cmp.path.clone().unwrap_or_else(|| default_paths::CMP.to_string()),
                ProtocolAdapter::CmpUpdate(CmpAdapter::new(&cmp.default_profile)),
            ));
        }
        if let Some(acme) = self.acme.as_ref().filter(|c| c.enabled) {
            adapters.push((
                acme.path.clone().unwrap_or_else(|| default_paths::ACME.to_string()),
                ProtocolAdapter::Acme(AcmeAdapter::new(
                    &acme.base_url,
                    &acme.default_profile,
                    ca_chain.to_vec(),
                )?),
            ));
        }

        Ok(adapters)
    }

    /// Connection settings for the CA service.
    pub fn backend_config(&self) -> Result<CaClientConfig> {
        let mut builder = CaClientConfig::builder()
            .url(&self.backend.url)
            .map_err(|e| GatewayError::config(format!("Invalid backend URL: {e}")))?
            .ca_name(&self.backend.ca_name)
            .timeout(self.backend_timeout());

        if let Some(path) = &self.backend.ca_bundle_path {
            let pem = std::fs::read(path).map_err(|e| {
                GatewayError::config(format!("Failed to read {}: {e}", path.display()))
            })?;
            builder = builder.trust_explicit(vec![pem]);
        }

        if let (Some(cert), Some(key)) =
            (&self.backend.client_cert_path, &self.backend.client_key_path)
        {
            let identity = ClientIdentity::from_files(cert, key).map_err(|e| {
                GatewayError::config(format!("Failed to read backend client identity: {e}"))
            })?;
            builder = builder.client_identity(identity);
        }

        if let (Some(user), Some(pass)) = (&self.backend.username, &self.backend.password) {
            builder = builder.http_auth(user, pass);
        }

        builder.build().map_err(GatewayError::config)
    }

    /// Audit sink: the log, plus a rotating file when `audit.path` is set.
    pub fn audit_sink(&self) -> Result<Arc<dyn AuditSink>> {
        let Some(path) = &self.audit.path else {
            return Ok(Arc::new(LogAuditSink));
        };

        let file = FileAuditSink::new(
            path,
            self.audit.max_size_mb * 1024 * 1024,
            self.audit.max_files,
        )?;
        let mut sink = MultiAuditSink::new();
        sink.add(Arc::new(LogAuditSink));
        sink.add(Arc::new(file));
        Ok(Arc::new(sink))
    }

    /// Assemble the responder: signer pool, adapters, backend client and
    /// audit sink.
    pub fn build_responder(&self) -> Result<Responder> {
        let pool = self.load_signer_pool()?;
        let ca_chain = self.load_ca_chain()?;
        let backend = HttpCaClient::new(self.backend_config()?)?;

        let mut builder = Responder::builder()
            .signer_pool(pool)
            .backend(Arc::new(backend))
            .audit_sink(self.audit_sink()?)
            .borrow_timeout(self.borrow_timeout())
            .backend_timeout(self.backend_timeout())
            .log_bodies(self.server.log_req_resp);

        for (path, adapter) in self.adapters(&ca_chain)? {
            builder = builder.mount(path, adapter);
        }

        builder.build()
    }
}
