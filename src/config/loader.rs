// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Configuration file discovery and loading.

use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};

use super::GatewayConf;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "CA_GATEWAY_CONFIG";

/// Configuration file loader with discovery and precedence rules.
///
/// # Search Order
///
/// The first match wins:
///
/// 1. Explicit path (if set via `with_path()`)
/// 2. Environment variable `CA_GATEWAY_CONFIG`
/// 3. `/etc/ca-gateway/config.toml`
/// 4. `./ca-gateway.toml`
///
/// # Example
///
/// ```no_run
/// use usg_ca_gateway::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_path("/etc/ca-gateway/config.toml")
///     .load()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    expand_variables: bool,
    validate: bool,
    env_var_name: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader with default settings.
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            expand_variables: true,
            validate: true,
            env_var_name: CONFIG_ENV_VAR.to_string(),
        }
    }

    /// Set an explicit configuration file path.
    ///
    /// When set, only this path is checked.
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enable or disable `${VAR}` expansion. Default: `true`
    pub fn with_expand_variables(mut self, expand: bool) -> Self {
        self.expand_variables = expand;
        self
    }

    /// Enable or disable validation after loading. Default: `true`
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Set the environment variable consulted for the path.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var_name = name.into();
        self
    }

    /// Find, read, expand and validate the configuration file.
    pub fn load(&self) -> Result<GatewayConf> {
        let config_path = self.find_config_file()?;
        tracing::debug!("Loading configuration from {}", config_path.display());

        let toml_content = std::fs::read_to_string(&config_path).map_err(|e| {
            GatewayError::config(format!("Failed to read {}: {e}", config_path.display()))
        })?;

        self.load_from_str(&toml_content)
    }

    /// Load configuration from a TOML string.
    pub fn load_from_str(&self, toml_content: &str) -> Result<GatewayConf> {
        let mut config = GatewayConf::from_toml(toml_content)?;

        if self.expand_variables {
            config.expand_variables()?;
        }

        if self.validate {
            config.validate()?;
        }

        Ok(config)
    }

    /// Resolve the configuration file path.
    pub fn find_config_file(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.explicit_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(GatewayError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        if let Ok(env_path) = std::env::var(&self.env_var_name) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(path);
            }
            // Set but missing is an error, not a fall-through
            return Err(GatewayError::config(format!(
                "Configuration file from {} not found: {}",
                self.env_var_name, env_path
            )));
        }

        for path in self.search_paths() {
            if path.exists() {
                return Ok(path);
            }
        }

        Err(GatewayError::config(format!(
            "No configuration file found. Searched:\n  - {}",
            self.search_paths()
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n  - ")
        )))
    }

    /// Standard locations, in search order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from("/etc/ca-gateway/config.toml"),
            PathBuf::from("ca-gateway.toml"),
        ]
    }
}

/// Write a commented starting configuration to `path`.
pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
    let default_config = r#"# CA gateway configuration

[server]
listen = "0.0.0.0:8443"
# Log request and response bodies at DEBUG
log_req_resp = false

[backend]
url = "https://ca.example.com/gw"
ca_name = "issuing-ca"
timeout_seconds = 30
# ca_bundle_path = "/etc/ca-gateway/backend-trust.pem"
# client_cert_path = "/etc/ca-gateway/gw-cert.pem"
# client_key_path = "/etc/ca-gateway/gw-key.pem"
# username = "gateway"
# password = "${CA_GATEWAY_BACKEND_PASSWORD}"

[pool]
signer = "pop"
borrow_timeout_ms = 5000

[[signers]]
name = "pop"
key_path = "/etc/ca-gateway/pop-key.pem"
hash = "SHA256"
parallelism = 4

[ca]
chain_path = "/etc/ca-gateway/ca-chain.pem"

[est]
# path = "/.well-known/est"
default_profile = "tls"

[scep]
default_profile = "tls"

[cmp]
default_profile = "tls"

[acme]
base_url = "https://gw.example.com/acme"
default_profile = "tls"

[logging]
level = "info"
json = false

[audit]
# path = "/var/log/ca-gateway/audit.jsonl"
max_size_mb = 10
max_files = 5
"#;

    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            GatewayError::config(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }
    std::fs::write(path, default_config)
        .map_err(|e| GatewayError::config(format!("Failed to write {}: {e}", path.display())))
}
