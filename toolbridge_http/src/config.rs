//! Bridge and provider configuration.
//!
//! Providers are declared in a TOML file (or with the `--provider` CLI
//! shorthand); registration order is the order of declaration and is the
//! order used for fan-out listings.
//!
//! ```toml
//! default_provider = "xero"
//!
//! [[providers]]
//! name = "xero"
//! command = "xero-mcp-server"
//! args = ["--stdio"]
//! [providers.env]
//! XERO_CLIENT_ID = "..."
//!
//! [[providers]]
//! name = "supabase"
//! command = "npx"
//! args = ["-y", "@supabase/mcp-server-supabase"]
//! ```

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, path::Path, time::Duration};

pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// Selector value meaning "every registered provider".
pub const ALL_PROVIDERS: &str = "all";

/// Get the initialize handshake timeout from TOOLBRIDGE_INIT_TIMEOUT_SECS.
/// Defaults to 10 seconds if not set or invalid.
pub fn init_timeout_secs() -> u64 {
    std::env::var("TOOLBRIDGE_INIT_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_INIT_TIMEOUT_SECS)
}

/// Get the per-call timeout from TOOLBRIDGE_CALL_TIMEOUT_SECS.
/// Defaults to 10 seconds if not set or invalid.
pub fn call_timeout_secs() -> u64 {
    std::env::var("TOOLBRIDGE_CALL_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS)
}

/// How to launch one provider process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
    /// Routing key, also used as the namespace prefix of its tools.
    pub name: String,
    /// Executable path or command name.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables added on top of the bridge's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Parse the CLI shorthand `name=command [arg ...]`.
    pub fn parse_shorthand(input: &str) -> Result<Self> {
        let (name, rest) = input.split_once('=').ok_or_else(|| {
            BridgeError::Config(format!(
                "Invalid provider '{input}': expected name=command [args...]"
            ))
        })?;
        let mut words = rest.split_whitespace();
        let command = words.next().ok_or_else(|| {
            BridgeError::Config(format!("Provider '{name}' has an empty command"))
        })?;
        Ok(Self::new(name.trim(), command).with_args(words))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProvidersFile {
    #[serde(default)]
    default_provider: Option<String>,
    #[serde(default)]
    providers: Vec<ProviderSpec>,
}

/// Configuration for the HTTP bridge server.
///
/// # Example
///
/// ```rust
/// use toolbridge_http::{BridgeConfig, ProviderSpec};
///
/// let config = BridgeConfig {
///     bind_addr: "127.0.0.1:8080".parse().unwrap(),
///     providers: vec![
///         ProviderSpec::new("xero", "xero-mcp-server"),
///         ProviderSpec::new("supabase", "supabase-mcp").with_args(["--read-only"]),
///     ],
///     default_provider: Some("xero".into()),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Local address to bind the HTTP server to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Registered providers, in registration order.
    pub providers: Vec<ProviderSpec>,

    /// Provider used when a request names none. Defaults to the first one.
    pub default_provider: Option<String>,

    /// Bound on the spawn + initialize handshake of one provider.
    pub init_timeout: Duration,

    /// Bound on each individual call.
    pub call_timeout: Duration,

    /// Echo every line exchanged with the children to stderr, colored.
    pub enable_colored_output: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            providers: Vec::new(),
            default_provider: None,
            init_timeout: Duration::from_secs(init_timeout_secs()),
            call_timeout: Duration::from_secs(call_timeout_secs()),
            enable_colored_output: false,
        }
    }
}

impl BridgeConfig {
    /// Merge the providers declared in a TOML file into this configuration.
    ///
    /// File providers are registered before any already present. A
    /// `default_provider` in the file applies only if none is set yet.
    pub fn load_providers_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        self.merge_providers_toml(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Same as [`BridgeConfig::load_providers_file`] for in-memory TOML.
    pub fn merge_providers_toml(&mut self, content: &str) -> Result<()> {
        let file: ProvidersFile =
            toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?;

        let mut providers = file.providers;
        providers.append(&mut self.providers);
        self.providers = providers;

        if self.default_provider.is_none() {
            self.default_provider = file.default_provider;
        }
        Ok(())
    }

    /// Name of the provider used when a request does not pick one.
    pub fn default_provider_name(&self) -> Option<&str> {
        self.default_provider
            .as_deref()
            .or_else(|| self.providers.first().map(|p| p.name.as_str()))
    }

    /// Check provider names, commands and the default provider.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(BridgeError::Config(
                "At least one provider must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            let name = provider.name.as_str();
            if name.is_empty() {
                return Err(BridgeError::Config("Provider name must not be empty".into()));
            }
            if name.contains('.') {
                return Err(BridgeError::Config(format!(
                    "Provider name '{name}' must not contain '.' (reserved for tool namespaces)"
                )));
            }
            if name.eq_ignore_ascii_case(ALL_PROVIDERS) {
                return Err(BridgeError::Config(format!(
                    "Provider name '{name}' is reserved"
                )));
            }
            if provider.command.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "Provider '{name}' has an empty command"
                )));
            }
            if !seen.insert(name) {
                return Err(BridgeError::Config(format!(
                    "Provider '{name}' is declared more than once"
                )));
            }
        }

        if let Some(default) = &self.default_provider
            && !seen.contains(default.as_str())
        {
            return Err(BridgeError::Config(format!(
                "Default provider '{default}' is not registered"
            )));
        }
        Ok(())
    }
}
