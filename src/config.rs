//! Configuration types for the SOAP runtime.

use crate::assembler::AssemblyConfig;
use crate::binding::{BindingKind, SoapVersion, WsBinding, ADDRESSING_FEATURE};
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Environment variable that turns message dumping on.
pub const DUMP_ENV_VAR: &str = "ZENTINEL_SOAP_DUMP";

/// Main configuration for the SOAP runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Binding configuration
    pub binding: BindingConfig,

    /// WS-Addressing configuration
    pub addressing: AddressingConfig,

    /// WS-Security configuration
    pub ws_security: WsSecurityConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            binding: BindingConfig::default(),
            addressing: AddressingConfig::default(),
            ws_security: WsSecurityConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loading runtime configuration");
        Self::from_yaml_str(&contents)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        let value = std::env::var(DUMP_ENV_VAR).ok();
        self.with_dump_override(value.as_deref())
    }

    fn with_dump_override(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            let enabled = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true");
            debug!(env = DUMP_ENV_VAR, enabled, "Dump flag overridden from environment");
            self.settings.dump = enabled;
        }
        self
    }

    /// Flags handed to the tube assembler.
    pub fn assembly_config(&self) -> AssemblyConfig {
        AssemblyConfig {
            dump: self.settings.dump,
            max_body_size: self.settings.max_body_size,
            require_addressing: self.addressing.required,
            ws_security: self.ws_security.clone(),
        }
    }

    /// Build the binding described by this configuration.
    pub fn build_binding(&self) -> Result<WsBinding> {
        let mut binding = WsBinding::new(self.binding.kind).with_mtom(self.binding.mtom);
        for feature in &self.binding.features {
            binding = binding.with_feature(feature.clone());
        }
        if self.addressing.enabled {
            binding = binding.with_feature(ADDRESSING_FEATURE);
        }
        if !self.binding.roles.is_empty() {
            binding.set_roles(self.binding.roles.iter().cloned())?;
        }
        Ok(binding)
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Log every request and response envelope
    pub dump: bool,

    /// Maximum encoded message size accepted by the server adapter (bytes)
    pub max_body_size: usize,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            dump: false,
            max_body_size: 1_048_576, // 1MB
        }
    }
}

/// Binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Binding kind: soap11, soap12 or xml_http
    pub kind: BindingKind,

    /// Additional feature ids to enable
    pub features: Vec<String>,

    /// Enable MTOM (carried as a flag only)
    pub mtom: bool,

    /// Roles this node plays besides the implicit ones
    pub roles: Vec<String>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            kind: BindingKind::Soap11,
            features: Vec::new(),
            mtom: false,
            roles: Vec::new(),
        }
    }
}

impl BindingConfig {
    pub fn soap_version(&self) -> Option<SoapVersion> {
        self.kind.soap_version()
    }
}

/// WS-Addressing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressingConfig {
    /// Enable the addressing feature on the binding
    pub enabled: bool,

    /// Reject requests without wsa:Action (server)
    pub required: bool,
}

/// WS-Security configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSecurityConfig {
    /// Enable WS-Security processing
    pub enabled: bool,

    /// Require WS-Security header
    pub require_security_header: bool,

    /// Require timestamp in Security header
    pub require_timestamp: bool,

    /// Maximum timestamp age in seconds (for replay prevention)
    pub max_timestamp_age_secs: u64,

    /// Require username token
    pub require_username_token: bool,

    /// Allowed username token password types
    pub allowed_password_types: Vec<PasswordType>,

    /// Require SAML assertion
    pub require_saml: bool,

    /// Packet property receiving the validated identity
    pub identity_property: Option<String>,

    /// Username sent by clients
    pub username: Option<String>,

    /// Password sent by clients (as PasswordText)
    pub password: Option<String>,

    /// Lifetime of client timestamps in seconds
    pub timestamp_ttl_secs: u64,
}

impl Default for WsSecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_security_header: false,
            require_timestamp: false,
            max_timestamp_age_secs: 300, // 5 minutes
            require_username_token: false,
            allowed_password_types: vec![PasswordType::PasswordDigest],
            require_saml: false,
            identity_property: None,
            username: None,
            password: None,
            timestamp_ttl_secs: 300,
        }
    }
}

/// WS-Security UsernameToken password types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordType {
    /// Plain text password (not recommended)
    #[serde(rename = "PasswordText")]
    PasswordText,
    /// Digested password (SHA-1 with nonce and timestamp)
    #[serde(rename = "PasswordDigest")]
    PasswordDigest,
}

impl PasswordType {
    /// Token profile URI for this password type.
    pub fn uri(&self) -> &'static str {
        match self {
            Self::PasswordText => "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText",
            Self::PasswordDigest => "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest",
        }
    }

    /// Whether a password type URI names this type.
    pub fn matches(&self, uri: &str) -> bool {
        match self {
            Self::PasswordText => uri.contains("PasswordText"),
            Self::PasswordDigest => uri.contains("PasswordDigest"),
        }
    }
}
