//! TOML-based configuration for the secmgr identity provider.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SecmgrError};

/// Name of the credential group every valid configuration must carry.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Top-level configuration, deserialized from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecmgrConfig {
    pub secmgr: SecmgrSection,
    #[serde(default)]
    pub idp: IdpConfig,
    #[serde(default)]
    pub service_providers: Vec<ServiceProviderConfig>,
    #[serde(default)]
    pub credential_groups: Vec<CredentialGroup>,
}

/// Instance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecmgrSection {
    pub instance_name: String,
    #[serde(default)]
    pub public_url: Option<String>,
}

/// Identity provider behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdpConfig {
    /// SAML entity ID of this IdP. Defaults to `secmgr.public_url`.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default = "default_cookie_name")]
    pub session_cookie_name: String,
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_minutes: u32,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_form_attempts")]
    pub max_form_attempts: u32,
    #[serde(default = "default_assertion_lifetime")]
    pub assertion_lifetime_minutes: u32,
    /// SOAP header names, in `{namespace}local` form, this IdP understands.
    #[serde(default)]
    pub understood_soap_headers: Vec<String>,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            entity_id: None,
            session_cookie_name: default_cookie_name(),
            session_idle_timeout_minutes: default_idle_timeout(),
            max_sessions: default_max_sessions(),
            max_form_attempts: default_max_form_attempts(),
            assertion_lifetime_minutes: default_assertion_lifetime(),
            understood_soap_headers: Vec::new(),
        }
    }
}

fn default_cookie_name() -> String {
    "GSA_SESSION_ID".into()
}

fn default_idle_timeout() -> u32 {
    30
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_max_form_attempts() -> u32 {
    3
}

fn default_assertion_lifetime() -> u32 {
    5
}

fn default_enabled() -> bool {
    true
}

/// A relying party allowed to send SSO requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub acs_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A set of credentials verified together, e.g. one per protected realm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialGroup {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// An optional group may stay unverified without failing the exchange.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub requires_username: bool,
    #[serde(default)]
    pub requires_password: bool,
    #[serde(default)]
    pub mechanisms: Vec<MechanismConfig>,
}

impl CredentialGroup {
    /// Label shown on the login form.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// How a credential group gathers credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MechanismConfig {
    /// Username/password on the universal login form, checked against local
    /// accounts.
    Form {
        name: String,
        #[serde(default)]
        accounts: Vec<LocalAccount>,
    },
    /// Username asserted by a trusted front-end in a request header.
    Header { name: String, header: String },
}

impl MechanismConfig {
    pub fn name(&self) -> &str {
        match self {
            MechanismConfig::Form { name, .. } | MechanismConfig::Header { name, .. } => name,
        }
    }
}

/// A local account for the form mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAccount {
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
}

impl SecmgrConfig {
    /// Entity ID this IdP signs its messages as.
    pub fn entity_id(&self) -> &str {
        self.idp
            .entity_id
            .as_deref()
            .or(self.secmgr.public_url.as_deref())
            .unwrap_or("https://secmgr.local")
    }

    pub fn group(&self, name: &str) -> Option<&CredentialGroup> {
        self.credential_groups.iter().find(|g| g.name == name)
    }

    /// Enabled service provider with the given entity ID.
    pub fn service_provider(&self, entity_id: &str) -> Option<&ServiceProviderConfig> {
        self.service_providers
            .iter()
            .find(|sp| sp.enabled && sp.entity_id == entity_id)
    }

    /// Structural validation, returning an error for invalid combinations.
    ///
    /// This does not check the default-group invariant; that gate lives in
    /// [`crate::codec::ConfigCodec`].
    pub fn validate(&self) -> Result<()> {
        if self.secmgr.instance_name.is_empty() {
            return Err(SecmgrError::Config(
                "secmgr.instance_name must not be empty".into(),
            ));
        }

        if self.secmgr.public_url.is_none() {
            return Err(SecmgrError::Config(
                "secmgr.public_url is required".into(),
            ));
        }

        if self.idp.session_cookie_name.is_empty() {
            return Err(SecmgrError::Config(
                "idp.session_cookie_name must not be empty".into(),
            ));
        }

        if self.idp.max_sessions == 0 {
            return Err(SecmgrError::Config(
                "idp.max_sessions must be greater than zero".into(),
            ));
        }

        for header in &self.idp.understood_soap_headers {
            if !is_clark_name(header) {
                return Err(SecmgrError::Config(format!(
                    "idp.understood_soap_headers entry is not of the form {{namespace}}local: {header}"
                )));
            }
        }

        for sp in &self.service_providers {
            if sp.entity_id.is_empty() {
                return Err(SecmgrError::Config(
                    "service_providers.entity_id must not be empty".into(),
                ));
            }
            if sp.enabled && sp.acs_url.is_empty() {
                return Err(SecmgrError::Config(format!(
                    "service provider {} has no acs_url",
                    sp.entity_id
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.credential_groups {
            if group.name.is_empty() {
                return Err(SecmgrError::Config(
                    "credential_groups.name must not be empty".into(),
                ));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(SecmgrError::Config(format!(
                    "duplicate credential group: {}",
                    group.name
                )));
            }
            for mechanism in &group.mechanisms {
                if let MechanismConfig::Header { name, header } = mechanism {
                    if header.is_empty() {
                        return Err(SecmgrError::Config(format!(
                            "header mechanism {name} in group {} names no header",
                            group.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Generate a sensible default configuration.
    pub fn generate_default() -> Self {
        Self {
            secmgr: SecmgrSection {
                instance_name: "Search Appliance Security Manager".into(),
                public_url: Some("https://secmgr.example.com".into()),
            },
            idp: IdpConfig::default(),
            service_providers: vec![ServiceProviderConfig {
                entity_id: "https://gsa.example.com".into(),
                acs_url: "https://gsa.example.com/security-manager/samlassertionconsumer".into(),
                enabled: true,
            }],
            credential_groups: vec![CredentialGroup {
                name: DEFAULT_GROUP_NAME.into(),
                display_name: Some("Default".into()),
                optional: false,
                requires_username: true,
                requires_password: true,
                mechanisms: vec![MechanismConfig::Form {
                    name: "local".into(),
                    accounts: Vec::new(),
                }],
            }],
        }
    }
}

fn is_clark_name(name: &str) -> bool {
    match name.strip_prefix('{').and_then(|rest| rest.split_once('}')) {
        Some((ns, local)) => !ns.is_empty() && !local.is_empty(),
        None => !name.is_empty() && !name.contains(['{', '}']),
    }
}
