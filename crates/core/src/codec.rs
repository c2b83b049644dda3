//! Configuration encoding and decoding behind a validity gate.
//!
//! Every configuration that leaves [`ConfigCodec::decode`] or enters
//! [`ConfigCodec::encode`] passes the same check: it must have a non-optional,
//! non-empty credential group named `default` that requires a username, so
//! that every assertion the IdP issues carries a username usable in ACLs.
//!
//! [`ValidityPolicy::Permissive`] switches the check off. Requiring a username
//! in the default group rules out deployments with a single form mechanism
//! that never asks for one, and there is no way yet to keep identity
//! assignment stable without that requirement; operators who need such a
//! deployment opt out explicitly and get a warning on every pass.

use std::path::Path;

use tracing::warn;

use crate::config::{SecmgrConfig, DEFAULT_GROUP_NAME};
use crate::error::{Result, SecmgrError};

/// Whether the default-group invariant is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidityPolicy {
    #[default]
    Strict,
    /// Let invalid configurations through, logging each one.
    Permissive,
}

/// Reads and writes [`SecmgrConfig`] as TOML.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigCodec {
    policy: ValidityPolicy,
}

impl ConfigCodec {
    pub fn new(policy: ValidityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ValidityPolicy {
        self.policy
    }

    /// Decode a configuration from TOML text.
    pub fn decode(&self, text: &str) -> Result<SecmgrConfig> {
        let config: SecmgrConfig = toml::from_str(text)
            .map_err(|e| SecmgrError::Config(format!("failed to parse config: {e}")))?;
        self.guarantee_valid_config(&config)?;
        Ok(config)
    }

    /// Encode a configuration as TOML text.
    pub fn encode(&self, config: &SecmgrConfig) -> Result<String> {
        self.guarantee_valid_config(config)?;
        toml::to_string_pretty(config)
            .map_err(|e| SecmgrError::Serialization(format!("failed to encode config: {e}")))
    }

    /// Read and decode a configuration file.
    pub fn read_file(&self, path: &Path) -> Result<SecmgrConfig> {
        let content = std::fs::read_to_string(path)?;
        self.decode(&content)
    }

    /// Encode a configuration and write it to `path`.
    pub fn write_file(&self, path: &Path, config: &SecmgrConfig) -> Result<()> {
        let text = self.encode(config)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn guarantee_valid_config(&self, config: &SecmgrConfig) -> Result<()> {
        let Some(problem) = default_group_violation(config) else {
            return Ok(());
        };
        match self.policy {
            ValidityPolicy::Strict => Err(SecmgrError::InvalidConfig(problem)),
            ValidityPolicy::Permissive => {
                warn!(
                    instance = %config.secmgr.instance_name,
                    %problem,
                    "accepting configuration that violates the default group invariant"
                );
                Ok(())
            }
        }
    }
}

/// Describe how `config` breaks the default-group invariant, if it does.
pub fn default_group_violation(config: &SecmgrConfig) -> Option<String> {
    let Some(group) = config.group(DEFAULT_GROUP_NAME) else {
        return Some(format!("no credential group named \"{DEFAULT_GROUP_NAME}\""));
    };
    if group.optional {
        return Some(format!("credential group \"{DEFAULT_GROUP_NAME}\" is optional"));
    }
    if group.mechanisms.is_empty() {
        return Some(format!(
            "credential group \"{DEFAULT_GROUP_NAME}\" has no mechanisms"
        ));
    }
    if !group.requires_username {
        return Some(format!(
            "credential group \"{DEFAULT_GROUP_NAME}\" does not require a username"
        ));
    }
    None
}
