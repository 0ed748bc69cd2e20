//! Configuration loading via `ortho-config`.
//!
//! One [`ToolkitConfig`] is constructed at process start and passed by
//! reference into the node controller; nothing reads process-wide state
//! after that.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::provider::LaunchSpec;
use crate::remote::{DEFAULT_SSH_PORT, SshConfig};

fn default_instance_types() -> HashMap<String, String> {
    HashMap::from([
        (String::from("free"), String::from("t2.micro")),
        (String::from("gpu"), String::from("p2.xlarge")),
    ])
}

fn default_images() -> HashMap<String, String> {
    HashMap::from([
        (String::from("free"), String::from("ami-c51e3eb6")),
        (String::from("gpu"), String::from("ami-873e61e1")),
    ])
}

/// Toolkit configuration derived from configuration files, environment
/// variables, and defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SPOTDRIVE")]
pub struct ToolkitConfig {
    /// Instance type per tier label (for example `free`, `gpu`).
    #[ortho_config(skip_cli, default = default_instance_types())]
    pub instance_types: HashMap<String, String>,
    /// Machine image per tier label.
    #[ortho_config(skip_cli, default = default_images())]
    pub images: HashMap<String, String>,
    /// Ceiling bid for spot capacity.
    #[ortho_config(default = "0.25".to_owned())]
    pub spot_price: String,
    /// Remote user on the nodes.
    #[ortho_config(default = "ec2-user".to_owned())]
    pub ssh_user: String,
    /// Private key file for SSH; `None` lets the ssh client pick.
    pub ssh_key_file: Option<String>,
    /// Key pair name baked into new instances.
    #[ortho_config(default = "key".to_owned())]
    pub key_name: String,
    /// Security group new instances are placed in.
    #[ortho_config(default = "default".to_owned())]
    pub security_group: String,
    /// Provider region override; `None` uses the CLI's own default.
    pub region: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ToolkitConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to spotdrive.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments.
    /// Values merge defaults, configuration files, and environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("spotdrive")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Builds the launch parameters for a tier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTier`] when the tier is absent from
    /// either table, listing the tiers that are configured.
    pub fn launch_spec(
        &self,
        tier: &str,
        boot_size_gib: Option<u32>,
    ) -> Result<LaunchSpec, ConfigError> {
        self.validate()?;
        let instance_type = self
            .instance_types
            .get(tier)
            .ok_or_else(|| self.unknown_tier(tier))?;
        let image_id = self
            .images
            .get(tier)
            .ok_or_else(|| self.unknown_tier(tier))?;
        Ok(LaunchSpec {
            image_id: image_id.clone(),
            instance_type: instance_type.clone(),
            key_name: self.key_name.clone(),
            security_group: self.security_group.clone(),
            boot_size_gib,
        })
    }

    fn unknown_tier(&self, tier: &str) -> ConfigError {
        let mut known: Vec<String> = self
            .instance_types
            .keys()
            .filter(|key| self.images.contains_key(*key))
            .cloned()
            .collect();
        known.sort();
        ConfigError::UnknownTier {
            tier: tier.to_owned(),
            known,
        }
    }

    /// Connection settings for the remote command channel.
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            ssh_bin: String::from("ssh"),
            user: self.ssh_user.clone(),
            key_file: self.ssh_key_file.as_deref().map(Utf8PathBuf::from),
            port: DEFAULT_SSH_PORT,
        }
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is
    /// empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.spot_price,
            &FieldMetadata::new("spot price ceiling", "SPOTDRIVE_SPOT_PRICE", "spot_price"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("remote user", "SPOTDRIVE_SSH_USER", "ssh_user"),
        )?;
        Self::require_field(
            &self.key_name,
            &FieldMetadata::new("key pair name", "SPOTDRIVE_KEY_NAME", "key_name"),
        )?;
        Self::require_field(
            &self.security_group,
            &FieldMetadata::new(
                "security group",
                "SPOTDRIVE_SECURITY_GROUP",
                "security_group",
            ),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// The requested tier has no instance type or image configured.
    #[error("unknown tier {tier}; configured tiers: {known:?}")]
    UnknownTier {
        /// Tier label that failed to resolve.
        tier: String,
        /// Tiers present in both the type and image tables.
        known: Vec<String>,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> ToolkitConfig {
        ToolkitConfig {
            instance_types: default_instance_types(),
            images: default_images(),
            spot_price: String::from("0.25"),
            ssh_user: String::from("ec2-user"),
            ssh_key_file: Some(String::from("/home/me/.aws/key.pem")),
            key_name: String::from("key"),
            security_group: String::from("default"),
            region: None,
        }
    }

    #[rstest]
    fn launch_spec_resolves_tier_tables(config: ToolkitConfig) {
        let spec = config
            .launch_spec("gpu", Some(15))
            .expect("gpu tier is configured by default");
        assert_eq!(spec.instance_type, "p2.xlarge");
        assert_eq!(spec.image_id, "ami-873e61e1");
        assert_eq!(spec.boot_size_gib, Some(15));
    }

    #[rstest]
    fn launch_spec_rejects_unknown_tier_listing_known(config: ToolkitConfig) {
        let err = config
            .launch_spec("quantum", None)
            .expect_err("unknown tier must fail");
        assert_eq!(
            err,
            ConfigError::UnknownTier {
                tier: String::from("quantum"),
                known: vec![String::from("free"), String::from("gpu")],
            }
        );
    }

    #[rstest]
    fn validate_rejects_blank_spot_price_with_actionable_error(config: ToolkitConfig) {
        let broken = ToolkitConfig {
            spot_price: String::from("  "),
            ..config
        };
        let err = broken.validate().expect_err("blank spot price is invalid");
        let ConfigError::MissingField(ref message) = err else {
            panic!("expected MissingField, got {err}");
        };
        assert!(
            message.contains("SPOTDRIVE_SPOT_PRICE"),
            "error should mention env var: {message}"
        );
        assert!(
            message.contains("spotdrive.toml"),
            "error should mention config file: {message}"
        );
    }

    #[rstest]
    fn ssh_config_carries_user_and_key(config: ToolkitConfig) {
        let ssh = config.ssh_config();
        assert_eq!(ssh.user, "ec2-user");
        assert_eq!(
            ssh.key_file.as_ref().map(|key| key.as_str()),
            Some("/home/me/.aws/key.pem")
        );
    }
}
