//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{Backoff, RetryPolicy};
use crate::gc::GcSettings;
use crate::reconcile::ReconcilerSettings;

const CONFIG_FILE_NAME: &str = "replica-controller.toml";

/// Controller tunables merged from defaults, `replica-controller.toml`,
/// and `REPLICA_*` environment variables.
#[derive(Clone, Debug, Deserialize, Serialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "REPLICA",
    discovery(
        app_name = "replica-controller",
        env_var = "REPLICA_CONFIG_PATH",
        config_file_name = "replica-controller.toml",
        dotfile_name = ".replica-controller.toml",
        project_file_name = "replica-controller.toml"
    )
)]
pub struct ControllerConfig {
    /// Seconds between a primary leaving and its replicas being detached.
    #[ortho_config(default = 120)]
    pub gc_delay_secs: u64,
    /// Seconds before a transiently failed attachment is looked at again.
    #[ortho_config(default = 30)]
    pub failed_attachment_retry_secs: u64,
    /// Attempts for a write that keeps hitting version conflicts.
    #[ortho_config(default = 5)]
    pub conflict_retry_attempts: u32,
    /// First conflict backoff in milliseconds; doubles per attempt.
    #[ortho_config(default = 50)]
    pub conflict_retry_base_ms: u64,
    /// Upper bound for every backoff, in seconds.
    #[ortho_config(default = 300)]
    pub backoff_max_secs: u64,
    /// Attempts for a failed garbage-collection run.
    #[ortho_config(default = 3)]
    pub gc_retry_attempts: u32,
    /// Name written into the detach-request annotation.
    #[ortho_config(default = "replica-controller".to_owned())]
    pub controller_name: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn complaint(&self, problem: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "{} {problem}: set {} or {} in {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl ControllerConfig {
    /// Loads configuration from files and the environment without parsing
    /// CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("replica-controller")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that control the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_positive(
            self.gc_delay_secs,
            &FieldMetadata::new("GC delay", "REPLICA_GC_DELAY_SECS", "gc_delay_secs"),
        )?;
        Self::require_positive(
            self.failed_attachment_retry_secs,
            &FieldMetadata::new(
                "failed attachment retry interval",
                "REPLICA_FAILED_ATTACHMENT_RETRY_SECS",
                "failed_attachment_retry_secs",
            ),
        )?;
        Self::require_positive(
            u64::from(self.conflict_retry_attempts),
            &FieldMetadata::new(
                "conflict retry attempts",
                "REPLICA_CONFLICT_RETRY_ATTEMPTS",
                "conflict_retry_attempts",
            ),
        )?;
        Self::require_positive(
            u64::from(self.gc_retry_attempts),
            &FieldMetadata::new(
                "GC retry attempts",
                "REPLICA_GC_RETRY_ATTEMPTS",
                "gc_retry_attempts",
            ),
        )?;
        let backoff_max = FieldMetadata::new(
            "backoff ceiling",
            "REPLICA_BACKOFF_MAX_SECS",
            "backoff_max_secs",
        );
        Self::require_positive(self.backoff_max_secs, &backoff_max)?;
        if Duration::from_millis(self.conflict_retry_base_ms)
            > Duration::from_secs(self.backoff_max_secs)
        {
            return Err(backoff_max.complaint("must not be below conflict_retry_base_ms"));
        }
        if self.controller_name.trim().is_empty() {
            return Err(FieldMetadata::new(
                "controller name",
                "REPLICA_CONTROLLER_NAME",
                "controller_name",
            )
            .complaint("must not be empty"));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.complaint("must be greater than zero"));
        }
        Ok(())
    }

    /// Backoff used for conflict retries and the runner.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.conflict_retry_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    /// Reconciler settings derived from this configuration.
    #[must_use]
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        let conflict_retry = RetryPolicy::new(self.conflict_retry_attempts, self.backoff());
        ReconcilerSettings {
            gc_delay: Duration::from_secs(self.gc_delay_secs),
            failed_attachment_retry: Duration::from_secs(self.failed_attachment_retry_secs),
            conflict_retry,
            gc: GcSettings {
                annotation_value: self.controller_name.trim().to_owned(),
                conflict_retry,
                run_retry: RetryPolicy::new(self.gc_retry_attempts, self.backoff()),
            },
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
