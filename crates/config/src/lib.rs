//! Configuration for certkeeper.
//!
//! Every managed certificate is described by its own YAML file. This crate
//! parses those files into [`TargetConfig`] values and validates them before
//! any renewal task starts.
//!
//! # Example
//!
//! ```yaml
//! timing:
//!   run-interval-minutes: 720
//!   renewal-due-cert: 14
//!   renewal-due-ocsp: 3
//! certificate:
//!   dns-names: [example.org, www.example.org]
//!   must-staple: true
//!   acme-account-file: /etc/certkeeper/account.pem
//!   register-acme: true
//!   accept-acme-tos: true
//!   acme-mail-contacts: [hostmaster@example.org]
//! mode: haproxy
//! files:
//!   single-file: true
//!   cert-file: /etc/haproxy/certs/example.org.pem
//! haproxy:
//!   haproxy-socket: /run/haproxy/admin.sock
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

mod target;
pub mod validate;

pub use target::{
    CertificateConfig, DeployHookConfig, EllipticCurve, FilesConfig, HaProxyConfig, NginxConfig,
    ServerMode, TargetConfig, TimingConfig, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
pub use validate::{ValidationError, ValidationResult, ValidationWarning};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration in {path:?}: {summary}")]
    Validation { path: PathBuf, summary: String },

    #[error("{0}")]
    Invalid(String),
}

impl TargetConfig {
    /// Parse a target from YAML text without validating it.
    pub fn from_yaml(path: &Path, content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read, parse and validate a target file.
    ///
    /// Warnings are logged, errors are returned as
    /// [`ConfigError::Validation`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml(path, &content)?;

        let mut result = validate::validate_target(&config);
        result.merge(validate::validate_paths(&config));
        result.merge(validate::lint_target(&config));

        for warning in &result.warnings {
            warn!(config = %path.display(), "{}", warning.message);
        }
        if !result.is_ok() {
            return Err(ConfigError::Validation {
                path: path.to_path_buf(),
                summary: result.error_summary(),
            });
        }

        debug!(
            config = %path.display(),
            target = %config.name(),
            mode = %config.mode,
            "Loaded target configuration"
        );
        Ok(config)
    }
}

/// Load every target file, failing on the first invalid one.
///
/// Two targets writing the same certificate file are rejected, since each
/// file must only ever be written by its own target's task.
pub fn load_targets<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<TargetConfig>, ConfigError> {
    let mut targets = Vec::with_capacity(paths.len());
    let mut owners: HashMap<PathBuf, PathBuf> = HashMap::new();

    for path in paths {
        let path = path.as_ref();
        let config = TargetConfig::from_file(path)?;

        if let Some(previous) = owners.insert(config.files.cert_file.clone(), path.to_path_buf()) {
            return Err(ConfigError::Invalid(format!(
                "cert-file {:?} is used by both {:?} and {:?}",
                config.files.cert_file, previous, path
            )));
        }
        targets.push(config);
    }

    Ok(targets)
}
