//! Per-target configuration schema.
//!
//! One YAML file describes one managed certificate: which names it covers,
//! where the ACME account lives, how often it is checked, where the
//! material is written and which server receives it afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Let's Encrypt production directory url
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory url
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Root configuration for one managed certificate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    /// Scheduling and renewal thresholds.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Certificate contents and ACME account settings.
    pub certificate: CertificateConfig,

    /// Server the renewed material is delivered to.
    pub mode: ServerMode,

    /// Where certificate, key and OCSP response are stored.
    pub files: FilesConfig,

    #[serde(default)]
    pub haproxy: HaProxyConfig,

    #[serde(default)]
    pub nginx: NginxConfig,

    #[serde(default)]
    pub deploy_hook: DeployHookConfig,
}

impl TargetConfig {
    /// Label used in log lines: the first configured domain name.
    pub fn name(&self) -> &str {
        self.certificate
            .dns_names
            .first()
            .map(String::as_str)
            .unwrap_or("<unnamed>")
    }
}

/// Scheduling and renewal thresholds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimingConfig {
    /// Minutes between runs; 0 runs once and exits.
    #[serde(default)]
    pub run_interval_minutes: u64,

    /// Renew the certificate when fewer than this many days of validity
    /// remain; 0 disables certificate renewal.
    #[serde(default)]
    pub renewal_due_cert: u32,

    /// Refresh the OCSP response when fewer than this many days remain
    /// until its NextUpdate; 0 disables OCSP refresh.
    #[serde(default)]
    pub renewal_due_ocsp: u32,
}

impl TimingConfig {
    /// Period between runs, `None` for a single run.
    pub fn run_interval(&self) -> Option<Duration> {
        (self.run_interval_minutes > 0).then(|| Duration::from_secs(self.run_interval_minutes * 60))
    }

    /// Certificate renewal threshold, `None` when disabled.
    pub fn cert_threshold(&self) -> Option<Duration> {
        days(self.renewal_due_cert)
    }

    /// OCSP refresh threshold, `None` when disabled.
    pub fn ocsp_threshold(&self) -> Option<Duration> {
        days(self.renewal_due_ocsp)
    }
}

fn days(count: u32) -> Option<Duration> {
    (count > 0).then(|| Duration::from_secs(u64::from(count) * 86_400))
}

/// Certificate contents and ACME account settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CertificateConfig {
    /// Names placed in the certificate (and validated via dns-01).
    pub dns_names: Vec<String>,

    /// `P256` or `P384`; unset means P384.
    #[serde(default)]
    pub elliptic_curve: Option<String>,

    /// Request the TLS feature (status_request) extension.
    #[serde(default)]
    pub must_staple: bool,

    /// ACME directory url of the CA.
    #[serde(default = "default_directory")]
    pub acme_directory: String,

    /// Account key file (PEM with a plaintext header).
    pub acme_account_file: PathBuf,

    /// Register a new account when the account file is missing.
    #[serde(default)]
    pub register_acme: bool,

    /// Agree to the CA's terms of service during registration.
    #[serde(default)]
    pub accept_acme_tos: bool,

    /// Contact mail addresses (without `mailto:`).
    #[serde(default)]
    pub acme_mail_contacts: Vec<String>,

    /// Upper bound for waiting on a single authorization; unset waits
    /// as long as the CA takes.
    #[serde(default)]
    pub authorization_timeout_secs: Option<u64>,

    /// Delay between polls of authorization and order state.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            dns_names: Vec::new(),
            elliptic_curve: None,
            must_staple: false,
            acme_directory: default_directory(),
            acme_account_file: PathBuf::new(),
            register_acme: false,
            accept_acme_tos: false,
            acme_mail_contacts: Vec::new(),
            authorization_timeout_secs: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl CertificateConfig {
    /// Resolve the configured curve.
    pub fn curve(&self) -> Result<EllipticCurve, ConfigError> {
        EllipticCurve::from_config(self.elliptic_curve.as_deref())
    }

    pub fn authorization_timeout(&self) -> Option<Duration> {
        self.authorization_timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_directory() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_poll_interval() -> u64 {
    2
}

/// Curve of the certificate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EllipticCurve {
    P256,
    #[default]
    P384,
}

impl EllipticCurve {
    /// Parse the configuration value; empty or missing selects P384.
    pub fn from_config(value: Option<&str>) -> Result<Self, ConfigError> {
        match value.map(str::trim) {
            None | Some("") | Some("P384") => Ok(Self::P384),
            Some("P256") => Ok(Self::P256),
            Some(other) => Err(ConfigError::Invalid(format!(
                "invalid elliptic curve '{}', possible values are P256 and P384",
                other
            ))),
        }
    }
}

/// Server the renewed material is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Live update over the haproxy runtime API socket.
    #[default]
    Haproxy,
    /// Split files plus `nginx -s reload`.
    Nginx,
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMode::Haproxy => f.write_str("haproxy"),
            ServerMode::Nginx => f.write_str("nginx"),
        }
    }
}

/// Where certificate, key and OCSP response are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilesConfig {
    /// Store chain and key together in `cert-file` (required by haproxy).
    #[serde(default)]
    pub single_file: bool,

    /// Certificate chain (leaf first); the OCSP response is written next
    /// to it with an `.ocsp` suffix.
    pub cert_file: PathBuf,

    /// Private key file when `single-file` is false.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl FilesConfig {
    /// Key path for split storage, `None` when the key is bundled.
    pub fn split_key_file(&self) -> Option<&Path> {
        if self.single_file {
            None
        } else {
            self.key_file.as_deref()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HaProxyConfig {
    /// Runtime API socket; leave unset to only write files.
    #[serde(default)]
    pub haproxy_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NginxConfig {
    /// Run `nginx -s reload` after new material was written.
    #[serde(default)]
    pub reload_nginx: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeployHookConfig {
    /// Executable run after every change; leave unset to disable.
    #[serde(default)]
    pub executable: Option<PathBuf>,
}
