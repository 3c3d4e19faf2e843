//! ACME error types

use std::path::PathBuf;
use std::time::Duration;

use certkeeper_config::ConfigError;
use thiserror::Error;

use crate::dns::DnsError;
use crate::store::StoreError;

/// Errors of the issuance dialogue and account maintenance
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("account error: {0}")]
    Account(String),

    #[error("CA knows no account for this key: {0}")]
    AccountNotFound(String),

    #[error("account file {path:?} is unusable: {reason}")]
    AccountFile { path: PathBuf, reason: String },

    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("CA offered no dns-01 challenge for {0}")]
    NoDnsChallenge(String),

    #[error("authorization for {domain} ended as {status}")]
    AuthorizationFailed { domain: String, status: String },

    #[error("authorization for {domain} not resolved within {timeout:?}")]
    AuthorizationTimeout { domain: String, timeout: Duration },

    #[error("order ended as {0}")]
    OrderFailed(String),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("key generation failed: {0}")]
    Key(String),

    #[error("CSR generation failed: {0}")]
    Csr(String),
}

impl From<ConfigError> for AcmeError {
    fn from(e: ConfigError) -> Self {
        AcmeError::Config(e.to_string())
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for AcmeError {
    fn from(e: reqwest::Error) -> Self {
        AcmeError::Http(e.to_string())
    }
}

impl From<rcgen::Error> for AcmeError {
    fn from(e: rcgen::Error) -> Self {
        AcmeError::Csr(e.to_string())
    }
}
