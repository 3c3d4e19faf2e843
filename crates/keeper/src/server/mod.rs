//! Delivery of renewed material to the serving process
//!
//! A target's `mode` selects exactly one [`ServerAdapter`]. Each run gets a
//! fresh adapter: `set_cert` / `set_ocsp` persist the material through the
//! [`CertificateStore`] and stage it, `update_server` hands whatever was
//! staged to the server.

mod haproxy;
mod nginx;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use certkeeper_config::{ServerMode, TargetConfig};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::acme::IssuedCertificate;
use crate::ocsp::OcspResponse;
use crate::store::{CertificateStore, StoreError};

pub use haproxy::{HaProxyAdapter, HaProxyClient};
pub use nginx::NginxAdapter;

/// Push adapter errors
#[derive(Debug, Error)]
pub enum PushError {
    #[error("haproxy socket {path:?}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("haproxy socket {path:?} did not answer within {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("unexpected haproxy response to '{command}': {response:?}")]
    UnexpectedResponse { command: String, response: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("nginx reload failed: {0}")]
    Reload(String),

    #[error("deploy hook {path:?} failed: {reason}")]
    DeployHook { path: PathBuf, reason: String },
}

/// What a server wants renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub certificate: bool,
    pub ocsp: bool,
}

#[derive(Debug)]
pub enum ServerAdapter {
    HaProxy(HaProxyAdapter),
    Nginx(NginxAdapter),
}

impl ServerAdapter {
    pub fn for_target(target: &TargetConfig) -> Result<Self, PushError> {
        let store = CertificateStore::for_target(&target.files);
        match target.mode {
            ServerMode::Haproxy => {
                if !target.files.single_file {
                    return Err(PushError::Unsupported(
                        "haproxy needs certificate and key in a single file".into(),
                    ));
                }
                Ok(Self::HaProxy(HaProxyAdapter::new(
                    store,
                    target.haproxy.haproxy_socket.clone(),
                )))
            }
            ServerMode::Nginx => Ok(Self::Nginx(NginxAdapter::new(
                store,
                target.nginx.reload_nginx,
            ))),
        }
    }

    pub fn requirements(&self) -> Requirements {
        match self {
            Self::HaProxy(_) => Requirements {
                certificate: true,
                ocsp: true,
            },
            Self::Nginx(_) => Requirements {
                certificate: true,
                ocsp: false,
            },
        }
    }

    pub fn store(&self) -> &CertificateStore {
        match self {
            Self::HaProxy(a) => a.store(),
            Self::Nginx(a) => a.store(),
        }
    }

    pub fn has_changes(&self) -> bool {
        match self {
            Self::HaProxy(a) => a.has_changes(),
            Self::Nginx(a) => a.has_changes(),
        }
    }

    pub fn set_cert(&mut self, issued: &IssuedCertificate) -> Result<(), PushError> {
        match self {
            Self::HaProxy(a) => a.set_cert(issued),
            Self::Nginx(a) => a.set_cert(issued),
        }
    }

    pub fn set_ocsp(&mut self, response: &OcspResponse) -> Result<(), PushError> {
        match self {
            Self::HaProxy(a) => a.set_ocsp(response),
            Self::Nginx(a) => a.set_ocsp(response),
        }
    }

    /// Stage what is on disk so the next `update_server` delivers it again.
    pub fn stage_stored(&mut self) -> Result<(), PushError> {
        match self {
            Self::HaProxy(a) => a.stage_stored(),
            Self::Nginx(a) => a.stage_stored(),
        }
    }

    pub async fn update_server(&mut self) -> Result<(), PushError> {
        match self {
            Self::HaProxy(a) => a.update_server().await,
            Self::Nginx(a) => a.update_server().await,
        }
    }
}

/// Run the deploy hook without arguments and wait for it.
pub async fn run_deploy_hook(executable: &Path) -> Result<(), PushError> {
    debug!(hook = %executable.display(), "Running deploy hook");
    let status = Command::new(executable)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| PushError::DeployHook {
            path: executable.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !status.success() {
        return Err(PushError::DeployHook {
            path: executable.to_path_buf(),
            reason: format!("exited with {}", status),
        });
    }
    info!(hook = %executable.display(), "Deploy hook finished");
    Ok(())
}
