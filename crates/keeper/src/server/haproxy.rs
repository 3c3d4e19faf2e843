//! haproxy runtime API over the admin unix socket
//!
//! Every command uses its own connection: the command is written, the write
//! half is closed and the reply is read until haproxy closes the socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, trace, warn};

use super::PushError;
use crate::acme::IssuedCertificate;
use crate::ocsp::OcspResponse;
use crate::store::{encode_pem_bundle, CertificateStore};

/// Upper bound for one command round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// One-shot command client for the haproxy admin socket.
#[derive(Debug, Clone)]
pub struct HaProxyClient {
    socket: PathBuf,
    timeout: Duration,
}

impl HaProxyClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one command and return the complete reply.
    pub async fn send(&self, command: &str) -> Result<String, PushError> {
        let socket_error = |source| PushError::Socket {
            path: self.socket.clone(),
            source,
        };

        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket).await.map_err(socket_error)?;
            stream.write_all(command.as_bytes()).await.map_err(socket_error)?;
            stream.shutdown().await.map_err(socket_error)?;

            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.map_err(socket_error)?;
            Ok::<_, PushError>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| PushError::Timeout {
                path: self.socket.clone(),
                timeout: self.timeout,
            })??;

        trace!(socket = %self.socket.display(), reply = %reply.trim_end(), "haproxy reply");
        Ok(reply)
    }

    /// Send `command`, requiring one of the `accepted` replies.
    async fn expect(&self, label: &str, command: &str, accepted: &[&str]) -> Result<(), PushError> {
        debug!(socket = %self.socket.display(), command = %label, "Sending haproxy command");
        let reply = self.send(command).await?;
        if accepted.contains(&reply.as_str()) {
            Ok(())
        } else {
            warn!(command = %label, reply = %reply.trim_end(), "Unexpected haproxy reply");
            Err(PushError::UnexpectedResponse {
                command: label.to_string(),
                response: reply,
            })
        }
    }

    /// Replace the certificate in a transaction, with an optional OCSP
    /// response, and commit it.
    pub async fn replace_certificate(
        &self,
        cert_file: &str,
        bundle: &str,
        ocsp: Option<&[u8]>,
    ) -> Result<(), PushError> {
        self.expect(
            &format!("abort ssl cert {}", cert_file),
            &format!("abort ssl cert {}\n", cert_file),
            &[
                &format!("Transaction aborted for certificate {}!\n\n", cert_file),
                "No ongoing transaction!\n\n",
            ],
        )
        .await?;

        self.expect(
            &format!("set ssl cert {}", cert_file),
            &format!("set ssl cert {} <<\n{}\n", cert_file, bundle),
            &[&format!("Transaction created for certificate {}!\n\n", cert_file)],
        )
        .await?;

        if let Some(der) = ocsp {
            self.expect(
                &format!("set ssl cert {}.ocsp", cert_file),
                &format!("set ssl cert {}.ocsp <<\n{}\n\n", cert_file, STANDARD.encode(der)),
                &[&format!("Transaction updated for certificate {}!\n\n", cert_file)],
            )
            .await?;
        }

        self.expect(
            &format!("commit ssl cert {}", cert_file),
            &format!("commit ssl cert {}\n", cert_file),
            &[&format!("Committing {}.\nSuccess!\n\n", cert_file)],
        )
        .await
    }

    /// Update the OCSP response of an unchanged certificate.
    pub async fn update_ocsp(&self, der: &[u8]) -> Result<(), PushError> {
        self.expect(
            "set ssl ocsp-response",
            &format!("set ssl ocsp-response <<\n{}\n\n", STANDARD.encode(der)),
            &["OCSP Response updated!\n\n"],
        )
        .await
    }
}

/// Stages material written to disk and hands it to a running haproxy.
#[derive(Debug)]
pub struct HaProxyAdapter {
    store: CertificateStore,
    client: Option<HaProxyClient>,
    staged_bundle: Option<String>,
    staged_ocsp: Option<Vec<u8>>,
}

impl HaProxyAdapter {
    pub fn new(store: CertificateStore, socket: Option<PathBuf>) -> Self {
        Self {
            store,
            client: socket.map(HaProxyClient::new),
            staged_bundle: None,
            staged_ocsp: None,
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        self.staged_bundle.is_some() || self.staged_ocsp.is_some()
    }

    pub fn set_cert(&mut self, issued: &IssuedCertificate) -> Result<(), PushError> {
        self.store.save_certificate(issued)?;
        self.staged_bundle = Some(encode_pem_bundle(&issued.chain, Some(&issued.private_key)));
        Ok(())
    }

    pub fn set_ocsp(&mut self, response: &OcspResponse) -> Result<(), PushError> {
        self.store.save_ocsp(&response.der)?;
        self.staged_ocsp = Some(response.der.clone());
        Ok(())
    }

    /// Stage the stored certificate and OCSP response, unless newer material
    /// is already staged.
    pub fn stage_stored(&mut self) -> Result<(), PushError> {
        if self.staged_bundle.is_none() {
            self.staged_bundle = self.store.load_bundle()?;
        }
        if self.staged_ocsp.is_none() {
            self.staged_ocsp = self.store.load_ocsp()?;
        }
        Ok(())
    }

    /// Push whatever was staged since the last update.
    pub async fn update_server(&mut self) -> Result<(), PushError> {
        if !self.has_changes() {
            debug!("No staged changes for haproxy");
            return Ok(());
        }
        let Some(client) = &self.client else {
            warn!(
                cert = %self.store.cert_path().display(),
                "No haproxy socket configured, skipping runtime update"
            );
            return Ok(());
        };

        let cert_file = self.store.cert_path().display().to_string();
        match &self.staged_bundle {
            Some(bundle) => {
                client
                    .replace_certificate(&cert_file, bundle, self.staged_ocsp.as_deref())
                    .await?;
                info!(
                    socket = %client.socket().display(),
                    cert = %cert_file,
                    with_ocsp = self.staged_ocsp.is_some(),
                    "Committed new certificate to haproxy"
                );
            }
            None => {
                if let Some(der) = &self.staged_ocsp {
                    client.update_ocsp(der).await?;
                    info!(socket = %client.socket().display(), "Updated OCSP response in haproxy");
                }
            }
        }

        self.staged_bundle = None;
        self.staged_ocsp = None;
        Ok(())
    }
}
