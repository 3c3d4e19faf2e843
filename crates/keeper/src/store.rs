//! Certificate store
//!
//! Persists the material of one target: the PEM certificate chain (with the
//! key appended, or in its own file), and the DER OCSP response next to it
//! as `<cert-file>.ocsp`.
//!
//! Files are never rewritten in place. New content goes to a temporary file
//! in the same directory, the previous file is kept as the next free
//! numbered backup (`site.pem` becomes `site-0.pem`, `site-1.pem`, ...) and
//! the temporary file is renamed over the original.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use certkeeper_config::FilesConfig;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::acme::IssuedCertificate;
use crate::ocsp;

pub const PEM_CERTIFICATE: &str = "CERTIFICATE";
pub const PEM_PRIVATE_KEY: &str = "PRIVATE KEY";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM in {path:?}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::PemError,
    },

    #[error("invalid certificate in {path:?}: {reason}")]
    X509 { path: PathBuf, reason: String },

    #[error("no {kind} block found in {path:?}")]
    MissingBlock { path: PathBuf, kind: &'static str },

    #[error("invalid OCSP response in {path:?}: {reason}")]
    Ocsp { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Files of one target.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    cert_path: PathBuf,
    /// Separate key file; `None` stores the key after the chain.
    key_path: Option<PathBuf>,
}

impl CertificateStore {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: Option<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path,
        }
    }

    pub fn for_target(files: &FilesConfig) -> Self {
        Self::new(
            files.cert_file.clone(),
            files.split_key_file().map(Path::to_path_buf),
        )
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    pub fn ocsp_path(&self) -> PathBuf {
        let mut path = self.cert_path.clone().into_os_string();
        path.push(".ocsp");
        PathBuf::from(path)
    }

    /// Load the stored chain (DER, leaf first), `None` if there is no file.
    pub fn load_chain(&self) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        let content = match fs::read(&self.cert_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %self.cert_path.display(), "No stored certificate");
                return Ok(None);
            }
            Err(e) => return Err(StoreError::io(&self.cert_path, e)),
        };

        let chain = decode_blocks(&self.cert_path, &content, PEM_CERTIFICATE)?;
        if chain.is_empty() {
            return Err(StoreError::MissingBlock {
                path: self.cert_path.clone(),
                kind: PEM_CERTIFICATE,
            });
        }
        Ok(Some(chain))
    }

    /// Stored chain and key re-encoded as one PEM bundle, `None` if there is
    /// no certificate file.
    pub fn load_bundle(&self) -> Result<Option<String>, StoreError> {
        let Some(chain) = self.load_chain()? else {
            return Ok(None);
        };

        let key_path = self.key_path.as_deref().unwrap_or(&self.cert_path);
        let content = fs::read(key_path).map_err(|e| StoreError::io(key_path, e))?;
        let key = decode_blocks(key_path, &content, PEM_PRIVATE_KEY)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::MissingBlock {
                path: key_path.to_path_buf(),
                kind: PEM_PRIVATE_KEY,
            })?;
        Ok(Some(encode_pem_bundle(&chain, Some(&key))))
    }

    /// NotAfter of the stored leaf certificate.
    pub fn cert_not_after(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(chain) = self.load_chain()? else {
            return Ok(None);
        };

        let (_, leaf) = x509_parser::parse_x509_certificate(&chain[0]).map_err(|e| {
            StoreError::X509 {
                path: self.cert_path.clone(),
                reason: e.to_string(),
            }
        })?;
        let not_after = leaf.validity().not_after.timestamp();
        let not_after = DateTime::from_timestamp(not_after, 0).ok_or_else(|| StoreError::X509 {
            path: self.cert_path.clone(),
            reason: format!("notAfter out of range: {}", not_after),
        })?;
        Ok(Some(not_after))
    }

    /// Remaining validity of the stored certificate.
    ///
    /// `None` when there is no usable certificate: missing, unreadable or
    /// already expired.
    pub fn remaining_cert_validity(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.cert_not_after() {
            Ok(Some(not_after)) => remaining(now, not_after),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Stored certificate is unusable");
                None
            }
        }
    }

    pub fn load_ocsp(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.ocsp_path();
        match fs::read(&path) {
            Ok(der) => Ok(Some(der)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Time until the stored OCSP response's NextUpdate.
    ///
    /// `None` when there is no usable response: missing, unparsable,
    /// without NextUpdate or already stale.
    pub fn remaining_ocsp_validity(&self, now: DateTime<Utc>) -> Option<Duration> {
        let path = self.ocsp_path();
        let der = match self.load_ocsp() {
            Ok(Some(der)) => der,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Stored OCSP response is unreadable");
                return None;
            }
        };

        match ocsp::parse_response(&der) {
            Ok(response) => response.next_update.and_then(|next| remaining(now, next)),
            Err(e) => {
                let e = StoreError::Ocsp {
                    path,
                    reason: e.to_string(),
                };
                warn!(error = %e, "Stored OCSP response is unusable");
                None
            }
        }
    }

    /// Persist freshly issued material.
    pub fn save_certificate(&self, issued: &IssuedCertificate) -> Result<(), StoreError> {
        match &self.key_path {
            None => {
                let bundle = encode_pem_bundle(&issued.chain, Some(&issued.private_key));
                write_rotated(&self.cert_path, bundle.as_bytes())?;
            }
            Some(key_path) => {
                let chain = encode_pem_bundle(&issued.chain, None);
                let key = encode_pem_bundle(&[], Some(&issued.private_key));
                let staged_chain = StagedFile::new(&self.cert_path, chain.as_bytes())?;
                let staged_key = StagedFile::new(key_path, key.as_bytes())?;

                let chain_backup = staged_chain.commit()?;
                if let Err(e) = staged_key.commit() {
                    self.restore(&self.cert_path, chain_backup);
                    return Err(e);
                }
            }
        }

        info!(
            path = %self.cert_path.display(),
            chain_len = issued.chain.len(),
            "Saved certificate"
        );
        Ok(())
    }

    /// Put the previous file back after a partial write, best effort.
    fn restore(&self, path: &Path, backup: Option<PathBuf>) {
        let restored = match &backup {
            Some(backup) => fs::rename(backup, path),
            None => fs::remove_file(path),
        };
        match restored {
            Ok(()) => warn!(path = %path.display(), "Rolled back partially written certificate"),
            Err(e) => error!(
                path = %path.display(),
                backup = ?backup,
                error = %e,
                "Failed to roll back certificate, key and certificate may not match"
            ),
        }
    }

    pub fn save_ocsp(&self, der: &[u8]) -> Result<(), StoreError> {
        let path = self.ocsp_path();
        write_rotated(&path, der)?;
        info!(path = %path.display(), "Saved OCSP response");
        Ok(())
    }

    /// Move a stored OCSP response out of the way.
    ///
    /// Used when a new certificate was stored but no matching response could
    /// be fetched, so the old response is not served for the new leaf.
    pub fn discard_ocsp(&self) -> Result<(), StoreError> {
        let path = self.ocsp_path();
        if !path.exists() {
            return Ok(());
        }
        let backup = next_backup_path(&path);
        fs::rename(&path, &backup).map_err(|e| StoreError::io(&path, e))?;
        info!(
            path = %path.display(),
            backup = %backup.display(),
            "Discarded stale OCSP response"
        );
        Ok(())
    }
}

fn remaining(now: DateTime<Utc>, until: DateTime<Utc>) -> Option<Duration> {
    (until - now).to_std().ok().filter(|d| !d.is_zero())
}

fn decode_blocks(path: &Path, content: &[u8], tag: &str) -> Result<Vec<Vec<u8>>, StoreError> {
    let blocks = pem::parse_many(content).map_err(|source| StoreError::Pem {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == tag)
        .map(pem::Pem::into_contents)
        .collect())
}

/// Encode a chain (leaf first) and optionally a PKCS#8 key as PEM.
pub fn encode_pem_bundle(chain: &[Vec<u8>], private_key: Option<&[u8]>) -> String {
    let mut blocks: Vec<pem::Pem> = chain
        .iter()
        .map(|der| pem::Pem::new(PEM_CERTIFICATE, der.clone()))
        .collect();
    if let Some(key) = private_key {
        blocks.push(pem::Pem::new(PEM_PRIVATE_KEY, key.to_vec()));
    }
    pem::encode_many_config(
        &blocks,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// First `name-N.ext` next to `path` that does not exist yet.
pub fn next_backup_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = match file_name.rfind('.') {
        Some(offset) if offset > 0 => file_name.split_at(offset),
        _ => (file_name.as_str(), ""),
    };

    (0u64..)
        .map(|i| path.with_file_name(format!("{}-{}{}", stem, i, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.with_file_name(format!("{}-backup{}", stem, ext)))
}

/// Replace `path` with `contents`, keeping the previous file as a backup.
///
/// Returns the backup path if there was a previous file. The new file is
/// created with mode 0600.
pub fn write_rotated(path: &Path, contents: &[u8]) -> Result<Option<PathBuf>, StoreError> {
    StagedFile::new(path, contents)?.commit()
}

/// New contents written and synced next to their destination, not yet in
/// place. Dropping it removes the temporary file.
struct StagedFile {
    path: PathBuf,
    temp: tempfile::NamedTempFile,
}

impl StagedFile {
    fn new(path: &Path, contents: &[u8]) -> Result<Self, StoreError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        temp.write_all(contents)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| StoreError::io(temp.path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::io(temp.path(), e))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            temp,
        })
    }

    /// Keep the current file as a numbered backup and move the new one in.
    fn commit(self) -> Result<Option<PathBuf>, StoreError> {
        let path = self.path;
        let backup = if path.exists() {
            let backup = next_backup_path(&path);
            if fs::hard_link(&path, &backup).is_err() {
                fs::copy(&path, &backup).map_err(|e| StoreError::io(&backup, e))?;
            }
            debug!(
                path = %path.display(),
                backup = %backup.display(),
                "Kept previous file as backup"
            );
            Some(backup)
        } else {
            None
        };

        self.temp
            .persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;

        Ok(backup)
    }
}
