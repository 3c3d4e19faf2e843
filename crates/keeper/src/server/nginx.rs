//! nginx: files on disk plus a reload

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use super::PushError;
use crate::acme::IssuedCertificate;
use crate::ocsp::OcspResponse;
use crate::store::CertificateStore;

/// Writes certificate and key files and reloads nginx when they changed.
///
/// OCSP responses are not accepted; nginx fetches and staples them itself.
#[derive(Debug)]
pub struct NginxAdapter {
    store: CertificateStore,
    reload: bool,
    reload_command: Vec<String>,
    changed: bool,
}

impl NginxAdapter {
    pub fn new(store: CertificateStore, reload: bool) -> Self {
        Self {
            store,
            reload,
            reload_command: vec!["nginx".into(), "-s".into(), "reload".into()],
            changed: false,
        }
    }

    /// Replace the reload command (program followed by its arguments).
    pub fn with_reload_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reload_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        self.changed
    }

    pub fn set_cert(&mut self, issued: &IssuedCertificate) -> Result<(), PushError> {
        self.store.save_certificate(issued)?;
        self.changed = true;
        Ok(())
    }

    /// Mark the stored files for the next reload.
    pub fn stage_stored(&mut self) -> Result<(), PushError> {
        if self.store.cert_path().exists() {
            self.changed = true;
        }
        Ok(())
    }

    pub fn set_ocsp(&mut self, _response: &OcspResponse) -> Result<(), PushError> {
        Err(PushError::Unsupported(
            "nginx does not take prepared OCSP responses".into(),
        ))
    }

    pub async fn update_server(&mut self) -> Result<(), PushError> {
        if !self.changed {
            debug!("No staged changes for nginx");
            return Ok(());
        }
        if !self.reload {
            info!(
                cert = %self.store.cert_path().display(),
                "nginx reload disabled, new certificate is picked up on the next reload"
            );
            self.changed = false;
            return Ok(());
        }

        let (program, args) = self
            .reload_command
            .split_first()
            .ok_or_else(|| PushError::Reload("empty reload command".into()))?;

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| PushError::Reload(format!("failed to run {}: {}", program, e)))?;
        if !status.success() {
            return Err(PushError::Reload(format!("{} exited with {}", program, status)));
        }

        info!("nginx reloaded");
        self.changed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocsp::parse_response;
    use crate::store::PEM_PRIVATE_KEY;
    use crate::test_support::{ocsp_response_der, self_signed_chain};
    use tempfile::TempDir;

    fn setup(reload: bool) -> (TempDir, NginxAdapter) {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::new(
            dir.path().join("site.crt"),
            Some(dir.path().join("site.key")),
        );
        (dir, NginxAdapter::new(store, reload))
    }

    fn issued() -> IssuedCertificate {
        let (chain, private_key) = self_signed_chain(&["example.org"], 90);
        IssuedCertificate { chain, private_key }
    }

    #[test]
    fn test_rejects_ocsp() {
        let (_dir, mut adapter) = setup(true);
        let response = parse_response(&ocsp_response_der(None)).unwrap();
        assert!(matches!(
            adapter.set_ocsp(&response).unwrap_err(),
            PushError::Unsupported(_)
        ));
        assert!(!adapter.has_changes());
    }

    #[test]
    fn test_split_files() {
        let (dir, mut adapter) = setup(false);
        adapter.set_cert(&issued()).unwrap();

        let cert = std::fs::read_to_string(dir.path().join("site.crt")).unwrap();
        let key = std::fs::read_to_string(dir.path().join("site.key")).unwrap();
        assert!(!cert.contains(PEM_PRIVATE_KEY));
        assert!(key.contains(PEM_PRIVATE_KEY));
        assert!(adapter.has_changes());
    }

    #[tokio::test]
    async fn test_reload_only_after_changes() {
        let (dir, adapter) = setup(true);
        let marker = dir.path().join("reloaded");
        let mut adapter = adapter.with_reload_command([
            "sh".to_string(),
            "-c".to_string(),
            format!("echo reload >> {}", marker.display()),
        ]);

        adapter.update_server().await.unwrap();
        assert!(!marker.exists());

        adapter.set_cert(&issued()).unwrap();
        adapter.update_server().await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "reload\n");
        assert!(!adapter.has_changes());
    }

    #[tokio::test]
    async fn test_stage_stored_reloads_again() {
        let (dir, adapter) = setup(true);
        let marker = dir.path().join("reloaded");
        let mut adapter = adapter.with_reload_command([
            "sh".to_string(),
            "-c".to_string(),
            format!("echo reload >> {}", marker.display()),
        ]);

        adapter.stage_stored().unwrap();
        assert!(!adapter.has_changes());

        adapter.set_cert(&issued()).unwrap();
        adapter.update_server().await.unwrap();
        adapter.stage_stored().unwrap();
        assert!(adapter.has_changes());
        adapter.update_server().await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "reload\nreload\n");
    }

    #[tokio::test]
    async fn test_reload_failure() {
        let (_dir, adapter) = setup(true);
        let mut adapter = adapter.with_reload_command(["sh", "-c", "exit 1"]);

        adapter.set_cert(&issued()).unwrap();
        assert!(matches!(
            adapter.update_server().await.unwrap_err(),
            PushError::Reload(_)
        ));
    }

    #[tokio::test]
    async fn test_reload_disabled() {
        let (_dir, adapter) = setup(false);
        let mut adapter = adapter.with_reload_command(["sh", "-c", "exit 1"]);

        adapter.set_cert(&issued()).unwrap();
        adapter.update_server().await.unwrap();
        assert!(!adapter.has_changes());
    }
}
