//! Issuance dialogue for one target

use std::sync::Arc;
use std::time::{Duration, Instant};

use certkeeper_config::{CertificateConfig, TargetConfig};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::account::{mailto_contacts, same_contacts, AccountInfo, AccountKey, AccountStatus, StoredAccount};
use super::csr;
use super::error::AcmeError;
use super::provider::{AccountSession, AcmeProvider, AuthorizationStatus, OrderSession};
use crate::dns::DnsResponder;

/// Freshly issued certificate material.
#[derive(Clone)]
pub struct IssuedCertificate {
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// PKCS#8 DER private key of the leaf.
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Authorization waiting for its dns-01 challenge to be validated.
struct PendingAuthorization {
    url: String,
    identifier: String,
    challenge_url: String,
}

/// Drives account login, order, dns-01 validation and finalization.
///
/// The orchestrator stores no certificate material itself; the account file
/// is the only thing it writes.
pub struct AcmeOrchestrator {
    provider: Arc<dyn AcmeProvider>,
    responder: DnsResponder,
}

impl AcmeOrchestrator {
    pub fn new(provider: Arc<dyn AcmeProvider>, responder: DnsResponder) -> Self {
        Self { provider, responder }
    }

    /// Run the full dialogue and return the new key and chain.
    pub async fn request_certificate(&self, target: &TargetConfig) -> Result<IssuedCertificate, AcmeError> {
        let config = &target.certificate;
        let curve = config.curve()?;
        let start = Instant::now();

        let account = self.login_or_register(config).await?;

        info!(names = ?config.dns_names, "Placing ACME order");
        let mut order = self.provider.new_order(&account, &config.dns_names).await?;

        let mut pending = Vec::new();
        let mut records = Vec::new();
        for url in order.authorization_urls() {
            let authorization = order.authorization(&url).await?;
            if authorization.status == AuthorizationStatus::Valid {
                debug!(domain = %authorization.identifier, "Authorization already valid");
                continue;
            }

            let challenge = authorization
                .dns_challenge()
                .ok_or_else(|| AcmeError::NoDnsChallenge(authorization.identifier.clone()))?;
            records.push(account.key.dns_value(&challenge.token));
            pending.push(PendingAuthorization {
                challenge_url: challenge.url.clone(),
                identifier: authorization.identifier,
                url,
            });
        }

        if !pending.is_empty() {
            self.validate(order.as_mut(), &pending, records, config).await?;
        }

        let key = csr::generate_key(curve)?;
        let csr_der = csr::build_csr(&config.dns_names, &key, config.must_staple)?;
        let private_key = key.serialize_der();
        drop(key);
        debug!(curve = ?curve, must_staple = config.must_staple, "Finalizing order");
        let chain = order.finalize(&csr_der, config.poll_interval()).await?;

        info!(
            names = ?config.dns_names,
            chain_len = chain.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate issued"
        );

        Ok(IssuedCertificate { chain, private_key })
    }

    /// Host the challenge values and wait for every pending authorization.
    ///
    /// The responder is stopped before returning, whatever the outcome.
    async fn validate(
        &self,
        order: &mut dyn OrderSession,
        pending: &[PendingAuthorization],
        records: Vec<String>,
        config: &CertificateConfig,
    ) -> Result<(), AcmeError> {
        let handle = self.responder.start(records).await?;
        let result = Self::await_authorizations(order, pending, config).await;
        handle.stop().await;
        result
    }

    async fn await_authorizations(
        order: &mut dyn OrderSession,
        pending: &[PendingAuthorization],
        config: &CertificateConfig,
    ) -> Result<(), AcmeError> {
        for authorization in pending {
            debug!(domain = %authorization.identifier, "Accepting dns-01 challenge");
            order.set_challenge_ready(&authorization.challenge_url).await?;
        }

        let poll = config.poll_interval();
        for authorization in pending {
            let status = match config.authorization_timeout() {
                Some(timeout) => tokio::time::timeout(timeout, wait_terminal(order, authorization, poll))
                    .await
                    .map_err(|_| AcmeError::AuthorizationTimeout {
                        domain: authorization.identifier.clone(),
                        timeout,
                    })??,
                None => wait_terminal(order, authorization, poll).await?,
            };

            if status != AuthorizationStatus::Valid {
                warn!(domain = %authorization.identifier, status = %status, "Authorization failed");
                return Err(AcmeError::AuthorizationFailed {
                    domain: authorization.identifier.clone(),
                    status: status.to_string(),
                });
            }
            info!(domain = %authorization.identifier, "Authorization valid");
        }
        Ok(())
    }

    /// Log in with the account file. A new account is registered only when
    /// registration is enabled and there is no account to log in with: the
    /// file is missing or unusable, or the CA does not know its key. Other
    /// failures (CA unreachable, rejected requests, account not valid) end
    /// the run with the account file left alone.
    async fn login_or_register(&self, config: &CertificateConfig) -> Result<AccountSession, AcmeError> {
        match self.login(config).await {
            Ok((stored, info)) => Ok(AccountSession {
                directory: config.acme_directory.clone(),
                uri: info.uri,
                key: stored.key,
            }),
            Err(e @ (AcmeError::AccountFile { .. } | AcmeError::AccountNotFound(_))) if config.register_acme => {
                warn!(error = %e, "ACME login failed, registering a new account");
                let stored = self.register(config, config.accept_acme_tos).await?;
                Ok(AccountSession {
                    directory: config.acme_directory.clone(),
                    uri: stored.uri,
                    key: stored.key,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn login(&self, config: &CertificateConfig) -> Result<(StoredAccount, AccountInfo), AcmeError> {
        let stored = StoredAccount::load(&config.acme_account_file)?;
        let info = self
            .provider
            .find_account(&config.acme_directory, &stored.key)
            .await?;

        if info.status != AccountStatus::Valid {
            warn!(account = %info.uri, status = %info.status, "ACME login failed");
            return Err(AcmeError::Account(format!(
                "account {} has status {}",
                info.uri, info.status
            )));
        }

        info!(account = %info.uri, "Logged in to ACME account");
        Ok((stored, info))
    }

    async fn register(&self, config: &CertificateConfig, accept_tos: bool) -> Result<StoredAccount, AcmeError> {
        info!(directory = %config.acme_directory, "Registering ACME account");

        let key = AccountKey::generate()?;
        let contacts = mailto_contacts(&config.acme_mail_contacts);
        let info = self
            .provider
            .register_account(&config.acme_directory, &key, &contacts, accept_tos)
            .await?;

        if info.status == AccountStatus::Valid {
            info!(account = %info.uri, tos = ?info.terms_of_service, "Registered ACME account");
        } else {
            warn!(account = %info.uri, status = %info.status, "Registered account is not valid");
        }

        let stored = StoredAccount {
            uri: info.uri,
            terms_of_service: info.terms_of_service,
            contacts,
            key,
        };
        stored.save(&config.acme_account_file)?;
        Ok(stored)
    }

    /// Register a new account and write the account file.
    pub async fn register_account(&self, config: &CertificateConfig, accept_tos: bool) -> Result<String, AcmeError> {
        Ok(self.register(config, accept_tos).await?.uri)
    }

    /// Log in and report the account as the CA sees it.
    pub async fn test_account(&self, config: &CertificateConfig) -> Result<AccountInfo, AcmeError> {
        let (_, info) = self.login(config).await?;
        info!(
            account = %info.uri,
            status = %info.status,
            contacts = ?info.contacts,
            "ACME account"
        );
        Ok(info)
    }

    /// Replace the account's contacts with the configured ones.
    ///
    /// Returns `false` without contacting the CA again when they already
    /// match.
    pub async fn update_contacts(&self, config: &CertificateConfig) -> Result<bool, AcmeError> {
        let (mut stored, info) = self.login(config).await?;
        let contacts = mailto_contacts(&config.acme_mail_contacts);

        if same_contacts(&info.contacts, &contacts) {
            info!(account = %info.uri, "Contact addresses unchanged");
            return Ok(false);
        }

        info!(account = %info.uri, old = ?info.contacts, new = ?contacts, "Updating contact addresses");
        let updated = self
            .provider
            .update_contacts(&config.acme_directory, &stored.key, &info.uri, &contacts)
            .await?;

        stored.uri = updated.uri;
        stored.contacts = updated.contacts;
        stored.save(&config.acme_account_file)?;
        Ok(true)
    }
}

async fn wait_terminal(
    order: &mut dyn OrderSession,
    authorization: &PendingAuthorization,
    poll: Duration,
) -> Result<AuthorizationStatus, AcmeError> {
    loop {
        let status = order.authorization(&authorization.url).await?.status;
        if status.is_terminal() {
            return Ok(status);
        }
        debug!(domain = %authorization.identifier, "Authorization pending");
        sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{haproxy_target, MockCa};
    use std::sync::atomic::Ordering;

    fn orchestrator(ca: &Arc<MockCa>) -> AcmeOrchestrator {
        AcmeOrchestrator::new(ca.clone(), ca.responder.clone())
    }

    #[tokio::test]
    async fn test_invalid_curve_fails_before_any_ca_call() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let mut target = haproxy_target(dir.path());
        target.certificate.elliptic_curve = Some("P521".into());

        let err = orchestrator(&ca).request_certificate(&target).await.unwrap_err();
        assert!(matches!(err, AcmeError::Config(_)));
        assert_eq!(ca.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registers_and_issues() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let target = haproxy_target(dir.path());
        let keeper = orchestrator(&ca);

        let first = keeper.request_certificate(&target).await.unwrap();
        assert_eq!(first.chain.len(), 2);
        assert!(target.certificate.acme_account_file.exists());
        assert_eq!(ca.registrations.load(Ordering::SeqCst), 1);

        // Challenge acceptance only happened while the responder was up.
        assert!(ca.ready_while_hosting.load(Ordering::SeqCst) > 0);
        assert_eq!(ca.ready_without_hosting.load(Ordering::SeqCst), 0);
        assert!(!ca.responder.is_hosting());

        // Second run logs in with the stored account and uses a new key.
        let second = keeper.request_certificate(&target).await.unwrap();
        assert_eq!(ca.registrations.load(Ordering::SeqCst), 1);
        assert_ne!(first.private_key, second.private_key);
        assert_ne!(first.chain[0], second.chain[0]);
    }

    #[tokio::test]
    async fn test_valid_authorizations_skip_hosting() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        ca.authorizations_valid.store(true, Ordering::SeqCst);
        let target = haproxy_target(dir.path());

        orchestrator(&ca).request_certificate(&target).await.unwrap();
        assert_eq!(ca.ready_while_hosting.load(Ordering::SeqCst), 0);
        assert_eq!(ca.ready_without_hosting.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_dns_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        ca.offer_dns.store(false, Ordering::SeqCst);
        let target = haproxy_target(dir.path());

        let err = orchestrator(&ca).request_certificate(&target).await.unwrap_err();
        assert!(matches!(err, AcmeError::NoDnsChallenge(_)));
        assert_eq!(ca.finalized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_authorization_stops_responder() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        ca.fail_validation.store(true, Ordering::SeqCst);
        let target = haproxy_target(dir.path());

        let err = orchestrator(&ca).request_certificate(&target).await.unwrap_err();
        assert!(matches!(err, AcmeError::AuthorizationFailed { .. }));
        assert!(!ca.responder.is_hosting());
        assert_eq!(ca.finalized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_authorization_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        ca.never_resolve.store(true, Ordering::SeqCst);
        let mut target = haproxy_target(dir.path());
        target.certificate.authorization_timeout_secs = Some(1);

        let err = orchestrator(&ca).request_certificate(&target).await.unwrap_err();
        assert!(matches!(err, AcmeError::AuthorizationTimeout { .. }));
        assert!(!ca.responder.is_hosting());
    }

    #[tokio::test]
    async fn test_login_without_registration() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let mut target = haproxy_target(dir.path());
        target.certificate.register_acme = false;

        let err = orchestrator(&ca).request_certificate(&target).await.unwrap_err();
        assert!(matches!(err, AcmeError::AccountFile { .. }));
        assert_eq!(ca.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_account_is_registered_again() {
        let dir = tempfile::tempdir().unwrap();
        let target = haproxy_target(dir.path());

        // Account file from a CA that has since forgotten the key.
        orchestrator(&Arc::new(MockCa::new()))
            .register_account(&target.certificate, true)
            .await
            .unwrap();

        let ca = Arc::new(MockCa::new());
        orchestrator(&ca).request_certificate(&target).await.unwrap();
        assert_eq!(ca.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(ca.finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_keeps_account() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let keeper = orchestrator(&ca);
        let target = haproxy_target(dir.path());

        let uri = keeper.register_account(&target.certificate, true).await.unwrap();
        let account_file = target.certificate.acme_account_file.clone();
        let before = std::fs::read_to_string(&account_file).unwrap();

        ca.lookup_failures.store(1, Ordering::SeqCst);
        let err = keeper.request_certificate(&target).await.unwrap_err();
        assert!(matches!(err, AcmeError::Http(_)));
        assert_eq!(ca.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(ca.finalized.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(&account_file).unwrap(), before);
        assert!(!dir.path().join("account-0.pem").exists());

        // Once the CA answers again the same account is used.
        keeper.request_certificate(&target).await.unwrap();
        assert_eq!(ca.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(StoredAccount::load(&account_file).unwrap().uri, uri);
    }

    #[tokio::test]
    async fn test_concurrent_runs_never_share_hosting() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let keeper = Arc::new(orchestrator(&ca));

        // Register once so the runs below only log in.
        let target = haproxy_target(dir.path());
        keeper
            .register_account(&target.certificate, true)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let keeper = Arc::clone(&keeper);
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                keeper.request_certificate(&target).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(ca.peak_validating.load(Ordering::SeqCst), 1);
        assert_eq!(ca.finalized.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_account_maintenance() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let keeper = orchestrator(&ca);
        let mut target = haproxy_target(dir.path());

        let uri = keeper.register_account(&target.certificate, true).await.unwrap();
        let info = keeper.test_account(&target.certificate).await.unwrap();
        assert_eq!(info.uri, uri);
        assert_eq!(info.status, AccountStatus::Valid);
        assert_eq!(info.contacts, vec!["mailto:hostmaster@example.org"]);

        // Same contacts: nothing sent.
        assert!(!keeper.update_contacts(&target.certificate).await.unwrap());
        assert_eq!(ca.contact_updates.load(Ordering::SeqCst), 0);

        target.certificate.acme_mail_contacts = vec!["ops@example.org".into()];
        assert!(keeper.update_contacts(&target.certificate).await.unwrap());
        assert_eq!(ca.contact_updates.load(Ordering::SeqCst), 1);

        let stored = StoredAccount::load(&target.certificate.acme_account_file).unwrap();
        assert_eq!(stored.contacts, vec!["mailto:ops@example.org"]);
    }

    #[tokio::test]
    async fn test_registration_requires_tos() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(MockCa::new());
        let target = haproxy_target(dir.path());

        let err = orchestrator(&ca)
            .register_account(&target.certificate, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::Account(_)));
        assert!(!target.certificate.acme_account_file.exists());
    }
}
