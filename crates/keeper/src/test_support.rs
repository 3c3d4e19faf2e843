//! Fixtures shared by the unit tests: certificates, OCSP responses, target
//! configurations and in-process fakes for the CA, the OCSP responder and
//! the haproxy control socket.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use certkeeper_config::TargetConfig;
use chrono::{DateTime, Datelike, Utc};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use yasna::models::ObjectIdentifier;
use yasna::{tags::TAG_GENERALIZEDTIME, Tag};

use crate::acme::{
    AccountInfo, AccountKey, AccountSession, AccountStatus, AcmeError, AcmeProvider, Authorization,
    AuthorizationStatus, Challenge, ChallengeKind, OrderSession,
};
use crate::dns::DnsResponder;
use crate::ocsp::{parse_response, OcspError, OcspFetcher, OcspResponse};

// ---------------------------------------------------------------------------
// Certificates and OCSP responses
// ---------------------------------------------------------------------------

fn self_signed(names: &[&str], days: i64, extensions: Vec<CustomExtension>) -> (Vec<u8>, Vec<u8>) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let mut params = CertificateParams::new(names).unwrap();
    let expiry = (Utc::now() + chrono::Duration::days(days)).date_naive();
    params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);
    params.custom_extensions = extensions;

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.der().to_vec(), key.serialize_der())
}

/// `[leaf, issuer]` valid for `days` more days, plus the leaf's PKCS#8 key.
pub(crate) fn self_signed_chain(names: &[&str], days: i64) -> (Vec<Vec<u8>>, Vec<u8>) {
    let (leaf, key) = self_signed(names, days, Vec::new());
    let (issuer, _) = self_signed(&["Test Issuer"], 3650, Vec::new());
    (vec![leaf, issuer], key)
}

/// `[leaf, issuer]` where the leaf names `url` as its OCSP responder.
pub(crate) fn chain_with_ocsp_url(url: &str) -> Vec<Vec<u8>> {
    let aia = yasna::construct_der(|writer| {
        writer.write_sequence_of(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(&[1, 3, 6, 1, 5, 5, 7, 48, 1]));
                writer
                    .next()
                    .write_tagged_implicit(Tag::context(6), |writer| writer.write_ia5_string(url));
            });
        });
    });
    let extension = CustomExtension::from_oid_content(&[1, 3, 6, 1, 5, 5, 7, 1, 1], aia);

    let (leaf, _) = self_signed(&["example.org"], 60, vec![extension]);
    let (issuer, _) = self_signed(&["Test Issuer"], 3650, Vec::new());
    vec![leaf, issuer]
}

fn generalized_time(t: DateTime<Utc>) -> Vec<u8> {
    t.format("%Y%m%d%H%M%SZ").to_string().into_bytes()
}

/// Successful, unsigned basic OCSP response reporting "good".
pub(crate) fn ocsp_response_der(next_update: Option<DateTime<Utc>>) -> Vec<u8> {
    let now = generalized_time(Utc::now() - chrono::Duration::hours(1));
    let next_update = next_update.map(generalized_time);

    let basic = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            // tbsResponseData
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_tagged(Tag::context(2), |writer| writer.write_bytes(&[0u8; 20]));
                writer
                    .next()
                    .write_tagged_implicit(TAG_GENERALIZEDTIME, |writer| writer.write_bytes(&now));
                writer.next().write_sequence_of(|writer| {
                    writer.next().write_sequence(|writer| {
                        writer.next().write_sequence(|writer| {
                            writer.next().write_sequence(|writer| {
                                writer
                                    .next()
                                    .write_oid(&ObjectIdentifier::from_slice(&[1, 3, 14, 3, 2, 26]));
                                writer.next().write_null();
                            });
                            writer.next().write_bytes(&[1u8; 20]);
                            writer.next().write_bytes(&[2u8; 20]);
                            writer.next().write_u64(4711);
                        });
                        writer
                            .next()
                            .write_tagged_implicit(Tag::context(0), |writer| writer.write_null());
                        writer
                            .next()
                            .write_tagged_implicit(TAG_GENERALIZEDTIME, |writer| writer.write_bytes(&now));
                        if let Some(next_update) = &next_update {
                            writer.next().write_tagged(Tag::context(0), |writer| {
                                writer.write_tagged_implicit(TAG_GENERALIZEDTIME, |writer| {
                                    writer.write_bytes(next_update)
                                })
                            });
                        }
                    });
                });
            });
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(&[1, 2, 840, 10045, 4, 3, 2]));
            });
            writer.next().write_bitvec_bytes(&[0u8; 8], 64);
        });
    });

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_enum(0);
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer
                        .next()
                        .write_oid(&ObjectIdentifier::from_slice(&[1, 3, 6, 1, 5, 5, 7, 48, 1, 1]));
                    writer.next().write_bytes(&basic);
                });
            });
        });
    })
}

/// Response carrying only a (non-successful) status.
pub(crate) fn ocsp_response_der_with_status(status: i64) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_enum(status);
        });
    })
}

// ---------------------------------------------------------------------------
// Target configurations
// ---------------------------------------------------------------------------

/// haproxy target with all files under `dir` and a socket at
/// `dir/admin.sock`.
pub(crate) fn haproxy_target(dir: &Path) -> TargetConfig {
    let yaml = format!(
        r#"
timing:
  run-interval-minutes: 0
  renewal-due-cert: 14
  renewal-due-ocsp: 3
certificate:
  dns-names: [example.org, www.example.org]
  acme-directory: https://ca.test/directory
  acme-account-file: {dir}/account.pem
  register-acme: true
  accept-acme-tos: true
  acme-mail-contacts: [hostmaster@example.org]
  poll-interval-secs: 1
mode: haproxy
files:
  single-file: true
  cert-file: {dir}/site.pem
haproxy:
  haproxy-socket: {dir}/admin.sock
"#,
        dir = dir.display()
    );
    TargetConfig::from_yaml(Path::new("haproxy.yaml"), &yaml).unwrap()
}

/// nginx target with split files under `dir` and reloading disabled.
pub(crate) fn nginx_target(dir: &Path) -> TargetConfig {
    let yaml = format!(
        r#"
timing:
  renewal-due-cert: 14
  renewal-due-ocsp: 3
certificate:
  dns-names: [example.org]
  elliptic-curve: P256
  acme-directory: https://ca.test/directory
  acme-account-file: {dir}/account.pem
  register-acme: true
  accept-acme-tos: true
  poll-interval-secs: 1
mode: nginx
files:
  cert-file: {dir}/site.crt
  key-file: {dir}/site.key
"#,
        dir = dir.display()
    );
    TargetConfig::from_yaml(Path::new("nginx.yaml"), &yaml).unwrap()
}

// ---------------------------------------------------------------------------
// Fake CA
// ---------------------------------------------------------------------------

const TERMS_OF_SERVICE: &str = "https://ca.test/tos";

struct FakeAccount {
    uri: String,
    contacts: Vec<String>,
}

/// In-process CA.
///
/// Every trait call is counted in `calls`. Orders report how often a
/// challenge was accepted while the shared responder was (not) hosting, and
/// the peak number of orders validating at the same time.
pub(crate) struct MockCa {
    state: Arc<CaState>,
}

pub(crate) struct CaState {
    pub responder: DnsResponder,
    pub calls: AtomicUsize,
    pub registrations: AtomicUsize,
    pub contact_updates: AtomicUsize,
    pub finalized: AtomicUsize,
    pub ready_while_hosting: AtomicUsize,
    pub ready_without_hosting: AtomicUsize,
    pub validating: AtomicUsize,
    pub peak_validating: AtomicUsize,
    /// Authorizations start out valid.
    pub authorizations_valid: AtomicBool,
    /// Authorizations offer a dns-01 challenge.
    pub offer_dns: AtomicBool,
    /// Accepted challenges end up invalid.
    pub fail_validation: AtomicBool,
    /// Accepted challenges stay pending forever.
    pub never_resolve: AtomicBool,
    /// Number of upcoming account lookups that fail as if the CA were down.
    pub lookup_failures: AtomicUsize,
    accounts: Mutex<HashMap<String, FakeAccount>>,
    orders: AtomicUsize,
}

impl std::ops::Deref for MockCa {
    type Target = CaState;

    fn deref(&self) -> &CaState {
        &self.state
    }
}

impl MockCa {
    pub fn new() -> Self {
        let state = CaState {
            responder: DnsResponder::new("127.0.0.1:0".parse().unwrap()),
            calls: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
            contact_updates: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            ready_while_hosting: AtomicUsize::new(0),
            ready_without_hosting: AtomicUsize::new(0),
            validating: AtomicUsize::new(0),
            peak_validating: AtomicUsize::new(0),
            authorizations_valid: AtomicBool::new(false),
            offer_dns: AtomicBool::new(true),
            fail_validation: AtomicBool::new(false),
            never_resolve: AtomicBool::new(false),
            lookup_failures: AtomicUsize::new(0),
            accounts: Mutex::new(HashMap::new()),
            orders: AtomicUsize::new(0),
        };
        Self {
            state: Arc::new(state),
        }
    }
}

impl CaState {
    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AcmeProvider for MockCa {
    async fn find_account(&self, _directory: &str, key: &AccountKey) -> Result<AccountInfo, AcmeError> {
        self.call();
        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AcmeError::Http("503 Service Unavailable".into()));
        }

        let accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get(&key.thumbprint())
            .ok_or_else(|| AcmeError::AccountNotFound("no account exists with the provided key".into()))?;
        Ok(AccountInfo {
            uri: account.uri.clone(),
            status: AccountStatus::Valid,
            contacts: account.contacts.clone(),
            terms_of_service: None,
        })
    }

    async fn register_account(
        &self,
        _directory: &str,
        key: &AccountKey,
        contacts: &[String],
        accept_tos: bool,
    ) -> Result<AccountInfo, AcmeError> {
        self.call();
        if !accept_tos {
            return Err(AcmeError::Account(format!(
                "terms of service {} were not accepted",
                TERMS_OF_SERVICE
            )));
        }

        let number = self.registrations.fetch_add(1, Ordering::SeqCst);
        let uri = format!("https://ca.test/acct/{}", number);
        self.accounts.lock().unwrap().insert(
            key.thumbprint(),
            FakeAccount {
                uri: uri.clone(),
                contacts: contacts.to_vec(),
            },
        );
        Ok(AccountInfo {
            uri,
            status: AccountStatus::Valid,
            contacts: contacts.to_vec(),
            terms_of_service: Some(TERMS_OF_SERVICE.into()),
        })
    }

    async fn update_contacts(
        &self,
        _directory: &str,
        key: &AccountKey,
        account_uri: &str,
        contacts: &[String],
    ) -> Result<AccountInfo, AcmeError> {
        self.call();
        self.contact_updates.fetch_add(1, Ordering::SeqCst);
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(&key.thumbprint())
            .filter(|a| a.uri == account_uri)
            .ok_or_else(|| AcmeError::Account("unknown account".into()))?;
        account.contacts = contacts.to_vec();
        Ok(AccountInfo {
            uri: account.uri.clone(),
            status: AccountStatus::Valid,
            contacts: account.contacts.clone(),
            terms_of_service: None,
        })
    }

    async fn new_order(
        &self,
        account: &AccountSession,
        names: &[String],
    ) -> Result<Box<dyn OrderSession>, AcmeError> {
        self.call();
        if !self.accounts.lock().unwrap().contains_key(&account.key.thumbprint()) {
            return Err(AcmeError::Account("unknown account".into()));
        }

        let id = self.orders.fetch_add(1, Ordering::SeqCst);
        let authorizations = names
            .iter()
            .enumerate()
            .map(|(i, name)| (format!("https://ca.test/authz/{}/{}", id, i), name.clone()))
            .collect();
        Ok(Box::new(MockOrder {
            ca: Arc::clone(&self.state),
            names: names.to_vec(),
            authorizations,
            ready: HashSet::new(),
            resolved: HashSet::new(),
            counted: false,
        }))
    }
}

struct MockOrder {
    ca: Arc<CaState>,
    names: Vec<String>,
    /// (authorization url, identifier)
    authorizations: Vec<(String, String)>,
    ready: HashSet<String>,
    resolved: HashSet<String>,
    counted: bool,
}

impl MockOrder {
    fn challenge_url(authorization_url: &str) -> String {
        format!("{}/dns-01", authorization_url)
    }

    fn finish_validation(&mut self) {
        if self.counted {
            self.counted = false;
            self.ca.validating.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockOrder {
    fn drop(&mut self) {
        self.finish_validation();
    }
}

#[async_trait]
impl OrderSession for MockOrder {
    fn authorization_urls(&self) -> Vec<String> {
        self.authorizations.iter().map(|(url, _)| url.clone()).collect()
    }

    async fn authorization(&mut self, url: &str) -> Result<Authorization, AcmeError> {
        let ca = Arc::clone(&self.ca);
        ca.call();
        let identifier = self
            .authorizations
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, name)| name.clone())
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))?;

        let challenge_url = Self::challenge_url(url);
        let status = if ca.authorizations_valid.load(Ordering::SeqCst) {
            AuthorizationStatus::Valid
        } else if !self.ready.contains(&challenge_url) || ca.never_resolve.load(Ordering::SeqCst) {
            AuthorizationStatus::Pending
        } else if ca.fail_validation.load(Ordering::SeqCst) {
            AuthorizationStatus::Invalid
        } else {
            AuthorizationStatus::Valid
        };

        if self.ready.contains(&challenge_url) && status.is_terminal() {
            self.resolved.insert(url.to_string());
            if self.resolved.len() == self.ready.len() {
                self.finish_validation();
            }
        }

        let mut challenges = vec![Challenge {
            kind: ChallengeKind::Http01,
            url: format!("{}/http-01", url),
            token: format!("http-token-{}", identifier),
        }];
        if ca.offer_dns.load(Ordering::SeqCst) {
            challenges.push(Challenge {
                kind: ChallengeKind::Dns01,
                url: challenge_url,
                token: format!("dns-token-{}", identifier),
            });
        }

        Ok(Authorization {
            url: url.to_string(),
            identifier,
            status,
            challenges,
        })
    }

    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError> {
        let ca = Arc::clone(&self.ca);
        ca.call();
        if ca.responder.is_hosting() {
            ca.ready_while_hosting.fetch_add(1, Ordering::SeqCst);
        } else {
            ca.ready_without_hosting.fetch_add(1, Ordering::SeqCst);
        }

        if !self.counted {
            self.counted = true;
            let now = ca.validating.fetch_add(1, Ordering::SeqCst) + 1;
            ca.peak_validating.fetch_max(now, Ordering::SeqCst);
        }
        self.ready.insert(challenge_url.to_string());
        Ok(())
    }

    async fn finalize(&mut self, csr_der: &[u8], _poll_interval: Duration) -> Result<Vec<Vec<u8>>, AcmeError> {
        let ca = Arc::clone(&self.ca);
        ca.call();
        if csr_der.is_empty() {
            return Err(AcmeError::OrderFailed("empty CSR".into()));
        }
        ca.finalized.fetch_add(1, Ordering::SeqCst);

        let names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        let (chain, _) = self_signed_chain(&names, 90);
        Ok(chain)
    }
}

// ---------------------------------------------------------------------------
// Fake OCSP responder
// ---------------------------------------------------------------------------

/// Returns a canned response, or fails when `fail` is set.
pub(crate) struct MockOcsp {
    pub next_update_days: i64,
    pub fail: AtomicBool,
    pub fetches: AtomicUsize,
    pub last_leaf: Mutex<Option<Vec<u8>>>,
}

impl MockOcsp {
    pub fn new(next_update_days: i64) -> Self {
        Self {
            next_update_days,
            fail: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            last_leaf: Mutex::new(None),
        }
    }
}

#[async_trait]
impl OcspFetcher for MockOcsp {
    async fn fetch(&self, chain: &[Vec<u8>]) -> Result<OcspResponse, OcspError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_leaf.lock().unwrap() = chain.first().cloned();
        if self.fail.load(Ordering::SeqCst) {
            return Err(OcspError::HttpStatus {
                url: "http://ocsp.test".into(),
                status: 503,
            });
        }
        let next_update = Utc::now() + chrono::Duration::days(self.next_update_days);
        parse_response(&ocsp_response_der(Some(next_update)))
    }
}

// ---------------------------------------------------------------------------
// Fake haproxy control socket
// ---------------------------------------------------------------------------

/// Reply haproxy gives to a well-formed command.
pub(crate) fn haproxy_reply(command: &str) -> String {
    let first_line = command.lines().next().unwrap_or_default();
    if first_line.starts_with("abort ssl cert ") {
        "No ongoing transaction!\n\n".into()
    } else if first_line == "set ssl ocsp-response <<" {
        "OCSP Response updated!\n\n".into()
    } else if let Some(rest) = first_line.strip_prefix("set ssl cert ") {
        let path = rest.trim_end_matches(" <<");
        match path.strip_suffix(".ocsp") {
            Some(cert) => format!("Transaction updated for certificate {}!\n\n", cert),
            None => format!("Transaction created for certificate {}!\n\n", path),
        }
    } else if let Some(path) = first_line.strip_prefix("commit ssl cert ") {
        format!("Committing {}.\nSuccess!\n\n", path)
    } else {
        "Unknown command.\n\n".into()
    }
}

/// Unix socket server recording every command it receives.
pub(crate) struct MockHaproxy {
    pub commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockHaproxy {
    pub fn start<F>(path: PathBuf, reply: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let listener = UnixListener::bind(&path).unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&commands);

        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut request = String::new();
                if stream.read_to_string(&mut request).await.is_err() {
                    continue;
                }
                let response = reply(&request);
                recorded.lock().unwrap().push(request);
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { commands, task }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for MockHaproxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}
