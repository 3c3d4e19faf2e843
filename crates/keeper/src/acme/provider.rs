//! CA backend seam
//!
//! [`AcmeOrchestrator`](super::AcmeOrchestrator) drives issuance through
//! these traits so the dialogue can run against a live CA
//! ([`LiveAcme`](super::LiveAcme)) or an in-process fake.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::account::{AccountInfo, AccountKey};
use super::error::AcmeError;

/// Logged-in account used to place orders.
#[derive(Debug)]
pub struct AccountSession {
    pub directory: String,
    pub uri: String,
    pub key: AccountKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Dns01,
    Http01,
    TlsAlpn01,
    Other,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
}

/// One identifier's authorization within an order.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    pub identifier: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn dns_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == ChallengeKind::Dns01)
    }
}

/// Account operations and order creation.
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    /// Account registered for `key`, without creating one.
    async fn find_account(&self, directory: &str, key: &AccountKey) -> Result<AccountInfo, AcmeError>;

    /// Register a new account, agreeing to the terms of service only if
    /// `accept_tos` is set.
    async fn register_account(
        &self,
        directory: &str,
        key: &AccountKey,
        contacts: &[String],
        accept_tos: bool,
    ) -> Result<AccountInfo, AcmeError>;

    async fn update_contacts(
        &self,
        directory: &str,
        key: &AccountKey,
        account_uri: &str,
        contacts: &[String],
    ) -> Result<AccountInfo, AcmeError>;

    /// Place an order for `names`.
    async fn new_order(
        &self,
        account: &AccountSession,
        names: &[String],
    ) -> Result<Box<dyn OrderSession>, AcmeError>;
}

/// One order, from authorization to certificate download.
#[async_trait]
pub trait OrderSession: Send {
    fn authorization_urls(&self) -> Vec<String>;

    /// Current state of one authorization.
    async fn authorization(&mut self, url: &str) -> Result<Authorization, AcmeError>;

    /// Tell the CA the challenge at `challenge_url` can be validated.
    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError>;

    /// Submit the CSR and wait for the chain (DER, leaf first), polling
    /// every `poll_interval`.
    async fn finalize(&mut self, csr_der: &[u8], poll_interval: Duration) -> Result<Vec<Vec<u8>>, AcmeError>;
}
