//! Live CA backend
//!
//! Orders go through `instant-acme`, which is handed the account key and
//! url from the account file. Account endpoints go through
//! [`AccountClient`](super::jws::AccountClient).

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use instant_acme::{Account, AccountCredentials, Identifier, NewOrder, Order, OrderStatus};
use tokio::time::sleep;
use tracing::{debug, trace};

use super::account::{AccountInfo, AccountKey};
use super::error::AcmeError;
use super::jws::AccountClient;
use super::provider::{
    AccountSession, AcmeProvider, Authorization, AuthorizationStatus, Challenge, ChallengeKind,
    OrderSession,
};
use crate::store::PEM_CERTIFICATE;

/// Upper bound for polls while the CA has not produced the certificate.
const MAX_CERTIFICATE_POLLS: u32 = 30;

/// Talks to a real ACME CA.
#[derive(Debug, Clone)]
pub struct LiveAcme {
    http: reqwest::Client,
}

impl LiveAcme {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn client(&self, directory: &str) -> Result<AccountClient, AcmeError> {
        AccountClient::connect(self.http.clone(), directory).await
    }
}

#[async_trait]
impl AcmeProvider for LiveAcme {
    async fn find_account(&self, directory: &str, key: &AccountKey) -> Result<AccountInfo, AcmeError> {
        self.client(directory).await?.find_account(key).await
    }

    async fn register_account(
        &self,
        directory: &str,
        key: &AccountKey,
        contacts: &[String],
        accept_tos: bool,
    ) -> Result<AccountInfo, AcmeError> {
        self.client(directory)
            .await?
            .register(key, contacts, accept_tos)
            .await
    }

    async fn update_contacts(
        &self,
        directory: &str,
        key: &AccountKey,
        account_uri: &str,
        contacts: &[String],
    ) -> Result<AccountInfo, AcmeError> {
        self.client(directory)
            .await?
            .update_contacts(key, account_uri, contacts)
            .await
    }

    async fn new_order(
        &self,
        account: &AccountSession,
        names: &[String],
    ) -> Result<Box<dyn OrderSession>, AcmeError> {
        let credentials: AccountCredentials = serde_json::from_value(serde_json::json!({
            "id": account.uri,
            "key_pkcs8": URL_SAFE_NO_PAD.encode(account.key.pkcs8_der()),
            "directory": account.directory,
        }))
        .map_err(|e| AcmeError::Account(format!("invalid account credentials: {}", e)))?;
        let acme_account = Account::from_credentials(credentials).await?;

        let identifiers: Vec<Identifier> = names.iter().map(|n| Identifier::Dns(n.clone())).collect();
        let mut order = acme_account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let urls = order.state().authorizations.clone();
        debug!(
            authorizations = urls.len(),
            status = ?order.state().status,
            "Order created"
        );
        Ok(Box::new(LiveOrder { order, urls }))
    }
}

struct LiveOrder {
    order: Order,
    urls: Vec<String>,
}

impl LiveOrder {
    async fn wait_while(&mut self, waiting: OrderStatus, poll_interval: Duration) -> Result<OrderStatus, AcmeError> {
        loop {
            let status = self.order.refresh().await?.status;
            trace!(status = ?status, "Order state");
            match status {
                OrderStatus::Invalid => return Err(AcmeError::OrderFailed("invalid".into())),
                s if s == waiting => sleep(poll_interval).await,
                s => return Ok(s),
            }
        }
    }
}

fn authorization_status(status: instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    use instant_acme::AuthorizationStatus as S;
    #[allow(unreachable_patterns)]
    match status {
        S::Pending => AuthorizationStatus::Pending,
        S::Valid => AuthorizationStatus::Valid,
        S::Invalid => AuthorizationStatus::Invalid,
        S::Revoked => AuthorizationStatus::Revoked,
        S::Expired => AuthorizationStatus::Expired,
        _ => AuthorizationStatus::Deactivated,
    }
}

fn challenge_kind(kind: &instant_acme::ChallengeType) -> ChallengeKind {
    use instant_acme::ChallengeType as T;
    #[allow(unreachable_patterns)]
    match kind {
        T::Dns01 => ChallengeKind::Dns01,
        T::Http01 => ChallengeKind::Http01,
        T::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        _ => ChallengeKind::Other,
    }
}

#[async_trait]
impl OrderSession for LiveOrder {
    fn authorization_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    async fn authorization(&mut self, url: &str) -> Result<Authorization, AcmeError> {
        let index = self
            .urls
            .iter()
            .position(|u| u == url)
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))?;

        let authz = self
            .order
            .authorizations()
            .await?
            .into_iter()
            .nth(index)
            .ok_or_else(|| AcmeError::Protocol(format!("authorization {} missing from order", url)))?;

        let Identifier::Dns(identifier) = authz.identifier;
        Ok(Authorization {
            url: url.to_string(),
            identifier,
            status: authorization_status(authz.status),
            challenges: authz
                .challenges
                .into_iter()
                .map(|c| Challenge {
                    kind: challenge_kind(&c.r#type),
                    url: c.url,
                    token: c.token,
                })
                .collect(),
        })
    }

    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError> {
        self.order.set_challenge_ready(challenge_url).await?;
        Ok(())
    }

    async fn finalize(&mut self, csr_der: &[u8], poll_interval: Duration) -> Result<Vec<Vec<u8>>, AcmeError> {
        if self.wait_while(OrderStatus::Pending, poll_interval).await? == OrderStatus::Ready {
            self.order.finalize(csr_der).await?;
            debug!("Submitted CSR");
        }
        let status = self.wait_while(OrderStatus::Processing, poll_interval).await?;
        if status != OrderStatus::Valid {
            return Err(AcmeError::OrderFailed(format!("{:?}", status)));
        }

        let mut polls = 0;
        let chain_pem = loop {
            if let Some(pem) = self.order.certificate().await? {
                break pem;
            }
            polls += 1;
            if polls >= MAX_CERTIFICATE_POLLS {
                return Err(AcmeError::Protocol("certificate not available after order became valid".into()));
            }
            sleep(poll_interval).await;
        };

        let chain: Vec<Vec<u8>> = pem::parse_many(chain_pem.as_bytes())
            .map_err(|e| AcmeError::Protocol(format!("invalid certificate chain: {}", e)))?
            .into_iter()
            .filter(|block| block.tag() == PEM_CERTIFICATE)
            .map(pem::Pem::into_contents)
            .collect();
        if chain.is_empty() {
            return Err(AcmeError::Protocol("CA returned an empty certificate chain".into()));
        }
        Ok(chain)
    }
}
