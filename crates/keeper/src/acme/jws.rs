//! Signed requests against the ACME account endpoints
//!
//! The order flow runs through `instant-acme`; account lookup, registration
//! with an explicit terms-of-service decision, and contact updates are sent
//! from here as flattened JWS (RFC 8555 section 6.2).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::header::LOCATION;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, trace};

use super::account::{AccountInfo, AccountKey, AccountStatus};
use super::error::AcmeError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DirectoryMeta {
    #[serde(default)]
    pub terms_of_service: Option<String>,
}

impl Directory {
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta.as_ref()?.terms_of_service.as_deref()
    }
}

/// Account object as returned by the CA.
#[derive(Debug, Deserialize)]
struct AccountBody {
    status: AccountStatus,
    #[serde(default)]
    contact: Vec<String>,
}

/// RFC 7807 problem document
#[derive(Debug, Default, Deserialize)]
struct Problem {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl Problem {
    fn is_account_missing(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.ends_with(":accountDoesNotExist"))
    }
}

/// Key identification in the protected header.
pub(crate) enum Signer<'a> {
    /// Embedded public key; only for `newAccount`.
    Jwk(&'a AccountKey),
    /// Account url.
    Kid(&'a AccountKey, &'a str),
}

pub(crate) struct AccountClient {
    http: Client,
    directory: Directory,
}

impl AccountClient {
    pub async fn connect(http: Client, directory_url: &str) -> Result<Self, AcmeError> {
        debug!(directory = %directory_url, "Loading ACME directory");

        let response = http.get(directory_url).send().await?;
        if !response.status().is_success() {
            return Err(AcmeError::Http(format!(
                "failed to load directory {}: status {}",
                directory_url,
                response.status()
            )));
        }
        let directory: Directory = response.json().await?;

        trace!(
            new_nonce = %directory.new_nonce,
            new_account = %directory.new_account,
            new_order = %directory.new_order,
            "Directory loaded"
        );
        Ok(Self { http, directory })
    }

    async fn nonce(&self) -> Result<String, AcmeError> {
        let response = self.http.head(&self.directory.new_nonce).send().await?;
        response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| AcmeError::Protocol("CA returned no replay-nonce".into()))
    }

    /// POST a signed payload and return the successful response.
    async fn post(
        &self,
        url: &str,
        signer: Signer<'_>,
        payload: &serde_json::Value,
    ) -> Result<Response, AcmeError> {
        let nonce = self.nonce().await?;

        let (key, mut protected) = match signer {
            Signer::Jwk(key) => (key, serde_json::json!({ "jwk": key.jwk() })),
            Signer::Kid(key, kid) => (key, serde_json::json!({ "kid": kid })),
        };
        protected["alg"] = "ES256".into();
        protected["nonce"] = nonce.into();
        protected["url"] = url.into();

        let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signature = key.sign(format!("{}.{}", protected, payload).as_bytes())?;
        let body = serde_json::json!({
            "protected": protected,
            "payload": payload,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        });

        debug!(url = %url, "Signed ACME request");
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(body.to_string())
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let problem: Problem = response.json().await.unwrap_or_default();
        if problem.is_account_missing() {
            return Err(AcmeError::AccountNotFound(
                problem.detail.unwrap_or_else(|| url.to_string()),
            ));
        }
        Err(AcmeError::Account(format!(
            "{} ({}): {}",
            problem.kind.as_deref().unwrap_or("request rejected"),
            status,
            problem.detail.as_deref().unwrap_or("no detail")
        )))
    }

    async fn account_response(
        response: Response,
        uri: Option<&str>,
    ) -> Result<AccountInfo, AcmeError> {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body: AccountBody = response.json().await?;

        let uri = location
            .or_else(|| uri.map(ToString::to_string))
            .ok_or_else(|| AcmeError::Protocol("account response has no Location".into()))?;

        Ok(AccountInfo {
            uri,
            status: body.status,
            contacts: body.contact,
            terms_of_service: None,
        })
    }

    /// Look up the account belonging to `key` without creating one.
    pub async fn find_account(&self, key: &AccountKey) -> Result<AccountInfo, AcmeError> {
        let response = self
            .post(
                &self.directory.new_account,
                Signer::Jwk(key),
                &serde_json::json!({ "onlyReturnExisting": true }),
            )
            .await?;
        Self::account_response(response, None).await
    }

    /// Register a new account.
    ///
    /// If the CA publishes terms of service they must be accepted, otherwise
    /// registration is refused before anything is sent.
    pub async fn register(
        &self,
        key: &AccountKey,
        contacts: &[String],
        accept_tos: bool,
    ) -> Result<AccountInfo, AcmeError> {
        let tos = self.directory.terms_of_service().map(ToString::to_string);
        if let Some(url) = &tos {
            if !accept_tos {
                return Err(AcmeError::Account(format!(
                    "terms of service {} were not accepted",
                    url
                )));
            }
        }

        let response = self
            .post(
                &self.directory.new_account,
                Signer::Jwk(key),
                &serde_json::json!({
                    "termsOfServiceAgreed": accept_tos,
                    "contact": contacts,
                }),
            )
            .await?;

        let mut info = Self::account_response(response, None).await?;
        info.terms_of_service = tos;
        Ok(info)
    }

    /// Replace the contact list of an existing account.
    pub async fn update_contacts(
        &self,
        key: &AccountKey,
        account_uri: &str,
        contacts: &[String],
    ) -> Result<AccountInfo, AcmeError> {
        let response = self
            .post(
                account_uri,
                Signer::Kid(key, account_uri),
                &serde_json::json!({ "contact": contacts }),
            )
            .await?;
        Self::account_response(response, Some(account_uri)).await
    }
}
