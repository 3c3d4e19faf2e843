//! ACME dns-01 certificate issuance
//!
//! # Architecture
//!
//! - [`AcmeOrchestrator`] - Runs the issuance dialogue for one target and the
//!   account maintenance commands
//! - [`AcmeProvider`] / [`OrderSession`] - CA backend seam
//! - [`LiveAcme`] - Backend talking to a real CA through `instant-acme`
//! - [`StoredAccount`] - Account key and the human-readable account file
//!
//! # Issuance Flow
//!
//! 1. Log in with the account file (or register when allowed)
//! 2. Place an order for all configured names
//! 3. Collect the dns-01 challenge of every authorization that is not valid yet
//! 4. Start the [`DnsResponder`](crate::dns::DnsResponder) with the expected TXT values
//! 5. Accept the challenges and wait for every authorization to resolve
//! 6. Stop the responder, generate a fresh key and CSR, finalize the order
//!
//! Nothing here persists certificate material; that is up to the caller.

mod account;
mod csr;
mod error;
mod jws;
mod live;
mod orchestrator;
mod provider;

pub use account::{AccountInfo, AccountKey, AccountStatus, StoredAccount};
pub use csr::{build_csr, generate_key};
pub use error::AcmeError;
pub use live::LiveAcme;
pub use orchestrator::{AcmeOrchestrator, IssuedCertificate};
pub use provider::{
    AccountSession, AcmeProvider, Authorization, AuthorizationStatus, Challenge, ChallengeKind,
    OrderSession,
};
