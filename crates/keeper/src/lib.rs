//! certkeeper
//!
//! Keeps TLS certificates of haproxy and nginx deployments renewed. Each
//! configured target gets its own renewal task that:
//!
//! - obtains certificates from an ACME CA using dns-01, answering the CA's
//!   DNS queries itself ([`dns`])
//! - keeps an OCSP response fresh next to the certificate ([`ocsp`])
//! - writes material with numbered backups ([`store`])
//! - hands new material to a running haproxy or reloads nginx ([`server`])
//!
//! [`scheduler`] ties these together; [`acme`] runs the issuance dialogue.

pub mod acme;
pub mod dns;
pub mod ocsp;
pub mod scheduler;
pub mod server;
pub mod store;

#[cfg(test)]
mod test_support;

pub use acme::{AcmeError, AcmeOrchestrator, IssuedCertificate, LiveAcme};
pub use dns::{DnsError, DnsResponder};
pub use ocsp::{HttpOcspFetcher, OcspError, OcspFetcher, OcspResponse};
pub use scheduler::{RenewalDecision, RenewalError, RenewalScheduler, TargetRunner};
pub use server::{PushError, ServerAdapter};
pub use store::{CertificateStore, StoreError};
