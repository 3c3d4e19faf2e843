//! OCSP fetcher
//!
//! Builds an OCSP request for a leaf/issuer pair, POSTs it to the responder
//! named in the leaf's Authority Information Access extension and parses
//! the validity window out of the DER response. Signatures are not
//! verified; the response is only staged for the TLS server, which hands it
//! to clients that do verify it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use num_bigint::BigUint;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use yasna::models::ObjectIdentifier;
use yasna::{tags::TAG_GENERALIZEDTIME, Tag};

/// id-ad-ocsp (1.3.6.1.5.5.7.48.1), DER content bytes
const OCSP_ACCESS_METHOD: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];

const OID_SHA1: &[u64] = &[1, 3, 14, 3, 2, 26];
const OID_OCSP_BASIC: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 1];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum OcspError {
    #[error("certificate chain has no issuer certificate")]
    MissingIssuer,

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("certificate names no OCSP responder")]
    NoResponderUrl,

    #[error("OCSP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("OCSP responder {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("OCSP responder answered {0}")]
    Unsuccessful(ResponseStatus),

    #[error("malformed OCSP response: {0}")]
    Malformed(String),
}

impl From<yasna::ASN1Error> for OcspError {
    fn from(e: yasna::ASN1Error) -> Self {
        OcspError::Malformed(e.to_string())
    }
}

/// OCSPResponseStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Successful,
    MalformedRequest,
    InternalError,
    TryLater,
    SigRequired,
    Unauthorized,
    Other(i64),
}

impl From<i64> for ResponseStatus {
    fn from(value: i64) -> Self {
        match value {
            0 => ResponseStatus::Successful,
            1 => ResponseStatus::MalformedRequest,
            2 => ResponseStatus::InternalError,
            3 => ResponseStatus::TryLater,
            5 => ResponseStatus::SigRequired,
            6 => ResponseStatus::Unauthorized,
            other => ResponseStatus::Other(other),
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Successful => f.write_str("successful"),
            ResponseStatus::MalformedRequest => f.write_str("malformedRequest"),
            ResponseStatus::InternalError => f.write_str("internalError"),
            ResponseStatus::TryLater => f.write_str("tryLater"),
            ResponseStatus::SigRequired => f.write_str("sigRequired"),
            ResponseStatus::Unauthorized => f.write_str("unauthorized"),
            ResponseStatus::Other(v) => write!(f, "status {}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

/// A fetched (or stored) OCSP response.
#[derive(Debug, Clone)]
pub struct OcspResponse {
    /// The complete OCSPResponse DER, as served to TLS clients.
    pub der: Vec<u8>,
    pub status: CertStatus,
    pub produced_at: DateTime<Utc>,
    pub this_update: DateTime<Utc>,
    /// `None` means the responder promises nothing about freshness.
    pub next_update: Option<DateTime<Utc>>,
}

/// Source of OCSP responses for a certificate chain (leaf first).
#[async_trait]
pub trait OcspFetcher: Send + Sync {
    async fn fetch(&self, chain: &[Vec<u8>]) -> Result<OcspResponse, OcspError>;
}

/// Fetches responses over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpOcspFetcher {
    http: reqwest::Client,
}

impl HttpOcspFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl OcspFetcher for HttpOcspFetcher {
    async fn fetch(&self, chain: &[Vec<u8>]) -> Result<OcspResponse, OcspError> {
        let (url, request) = build_request(chain)?;
        debug!(url = %url, "Requesting OCSP response");

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/ocsp-request")
            .header("Accept", "application/ocsp-response")
            .timeout(REQUEST_TIMEOUT)
            .body(request)
            .send()
            .await
            .map_err(|e| OcspError::Http {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(OcspError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| OcspError::Http {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let parsed = parse_response(&body)?;
        if parsed.status != CertStatus::Good {
            warn!(url = %url, status = ?parsed.status, "OCSP responder does not report the certificate as good");
        }
        info!(
            url = %url,
            this_update = %parsed.this_update,
            next_update = ?parsed.next_update,
            "Fetched OCSP response"
        );
        Ok(parsed)
    }
}

/// OCSP responder url from the Authority Information Access extension.
pub fn responder_url(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.tbs_certificate.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.as_bytes() != OCSP_ACCESS_METHOD {
                    continue;
                }
                if let GeneralName::URI(uri) = &desc.access_location {
                    return Some((*uri).to_string());
                }
            }
        }
    }
    None
}

/// Responder url and DER request for the first two certificates of `chain`.
pub fn build_request(chain: &[Vec<u8>]) -> Result<(String, Vec<u8>), OcspError> {
    let (leaf_der, issuer_der) = match chain {
        [leaf, issuer, ..] => (leaf, issuer),
        _ => return Err(OcspError::MissingIssuer),
    };

    let (_, leaf) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| OcspError::Certificate(format!("leaf: {}", e)))?;
    let (_, issuer) = x509_parser::parse_x509_certificate(issuer_der)
        .map_err(|e| OcspError::Certificate(format!("issuer: {}", e)))?;

    let url = responder_url(&leaf).ok_or(OcspError::NoResponderUrl)?;
    let request = encode_request(
        leaf.tbs_certificate.issuer.as_raw(),
        &issuer.tbs_certificate.subject_pki.subject_public_key.data,
        &leaf.tbs_certificate.serial,
    );
    Ok((url, request))
}

fn encode_request(issuer_name: &[u8], issuer_key: &[u8], serial: &BigUint) -> Vec<u8> {
    let name_hash = Sha1::digest(issuer_name);
    let key_hash = Sha1::digest(issuer_key);
    let sha1 = ObjectIdentifier::from_slice(OID_SHA1);

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            // tbsRequest
            writer.next().write_sequence(|writer| {
                writer.next().write_sequence_of(|writer| {
                    // Request
                    writer.next().write_sequence(|writer| {
                        // CertID
                        writer.next().write_sequence(|writer| {
                            writer.next().write_sequence(|writer| {
                                writer.next().write_oid(&sha1);
                                writer.next().write_null();
                            });
                            writer.next().write_bytes(&name_hash);
                            writer.next().write_bytes(&key_hash);
                            writer.next().write_biguint(serial);
                        });
                    });
                });
            });
        });
    })
}

struct SingleResponse {
    status: CertStatus,
    this_update: Vec<u8>,
    next_update: Option<Vec<u8>>,
}

/// Parse an OCSPResponse.
///
/// Only successful `id-pkix-ocsp-basic` responses are accepted; the first
/// SingleResponse provides status and validity window.
pub fn parse_response(der: &[u8]) -> Result<OcspResponse, OcspError> {
    let (status, response_bytes) = yasna::parse_der(der, |reader| {
        reader.read_sequence(|reader| {
            let status = reader.next().read_enum()?;
            let bytes = reader.read_optional(|reader| {
                reader.read_tagged(Tag::context(0), |reader| {
                    reader.read_sequence(|reader| {
                        let kind = reader.next().read_oid()?;
                        let response = reader.next().read_bytes()?;
                        Ok((kind, response))
                    })
                })
            })?;
            Ok((status, bytes))
        })
    })?;

    let status = ResponseStatus::from(status);
    if status != ResponseStatus::Successful {
        return Err(OcspError::Unsuccessful(status));
    }
    let (kind, basic) = response_bytes
        .ok_or_else(|| OcspError::Malformed("successful response without responseBytes".into()))?;
    if kind != ObjectIdentifier::from_slice(OID_OCSP_BASIC) {
        return Err(OcspError::Malformed(format!("unsupported response type {}", kind)));
    }

    let tbs = yasna::parse_der(&basic, |reader| {
        reader.read_sequence(|reader| {
            let tbs = reader.next().read_der()?;
            // signatureAlgorithm, signature, optional certs
            reader.next().read_der()?;
            reader.next().read_der()?;
            reader.read_optional(|reader| reader.read_der())?;
            Ok(tbs)
        })
    })?;

    let (produced_at, responses) = yasna::parse_der(&tbs, |reader| {
        reader.read_sequence(|reader| {
            reader.read_optional(|reader| {
                reader.read_tagged(Tag::context(0), |reader| reader.read_i64())
            })?;
            // responderID
            reader.next().read_der()?;
            let produced_at = read_generalized_time(reader.next())?;

            let mut responses = Vec::new();
            reader.next().read_sequence_of(|reader| {
                responses.push(read_single_response(reader)?);
                Ok(())
            })?;

            reader.read_optional(|reader| reader.read_der())?;
            Ok((produced_at, responses))
        })
    })?;

    let first = responses
        .into_iter()
        .next()
        .ok_or_else(|| OcspError::Malformed("response contains no SingleResponse".into()))?;

    Ok(OcspResponse {
        der: der.to_vec(),
        status: first.status,
        produced_at: parse_time(&produced_at)?,
        this_update: parse_time(&first.this_update)?,
        next_update: first.next_update.as_deref().map(parse_time).transpose()?,
    })
}

fn read_single_response(reader: yasna::BERReader<'_, '_>) -> yasna::ASN1Result<SingleResponse> {
    reader.read_sequence(|reader| {
        // certID
        reader.next().read_der()?;
        let status = reader.next().read_tagged_der()?;
        let status = match status.tag().tag_number {
            0 => CertStatus::Good,
            1 => CertStatus::Revoked,
            _ => CertStatus::Unknown,
        };
        let this_update = read_generalized_time(reader.next())?;
        let next_update = reader.read_optional(|reader| {
            reader.read_tagged(Tag::context(0), read_generalized_time)
        })?;
        reader.read_optional(|reader| reader.read_der())?;
        Ok(SingleResponse {
            status,
            this_update,
            next_update,
        })
    })
}

fn read_generalized_time(reader: yasna::BERReader<'_, '_>) -> yasna::ASN1Result<Vec<u8>> {
    reader.read_tagged_implicit(TAG_GENERALIZEDTIME, |reader| reader.read_bytes())
}

/// GeneralizedTime `YYYYMMDDHHMMSS[.fff]Z`, fractions dropped.
fn parse_time(raw: &[u8]) -> Result<DateTime<Utc>, OcspError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| OcspError::Malformed("GeneralizedTime is not ASCII".into()))?;
    let digits = text
        .get(..14)
        .ok_or_else(|| OcspError::Malformed(format!("short GeneralizedTime '{}'", text)))?;
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .map(|t| t.and_utc())
        .map_err(|e| OcspError::Malformed(format!("invalid GeneralizedTime '{}': {}", text, e)))
}
