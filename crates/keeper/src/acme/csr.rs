//! Certificate key and CSR generation

use certkeeper_config::EllipticCurve;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair};

use super::error::AcmeError;

/// TLS feature extension (RFC 7633)
const OID_TLS_FEATURE: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 24];

/// `SEQUENCE { INTEGER 5 }`: status_request
const TLS_FEATURE_STATUS_REQUEST: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x05];

/// Fresh key pair on `curve`.
pub fn generate_key(curve: EllipticCurve) -> Result<KeyPair, AcmeError> {
    let alg = match curve {
        EllipticCurve::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        EllipticCurve::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    };
    KeyPair::generate_for(alg).map_err(|e| AcmeError::Key(e.to_string()))
}

/// DER CSR for exactly `names`, with an empty subject.
pub fn build_csr(names: &[String], key: &KeyPair, must_staple: bool) -> Result<Vec<u8>, AcmeError> {
    let mut params = CertificateParams::new(names.to_vec())?;
    params.distinguished_name = DistinguishedName::new();
    if must_staple {
        params.custom_extensions.push(CustomExtension::from_oid_content(
            OID_TLS_FEATURE,
            TLS_FEATURE_STATUS_REQUEST.to_vec(),
        ));
    }

    let csr = params.serialize_request(key)?;
    Ok(csr.der().to_vec())
}
