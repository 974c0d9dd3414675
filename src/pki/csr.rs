//! CSR parsing, verification, and CSR-keyed issuance.

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{Certificate, CertificateSigningRequestParams, KeyPair};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use crate::error::{AcmeErrorType, ApiError};
use crate::pki::LeafBuildOptions;

/// A verified CSR: its subject, its public key, and the request itself,
/// ready for issuance. Everything that can fail about a CSR fails inside
/// `parse_csr` as `badCSR`; issuance afterwards never re-parses.
pub struct ParsedCsr {
    pub subject: String,
    pub common_name: Option<String>,
    /// DER-encoded SubjectPublicKeyInfo carried by the request.
    pub public_key_der: Vec<u8>,
    request: CertificateSigningRequestParams,
}

impl std::fmt::Debug for ParsedCsr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedCsr")
            .field("subject", &self.subject)
            .field("common_name", &self.common_name)
            .field("public_key_der", &self.public_key_der)
            .finish()
    }
}

/// Parse a CSR given as DER or PEM and verify its embedded self-signature.
/// Rejects with `badCSR` when the structure or the signature is invalid.
pub fn parse_csr(input: &[u8]) -> Result<ParsedCsr, ApiError> {
    let decoded;
    let der: &[u8] = if input.starts_with(b"-----BEGIN") {
        decoded = csr_pem_to_der(input)?;
        &decoded
    } else {
        input
    };
    let (rest, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| ApiError::acme(AcmeErrorType::BadCsr, format!("unparseable CSR: {e}")))?;
    if !rest.is_empty() {
        return Err(ApiError::acme(
            AcmeErrorType::BadCsr,
            "trailing bytes after CSR",
        ));
    }
    csr.verify_signature().map_err(|e| {
        ApiError::acme(
            AcmeErrorType::BadCsr,
            format!("CSR self-signature does not verify: {e}"),
        )
    })?;

    let info = &csr.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());

    // The signing backend gets its own read of the request here, behind the
    // same badCSR gate, so a request it cannot represent is rejected up
    // front instead of surfacing later as an internal error.
    let request = CertificateSigningRequestParams::from_pem(&der_to_csr_pem(der))
        .map_err(|e| {
            ApiError::acme(
                AcmeErrorType::BadCsr,
                format!("CSR not usable for issuance: {e}"),
            )
        })?;

    Ok(ParsedCsr {
        subject: info.subject.to_string(),
        common_name,
        public_key_der: info.subject_pki.raw.to_vec(),
        request,
    })
}

/// Issue a leaf certificate for the public key carried by a verified CSR.
/// The caller decides every issuance parameter; only the key comes from the
/// request.
pub fn issue_from_csr(
    csr: ParsedCsr,
    issuer_cert: &Certificate,
    issuer_key: &KeyPair,
    opts: &LeafBuildOptions,
) -> anyhow::Result<(Certificate, String)> {
    let mut request = csr.request;
    let not_after = crate::pki::apply_leaf_params(&mut request.params, opts)?;
    let cert = request
        .signed_by(issuer_cert, issuer_key)
        .context("signing certificate from CSR")?;
    Ok((cert, not_after.to_rfc3339()))
}

fn csr_pem_to_der(pem: &[u8]) -> Result<Vec<u8>, ApiError> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| ApiError::acme(AcmeErrorType::BadCsr, "CSR PEM is not UTF-8"))?;
    let b64: String = text
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    STANDARD
        .decode(b64.trim())
        .map_err(|e| ApiError::acme(AcmeErrorType::BadCsr, format!("invalid CSR PEM: {e}")))
}

fn der_to_csr_pem(der: &[u8]) -> String {
    let b64 = STANDARD.encode(der);
    let mut pem = String::with_capacity(b64.len() + 80);
    pem.push_str("-----BEGIN CERTIFICATE REQUEST-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE REQUEST-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{generate_keypair, HashAlgorithm, KeyAlgorithm};
    use rcgen::{CertificateParams, DistinguishedName, DnType};

    fn sample_csr(cn: &str) -> (KeyPair, Vec<u8>) {
        let key = generate_keypair(KeyAlgorithm::EcP256, HashAlgorithm::default()).unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key).unwrap();
        let der = csr.der().to_vec();
        (key, der)
    }

    #[test]
    fn parses_and_verifies_well_formed_csr() {
        let (key, der) = sample_csr("csr.example.com");
        let parsed = parse_csr(&der).unwrap();
        assert_eq!(parsed.common_name.as_deref(), Some("csr.example.com"));
        assert!(parsed.subject.contains("csr.example.com"));
        // The public key is the requester's SubjectPublicKeyInfo; its DER
        // ends with the raw EC point of the generated key.
        assert!(parsed.public_key_der.ends_with(key.public_key_raw()));
    }

    #[test]
    fn accepts_pem_encoded_csr() {
        let (_, der) = sample_csr("pem.example.com");
        let pem = der_to_csr_pem(&der);
        let parsed = parse_csr(pem.as_bytes()).unwrap();
        assert_eq!(parsed.common_name.as_deref(), Some("pem.example.com"));
        assert!(!parsed.public_key_der.is_empty());
    }

    #[test]
    fn rejects_garbage_as_bad_csr() {
        let err = parse_csr(b"not a csr").unwrap_err();
        match err {
            ApiError::Acme { acme_type, .. } => assert_eq!(acme_type, AcmeErrorType::BadCsr),
            other => panic!("expected badCSR, got {other:?}"),
        }
    }

    #[test]
    fn rejects_tampered_csr() {
        let (_, mut der) = sample_csr("csr.example.com");
        // Flip a byte near the end, inside the signature bits.
        let idx = der.len() - 5;
        der[idx] ^= 0xff;
        assert!(parse_csr(&der).is_err());
    }

    #[test]
    fn issues_certificate_for_csr_public_key() {
        let ca_key = generate_keypair(KeyAlgorithm::EcP256, HashAlgorithm::default()).unwrap();
        let (ca_cert, _) = crate::pki::build_root_certificate(
            &ca_key,
            &crate::pki::CaBuildOptions {
                common_name: "CSR Root".into(),
                validity_years: 1,
            },
        )
        .unwrap();

        let (_, der) = sample_csr("csr.example.com");
        let parsed = parse_csr(&der).unwrap();
        let (cert, not_after) = issue_from_csr(
            parsed,
            &ca_cert,
            &ca_key,
            &LeafBuildOptions {
                subject_cn: "csr.example.com".into(),
                san_dns: vec!["csr.example.com".into()],
                validity_days: 365,
                ev_policy_oid: None,
            },
        )
        .unwrap();

        assert!(!not_after.is_empty());
        let details = crate::pki::parse_certificate(&cert.pem()).unwrap();
        assert!(details.issuer.contains("CSR Root"));
        assert_eq!(details.san_list, vec!["csr.example.com".to_string()]);
    }
}
